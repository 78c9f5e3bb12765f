//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probe::{Probe, ProbeOutcome};

/// A monitored endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub url: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The slice of a target the scheduler works from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub id: i64,
    pub url: String,
}

/// The outcome of one check against one target.
///
/// Either `status_code` and `latency_ms` are set and `error` is empty, or
/// the check never got a response and `error` explains why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub target_id: i64,
    pub checked_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub latency_ms: Option<i64>,
    pub reachable: bool,
    pub error: Option<String>,
}

impl CheckResult {
    /// Result for a target the guard refused to dial.
    pub fn blocked(target_id: i64, reason: impl Into<String>) -> Self {
        Self::failed(target_id, Utc::now(), reason)
    }

    /// Result for a target that produced no response.
    pub fn failed(target_id: i64, checked_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            target_id,
            checked_at,
            status_code: None,
            latency_ms: None,
            reachable: false,
            error: Some(error.into()),
        }
    }

    pub fn from_probe(target_id: i64, probe: Probe) -> Self {
        match probe.outcome {
            ProbeOutcome::Response { status, latency_ms } => Self {
                target_id,
                checked_at: probe.checked_at,
                status_code: Some(status),
                latency_ms: Some(latency_ms),
                reachable: is_reachable_status(status),
                error: None,
            },
            ProbeOutcome::Failed(e) => Self::failed(target_id, probe.checked_at, e.to_string()),
        }
    }
}

/// A final status in [200, 400) counts as up.
pub fn is_reachable_status(status: u16) -> bool {
    (200..400).contains(&status)
}

/// A target joined with its most recent check, if any.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub id: i64,
    pub url: String,
    pub name: Option<String>,
    pub reachable: bool,
    pub checked_at: Option<DateTime<Utc>>,
    pub status_code: Option<u16>,
    pub latency_ms: Option<i64>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;
    use std::time::Duration;

    #[test]
    fn test_reachable_range() {
        assert!(!is_reachable_status(199));
        assert!(is_reachable_status(200));
        assert!(is_reachable_status(301));
        assert!(is_reachable_status(399));
        assert!(!is_reachable_status(404));
        assert!(!is_reachable_status(503));
    }

    #[test]
    fn test_from_probe_response() {
        let probe = Probe {
            checked_at: Utc::now(),
            outcome: ProbeOutcome::Response { status: 503, latency_ms: 12 },
        };
        let check = CheckResult::from_probe(7, probe);
        assert_eq!(check.status_code, Some(503));
        assert_eq!(check.latency_ms, Some(12));
        assert!(!check.reachable);
        assert!(check.error.is_none());
    }

    #[test]
    fn test_from_probe_failure() {
        let probe = Probe {
            checked_at: Utc::now(),
            outcome: ProbeOutcome::Failed(ProbeError::Timeout(Duration::from_secs(10))),
        };
        let check = CheckResult::from_probe(7, probe);
        assert_eq!(check.status_code, None);
        assert_eq!(check.latency_ms, None);
        assert!(!check.reachable);
        assert!(check.error.unwrap().contains("timed out"));
    }
}
