//! Probe module for uptime monitoring.
//!
//! Contains the SSRF guard that vets target URLs and the HTTP prober that
//! measures reachability and latency.

mod http;
mod ssrf;

pub use http::*;
pub use ssrf::*;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("network error: {0}")]
    Network(String),
}

/// Everything a single probe observed.
#[derive(Debug)]
pub struct Probe {
    /// When the probe started.
    pub checked_at: DateTime<Utc>,
    pub outcome: ProbeOutcome,
}

/// Outcome of the HEAD/GET strategy.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// A response arrived; `status` is the final one after redirects.
    Response { status: u16, latency_ms: i64 },
    /// Neither attempt produced a response.
    Failed(ProbeError),
}
