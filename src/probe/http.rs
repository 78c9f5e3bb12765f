//! HTTP probe implementation.
//!
//! A probe sends HEAD first and falls back to a single GET when HEAD fails
//! at the transport level or is answered with 405. Latency is measured from
//! the start of the first attempt, so the fallback's cost is included.

use chrono::Utc;
use reqwest::{Method, StatusCode};
use std::error::Error as StdError;
use std::time::{Duration, Instant};

use super::{Probe, ProbeError, ProbeOutcome};

/// Redirects followed before a probe gives up. Only the first URL is vetted
/// by the guard.
const MAX_REDIRECTS: usize = 10;

/// Settings shared by every probe.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Budget for each attempt; the GET fallback gets its own.
    pub timeout: Duration,
    /// When false, certificate validation is skipped.
    pub verify_tls: bool,
}

/// Result of one HTTP attempt.
enum Attempt {
    Response(StatusCode),
    Transport(ProbeError),
}

/// Reusable HTTP prober.
pub struct Prober {
    client: reqwest::Client,
    timeout: Duration,
}

impl Prober {
    pub fn new(settings: ProbeSettings) -> Result<Self, ProbeError> {
        Self::build(client_builder(&settings), settings.timeout)
    }

    /// Prober that dials `addr` whenever a URL names `host`. The URL's own
    /// port is still used.
    #[cfg(test)]
    pub fn with_resolved_host(
        settings: ProbeSettings,
        host: &str,
        addr: std::net::SocketAddr,
    ) -> Result<Self, ProbeError> {
        Self::build(client_builder(&settings).resolve(host, addr), settings.timeout)
    }

    fn build(builder: reqwest::ClientBuilder, timeout: Duration) -> Result<Self, ProbeError> {
        let client = builder
            .build()
            .map_err(|e| ProbeError::Network(error_chain(&e)))?;

        Ok(Self { client, timeout })
    }

    /// Probe `url` once. Never fails: every failure becomes a `ProbeOutcome::Failed`.
    pub async fn probe(&self, url: &str) -> Probe {
        let checked_at = Utc::now();
        let start = Instant::now();

        let attempt = match self.attempt(Method::HEAD, url).await {
            Attempt::Response(status) if status != StatusCode::METHOD_NOT_ALLOWED => {
                Attempt::Response(status)
            }
            Attempt::Response(_) => {
                tracing::debug!("HEAD not allowed for {}, retrying with GET", url);
                self.attempt(Method::GET, url).await
            }
            Attempt::Transport(e) => {
                tracing::debug!("HEAD failed for {}: {}, retrying with GET", url, e);
                self.attempt(Method::GET, url).await
            }
        };

        let outcome = match attempt {
            Attempt::Response(status) => ProbeOutcome::Response {
                status: status.as_u16(),
                latency_ms: elapsed_ms(start.elapsed()),
            },
            Attempt::Transport(e) => ProbeOutcome::Failed(e),
        };

        Probe { checked_at, outcome }
    }

    async fn attempt(&self, method: Method, url: &str) -> Attempt {
        let read_body = method == Method::GET;

        let response = match self
            .client
            .request(method, url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Attempt::Transport(self.classify(e)),
        };

        let status = response.status();

        // Read the full body to measure complete transfer time
        if read_body {
            if let Err(e) = response.bytes().await {
                return Attempt::Transport(self.classify(e));
            }
        }

        Attempt::Response(status)
    }

    fn classify(&self, e: reqwest::Error) -> ProbeError {
        if e.is_timeout() {
            ProbeError::Timeout(self.timeout)
        } else if e.is_connect() {
            ProbeError::Connect(error_chain(&e))
        } else {
            ProbeError::Network(error_chain(&e))
        }
    }
}

fn client_builder(settings: &ProbeSettings) -> reqwest::ClientBuilder {
    // Probes dial targets directly; a proxy would skew latency and
    // bypass the address the guard inspected.
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .danger_accept_invalid_certs(!settings.verify_tls)
        .no_proxy()
}

/// Whole milliseconds, rounded up so any measured response is at least 1ms.
fn elapsed_ms(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_micros().div_ceil(1000)).unwrap_or(i64::MAX)
}

/// Render an error with all of its sources, e.g. "error sending request: dns error: ...".
fn error_chain(err: &dyn StdError) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_msg = cause.to_string();
        if !msg.contains(&cause_msg) {
            msg.push_str(": ");
            msg.push_str(&cause_msg);
        }
        source = cause.source();
    }
    msg
}
