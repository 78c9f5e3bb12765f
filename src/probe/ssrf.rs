//! SSRF guard: decides whether a target URL is safe to dial.
//!
//! The hostname is resolved and every returned address is checked, so a
//! public-looking name that points at an internal address is still refused.
//! Resolution errors block the target (fail closed).
//!
//! Two residual risks are accepted:
//!
//! - The prober resolves the name again when it connects, and nothing ties
//!   that lookup to the one inspected here.
//! - Only the target URL is vetted. The prober follows redirects, so a public
//!   target can bounce a probe to an internal address such as
//!   `169.254.169.254`. Only the final status code is recorded, never the body.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::{Host, Url};

const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// IPv4 ranges a target may not resolve into.
const BLOCKED_V4: [Ipv4Net; 5] = [
    Ipv4Net::new_assert(Ipv4Addr::new(127, 0, 0, 0), 8), // loopback
    Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 8),
    Ipv4Net::new_assert(Ipv4Addr::new(172, 16, 0, 0), 12),
    Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 0, 0), 16),
    Ipv4Net::new_assert(Ipv4Addr::new(169, 254, 0, 0), 16), // link-local, cloud metadata
];

/// Why a target was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing hostname")]
    MissingHost,
    #[error("localhost is not allowed")]
    Localhost,
    #[error("resolution failed: {0}")]
    Resolution(String),
    #[error("resolved to blocked IP: {0}")]
    BlockedAddress(IpAddr),
}

/// Guard decision for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked(BlockReason),
}

/// Hostname resolution used by the guard.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// All A and AAAA addresses for `host`.
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's `getaddrinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

/// Decides whether target URLs may be probed.
#[derive(Clone)]
pub struct Guard {
    resolver: Arc<dyn Resolve>,
    resolve_timeout: Duration,
}

impl Default for Guard {
    fn default() -> Self {
        Self::new()
    }
}

impl Guard {
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver))
    }

    pub fn with_resolver(resolver: Arc<dyn Resolve>) -> Self {
        Self {
            resolver,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }

    /// Bound on a single hostname lookup; a slower lookup blocks the target.
    pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Evaluate `url`. Any doubt about the destination blocks it.
    pub async fn evaluate(&self, url: &str) -> Verdict {
        match self.check(url).await {
            Ok(()) => Verdict::Allowed,
            Err(reason) => Verdict::Blocked(reason),
        }
    }

    async fn check(&self, url: &str) -> Result<(), BlockReason> {
        let parsed = Url::parse(url.trim()).map_err(|e| BlockReason::InvalidUrl(e.to_string()))?;

        let addrs = match parsed.host() {
            None => return Err(BlockReason::MissingHost),
            Some(Host::Ipv4(v4)) => vec![IpAddr::V4(v4)],
            Some(Host::Ipv6(v6)) => vec![IpAddr::V6(v6)],
            Some(Host::Domain(domain)) => {
                let host = domain.to_ascii_lowercase();
                if host.is_empty() {
                    return Err(BlockReason::MissingHost);
                }
                // Checked before resolution so /etc/hosts overrides don't matter.
                if host == "localhost" || host == "localhost." {
                    return Err(BlockReason::Localhost);
                }

                let addrs = tokio::time::timeout(self.resolve_timeout, self.resolver.resolve(&host))
                    .await
                    .map_err(|_| {
                        BlockReason::Resolution(format!("timed out after {:?}", self.resolve_timeout))
                    })?
                    .map_err(|e| BlockReason::Resolution(e.to_string()))?;
                if addrs.is_empty() {
                    return Err(BlockReason::Resolution(format!("no addresses for {}", host)));
                }
                addrs
            }
        };

        match addrs.into_iter().find(|ip| is_blocked_ip(*ip)) {
            Some(ip) => Err(BlockReason::BlockedAddress(ip)),
            None => Ok(()),
        }
    }
}

/// Whether `ip` falls in a blocked range.
///
/// IPv6 blocks only the loopback address; unique-local (fc00::/7) and
/// link-local (fe80::/10) are currently allowed.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => BLOCKED_V4.iter().any(|net| net.contains(&v4)),
        IpAddr::V6(v6) => v6 == Ipv6Addr::LOCALHOST,
    }
}
