//! Discovery and scanning collaborators invoked by scheduled jobs.

use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::inventory::Host;
use crate::profiles::Profile;
use crate::scheduler::ScanOptions;

pub mod discovery;
pub mod scanner;
pub mod tcp;

pub use discovery::TcpSweepDiscovery;
pub use scanner::TcpConnectScanner;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid port specification '{0}'")]
    InvalidPorts(String),

    #[error("invalid network '{network}': {reason}")]
    InvalidNetwork { network: String, reason: String },

    #[error("discovery method '{0}' is not supported")]
    UnsupportedMethod(String),
}

/// Parameters of one discovery run.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryRequest {
    pub network: String,
    pub method: String,
    pub detect_os: bool,
    /// Upper bound for the whole run.
    pub timeout: Duration,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub probed: usize,
    pub responsive: usize,
}

impl std::fmt::Display for DiscoveryReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} of {} addresses responsive", self.responsive, self.probed)
    }
}

#[async_trait::async_trait]
pub trait DiscoveryService: Send + Sync {
    /// Sweep a network and record what answered. Should return early once
    /// `cancel` fires.
    async fn discover(
        &self,
        cancel: &CancellationToken,
        request: &DiscoveryRequest,
    ) -> Result<DiscoveryReport>;
}

/// One host to scan, with the profile resolved for it.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub host: Host,
    pub profile: Profile,
    pub options: ScanOptions,
}

impl ScanTarget {
    /// Port list after applying the job's override.
    pub fn ports(&self) -> &str {
        self.options.ports.as_deref().unwrap_or(&self.profile.ports)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(
            self.options
                .timeout_seconds
                .unwrap_or(self.profile.timeout_seconds)
                .max(1),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub probed: usize,
    pub open: Vec<u16>,
}

#[async_trait::async_trait]
pub trait ScanningService: Send + Sync {
    /// Scan one host and persist the results.
    async fn scan(&self, cancel: &CancellationToken, target: &ScanTarget) -> Result<ScanReport>;
}

/// Parse a port list such as `"22,80,8000-8010"` into sorted, unique ports.
pub fn parse_ports(spec: &str) -> Result<Vec<u16>, ProbeError> {
    let invalid = || ProbeError::InvalidPorts(spec.to_string());
    let mut ports = Vec::new();

    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u16 = lo.trim().parse().map_err(|_| invalid())?;
                let hi: u16 = hi.trim().parse().map_err(|_| invalid())?;
                if lo == 0 || lo > hi {
                    return Err(invalid());
                }
                ports.extend(lo..=hi);
            }
            None => {
                let port: u16 = part.parse().map_err(|_| invalid())?;
                if port == 0 {
                    return Err(invalid());
                }
                ports.push(port);
            }
        }
    }

    if ports.is_empty() {
        return Err(invalid());
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}
