//! TCP sweep host discovery.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use ipnetwork::{IpNetwork, Ipv4Network};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tcp;
use super::{DiscoveryReport, DiscoveryRequest, DiscoveryService, ProbeError};
use crate::config::ScanningConfig;
use crate::inventory::SqliteInventory;

/// Narrowest prefix a single sweep will accept.
const MIN_PREFIX: u8 = 16;

/// Finds live hosts by attempting TCP connects to a handful of common ports.
/// A refused connection counts as alive.
#[derive(Clone)]
pub struct TcpSweepDiscovery {
    inventory: SqliteInventory,
    ports: Vec<u16>,
    connect_timeout: Duration,
}

impl TcpSweepDiscovery {
    pub fn new(inventory: SqliteInventory, config: &ScanningConfig) -> Self {
        Self {
            inventory,
            ports: config.discovery_ports.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms.max(1)),
        }
    }

    async fn is_alive(&self, ip: Ipv4Addr) -> bool {
        for &port in &self.ports {
            let result = tcp::probe(SocketAddr::new(IpAddr::V4(ip), port), self.connect_timeout).await;
            if result.host_alive() {
                return true;
            }
        }
        false
    }
}

/// Addresses to probe in `network`, without network and broadcast addresses
/// where the prefix has them.
fn sweep_targets(network: &str) -> Result<Vec<Ipv4Addr>, ProbeError> {
    let invalid = |reason: String| ProbeError::InvalidNetwork {
        network: network.to_string(),
        reason,
    };

    let net = match IpNetwork::from_str(network.trim()).map_err(|e| invalid(e.to_string()))? {
        IpNetwork::V4(net) => net,
        IpNetwork::V6(_) => return Err(invalid("IPv6 sweeps are not supported".to_string())),
    };
    if net.prefix() < MIN_PREFIX {
        return Err(invalid(format!("prefix wider than /{MIN_PREFIX}")));
    }

    let net = Ipv4Network::new(net.network(), net.prefix()).map_err(|e| invalid(e.to_string()))?;
    let edges = net.prefix() <= 30;
    Ok(net
        .iter()
        .filter(|ip| !edges || (*ip != net.network() && *ip != net.broadcast()))
        .collect())
}

#[async_trait::async_trait]
impl DiscoveryService for TcpSweepDiscovery {
    async fn discover(
        &self,
        cancel: &CancellationToken,
        request: &DiscoveryRequest,
    ) -> Result<DiscoveryReport> {
        if !request.method.eq_ignore_ascii_case("tcp") {
            return Err(ProbeError::UnsupportedMethod(request.method.clone()).into());
        }
        if request.detect_os {
            debug!(network = %request.network, "OS detection is not available for TCP sweeps");
        }

        let targets = sweep_targets(&request.network)?;
        let probed = targets.len();
        info!(network = %request.network, addresses = probed, "Starting discovery sweep");

        let sweep = stream::iter(targets)
            .map(|ip| async move { (ip, self.is_alive(ip).await) })
            .buffer_unordered(request.concurrency.max(1))
            .collect::<Vec<_>>();

        let outcomes = tokio::select! {
            _ = cancel.cancelled() => bail!("discovery of {} cancelled", request.network),
            outcome = tokio::time::timeout(request.timeout, sweep) => {
                outcome.with_context(|| format!("discovery of {} timed out", request.network))?
            }
        };

        let (up, down): (Vec<_>, Vec<_>) = outcomes.into_iter().partition(|(_, alive)| *alive);
        let up: Vec<IpAddr> = up.into_iter().map(|(ip, _)| IpAddr::V4(ip)).collect();
        let down: Vec<IpAddr> = down.into_iter().map(|(ip, _)| IpAddr::V4(ip)).collect();
        let report = DiscoveryReport {
            probed,
            responsive: up.len(),
        };

        self.inventory
            .record_sweep(up, down, Utc::now())
            .await
            .context("failed to record discovery results")?;

        info!(network = %request.network, responsive = report.responsive, "Discovery sweep complete");
        Ok(report)
    }
}
