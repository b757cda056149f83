//! TCP connect port scanner.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rusqlite::params;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tcp::{self, PortState, TcpResult};
use super::{parse_ports, ScanReport, ScanTarget, ScanningService};
use crate::config::ScanningConfig;
use crate::storage::{format_timestamp, Pool};

/// Connects to every port of the resolved profile and stores what answered
/// in `port_scans`.
#[derive(Clone)]
pub struct TcpConnectScanner {
    pool: Pool,
    connect_timeout: Duration,
    port_concurrency: usize,
}

impl TcpConnectScanner {
    pub fn new(pool: Pool, config: &ScanningConfig) -> Self {
        Self {
            pool,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms.max(1)),
            port_concurrency: config.port_concurrency.max(1),
        }
    }

    async fn persist(&self, target: &ScanTarget, results: Vec<TcpResult>) -> Result<()> {
        let pool = self.pool.clone();
        let ip = target.host.ip_address.to_string();
        let profile_id = target.profile.id.clone();
        let scanned_at = format_timestamp(&Utc::now());

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO port_scans (ip_address, port, state, profile_id, latency_ms, scanned_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for r in results.iter().filter(|r| r.state != PortState::Filtered) {
                    stmt.execute(params![
                        ip,
                        r.addr.port(),
                        r.state.as_str(),
                        profile_id,
                        r.latency_ms,
                        scanned_at,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .context("port scan persistence task failed")?
    }
}

#[async_trait::async_trait]
impl ScanningService for TcpConnectScanner {
    async fn scan(&self, cancel: &CancellationToken, target: &ScanTarget) -> Result<ScanReport> {
        let ports = parse_ports(target.ports())?;
        let ip = target.host.ip_address;
        let connect_timeout = self.connect_timeout;

        debug!(host = %ip, profile = %target.profile.id, ports = ports.len(), "Scanning host");

        let sweep = stream::iter(ports)
            .map(|port| tcp::probe(SocketAddr::new(ip, port), connect_timeout))
            .buffer_unordered(self.port_concurrency)
            .collect::<Vec<_>>();

        let results = tokio::select! {
            _ = cancel.cancelled() => bail!("scan of {ip} cancelled"),
            outcome = tokio::time::timeout(target.timeout(), sweep) => {
                outcome.with_context(|| format!("scan of {ip} timed out"))?
            }
        };

        let mut open: Vec<u16> = results
            .iter()
            .filter(|r| r.state == PortState::Open)
            .map(|r| r.addr.port())
            .collect();
        open.sort_unstable();

        let report = ScanReport {
            probed: results.len(),
            open,
        };
        self.persist(target, results).await?;

        info!(host = %ip, probed = report.probed, open = report.open.len(), "Host scan complete");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{Host, HostStatus};
    use crate::profiles::Profile;
    use crate::scheduler::ScanOptions;
    use crate::storage::open_pool;

    fn profile(ports: &str) -> Profile {
        Profile {
            id: "test-profile".to_string(),
            name: "Test".to_string(),
            description: None,
            os_family: None,
            ports: ports.to_string(),
            scan_type: "connect".to_string(),
            timeout_seconds: 10,
            is_default: false,
        }
    }

    #[tokio::test]
    async fn test_scan_localhost_records_open_port() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("scan.db").to_str().unwrap(), 2).unwrap();
        let scanner = TcpConnectScanner::new(pool.clone(), &ScanningConfig::default());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = ScanTarget {
            host: Host::new("127.0.0.1".parse().unwrap(), HostStatus::Up, Utc::now()),
            profile: profile("1"),
            options: ScanOptions {
                ports: Some(port.to_string()),
                timeout_seconds: None,
            },
        };
        let report = scanner
            .scan(&CancellationToken::new(), &target)
            .await
            .unwrap();
        assert_eq!(report.open, vec![port]);

        let stored: i64 = pool
            .get()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM port_scans WHERE state = 'open' AND port = ?1",
                [port],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stored, 1);
    }

    #[tokio::test]
    async fn test_scan_rejects_bad_port_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("scan.db").to_str().unwrap(), 2).unwrap();
        let scanner = TcpConnectScanner::new(pool, &ScanningConfig::default());

        let target = ScanTarget {
            host: Host::new("127.0.0.1".parse().unwrap(), HostStatus::Up, Utc::now()),
            profile: profile("not-a-port"),
            options: ScanOptions::default(),
        };
        assert!(scanner.scan(&CancellationToken::new(), &target).await.is_err());
    }
}
