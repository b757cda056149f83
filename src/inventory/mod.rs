//! Host inventory: the hosts discovery has seen, and the selector scan jobs
//! use to pick their targets.

use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use rusqlite::{params, params_from_iter};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::storage::{format_timestamp, parse_timestamp, Pool, StorageError};

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("invalid network scope '{network}': {reason}")]
    InvalidNetwork { network: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<rusqlite::Error> for InventoryError {
    fn from(e: rusqlite::Error) -> Self {
        InventoryError::Storage(e.into())
    }
}

impl From<r2d2::Error> for InventoryError {
    fn from(e: r2d2::Error) -> Self {
        InventoryError::Storage(e.into())
    }
}

/// Reachability of a host as of its last discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Up,
    Down,
    Unknown,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Up => "up",
            HostStatus::Down => "down",
            HostStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for HostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(HostStatus::Up),
            "down" => Ok(HostStatus::Down),
            "unknown" => Ok(HostStatus::Unknown),
            other => Err(format!("unknown host status '{other}'")),
        }
    }
}

/// A known host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Host {
    pub id: Uuid,
    pub ip_address: IpAddr,
    pub hostname: Option<String>,
    pub os_family: Option<String>,
    pub status: HostStatus,
    pub ignore_scanning: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Host {
    /// A freshly seen host with no OS information.
    pub fn new(ip_address: IpAddr, status: HostStatus, seen: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ip_address,
            hostname: None,
            os_family: None,
            status,
            ignore_scanning: false,
            first_seen: seen,
            last_seen: seen,
        }
    }
}

/// Conjunctive host predicates for one scan-job execution. The default
/// filter selects every scannable host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSelectionFilter {
    /// Only hosts whose status is `up`.
    pub live_only: bool,
    /// CIDR scopes; a host must fall in at least one. Empty = unrestricted.
    pub networks: Vec<String>,
    pub os_family: Option<String>,
    /// Only hosts seen within this long before now.
    pub max_age: Option<chrono::Duration>,
}

impl HostSelectionFilter {
    pub fn parse_networks(&self) -> Result<Vec<IpNetwork>, InventoryError> {
        self.networks
            .iter()
            .map(|raw| {
                IpNetwork::from_str(raw.trim()).map_err(|e| InventoryError::InvalidNetwork {
                    network: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Oldest acceptable `last_seen` at `now`. `None` when there is no age
    /// bound or the cutoff falls before the earliest representable time.
    pub fn seen_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_age.and_then(|age| now.checked_sub_signed(age))
    }

    /// Evaluate the filter against one host. `networks` is the parsed form
    /// of `self.networks`.
    pub fn matches(&self, host: &Host, networks: &[IpNetwork], now: DateTime<Utc>) -> bool {
        if host.ignore_scanning {
            return false;
        }
        if self.live_only && host.status != HostStatus::Up {
            return false;
        }
        if let Some(family) = &self.os_family {
            match &host.os_family {
                Some(f) if f.eq_ignore_ascii_case(family) => {}
                _ => return false,
            }
        }
        if let Some(cutoff) = self.seen_after(now) {
            if host.last_seen < cutoff {
                return false;
            }
        }
        networks.is_empty() || networks.iter().any(|n| n.contains(host.ip_address))
    }
}

/// The host inventory as seen by the scheduler.
#[async_trait::async_trait]
pub trait HostInventory: Send + Sync {
    /// Hosts matching `filter`, most recently seen first.
    async fn select(&self, filter: &HostSelectionFilter) -> Result<Vec<Host>, InventoryError>;
}

/// SQLite-backed inventory.
#[derive(Clone)]
pub struct SqliteInventory {
    pool: Pool,
}

const HOST_COLUMNS: &str =
    "id, ip_address, hostname, os_family, status, ignore_scanning, first_seen, last_seen";

fn host_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<Host>> {
    let id: String = row.get(0)?;
    let ip: String = row.get(1)?;
    let status: String = row.get(4)?;
    let first_seen: String = row.get(6)?;
    let last_seen: String = row.get(7)?;

    let (Ok(id), Ok(ip_address), Some(first_seen), Some(last_seen)) = (
        Uuid::parse_str(&id),
        ip.parse::<IpAddr>(),
        parse_timestamp(&first_seen),
        parse_timestamp(&last_seen),
    ) else {
        debug!(%ip, "skipping unreadable host row");
        return Ok(None);
    };

    Ok(Some(Host {
        id,
        ip_address,
        hostname: row.get(2)?,
        os_family: row.get(3)?,
        status: status.parse().unwrap_or(HostStatus::Unknown),
        ignore_scanning: row.get(5)?,
        first_seen,
        last_seen,
    }))
}

impl SqliteInventory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build the SQL half of a selection. Rows are re-checked with
    /// [`HostSelectionFilter::matches`] afterwards, which adds network
    /// containment; SQLite has no address type.
    fn build_query(filter: &HostSelectionFilter, now: DateTime<Utc>) -> (String, Vec<String>) {
        let mut query = format!("SELECT {HOST_COLUMNS} FROM hosts WHERE ignore_scanning = 0");
        let mut args = Vec::new();

        if filter.live_only {
            args.push(HostStatus::Up.as_str().to_string());
            query.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(family) = &filter.os_family {
            args.push(family.clone());
            query.push_str(&format!(" AND lower(os_family) = lower(?{})", args.len()));
        }
        if let Some(cutoff) = filter.seen_after(now) {
            args.push(format_timestamp(&cutoff));
            query.push_str(&format!(" AND last_seen >= ?{}", args.len()));
        }

        query.push_str(" ORDER BY last_seen DESC");
        (query, args)
    }

    pub async fn select_hosts(&self, filter: &HostSelectionFilter) -> Result<Vec<Host>, InventoryError> {
        let networks = filter.parse_networks()?;
        let now = Utc::now();
        let (query, args) = Self::build_query(filter, now);
        let pool = self.pool.clone();

        let hosts = tokio::task::spawn_blocking(move || -> Result<Vec<Host>, InventoryError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), host_from_row)?;
            let mut hosts = Vec::new();
            for r in rows {
                if let Some(host) = r? {
                    hosts.push(host);
                }
            }
            Ok(hosts)
        })
        .await
        .map_err(StorageError::from)??;

        Ok(hosts
            .into_iter()
            .filter(|h| filter.matches(h, &networks, now))
            .collect())
    }

    /// Insert or replace a host record, keyed by address.
    pub async fn upsert_host(&self, host: Host) -> Result<(), InventoryError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), InventoryError> {
            let conn = pool.get()?;
            conn.execute(
                "INSERT INTO hosts (id, ip_address, hostname, os_family, status, ignore_scanning, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(ip_address) DO UPDATE SET
                     hostname = excluded.hostname,
                     os_family = excluded.os_family,
                     status = excluded.status,
                     ignore_scanning = excluded.ignore_scanning,
                     last_seen = excluded.last_seen",
                params![
                    host.id.to_string(),
                    host.ip_address.to_string(),
                    host.hostname,
                    host.os_family,
                    host.status.as_str(),
                    host.ignore_scanning,
                    format_timestamp(&host.first_seen),
                    format_timestamp(&host.last_seen),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(StorageError::from)?
    }

    /// Record the outcome of a discovery sweep in one transaction: responsive
    /// addresses become `up` with a fresh `last_seen`; unresponsive addresses
    /// already in the inventory become `down`.
    pub async fn record_sweep(
        &self,
        up: Vec<IpAddr>,
        down: Vec<IpAddr>,
        seen_at: DateTime<Utc>,
    ) -> Result<(), InventoryError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), InventoryError> {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            let seen = format_timestamp(&seen_at);
            {
                let mut mark_up = tx.prepare(
                    "INSERT INTO hosts (id, ip_address, status, first_seen, last_seen, discovery_count)
                     VALUES (?1, ?2, 'up', ?3, ?3, 1)
                     ON CONFLICT(ip_address) DO UPDATE SET
                         status = 'up',
                         last_seen = excluded.last_seen,
                         discovery_count = discovery_count + 1",
                )?;
                for ip in &up {
                    mark_up.execute(params![Uuid::new_v4().to_string(), ip.to_string(), seen])?;
                }

                let mut mark_down =
                    tx.prepare("UPDATE hosts SET status = 'down' WHERE ip_address = ?1")?;
                for ip in &down {
                    mark_down.execute([ip.to_string()])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(StorageError::from)?
    }
}

#[async_trait::async_trait]
impl HostInventory for SqliteInventory {
    async fn select(&self, filter: &HostSelectionFilter) -> Result<Vec<Host>, InventoryError> {
        self.select_hosts(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;

    fn inventory() -> (tempfile::TempDir, SqliteInventory) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("hosts.db").to_str().unwrap(), 2).unwrap();
        (dir, SqliteInventory::new(pool))
    }

    fn host(ip: &str, status: HostStatus, hours_ago: i64) -> Host {
        Host::new(
            ip.parse().unwrap(),
            status,
            Utc::now() - chrono::Duration::hours(hours_ago),
        )
    }

    fn ips(hosts: &[Host]) -> Vec<String> {
        hosts.iter().map(|h| h.ip_address.to_string()).collect()
    }

    #[tokio::test]
    async fn test_live_only_with_max_age() {
        let (_dir, inv) = inventory();
        inv.upsert_host(host("10.0.0.2", HostStatus::Up, 2)).await.unwrap();
        inv.upsert_host(host("10.0.0.3", HostStatus::Up, 48)).await.unwrap();

        let filter = HostSelectionFilter {
            live_only: true,
            max_age: Some(chrono::Duration::hours(24)),
            ..Default::default()
        };
        let selected = inv.select(&filter).await.unwrap();
        assert_eq!(ips(&selected), vec!["10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_age_beyond_calendar_range_is_unbounded() {
        let (_dir, inv) = inventory();
        inv.upsert_host(host("10.0.0.2", HostStatus::Up, 2)).await.unwrap();

        let filter = HostSelectionFilter {
            max_age: Some(chrono::TimeDelta::MAX),
            ..Default::default()
        };
        assert_eq!(filter.seen_after(Utc::now()), None);
        let selected = inv.select(&filter).await.unwrap();
        assert_eq!(ips(&selected), vec!["10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_empty_filter_selects_everything_newest_first() {
        let (_dir, inv) = inventory();
        inv.upsert_host(host("10.0.0.9", HostStatus::Down, 30)).await.unwrap();
        inv.upsert_host(host("192.168.1.4", HostStatus::Up, 1)).await.unwrap();
        inv.upsert_host(host("172.16.0.1", HostStatus::Unknown, 5)).await.unwrap();

        let selected = inv.select(&HostSelectionFilter::default()).await.unwrap();
        assert_eq!(ips(&selected), vec!["192.168.1.4", "172.16.0.1", "10.0.0.9"]);
    }

    #[tokio::test]
    async fn test_network_scope_and_os_family() {
        let (_dir, inv) = inventory();
        let mut linux = host("10.1.0.5", HostStatus::Up, 1);
        linux.os_family = Some("Linux".to_string());
        let mut windows = host("10.1.0.6", HostStatus::Up, 1);
        windows.os_family = Some("windows".to_string());
        let mut outside = host("10.2.0.5", HostStatus::Up, 1);
        outside.os_family = Some("linux".to_string());
        for h in [linux, windows, outside] {
            inv.upsert_host(h).await.unwrap();
        }

        let filter = HostSelectionFilter {
            networks: vec!["10.1.0.0/16".to_string(), "192.168.0.0/16".to_string()],
            os_family: Some("linux".to_string()),
            ..Default::default()
        };
        let selected = inv.select(&filter).await.unwrap();
        assert_eq!(ips(&selected), vec!["10.1.0.5"]);
    }

    #[tokio::test]
    async fn test_ignored_hosts_never_selected() {
        let (_dir, inv) = inventory();
        let mut ignored = host("10.0.0.7", HostStatus::Up, 1);
        ignored.ignore_scanning = true;
        inv.upsert_host(ignored).await.unwrap();

        assert!(inv.select(&HostSelectionFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_network_rejected() {
        let (_dir, inv) = inventory();
        let filter = HostSelectionFilter {
            networks: vec!["10.0.0.0/33".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            inv.select(&filter).await,
            Err(InventoryError::InvalidNetwork { .. })
        ));
    }

    #[tokio::test]
    async fn test_record_sweep_marks_up_and_down() {
        let (_dir, inv) = inventory();
        inv.upsert_host(host("10.0.0.20", HostStatus::Up, 10)).await.unwrap();

        let now = Utc::now();
        inv.record_sweep(
            vec!["10.0.0.21".parse().unwrap()],
            vec!["10.0.0.20".parse().unwrap(), "10.0.0.22".parse().unwrap()],
            now,
        )
        .await
        .unwrap();

        let all = inv.select(&HostSelectionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2, "unknown unresponsive addresses are not inserted");
        let live = inv
            .select(&HostSelectionFilter {
                live_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ips(&live), vec!["10.0.0.21"]);
    }

    #[test]
    fn test_matches_agrees_with_selector_rules() {
        let now = Utc::now();
        let filter = HostSelectionFilter {
            live_only: true,
            networks: vec!["10.0.0.0/8".to_string()],
            os_family: None,
            max_age: Some(chrono::Duration::hours(24)),
        };
        let networks = filter.parse_networks().unwrap();
        assert!(filter.matches(&host("10.9.9.9", HostStatus::Up, 1), &networks, now));
        assert!(!filter.matches(&host("10.9.9.9", HostStatus::Down, 1), &networks, now));
        assert!(!filter.matches(&host("10.9.9.9", HostStatus::Up, 25), &networks, now));
        assert!(!filter.matches(&host("11.0.0.1", HostStatus::Up, 1), &networks, now));
    }
}
