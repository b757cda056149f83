//! In-memory collaborators for scheduler tests.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::engine::Collaborators;
use super::history::HistoryEntry;
use super::job::{DiscoveryJobConfig, JobConfig, ScanJobConfig, ScheduledJob};
use super::store::{JobStore, StoreError};
use crate::inventory::{Host, HostInventory, HostSelectionFilter, HostStatus, InventoryError};
use crate::probes::{
    DiscoveryReport, DiscoveryRequest, DiscoveryService, ScanReport, ScanTarget, ScanningService,
};
use crate::profiles::{Profile, ProfileError, ProfileService};

pub fn discovery_job(name: &str, network: &str) -> ScheduledJob {
    ScheduledJob::new(
        name,
        "0 0 * * *",
        JobConfig::Discovery(DiscoveryJobConfig::new(network)),
    )
}

pub fn scan_job(name: &str, config: ScanJobConfig) -> ScheduledJob {
    ScheduledJob::new(name, "0 0 * * *", JobConfig::Scan(config))
}

pub fn host(ip: &str, os_family: Option<&str>) -> Host {
    let mut host = Host::new(ip.parse().unwrap(), HostStatus::Up, Utc::now());
    host.os_family = os_family.map(str::to_string);
    host
}

/// Poll the store until `id` has at least `n` recorded runs.
pub async fn wait_for_runs(store: &MemoryJobStore, id: Uuid, n: usize) -> Vec<HistoryEntry> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let runs = store.recent_runs(id, 100).unwrap();
        if runs.len() >= n {
            return runs;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {n} runs of {id}, saw {}",
            runs.len()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Tracks how many calls overlap.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<ScheduledJob>>,
    history: Mutex<Vec<HistoryEntry>>,
    fail_create: AtomicBool,
    fail_get_all: AtomicBool,
    fail_delete: AtomicBool,
    fail_set_enabled: AtomicBool,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryJobStore {
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_get_all(&self, fail: bool) {
        self.fail_get_all.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn fail_set_enabled(&self, fail: bool) {
        self.fail_set_enabled.store(fail, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn outage(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Self::outage(&self.fail_create)?;
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        Self::outage(&self.fail_get_all)?;
        Ok(self.jobs.lock().unwrap().clone())
    }

    fn get(&self, id: Uuid) -> Result<ScheduledJob, StoreError> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn update(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let slot = jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or(StoreError::NotFound(job.id))?;
        *slot = job.clone();
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Self::outage(&self.fail_delete)?;
        self.jobs.lock().unwrap().retain(|j| j.id != id);
        self.history.lock().unwrap().retain(|h| h.job_id != id);
        Ok(())
    }

    fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError> {
        Self::outage(&self.fail_set_enabled)?;
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(StoreError::NotFound(id))?;
        job.enabled = enabled;
        Ok(())
    }

    fn record_run(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        self.history.lock().unwrap().push(entry.clone());
        Ok(())
    }

    fn recent_runs(&self, id: Uuid, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|h| h.job_id == id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeDiscovery {
    calls: Mutex<Vec<DiscoveryRequest>>,
    delay: Mutex<Duration>,
    panic_all: AtomicBool,
    panic_networks: Mutex<HashSet<String>>,
    fail: AtomicBool,
    in_flight: InFlight,
}

impl FakeDiscovery {
    pub fn calls(&self) -> Vec<DiscoveryRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_panic(&self, panic: bool) {
        self.panic_all.store(panic, Ordering::SeqCst);
    }

    pub fn panic_for(&self, network: &str) {
        self.panic_networks.lock().unwrap().insert(network.to_string());
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DiscoveryService for FakeDiscovery {
    async fn discover(
        &self,
        cancel: &CancellationToken,
        request: &DiscoveryRequest,
    ) -> anyhow::Result<DiscoveryReport> {
        self.calls.lock().unwrap().push(request.clone());
        let delay = *self.delay.lock().unwrap();

        self.in_flight.enter();
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        self.in_flight.exit();

        if cancelled {
            bail!("discovery cancelled");
        }
        if self.panic_all.load(Ordering::SeqCst)
            || self.panic_networks.lock().unwrap().contains(&request.network)
        {
            panic!("discovery exploded on {}", request.network);
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("discovery backend unreachable");
        }
        Ok(DiscoveryReport {
            probed: 1,
            responsive: 1,
        })
    }
}

#[derive(Default)]
pub struct FakeScanner {
    targets: Mutex<Vec<ScanTarget>>,
    failing: Mutex<HashSet<IpAddr>>,
    delay: Mutex<Duration>,
    in_flight: InFlight,
}

impl FakeScanner {
    pub fn targets(&self) -> Vec<ScanTarget> {
        self.targets.lock().unwrap().clone()
    }

    pub fn fail_for(&self, ip: IpAddr) {
        self.failing.lock().unwrap().insert(ip);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ScanningService for FakeScanner {
    async fn scan(&self, _cancel: &CancellationToken, target: &ScanTarget) -> anyhow::Result<ScanReport> {
        self.targets.lock().unwrap().push(target.clone());
        let delay = *self.delay.lock().unwrap();

        self.in_flight.enter();
        tokio::time::sleep(delay).await;
        self.in_flight.exit();

        if self.failing.lock().unwrap().contains(&target.host.ip_address) {
            bail!("connection reset by {}", target.host.ip_address);
        }
        Ok(ScanReport {
            probed: 1,
            open: vec![22],
        })
    }
}

#[derive(Default)]
pub struct FakeInventory {
    hosts: Mutex<Vec<Host>>,
}

impl FakeInventory {
    pub fn add(&self, host: Host) {
        self.hosts.lock().unwrap().push(host);
    }
}

#[async_trait::async_trait]
impl HostInventory for FakeInventory {
    async fn select(&self, filter: &HostSelectionFilter) -> Result<Vec<Host>, InventoryError> {
        let networks = filter.parse_networks()?;
        let now = Utc::now();
        let mut hosts: Vec<Host> = self
            .hosts
            .lock()
            .unwrap()
            .iter()
            .filter(|h| filter.matches(h, &networks, now))
            .cloned()
            .collect();
        hosts.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(hosts)
    }
}

pub struct FakeProfiles {
    profiles: Vec<Profile>,
}

fn profile(id: &str, os_family: Option<&str>) -> Profile {
    Profile {
        id: id.to_string(),
        name: id.to_string(),
        description: None,
        os_family: os_family.map(str::to_string),
        ports: "22,80,443".to_string(),
        scan_type: "connect".to_string(),
        timeout_seconds: 30,
        is_default: true,
    }
}

impl Default for FakeProfiles {
    fn default() -> Self {
        Self {
            profiles: vec![
                profile("generic-default", None),
                profile("linux-default", Some("linux")),
                profile("windows-default", Some("windows")),
            ],
        }
    }
}

#[async_trait::async_trait]
impl ProfileService for FakeProfiles {
    async fn get_by_id(&self, id: &str) -> Result<Option<Profile>, ProfileError> {
        Ok(self.profiles.iter().find(|p| p.id == id).cloned())
    }

    async fn get_default(&self) -> Result<Option<Profile>, ProfileError> {
        Ok(self
            .profiles
            .iter()
            .find(|p| p.is_default && p.os_family.is_none())
            .cloned())
    }

    async fn get_default_for_os_family(
        &self,
        family: &str,
    ) -> Result<Option<Profile>, ProfileError> {
        Ok(self
            .profiles
            .iter()
            .find(|p| {
                p.is_default
                    && p.os_family
                        .as_deref()
                        .is_some_and(|f| f.eq_ignore_ascii_case(family))
            })
            .cloned())
    }
}

/// One of each collaborator, kept around so tests can inspect them.
#[derive(Default, Clone)]
pub struct Fakes {
    pub discovery: Arc<FakeDiscovery>,
    pub scanner: Arc<FakeScanner>,
    pub inventory: Arc<FakeInventory>,
    pub profiles: Arc<FakeProfiles>,
}

impl Fakes {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            discovery: self.discovery.clone(),
            scanner: self.scanner.clone(),
            inventory: self.inventory.clone(),
            profiles: self.profiles.clone(),
        }
    }
}
