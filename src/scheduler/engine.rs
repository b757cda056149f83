//! Execution engine: runs one firing of a job from the checking phase
//! through cleanup.
//!
//! Every execution goes through the same three steps:
//!
//! 1. **Checking**, under the registry write lock: unknown, disabled and
//!    already-running jobs are skipped, otherwise the job is marked running.
//! 2. **Running**, with no lock held: the discovery or scan body runs inside
//!    a panic guard.
//! 3. **Cleanup**, under the write lock again: the running flag is cleared,
//!    `last_run`/`next_run` are written back and the outcome is recorded.
//!    A job removed while it ran is left alone.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cron::CronSchedule;
use super::driver::ExecutionTask;
use super::history::{HistoryEntry, RunStatus};
use super::job::{DiscoveryJobConfig, JobConfig, ScanJobConfig, ScheduledJob};
use super::registry::Registry;
use super::store::{self, JobStore};
use crate::config::SchedulerConfig;
use crate::inventory::{Host, HostInventory};
use crate::probes::{DiscoveryRequest, DiscoveryService, ScanTarget, ScanningService};
use crate::profiles::{ProfileResolver, ProfileService};

/// External services job bodies call into.
#[derive(Clone)]
pub struct Collaborators {
    pub discovery: Arc<dyn DiscoveryService>,
    pub scanner: Arc<dyn ScanningService>,
    pub inventory: Arc<dyn HostInventory>,
    pub profiles: Arc<dyn ProfileService>,
}

/// Why a job body did not succeed. Stays inside the engine.
#[derive(Debug, Error)]
pub(crate) enum ExecutionError {
    #[error("job body panicked: {0}")]
    RecoveredPanic(String),

    #[error("cancelled by scheduler shutdown")]
    Cancelled,

    #[error(transparent)]
    Body(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
struct EngineSettings {
    batch_size: usize,
    host_concurrency: usize,
    default_discovery_concurrency: usize,
}

impl From<&SchedulerConfig> for EngineSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            batch_size: config.scan_batch_size.max(1),
            host_concurrency: config.host_concurrency.max(1),
            default_discovery_concurrency: config.default_discovery_concurrency.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostOutcome {
    Scanned,
    Failed,
    Skipped,
}

#[derive(Debug, Default)]
struct ScanTally {
    scanned: usize,
    failed: usize,
    skipped: usize,
}

impl ScanTally {
    fn record(&mut self, outcome: HostOutcome) {
        match outcome {
            HostOutcome::Scanned => self.scanned += 1,
            HostOutcome::Failed => self.failed += 1,
            HostOutcome::Skipped => self.skipped += 1,
        }
    }
}

impl std::fmt::Display for ScanTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} hosts scanned, {} failed, {} skipped",
            self.scanned, self.failed, self.skipped
        )
    }
}

/// Runs job firings handed over by the cron driver workers.
pub struct ExecutionEngine {
    registry: Arc<Registry>,
    store: Arc<dyn JobStore>,
    collaborators: Collaborators,
    resolver: ProfileResolver,
    settings: EngineSettings,
    cancel: CancellationToken,
}

impl ExecutionEngine {
    pub(crate) fn new(
        registry: Arc<Registry>,
        store: Arc<dyn JobStore>,
        collaborators: Collaborators,
        config: &SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let resolver = ProfileResolver::new(collaborators.profiles.clone());
        Self {
            registry,
            store,
            collaborators,
            resolver,
            settings: config.into(),
            cancel,
        }
    }

    /// Execute one firing. Returns the recorded outcome, or `None` when the
    /// firing was skipped or its result discarded.
    pub async fn execute(&self, task: ExecutionTask) -> Option<RunStatus> {
        let (job, started_at) = self.begin(task.job_id).await?;
        info!(job_id = %job.id, job = %job.name, job_type = %job.job_type(), "Job started");

        let result = AssertUnwindSafe(self.run_body(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(ExecutionError::RecoveredPanic(panic_message(payload.as_ref())))
            });

        let (status, summary) = match result {
            Ok(summary) => {
                info!(job_id = %job.id, job = %job.name, %summary, "Job finished");
                (RunStatus::Success, Some(summary))
            }
            Err(ExecutionError::RecoveredPanic(message)) => {
                error!(job_id = %job.id, job = %job.name, panic = %message, "Recovered from panic in job body");
                (RunStatus::Panicked, Some(message))
            }
            Err(ExecutionError::Cancelled) => {
                info!(job_id = %job.id, job = %job.name, "Job cancelled by shutdown");
                (RunStatus::Cancelled, None)
            }
            Err(ExecutionError::Body(e)) => {
                let message = format!("{e:#}");
                error!(job_id = %job.id, job = %job.name, error = %message, "Job failed");
                (RunStatus::Failed, Some(message))
            }
        };

        self.finish(&job, started_at, status, summary)
            .await
            .then_some(status)
    }

    /// Checking phase: atomically claim the job for this firing.
    async fn begin(&self, job_id: Uuid) -> Option<(ScheduledJob, DateTime<Utc>)> {
        let mut state = self.registry.write().await;
        let Some(entry) = state.jobs.get_mut(&job_id) else {
            debug!(%job_id, "Firing for unregistered job ignored");
            return None;
        };
        if !entry.job.enabled {
            debug!(%job_id, job = %entry.job.name, "Job disabled, skipping firing");
            return None;
        }
        if entry.running {
            info!(%job_id, job = %entry.job.name, "Job still running, skipping firing");
            return None;
        }
        entry.running = true;
        Some((entry.job.clone(), Utc::now()))
    }

    /// Cleanup phase. Returns false if the job was removed mid-run.
    async fn finish(
        &self,
        job: &ScheduledJob,
        started_at: DateTime<Utc>,
        status: RunStatus,
        summary: Option<String>,
    ) -> bool {
        let finished_at = Utc::now();
        let mut state = self.registry.write().await;
        let Some(entry) = state.jobs.get_mut(&job.id) else {
            debug!(job_id = %job.id, job = %job.name, "Job removed during execution, discarding outcome");
            return false;
        };

        entry.running = false;
        entry.job.last_run = Some(started_at);
        entry.job.next_run = CronSchedule::parse(&entry.job.cron_expression)
            .ok()
            .and_then(|s| s.next_after(finished_at));

        let updated = entry.job.clone();
        if let Err(e) = store::blocking(&self.store, move |s| s.update(&updated)).await {
            warn!(job_id = %job.id, error = %e, "Failed to write back last run");
        }

        let history = HistoryEntry {
            job_id: job.id,
            job_name: job.name.clone(),
            status,
            result_summary: summary,
            started_at,
            finished_at: Some(finished_at),
        };
        if let Err(e) = store::blocking(&self.store, move |s| s.record_run(&history)).await {
            warn!(job_id = %job.id, error = %e, "Failed to record run history");
        }
        true
    }

    async fn run_body(&self, job: &ScheduledJob) -> Result<String, ExecutionError> {
        match &job.config {
            JobConfig::Discovery(config) => self.run_discovery(config).await,
            JobConfig::Scan(config) => self.run_scan(job, config).await,
        }
    }

    async fn run_discovery(&self, config: &DiscoveryJobConfig) -> Result<String, ExecutionError> {
        let concurrency = match config.concurrency {
            0 => self.settings.default_discovery_concurrency,
            n => n,
        };
        let request = DiscoveryRequest {
            network: config.network.clone(),
            method: config.method.clone(),
            detect_os: config.detect_os,
            timeout: Duration::from_secs(config.timeout_seconds.max(1)),
            concurrency,
        };

        match self
            .collaborators
            .discovery
            .discover(&self.cancel, &request)
            .await
        {
            Ok(report) => Ok(report.to_string()),
            Err(_) if self.cancel.is_cancelled() => Err(ExecutionError::Cancelled),
            Err(e) => Err(e
                .context(format!("discovery of {} failed", config.network))
                .into()),
        }
    }

    async fn run_scan(
        &self,
        job: &ScheduledJob,
        config: &ScanJobConfig,
    ) -> Result<String, ExecutionError> {
        let hosts = self
            .collaborators
            .inventory
            .select(&config.filter())
            .await
            .context("host selection failed")?;

        if hosts.is_empty() {
            info!(job_id = %job.id, job = %job.name, "No hosts matched scan filter");
            return Ok("no matching hosts".to_string());
        }

        let mut tally = ScanTally::default();
        for (batch, hosts) in hosts.chunks(self.settings.batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                info!(job_id = %job.id, batch, %tally, "Scan stopped between batches");
                return Err(ExecutionError::Cancelled);
            }
            debug!(job_id = %job.id, batch, hosts = hosts.len(), "Scanning batch");

            let outcomes: Vec<HostOutcome> = stream::iter(hosts.iter().cloned())
                .map(|host| self.scan_host(job, config, host))
                .buffer_unordered(self.settings.host_concurrency)
                .collect()
                .await;
            for outcome in outcomes {
                tally.record(outcome);
            }
        }
        Ok(tally.to_string())
    }

    // By value: `execute` must stay `Send` for the driver workers.
    async fn scan_host(&self, job: &ScheduledJob, config: &ScanJobConfig, host: Host) -> HostOutcome {
        let profile = match self.resolver.resolve(&host, config.explicit_profile()).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(job_id = %job.id, host = %host.ip_address, error = %e, "No usable scan profile, skipping host");
                return HostOutcome::Skipped;
            }
        };

        let ip = host.ip_address;
        let target = ScanTarget {
            host,
            profile,
            options: config.options.clone(),
        };
        match self.collaborators.scanner.scan(&self.cancel, &target).await {
            Ok(report) => {
                debug!(job_id = %job.id, host = %ip, open = report.open.len(), "Host scanned");
                HostOutcome::Scanned
            }
            Err(e) => {
                warn!(job_id = %job.id, host = %ip, error = %format!("{e:#}"), "Host scan failed");
                HostOutcome::Failed
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
