//! Scheduler management API: lifecycle and job CRUD over the registry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cron::CronSchedule;
use super::driver::{self, CronDriver, ExecutionTask};
use super::engine::{Collaborators, ExecutionEngine};
use super::error::SchedulerError;
use super::history::HistoryEntry;
use super::job::{DiscoveryJobConfig, JobConfig, JobType, ScanJobConfig, ScheduledJob};
use super::registry::{Registry, RegistryState, Runtime, RuntimeJobState};
use super::store::{self, JobStore, StoreError};
use crate::config::SchedulerConfig;

/// A job as reported by [`Scheduler::get_jobs`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub job: ScheduledJob,
    pub running: bool,
}

/// One upcoming firing reported by [`Scheduler::preview`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewEntry {
    pub at: DateTime<Utc>,
    pub job_id: Uuid,
    pub name: String,
    pub job_type: JobType,
}

/// The job scheduler. Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    collaborators: Collaborators,
    config: SchedulerConfig,
    registry: Arc<Registry>,
    driver: Arc<CronDriver>,
}

fn fresh_next_run(cron_expression: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    CronSchedule::parse(cron_expression)
        .ok()
        .and_then(|s| s.next_after(now))
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        collaborators: Collaborators,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            collaborators,
            config,
            registry: Arc::new(Registry::new()),
            driver: Arc::new(CronDriver::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Load every persisted job and start firing them.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.registry.write().await;
        if state.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let loaded = self.populate(&mut state).await?;

        let cancel = CancellationToken::new();
        let engine = Arc::new(ExecutionEngine::new(
            self.registry.clone(),
            self.store.clone(),
            self.collaborators.clone(),
            &self.config,
            cancel.clone(),
        ));
        let (queue, tasks) = driver::spawn(self.driver.clone(), engine, &self.config, cancel.clone());
        state.runtime = Some(Runtime {
            cancel,
            queue,
            tasks,
        });

        info!(jobs = loaded, workers = self.config.workers, "Scheduler started");
        Ok(())
    }

    /// Populate the registry from the store without starting the driver.
    /// Used by one-shot management commands.
    pub async fn load(&self) -> Result<usize, SchedulerError> {
        let mut state = self.registry.write().await;
        if state.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.populate(&mut state).await
    }

    /// Rebuild the registry from the store. Jobs still executing from a
    /// previous run keep their running flag.
    async fn populate(&self, state: &mut RegistryState) -> Result<usize, SchedulerError> {
        let jobs = store::blocking(&self.store, |s| s.get_all())
            .await
            .map_err(SchedulerError::FailedToLoadJobs)?;

        self.driver.clear().await;
        let previous = std::mem::take(&mut state.jobs);
        let now = Utc::now();

        for mut job in jobs {
            let schedule = match CronSchedule::parse(&job.cron_expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(job_id = %job.id, job = %job.name, error = %e, "Skipping job with unusable cron expression");
                    continue;
                }
            };
            job.next_run = schedule.next_after(now);
            let trigger = self.driver.register(job.id, schedule).await;

            let mut entry = RuntimeJobState::new(job, trigger);
            entry.running = previous.get(&entry.job.id).is_some_and(|p| p.running);
            debug!(job_id = %entry.job.id, job = %entry.job.name, next_run = ?entry.job.next_run, "Job registered");
            state.jobs.insert(entry.job.id, entry);
        }

        Ok(state.jobs.len())
    }

    /// Stop firing jobs. In-flight executions are not interrupted; they
    /// see the cancellation and finish on their own. No-op when stopped.
    pub async fn stop(&self) {
        // Dropping the handles detaches the tasks; they exit on cancellation.
        drop(self.halt().await);
    }

    /// [`stop`](Self::stop), then wait for the driver and every in-flight
    /// execution to finish.
    pub async fn shutdown(&self) {
        for task in self.halt().await {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
    }

    async fn halt(&self) -> Vec<JoinHandle<()>> {
        let runtime = self.registry.write().await.runtime.take();
        match runtime {
            Some(runtime) => {
                runtime.cancel.cancel();
                info!("Scheduler stopped");
                runtime.tasks
            }
            None => {
                debug!("Stop requested on a scheduler that is not running");
                Vec::new()
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.registry.read().await.is_running()
    }

    pub async fn add_discovery_job(
        &self,
        name: &str,
        cron_expression: &str,
        config: DiscoveryJobConfig,
    ) -> Result<ScheduledJob, SchedulerError> {
        self.add_job(name, cron_expression, JobConfig::Discovery(config))
            .await
    }

    pub async fn add_scan_job(
        &self,
        name: &str,
        cron_expression: &str,
        config: ScanJobConfig,
    ) -> Result<ScheduledJob, SchedulerError> {
        self.add_job(name, cron_expression, JobConfig::Scan(config))
            .await
    }

    async fn add_job(
        &self,
        name: &str,
        cron_expression: &str,
        config: JobConfig,
    ) -> Result<ScheduledJob, SchedulerError> {
        let schedule = CronSchedule::parse(cron_expression)?;
        let mut job = ScheduledJob::new(name, schedule.expression(), config);
        job.next_run = schedule.next_after(Utc::now());

        let mut state = self.registry.write().await;
        let persisted = job.clone();
        store::blocking(&self.store, move |s| s.create(&persisted))
            .await
            .map_err(SchedulerError::PersistenceFailed)?;

        let trigger = self.driver.register(job.id, schedule).await;
        state
            .jobs
            .insert(job.id, RuntimeJobState::new(job.clone(), trigger));

        info!(job_id = %job.id, job = %job.name, job_type = %job.job_type(), cron = %job.cron_expression, "Job added");
        Ok(job)
    }

    /// Remove a job. Its trigger is deregistered before the store row is
    /// deleted; if the delete fails the job stays listed but no longer fires.
    pub async fn remove_job(&self, id: Uuid) -> Result<(), SchedulerError> {
        let mut state = self.registry.write().await;
        let Some(entry) = state.jobs.get(&id) else {
            return Err(SchedulerError::JobNotFound(id));
        };

        self.driver.deregister(entry.trigger).await;
        store::blocking(&self.store, move |s| s.delete(id))
            .await
            .map_err(SchedulerError::PersistenceFailed)?;

        if let Some(removed) = state.jobs.remove(&id) {
            info!(job_id = %id, job = %removed.job.name, running = removed.running, "Job removed");
        }
        Ok(())
    }

    pub async fn enable_job(&self, id: Uuid) -> Result<(), SchedulerError> {
        self.set_enabled(id, true).await
    }

    /// Disabled jobs keep their trigger; the engine skips their firings.
    pub async fn disable_job(&self, id: Uuid) -> Result<(), SchedulerError> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), SchedulerError> {
        let mut state = self.registry.write().await;
        let Some(entry) = state.jobs.get_mut(&id) else {
            return Err(SchedulerError::JobNotFound(id));
        };

        store::blocking(&self.store, move |s| s.set_enabled(id, enabled))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(id) => SchedulerError::JobNotFound(id),
                e => SchedulerError::PersistenceFailed(e),
            })?;

        entry.job.enabled = enabled;
        info!(job_id = %id, job = %entry.job.name, enabled, "Job enabled flag updated");
        Ok(())
    }

    /// Every persisted job with a freshly computed `next_run`. A store
    /// failure yields an empty listing.
    pub async fn get_jobs(&self) -> Vec<JobSnapshot> {
        let state = self.registry.read().await;
        let jobs = match store::blocking(&self.store, |s| s.get_all()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Failed to list jobs from store");
                return Vec::new();
            }
        };

        let now = Utc::now();
        jobs.into_iter()
            .map(|mut job| {
                job.next_run = fresh_next_run(&job.cron_expression, now);
                let running = state.jobs.get(&job.id).is_some_and(|e| e.running);
                JobSnapshot { job, running }
            })
            .collect()
    }

    pub async fn get_job(&self, id: Uuid) -> Result<JobSnapshot, SchedulerError> {
        let state = self.registry.read().await;
        let entry = state.jobs.get(&id).ok_or(SchedulerError::JobNotFound(id))?;
        let mut job = entry.job.clone();
        job.next_run = fresh_next_run(&job.cron_expression, Utc::now());
        Ok(JobSnapshot {
            job,
            running: entry.running,
        })
    }

    /// Queue an immediate firing. It passes through the same checks as a
    /// cron firing, so a disabled or busy job is skipped.
    pub async fn run_now(&self, id: Uuid) -> Result<(), SchedulerError> {
        let queue = {
            let state = self.registry.read().await;
            if !state.jobs.contains_key(&id) {
                return Err(SchedulerError::JobNotFound(id));
            }
            state
                .runtime
                .as_ref()
                .map(|rt| rt.queue.clone())
                .ok_or(SchedulerError::NotRunning)?
        };

        queue
            .send(ExecutionTask {
                job_id: id,
                scheduled_for: Utc::now(),
            })
            .await
            .map_err(|_| SchedulerError::NotRunning)
    }

    /// Firings of every enabled job within the next `hours`, earliest first.
    /// Each job contributes at most `preview_limit_per_job` entries.
    pub async fn preview(&self, hours: u64) -> Vec<PreviewEntry> {
        let now = Utc::now();
        let until = now + chrono::Duration::hours(hours.min(24 * 366) as i64);
        let state = self.registry.read().await;

        let mut entries = Vec::new();
        for entry in state.jobs.values().filter(|e| e.job.enabled) {
            let Ok(schedule) = CronSchedule::parse(&entry.job.cron_expression) else {
                continue;
            };
            let limit = self.config.preview_limit_per_job.max(1);
            let firings = schedule.upcoming(now, until, limit);
            if firings.len() == limit {
                debug!(job_id = %entry.job.id, job = %entry.job.name, limit, "Preview truncated");
            }
            entries.extend(firings.into_iter().map(|at| PreviewEntry {
                at,
                job_id: entry.job.id,
                name: entry.job.name.clone(),
                job_type: entry.job.job_type(),
            }));
        }
        entries.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.name.cmp(&b.name)));
        entries
    }

    /// Most recent outcomes of a job, newest first.
    pub async fn history(&self, id: Uuid, limit: usize) -> Result<Vec<HistoryEntry>, SchedulerError> {
        if !self.registry.contains(id).await {
            return Err(SchedulerError::JobNotFound(id));
        }
        store::blocking(&self.store, move |s| s.recent_runs(id, limit))
            .await
            .map_err(SchedulerError::PersistenceFailed)
    }
}
