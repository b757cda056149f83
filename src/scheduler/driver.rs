//! Cron driver: turns cron registrations into execution tasks.
//!
//! A single ticker task wakes every `tick_interval_ms`, collects every
//! trigger whose firing time has passed and enqueues an [`ExecutionTask`]
//! on a bounded queue. A fixed set of workers drains the queue, running one
//! task at a time each. When the queue is full the firing is dropped, the
//! same policy the engine applies to a job that is still running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cron::CronSchedule;
use super::engine::ExecutionEngine;
use crate::config::SchedulerConfig;

/// Opaque token identifying one cron registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerHandle(u64);

/// One due firing of a job.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub job_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
}

#[derive(Debug)]
struct Trigger {
    job_id: Uuid,
    schedule: CronSchedule,
    next: Option<DateTime<Utc>>,
}

/// Set of cron registrations. Registrations may change while the ticker runs.
#[derive(Debug, Default)]
pub struct CronDriver {
    triggers: Mutex<HashMap<TriggerHandle, Trigger>>,
    next_handle: AtomicU64,
}

impl CronDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, job_id: Uuid, schedule: CronSchedule) -> TriggerHandle {
        let handle = TriggerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let next = schedule.next_after(Utc::now());
        self.triggers.lock().await.insert(
            handle,
            Trigger {
                job_id,
                schedule,
                next,
            },
        );
        handle
    }

    /// Remove a registration. Returns false if it was already gone.
    pub async fn deregister(&self, handle: TriggerHandle) -> bool {
        self.triggers.lock().await.remove(&handle).is_some()
    }

    /// Drop every registration.
    pub async fn clear(&self) {
        self.triggers.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.triggers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.triggers.lock().await.is_empty()
    }

    #[cfg(test)]
    async fn next_fire(&self, handle: TriggerHandle) -> Option<DateTime<Utc>> {
        self.triggers.lock().await.get(&handle).and_then(|t| t.next)
    }

    /// Collect every firing due at `now` and advance those triggers past
    /// `now`. Several missed firings of one trigger collapse into one task.
    pub async fn due(&self, now: DateTime<Utc>) -> Vec<ExecutionTask> {
        let mut triggers = self.triggers.lock().await;
        let mut tasks = Vec::new();
        for trigger in triggers.values_mut() {
            let Some(next) = trigger.next else { continue };
            if next <= now {
                tasks.push(ExecutionTask {
                    job_id: trigger.job_id,
                    scheduled_for: next,
                });
                trigger.next = trigger.schedule.next_after(now);
            }
        }
        tasks
    }
}

/// Spawn the ticker and worker tasks. Everything exits once `cancel` fires;
/// a worker that is mid-execution finishes that execution first.
pub(crate) fn spawn(
    driver: Arc<CronDriver>,
    engine: Arc<ExecutionEngine>,
    config: &SchedulerConfig,
    cancel: CancellationToken,
) -> (mpsc::Sender<ExecutionTask>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let mut tasks = Vec::with_capacity(config.workers + 1);

    let tick = Duration::from_millis(config.tick_interval_ms.max(1));
    tasks.push(tokio::spawn(run_ticker(
        driver,
        tx.clone(),
        tick,
        cancel.clone(),
    )));

    for worker in 0..config.workers.max(1) {
        tasks.push(tokio::spawn(run_worker(
            worker,
            rx.clone(),
            engine.clone(),
            cancel.clone(),
        )));
    }

    (tx, tasks)
}

async fn run_ticker(
    driver: Arc<CronDriver>,
    queue: mpsc::Sender<ExecutionTask>,
    tick: Duration,
    cancel: CancellationToken,
) {
    info!(tick_ms = tick.as_millis() as u64, "Cron driver started");
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        for task in driver.due(Utc::now()).await {
            match queue.try_send(task) {
                Ok(()) => {}
                Err(TrySendError::Full(task)) => {
                    warn!(job_id = %task.job_id, "Execution queue full, dropping firing");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Execution queue closed, cron driver exiting");
                    return;
                }
            }
        }
    }
    info!("Cron driver stopped");
}

async fn run_worker(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<ExecutionTask>>>,
    engine: Arc<ExecutionEngine>,
    cancel: CancellationToken,
) {
    loop {
        let task = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = task else { break };
        if cancel.is_cancelled() {
            debug!(worker, job_id = %task.job_id, "Scheduler stopping, dropping queued task");
            break;
        }

        debug!(worker, job_id = %task.job_id, scheduled_for = %task.scheduled_for, "Worker picked up task");
        engine.execute(task).await;
    }
    debug!(worker, "Worker exiting");
}
