//! In-memory job registry guarded by a single read-write lock.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::driver::{ExecutionTask, TriggerHandle};
use super::job::ScheduledJob;

/// Runtime state of one registered job. Never persisted.
#[derive(Debug)]
pub struct RuntimeJobState {
    /// Cached copy of the persisted job; `enabled` mirrors the store.
    pub job: ScheduledJob,
    /// True only while one execution of the job body is in flight.
    pub running: bool,
    pub trigger: TriggerHandle,
}

impl RuntimeJobState {
    pub fn new(job: ScheduledJob, trigger: TriggerHandle) -> Self {
        Self {
            job,
            running: false,
            trigger,
        }
    }
}

/// Handles owned by a started scheduler.
#[derive(Debug)]
pub(crate) struct Runtime {
    pub cancel: CancellationToken,
    pub queue: mpsc::Sender<ExecutionTask>,
    pub tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    pub jobs: HashMap<Uuid, RuntimeJobState>,
    /// `Some` while the scheduler is started.
    pub runtime: Option<Runtime>,
}

impl RegistryState {
    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }
}

/// The registry shared by the scheduler and its execution engine.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.inner.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner.write().await
    }

    pub async fn len(&self) -> usize {
        self.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.read().await.jobs.is_empty()
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.read().await.jobs.contains_key(&id)
    }

    /// Whether `id` is currently executing. `None` if it is not registered.
    pub async fn is_job_running(&self, id: Uuid) -> Option<bool> {
        self.read().await.jobs.get(&id).map(|s| s.running)
    }
}
