//! Cron-driven job scheduler: job lifecycle, triggering and execution.

pub mod cron;
pub mod driver;
pub mod engine;
pub mod error;
pub mod history;
pub mod job;
pub mod registry;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use self::cron::CronSchedule;
pub use self::driver::{CronDriver, ExecutionTask, TriggerHandle};
pub use self::engine::{Collaborators, ExecutionEngine};
pub use self::error::SchedulerError;
pub use self::history::{HistoryEntry, RunStatus};
pub use self::job::{DiscoveryJobConfig, JobConfig, JobType, ScanJobConfig, ScanOptions, ScheduledJob};
pub use self::registry::{Registry, RuntimeJobState};
pub use self::service::{JobSnapshot, PreviewEntry, Scheduler};
pub use self::store::{JobStore, SqliteJobStore, StoreError};
