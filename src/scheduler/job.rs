//! Persisted job definitions and their per-type configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inventory::HostSelectionFilter;

/// Kind of work a scheduled job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Discovery,
    Scan,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Discovery => "discovery",
            JobType::Scan => "scan",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(JobType::Discovery),
            "scan" => Ok(JobType::Scan),
            other => Err(format!("unknown job type '{other}'")),
        }
    }
}

fn default_method() -> String {
    "tcp".to_string()
}

fn default_discovery_timeout() -> u64 {
    300
}

/// Configuration of a host discovery job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryJobConfig {
    /// CIDR to sweep, e.g. `10.0.0.0/24`.
    pub network: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub detect_os: bool,
    #[serde(default = "default_discovery_timeout")]
    pub timeout_seconds: u64,
    /// Zero means "use the scheduler default".
    #[serde(default)]
    pub concurrency: usize,
}

impl DiscoveryJobConfig {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            method: default_method(),
            detect_os: false,
            timeout_seconds: default_discovery_timeout(),
            concurrency: 0,
        }
    }
}

/// Per-job overrides handed to the scanner alongside the resolved profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Port list replacing the profile's ports, e.g. `"22,80,8000-8010"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    /// Per-host timeout replacing the profile's timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Configuration of a scan job: which hosts, and how to scan them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanJobConfig {
    #[serde(default)]
    pub live_hosts_only: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_hours: Option<u64>,
    /// Explicit profile; `None`, empty or `"auto"` selects per host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub options: ScanOptions,
}

impl ScanJobConfig {
    /// Host selection filter for one execution of this job.
    pub fn filter(&self) -> HostSelectionFilter {
        HostSelectionFilter {
            live_only: self.live_hosts_only,
            networks: self.networks.clone(),
            os_family: self.os_family.clone().filter(|f| !f.is_empty()),
            // An age too large for a TimeDelta places no bound at all.
            max_age: self
                .max_age_hours
                .filter(|h| *h > 0)
                .and_then(|h| i64::try_from(h).ok())
                .and_then(chrono::TimeDelta::try_hours),
        }
    }

    /// The profile the operator pinned, if any.
    pub fn explicit_profile(&self) -> Option<&str> {
        self.profile_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty() && !id.eq_ignore_ascii_case("auto"))
    }
}

/// Type-specific job configuration. The variant decides the job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum JobConfig {
    Discovery(DiscoveryJobConfig),
    Scan(ScanJobConfig),
}

impl JobConfig {
    pub fn job_type(&self) -> JobType {
        match self {
            JobConfig::Discovery(_) => JobType::Discovery,
            JobConfig::Scan(_) => JobType::Scan,
        }
    }

    /// Encode just the variant's fields, as stored in the `config` column.
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            JobConfig::Discovery(c) => serde_json::to_string(c),
            JobConfig::Scan(c) => serde_json::to_string(c),
        }
    }

    /// Decode a `config` column according to the row's `type` column.
    pub fn from_json(job_type: JobType, raw: &str) -> serde_json::Result<Self> {
        Ok(match job_type {
            JobType::Discovery => JobConfig::Discovery(serde_json::from_str(raw)?),
            JobType::Scan => JobConfig::Scan(serde_json::from_str(raw)?),
        })
    }
}

/// A persisted scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub config: JobConfig,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// A new, enabled job that has never run.
    pub fn new(name: impl Into<String>, cron_expression: impl Into<String>, config: JobConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            cron_expression: cron_expression.into(),
            enabled: true,
            config,
            last_run: None,
            next_run: None,
            created_at: Utc::now(),
        }
    }

    pub fn job_type(&self) -> JobType {
        self.config.job_type()
    }
}
