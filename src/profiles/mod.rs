//! Scan profiles and per-host profile resolution.

use std::sync::Arc;

use rusqlite::{OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;

use crate::inventory::Host;
use crate::storage::{Pool, StorageError};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("scan profile '{0}' not found")]
    ProfileNotFound(String),

    #[error("no scan profile available")]
    NoProfileAvailable,

    #[error("profile lookup failed: {0}")]
    Lookup(#[from] StorageError),
}

impl From<rusqlite::Error> for ProfileError {
    fn from(e: rusqlite::Error) -> Self {
        ProfileError::Lookup(e.into())
    }
}

impl From<r2d2::Error> for ProfileError {
    fn from(e: r2d2::Error) -> Self {
        ProfileError::Lookup(e.into())
    }
}

/// How to scan one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// `None` for profiles that apply to any OS family.
    pub os_family: Option<String>,
    /// Port list, e.g. `"22,80,8000-8010"`.
    pub ports: String,
    pub scan_type: String,
    pub timeout_seconds: u64,
    pub is_default: bool,
}

/// Read access to the profile catalogue.
#[async_trait::async_trait]
pub trait ProfileService: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Profile>, ProfileError>;

    /// The global default profile.
    async fn get_default(&self) -> Result<Option<Profile>, ProfileError>;

    async fn get_default_for_os_family(&self, family: &str)
        -> Result<Option<Profile>, ProfileError>;
}

/// SQLite-backed profile catalogue.
#[derive(Clone)]
pub struct SqliteProfileStore {
    pool: Pool,
}

const PROFILE_COLUMNS: &str =
    "id, name, description, os_family, ports, scan_type, timeout_seconds, is_default";

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    let timeout: i64 = row.get(6)?;
    Ok(Profile {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        os_family: row.get(3)?,
        ports: row.get(4)?,
        scan_type: row.get(5)?,
        timeout_seconds: timeout.max(0) as u64,
        is_default: row.get(7)?,
    })
}

impl SqliteProfileStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn query_one(
        &self,
        sql: String,
        arg: Option<String>,
    ) -> Result<Option<Profile>, ProfileError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Profile>, ProfileError> {
            let conn = pool.get()?;
            let profile = match arg {
                Some(arg) => conn.query_row(&sql, [arg], profile_from_row).optional()?,
                None => conn.query_row(&sql, [], profile_from_row).optional()?,
            };
            Ok(profile)
        })
        .await
        .map_err(StorageError::from)?
    }

    /// Every profile, built-ins first.
    pub async fn list(&self) -> Result<Vec<Profile>, ProfileError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Profile>, ProfileError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROFILE_COLUMNS} FROM scan_profiles ORDER BY built_in DESC, id"
            ))?;
            let profiles = stmt
                .query_map([], profile_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(profiles)
        })
        .await
        .map_err(StorageError::from)?
    }
}

#[async_trait::async_trait]
impl ProfileService for SqliteProfileStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Profile>, ProfileError> {
        self.query_one(
            format!("SELECT {PROFILE_COLUMNS} FROM scan_profiles WHERE id = ?1"),
            Some(id.to_string()),
        )
        .await
    }

    async fn get_default(&self) -> Result<Option<Profile>, ProfileError> {
        self.query_one(
            format!(
                "SELECT {PROFILE_COLUMNS} FROM scan_profiles
                 WHERE is_default = 1 AND os_family IS NULL
                 ORDER BY built_in DESC, id LIMIT 1"
            ),
            None,
        )
        .await
    }

    async fn get_default_for_os_family(
        &self,
        family: &str,
    ) -> Result<Option<Profile>, ProfileError> {
        self.query_one(
            format!(
                "SELECT {PROFILE_COLUMNS} FROM scan_profiles
                 WHERE is_default = 1 AND lower(os_family) = lower(?1)
                 ORDER BY built_in DESC, id LIMIT 1"
            ),
            Some(family.to_string()),
        )
        .await
    }
}

/// Picks the profile for one host of one scan-job execution.
///
/// Order: the job's explicit profile, then the default for the host's OS
/// family, then the global default.
#[derive(Clone)]
pub struct ProfileResolver {
    profiles: Arc<dyn ProfileService>,
}

impl ProfileResolver {
    pub fn new(profiles: Arc<dyn ProfileService>) -> Self {
        Self { profiles }
    }

    pub async fn resolve(&self, host: &Host, explicit: Option<&str>) -> Result<Profile, ProfileError> {
        if let Some(id) = explicit {
            return self
                .profiles
                .get_by_id(id)
                .await?
                .ok_or_else(|| ProfileError::ProfileNotFound(id.to_string()));
        }

        if let Some(family) = host.os_family.as_deref().filter(|f| !f.is_empty()) {
            if let Some(profile) = self.profiles.get_default_for_os_family(family).await? {
                return Ok(profile);
            }
        }

        self.profiles
            .get_default()
            .await?
            .ok_or(ProfileError::NoProfileAvailable)
    }
}
