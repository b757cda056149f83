//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            cron_expression TEXT NOT NULL,
            config TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_run TEXT,
            next_run TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS schedule_history (
            id INTEGER PRIMARY KEY,
            job_id TEXT NOT NULL,
            job_name TEXT NOT NULL,
            status TEXT NOT NULL,
            result_summary TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            FOREIGN KEY (job_id) REFERENCES scheduled_jobs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS hosts (
            id TEXT PRIMARY KEY,
            ip_address TEXT NOT NULL UNIQUE,
            hostname TEXT,
            os_family TEXT,
            status TEXT NOT NULL DEFAULT 'unknown',
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scan_profiles (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            os_family TEXT,
            ports TEXT NOT NULL,
            scan_type TEXT NOT NULL DEFAULT 'connect',
            timeout_seconds INTEGER NOT NULL DEFAULT 30,
            is_default INTEGER NOT NULL DEFAULT 0,
            built_in INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS port_scans (
            id INTEGER PRIMARY KEY,
            ip_address TEXT NOT NULL,
            port INTEGER NOT NULL,
            state TEXT NOT NULL,
            profile_id TEXT,
            latency_ms REAL,
            scanned_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_created ON scheduled_jobs(created_at);
        CREATE INDEX IF NOT EXISTS idx_schedule_history_job ON schedule_history(job_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_hosts_last_seen ON hosts(last_seen);
        CREATE INDEX IF NOT EXISTS idx_port_scans_ip ON port_scans(ip_address, scanned_at);",
    )?;

    // Migration: Add scan-exclusion and discovery counters to hosts if missing
    for (column, ddl) in [
        (
            "ignore_scanning",
            "ALTER TABLE hosts ADD COLUMN ignore_scanning INTEGER NOT NULL DEFAULT 0",
        ),
        (
            "discovery_count",
            "ALTER TABLE hosts ADD COLUMN discovery_count INTEGER NOT NULL DEFAULT 0",
        ),
    ] {
        let present: i32 = conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('hosts') WHERE name = ?1",
                [column],
                |row| row.get(0),
            )
            .unwrap_or(0);
        if present == 0 {
            conn.execute(ddl, [])?;
        }
    }

    seed_builtin_profiles(conn)?;

    Ok(())
}

/// Built-in profiles: one global default plus per-OS-family defaults.
fn seed_builtin_profiles(conn: &Connection) -> Result<()> {
    let builtins: [(&str, &str, Option<&str>, &str, i64); 4] = [
        (
            "generic-default",
            "Generic default",
            None,
            "21,22,23,25,53,80,110,143,443,445,3389,8080",
            30,
        ),
        (
            "linux-default",
            "Linux servers",
            Some("linux"),
            "22,80,111,443,2049,3306,5432,6379,8080,9100",
            30,
        ),
        (
            "windows-default",
            "Windows hosts",
            Some("windows"),
            "80,135,139,443,445,3389,5985,5986",
            30,
        ),
        (
            "macos-default",
            "macOS hosts",
            Some("macos"),
            "22,88,445,548,631,5900",
            30,
        ),
    ];

    for (id, name, family, ports, timeout) in builtins {
        conn.execute(
            "INSERT OR IGNORE INTO scan_profiles
                 (id, name, description, os_family, ports, scan_type, timeout_seconds, is_default, built_in)
             VALUES (?1, ?2, ?3, ?4, ?5, 'connect', ?6, 1, 1)",
            rusqlite::params![id, name, format!("Built-in profile: {name}"), family, ports, timeout],
        )?;
    }
    Ok(())
}
