use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use scanwarden::config::Config;
use scanwarden::scheduler::{DiscoveryJobConfig, JobConfig, ScanJobConfig, ScanOptions};

#[derive(Parser)]
#[command(
    name = "scanwarden",
    about = "Continuous network inventory: scheduled host discovery and port scanning",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $SCANWARDEN_CONFIG, then /etc/scanwarden/scanwarden.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the configuration
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon until Ctrl-C
    Serve,

    /// Manage scheduled jobs
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Inspect the scan profile catalogue
    Profiles {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// List every scan profile, built-ins first
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all scheduled jobs
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Add a host discovery job
    AddDiscovery {
        /// Job name
        #[arg(long)]
        name: String,

        /// Cron expression (5-field, 6-field with seconds, or @daily style)
        #[arg(long)]
        cron: String,

        /// Network to sweep, in CIDR notation
        #[arg(long)]
        network: String,

        /// Discovery method
        #[arg(long, default_value = "tcp")]
        method: String,

        /// Attempt OS detection
        #[arg(long)]
        detect_os: bool,

        /// Overall timeout in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// Concurrent probes (0 = scheduler default)
        #[arg(long, default_value = "0")]
        concurrency: usize,
    },

    /// Add a port scan job
    AddScan {
        /// Job name
        #[arg(long)]
        name: String,

        /// Cron expression (5-field, 6-field with seconds, or @daily style)
        #[arg(long)]
        cron: String,

        /// Only scan hosts that are currently up
        #[arg(long)]
        live_only: bool,

        /// Restrict to these networks (repeatable)
        #[arg(long = "network")]
        networks: Vec<String>,

        /// Restrict to one OS family
        #[arg(long)]
        os_family: Option<String>,

        /// Only hosts seen within this many hours
        #[arg(long)]
        max_age_hours: Option<u64>,

        /// Scan profile id ("auto" picks per host)
        #[arg(long)]
        profile: Option<String>,

        /// Port list replacing the profile's, e.g. "22,80,8000-8010"
        #[arg(long)]
        ports: Option<String>,

        /// Per-host timeout in seconds replacing the profile's
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Remove a job
    Remove {
        /// Job id
        #[arg(long)]
        id: Uuid,
    },

    /// Enable a job
    Enable {
        /// Job id
        #[arg(long)]
        id: Uuid,
    },

    /// Disable a job without removing it
    Disable {
        /// Job id
        #[arg(long)]
        id: Uuid,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// Show recent runs of a job
    History {
        /// Job id
        #[arg(long)]
        id: Uuid,

        /// Number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };
    if let Some(database) = &cli.database {
        config.database.path = database.clone();
    }
    Ok(config)
}

fn describe(config: &JobConfig) -> String {
    match config {
        JobConfig::Discovery(c) => format!("{} via {}", c.network, c.method),
        JobConfig::Scan(c) => {
            let scope = if c.networks.is_empty() {
                "all hosts".to_string()
            } else {
                c.networks.join(",")
            };
            let profile = c.explicit_profile().unwrap_or("auto");
            format!("{scope}, profile {profile}")
        }
    }
}

async fn run_schedule(config: &Config, action: ScheduleAction) -> Result<()> {
    let pool = scanwarden::storage::open_pool(&config.database.path, config.database.pool_size)?;
    let scheduler = scanwarden::build_scheduler(config, pool);
    scheduler.load().await.context("failed to load scheduled jobs")?;

    match action {
        ScheduleAction::List { json } => {
            let jobs = scheduler.get_jobs().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No scheduled jobs found.");
            } else {
                println!(
                    "{:<36} | {:<20} | {:<9} | {:<15} | {:<7} | {:<20} | Target",
                    "ID", "Name", "Type", "Cron", "Enabled", "Next run"
                );
                println!(
                    "{:-<36}-|-{:-<20}-|-{:-<9}-|-{:-<15}-|-{:-<7}-|-{:-<20}-|-{:-<20}",
                    "", "", "", "", "", "", ""
                );
                for snapshot in jobs {
                    let job = &snapshot.job;
                    let next = job
                        .next_run
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<36} | {:<20} | {:<9} | {:<15} | {:<7} | {:<20} | {}",
                        job.id,
                        job.name,
                        job.job_type(),
                        job.cron_expression,
                        job.enabled,
                        next,
                        describe(&job.config)
                    );
                }
            }
        }
        ScheduleAction::AddDiscovery {
            name,
            cron,
            network,
            method,
            detect_os,
            timeout,
            concurrency,
        } => {
            let job = scheduler
                .add_discovery_job(
                    &name,
                    &cron,
                    DiscoveryJobConfig {
                        network,
                        method,
                        detect_os,
                        timeout_seconds: timeout,
                        concurrency,
                    },
                )
                .await?;
            println!("Discovery job '{}' added with id {}.", job.name, job.id);
        }
        ScheduleAction::AddScan {
            name,
            cron,
            live_only,
            networks,
            os_family,
            max_age_hours,
            profile,
            ports,
            timeout,
        } => {
            let job = scheduler
                .add_scan_job(
                    &name,
                    &cron,
                    ScanJobConfig {
                        live_hosts_only: live_only,
                        networks,
                        os_family,
                        max_age_hours,
                        profile_id: profile,
                        options: ScanOptions {
                            ports,
                            timeout_seconds: timeout,
                        },
                    },
                )
                .await?;
            println!("Scan job '{}' added with id {}.", job.name, job.id);
        }
        ScheduleAction::Remove { id } => {
            scheduler.remove_job(id).await?;
            println!("Job {} removed.", id);
        }
        ScheduleAction::Enable { id } => {
            scheduler.enable_job(id).await?;
            println!("Job {} enabled.", id);
        }
        ScheduleAction::Disable { id } => {
            scheduler.disable_job(id).await?;
            println!("Job {} disabled.", id);
        }
        ScheduleAction::DryRun { hours } => {
            let preview = scheduler.preview(hours).await;
            if preview.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for entry in preview {
                    println!(
                        "{} : {} ({})",
                        entry.at.format("%Y-%m-%d %H:%M:%S"),
                        entry.name,
                        entry.job_type
                    );
                }
            }
        }
        ScheduleAction::History { id, limit } => {
            let runs = scheduler.history(id, limit).await?;
            if runs.is_empty() {
                println!("No runs recorded for job {}.", id);
            } else {
                println!("{:<20} | {:<9} | {:>8} | Summary", "Started", "Status", "Secs");
                println!("{:-<20}-|-{:-<9}-|-{:->8}-|-{:-<30}", "", "", "", "");
                for run in runs {
                    let secs = run
                        .finished_at
                        .map(|f| format!("{:.1}", (f - run.started_at).num_milliseconds() as f64 / 1000.0))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<20} | {:<9} | {:>8} | {}",
                        run.started_at.format("%Y-%m-%d %H:%M:%S"),
                        run.status,
                        secs,
                        run.result_summary.as_deref().unwrap_or("")
                    );
                }
            }
        }
    }

    Ok(())
}

async fn run_profiles(config: &Config, action: ProfileAction) -> Result<()> {
    let pool = scanwarden::storage::open_pool(&config.database.path, config.database.pool_size)?;
    let store = scanwarden::profiles::SqliteProfileStore::new(pool);

    match action {
        ProfileAction::List { json } => {
            let profiles = store.list().await.context("failed to list scan profiles")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&profiles)?);
                return Ok(());
            }
            println!(
                "{:<20} | {:<10} | {:<7} | {:>7} | Ports",
                "ID", "OS family", "Default", "Timeout"
            );
            println!("{:-<20}-|-{:-<10}-|-{:-<7}-|-{:->7}-|-{:-<20}", "", "", "", "", "");
            for profile in profiles {
                println!(
                    "{:<20} | {:<10} | {:<7} | {:>6}s | {}",
                    profile.id,
                    profile.os_family.as_deref().unwrap_or("any"),
                    profile.is_default,
                    profile.timeout_seconds,
                    profile.ports
                );
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    scanwarden::logging::init(&config.logging)?;

    match cli.command {
        Commands::Serve => {
            tracing::info!(db_path = %config.database.path, "Starting Scanwarden daemon");
            scanwarden::serve(config).await?;
        }
        Commands::Schedule { action } => run_schedule(&config, action).await?,
        Commands::Profiles { action } => run_profiles(&config, action).await?,
    }

    Ok(())
}
