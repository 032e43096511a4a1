use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::config::{load_config, load_config_from, PgdockConfig};
use daemon::cli::DaemonStatus;
use daemon::{App, Registration};
use metastore::{BackupConfig, ClusterInfo, Destination, Schedule, AWS_DESTINATION};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[clap(
    name = "pgdock",
    about = "Single-host Postgres provisioning, monitoring and backups on Docker",
    version
)]
struct Cli {
    /// Configuration file to use instead of the default locations
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create and inspect database clusters
    #[clap(subcommand)]
    Cluster(ClusterCommands),

    /// Schedule, list and restore WAL-G backups
    #[clap(subcommand)]
    Backup(BackupCommands),

    /// Inspect the effective configuration
    #[clap(subcommand)]
    Config(ConfigCommands),

    /// Start the pgdock daemon
    Start,

    /// Stop the pgdock daemon
    Stop,

    /// Restart the pgdock daemon
    Restart,

    /// Run the pgdock daemon in the foreground
    Run,

    /// Get the status of the pgdock daemon
    Status,
}

#[derive(Subcommand, Debug)]
enum ClusterCommands {
    /// Provision a new Postgres cluster
    Create {
        /// Cluster name, unique on this host
        name: String,
        #[clap(long, default_value = "postgres")]
        username: String,
        /// Generated when omitted
        #[clap(long)]
        password: Option<String>,
        /// Postgres version as major.minor
        #[clap(long = "pg-version", default_value = "16.2", value_parser = parse_version)]
        version: (u32, u32),
        /// Host port, allocated from the configured range when omitted
        #[clap(long, default_value_t = 0)]
        port: u16,
        /// CPU shares
        #[clap(long, default_value_t = 0)]
        cpu: i64,
        /// Memory limit in bytes
        #[clap(long, default_value_t = 0)]
        memory: i64,
        /// Register the cluster with the monitoring stack
        #[clap(long)]
        monitoring: bool,
    },

    /// List all clusters
    List,

    /// Show one cluster by container id
    Get { cluster_id: String },
}

#[derive(Subcommand, Debug)]
enum BackupCommands {
    /// Store a backup schedule and prepare the cluster for WAL-G
    Create {
        cluster_id: String,
        #[clap(long)]
        bucket: String,
        #[clap(long)]
        key_id: String,
        #[clap(long)]
        key_secret: String,
        #[clap(long)]
        minute: Option<String>,
        #[clap(long)]
        hour: Option<String>,
        #[clap(long)]
        dom: Option<String>,
        #[clap(long)]
        month: Option<String>,
        #[clap(long)]
        dow: Option<String>,
    },

    /// Restore a base backup into a cluster, LATEST when no name is given
    Restore {
        cluster_id: String,
        #[clap(long, default_value = "")]
        backup: String,
        /// Network of the restore helper, the configured network by default
        #[clap(long)]
        network: Option<String>,
    },

    /// List the base backups stored for a cluster
    List { cluster_id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
}

fn parse_version(value: &str) -> Result<(u32, u32), String> {
    let (major, minor) = value
        .split_once('.')
        .ok_or_else(|| format!("{value} is not of the form major.minor"))?;
    let major = major.parse().map_err(|e| format!("invalid major version: {e}"))?;
    let minor = minor.parse().map_err(|e| format!("invalid minor version: {e}"))?;
    Ok((major, minor))
}

fn init_logging() -> Result<()> {
    let logger = env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_level(true)
        .format_module_path(false)
        .format_indent(Some(4))
        .filter_level(log::LevelFilter::Info)
        .build();
    let level = logger.filter();
    log::set_boxed_logger(Box::new(sentry_log::SentryLogger::with_dest(logger)))?;
    log::set_max_level(level);
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn redacted(mut cluster: ClusterInfo) -> ClusterInfo {
    cluster.password = "********".to_string();
    if let Some(backup) = cluster.backup.as_mut() {
        backup.destination.api_key_secret = "********".to_string();
    }
    cluster
}

async fn cluster_command(config: PgdockConfig, command: ClusterCommands) -> Result<()> {
    let app = App::connect(config).await?;
    match command {
        ClusterCommands::Create {
            name,
            username,
            password,
            version: (major, minor),
            port,
            cpu,
            memory,
            monitoring,
        } => {
            let password = password.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
            let mut cluster = ClusterInfo::new(&name, &username, &password, major, minor);
            cluster.port = port;
            cluster.cpu = cpu;
            cluster.memory = memory;
            cluster.monitoring = monitoring;

            app.clusters
                .create_service(&mut cluster)
                .await
                .with_context(|| format!("Failed to create cluster {name}"))?;

            if let Some(mut registration) = app.clusters.registration(&cluster.cluster_id) {
                match tokio::time::timeout(
                    Duration::from_secs(120),
                    registration.wait_for(Registration::is_done),
                )
                .await
                {
                    Ok(Ok(status)) => log::info!("Monitoring registration: {:?}", *status),
                    _ => log::warn!("Monitoring registration of {name} did not finish"),
                }
            }
            print_json(&cluster)?;
        }
        ClusterCommands::List => {
            let clusters: Vec<ClusterInfo> = app
                .clusters
                .list_clusters()
                .await?
                .into_iter()
                .map(redacted)
                .collect();
            print_json(&clusters)?;
        }
        ClusterCommands::Get { cluster_id } => {
            let cluster = app.clusters.get_cluster_by_id(&cluster_id).await?;
            print_json(&redacted(cluster))?;
        }
    }
    Ok(())
}

async fn backup_command(config: PgdockConfig, command: BackupCommands) -> Result<()> {
    let default_network = config.common.network_name.clone();
    let app = App::connect(config).await?;
    match command {
        BackupCommands::Create {
            cluster_id,
            bucket,
            key_id,
            key_secret,
            minute,
            hour,
            dom,
            month,
            dow,
        } => {
            let backup = BackupConfig {
                schedule: Schedule {
                    minute,
                    hour,
                    dom,
                    month,
                    dow,
                },
                destination: Destination {
                    name: AWS_DESTINATION.to_string(),
                    bucket_name: bucket,
                    api_key_id: key_id,
                    api_key_secret: key_secret,
                },
            };
            app.backups
                .create_backup(&cluster_id, &backup)
                .await
                .with_context(|| format!("Failed to create backup for cluster {cluster_id}"))?;
            log::info!(
                "Backup of {cluster_id} stored with schedule {}, the daemon runs it",
                backup.schedule
            );
        }
        BackupCommands::Restore {
            cluster_id,
            backup,
            network,
        } => {
            let network = network.unwrap_or(default_network);
            app.backups
                .restore(&network, &cluster_id, &backup)
                .await
                .with_context(|| format!("Failed to restore cluster {cluster_id}"))?;
        }
        BackupCommands::List { cluster_id } => {
            let backups = app.backups.list_backups(&cluster_id).await?;
            print_json(&backups)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config_path = cli.config.clone();
    let config = match &config_path {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .context("Failed to load configuration")?;

    let _sentry = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let config_arg = config_path.as_ref().map(|path| path.to_string_lossy().into_owned());
    match cli.command {
        Commands::Cluster(command) => cluster_command(config, command).await?,
        Commands::Backup(command) => backup_command(config, command).await?,
        Commands::Config(ConfigCommands::Show) => print!("{}", config.to_toml()?),
        Commands::Run => daemon::cli::run::execute(config).await?,
        Commands::Start => daemon::cli::start::execute(&config, config_arg.as_deref()).await?,
        Commands::Stop => daemon::cli::stop::execute(&config).await?,
        Commands::Restart => {
            log::info!("Restarting pgdock daemon...");
            daemon::cli::stop::execute(&config).await?;
            // the old process removes its PID file on the way out
            for _ in 0..50 {
                if !matches!(
                    daemon::cli::daemon_status(&config.pid_file())?,
                    DaemonStatus::Running(_)
                ) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            daemon::cli::start::execute(&config, config_arg.as_deref()).await?
        }
        Commands::Status => {
            if let DaemonStatus::Running(pid) = daemon::cli::status::execute(&config).await? {
                println!("running ({pid})");
            } else {
                println!("not running");
            }
        }
    }

    Ok(())
}
