//! QuotaWatch CLI
//!
//! Command-line interface for the QuotaWatch alerting engine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;

use quotawatch::alerting::{
    AlertDispatcher, AlertMetrics, AlertStore, CooldownGuard, NoopMetrics, NotifierFactory,
    PrometheusMetrics, QuotaMonitor,
};
use quotawatch::db::Database;
use quotawatch::Config;

/// QuotaWatch - quota and liveness alerts for proxy nodes
#[derive(Parser)]
#[command(name = "quotawatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "QUOTAWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (for commands that support it)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the alerting scheduler until interrupted
    Serve,

    /// Run a single pass of one periodic task
    Run {
        /// Task to run
        #[arg(value_enum)]
        task: Task,
    },

    /// Manage notify channels
    Channels {
        #[command(subcommand)]
        command: ChannelsCommands,
    },

    /// Inspect alerts
    Alerts {
        #[command(subcommand)]
        command: AlertsCommands,
    },

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Manage alert rules
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Task {
    /// Evaluate every metered node and client
    QuotaScan,
    /// Mark nodes with stale heartbeats offline
    OfflineSweep,
    /// Reset quotas due today
    Reset,
    /// Delete alert logs past retention
    Prune,
}

#[derive(Subcommand)]
enum ChannelsCommands {
    /// Send a test notification through a channel
    Test {
        /// Channel ID
        channel_id: i64,
    },
}

#[derive(Subcommand)]
enum AlertsCommands {
    /// Show alert history, newest first
    History {
        /// Maximum number of results
        #[arg(long, default_value = "20")]
        limit: i64,

        /// Number of results to skip
        #[arg(long, default_value = "0")]
        offset: i64,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run database migrations
    Migrate,

    /// Check database connectivity
    Health,
}

#[derive(Subcommand)]
enum RulesCommands {
    /// Create the default rules if none exist
    Seed,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    let result = match cli.command {
        Commands::Serve => run_serve(config).await,
        Commands::Run { task } => run_task(config, task, cli.format).await,
        Commands::Channels { command } => run_channels(config, command).await,
        Commands::Alerts { command } => run_alerts(config, command, cli.format).await,
        Commands::Db { command } => run_db(config, command).await,
        Commands::Rules { command } => run_rules(config, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn build_monitor(
    config: &Config,
    metrics: Arc<dyn AlertMetrics>,
) -> anyhow::Result<(Database, Arc<QuotaMonitor>)> {
    let db = Database::new(config)
        .await
        .context("failed to connect to database")?;
    let store: Arc<dyn AlertStore> = Arc::new(db.alert_store());

    let factory = NotifierFactory::new(&config.alerting)?;
    let guard = CooldownGuard::new(
        chrono::Duration::from_std(config.alerting.dedup_window)
            .context("alerting.dedup_window out of range")?,
    );
    let dispatcher =
        Arc::new(AlertDispatcher::new(store, factory, guard).with_metrics(metrics));

    let monitor = Arc::new(QuotaMonitor::new(dispatcher, config.alerting.clone()));
    Ok((db, monitor))
}

async fn run_serve(config: Config) -> anyhow::Result<()> {
    let metrics: Arc<dyn AlertMetrics> = if config.metrics.enabled {
        let addr: SocketAddr = config
            .metrics
            .listen_addr
            .parse()
            .with_context(|| format!("invalid metrics.listen_addr {}", config.metrics.listen_addr))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to start Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
        Arc::new(PrometheusMetrics)
    } else {
        Arc::new(NoopMetrics)
    };

    let (_db, monitor) = build_monitor(&config, metrics).await?;

    if config.alerting.seed_default_rules {
        monitor.seed_default_rules().await?;
    }

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(monitor.run(shutdown.clone()));

    info!("QuotaWatch running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    handle.await?;
    Ok(())
}

async fn run_task(config: Config, task: Task, format: OutputFormat) -> anyhow::Result<()> {
    let (_db, monitor) = build_monitor(&config, Arc::new(NoopMetrics)).await?;

    let output = match task {
        Task::QuotaScan => {
            let report = monitor.scan_quotas().await?;
            serde_json::json!({
                "evaluated": report.evaluated,
                "warnings": report.warnings,
                "exceeded": report.exceeded,
                "sent": report.summary.sent,
                "failed": report.summary.failed,
            })
        }
        Task::OfflineSweep => {
            let offline = monitor.sweep_offline().await?;
            serde_json::json!({ "marked_offline": offline })
        }
        Task::Reset => {
            let report = monitor.reset_quotas(Utc::now()).await?;
            serde_json::json!({ "nodes": report.nodes, "clients": report.clients })
        }
        Task::Prune => {
            let deleted = monitor.prune_logs().await?;
            serde_json::json!({ "deleted": deleted })
        }
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Text => {
            if let Some(fields) = output.as_object() {
                for (key, value) in fields {
                    println!("{key:>16}: {value}");
                }
            }
        }
    }
    Ok(())
}

async fn run_channels(config: Config, command: ChannelsCommands) -> anyhow::Result<()> {
    let (_db, monitor) = build_monitor(&config, Arc::new(NoopMetrics)).await?;

    match command {
        ChannelsCommands::Test { channel_id } => {
            monitor
                .dispatcher()
                .test_channel(channel_id)
                .await
                .with_context(|| format!("test notification through channel {channel_id} failed"))?;
            println!("Test notification sent through channel {channel_id}");
        }
    }
    Ok(())
}

async fn run_alerts(
    config: Config,
    command: AlertsCommands,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let db = Database::new(&config).await?;
    let store = db.alert_store();

    match command {
        AlertsCommands::History { limit, offset } => {
            use quotawatch::alerting::AlertLogRepository;

            let (logs, total) = store.list_recent(limit, offset).await?;
            match format {
                OutputFormat::Json => {
                    let page = serde_json::json!({ "total": total, "logs": logs });
                    println!("{}", serde_json::to_string_pretty(&page)?);
                }
                OutputFormat::Text => {
                    for log in &logs {
                        let summary = log.message.lines().next().unwrap_or_default();
                        println!(
                            "{}  {:<15} {:<7} #{:<5} {:<6} {}",
                            log.created_at.format("%Y-%m-%d %H:%M:%S"),
                            log.alert_type.as_str(),
                            log.status.as_str(),
                            log.channel_id,
                            log.target_kind.as_str(),
                            summary
                        );
                    }
                    println!("({} of {total})", logs.len());
                }
            }
        }
    }
    Ok(())
}

async fn run_db(config: Config, command: DbCommands) -> anyhow::Result<()> {
    let mut config = config;
    config.database.run_migrations = false;
    let db = Database::new(&config).await?;

    match command {
        DbCommands::Migrate => {
            db.migrate().await?;
            println!("Migrations applied");
        }
        DbCommands::Health => {
            db.health_check().await?;
            println!("Database OK");
        }
    }
    Ok(())
}

async fn run_rules(config: Config, command: RulesCommands) -> anyhow::Result<()> {
    let (_db, monitor) = build_monitor(&config, Arc::new(NoopMetrics)).await?;

    match command {
        RulesCommands::Seed => {
            let created = monitor.seed_default_rules().await?;
            if created == 0 {
                println!("Rules already exist, nothing seeded");
            } else {
                println!("Seeded {created} default rules");
            }
        }
    }
    Ok(())
}
