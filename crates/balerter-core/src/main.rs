//! Balerter CLI
//!
//! Command-line interface for the Balerter alert engine.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use balerter::alerting::{AlertManager, Dispatcher, MetricsSink, NoopSink, PrometheusSink};
use balerter::api::HttpServer;
use balerter::models::{Alert, Level, Options};
use balerter::storage::{CoreStorages, StorageRegistry};
use balerter::Config;

/// Balerter - scriptable monitoring agent
#[derive(Parser)]
#[command(name = "balerter")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "BALERTER_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (for commands that support it)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Listen address (overrides `server.host`)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides `server.port`)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Inspect and update alerts
    Alerts {
        #[command(subcommand)]
        command: AlertsCommands,
    },

    /// Validate configuration and print a summary
    CheckConfig,
}

#[derive(Subcommand)]
enum AlertsCommands {
    /// List alerts
    List {
        /// Comma separated levels (success, warn, error)
        #[arg(long)]
        level: Option<String>,

        /// Comma separated alert names
        #[arg(long)]
        name: Option<String>,
    },

    /// Show one alert
    Get {
        /// Alert name
        name: String,
    },

    /// Record an observation for an alert
    Update {
        /// Alert name
        name: String,

        /// Level (success, warn, error)
        level: String,

        /// Notification text
        #[arg(long, default_value = "")]
        text: String,

        /// Target channel (repeatable, default: every non-ignored channel)
        #[arg(long = "channel")]
        channels: Vec<String>,

        /// Update state without notifying
        #[arg(long)]
        quiet: bool,

        /// Re-notify every N calls at an unchanged level
        #[arg(long)]
        repeat: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let cli = Cli::parse();

    let _ = dotenvy::dotenv();

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    // Execute command
    let result = match cli.command {
        Commands::Serve { host, port } => run_serve(config, host, port).await,
        Commands::Alerts { command } => run_alerts(config, command, cli.format).await,
        Commands::CheckConfig => run_check_config(&config),
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
    let log_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn build_manager(
    config: &Config,
    metrics: Arc<dyn MetricsSink>,
) -> anyhow::Result<(StorageRegistry, CoreStorages, AlertManager)> {
    let registry = StorageRegistry::from_config(&config.storages)
        .await
        .context("initialize storages")?;
    let core = registry
        .resolve(&config.core_storage)
        .context("resolve core storages")?;
    let dispatcher = Dispatcher::from_config(&config.channels).context("initialize channels")?;

    let manager = AlertManager::new(core.alert.clone(), Arc::new(dispatcher), metrics);
    Ok((registry, core, manager))
}

async fn run_serve(config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("install Prometheus recorder")?;
    PrometheusSink::describe();

    let (registry, core, manager) = build_manager(&config, Arc::new(PrometheusSink)).await?;
    info!(
        alert_storage = %manager.storage_name(),
        kv_storage = %core.kv.name(),
        "Alert manager ready"
    );

    let addr = format!(
        "{}:{}",
        host.unwrap_or(config.server.host),
        port.unwrap_or(config.server.port)
    );

    let server = HttpServer::new(Arc::new(manager), core.kv, Some(prometheus));
    let result = server
        .serve(&addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down...");
        })
        .await;

    registry.stop_all().await;
    result.context("HTTP server")
}

async fn run_alerts(
    config: Config,
    command: AlertsCommands,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let (registry, _, manager) = build_manager(&config, Arc::new(NoopSink)).await?;
    let result = alerts_command(&manager, command, format).await;
    registry.stop_all().await;
    result
}

async fn alerts_command(
    manager: &AlertManager,
    command: AlertsCommands,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match command {
        AlertsCommands::List { level, name } => {
            let levels = Level::parse_list(level.as_deref().unwrap_or_default())?;
            let names: Vec<String> = name
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect();

            let alerts = manager.list(&names, &levels).await?;
            print_alerts(&alerts, format)
        }
        AlertsCommands::Get { name } => match manager.get(&name).await? {
            Some(alert) => print_alerts(std::slice::from_ref(&alert), format),
            None => Err(anyhow::anyhow!("alert '{name}' not found")),
        },
        AlertsCommands::Update {
            name,
            level,
            text,
            channels,
            quiet,
            repeat,
        } => {
            let level: Level = level.parse()?;
            let options = Options {
                channels,
                quiet,
                repeat,
                ..Options::default()
            };

            let (alert, changed) = manager.update(&name, level, &text, &options).await?;
            if matches!(format, OutputFormat::Text) {
                println!(
                    "{}: level={} count={} changed={}",
                    alert.name(),
                    alert.level(),
                    alert.count(),
                    changed
                );
                Ok(())
            } else {
                print_alerts(std::slice::from_ref(&alert), format)
            }
        }
    }
}

fn print_alerts(alerts: &[Alert], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(alerts)?);
        }
        OutputFormat::Text => {
            if alerts.is_empty() {
                println!("No alerts");
            }
            for alert in alerts {
                println!(
                    "{:<32} {:<8} {:>6}  last_change={}  start={}",
                    alert.name(),
                    alert.level(),
                    alert.count(),
                    alert.last_change().to_rfc3339(),
                    alert.start().to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

fn run_check_config(config: &Config) -> anyhow::Result<()> {
    println!("Configuration OK");
    println!("  HTTP:      {}:{}", config.server.host, config.server.port);
    println!("  Storages:");
    println!("    memory (builtin)");
    for storage in &config.storages.sqlite {
        println!("    {} (sqlite, timeout {:?})", storage.name, storage.timeout);
    }
    for storage in &config.storages.postgres {
        println!("    {} (postgres, timeout {:?})", storage.name, storage.timeout);
    }
    println!(
        "  Core:      alert={} kv={}",
        config.core_storage.alert, config.core_storage.kv
    );
    println!("  Channels:");
    for channel in &config.channels.log {
        println!("    {} (log{})", channel.name, ignored(channel.ignore));
    }
    for channel in &config.channels.webhook {
        println!("    {} (webhook {}{})", channel.name, channel.url, ignored(channel.ignore));
    }
    Ok(())
}

fn ignored(ignore: bool) -> &'static str {
    if ignore {
        ", ignored"
    } else {
        ""
    }
}
