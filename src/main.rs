//! mqrelay - rule-driven MQTT topic relay
//!
//! Usage:
//!   mqrelay --config <FILE> [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (JSON)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mqrelay::config::Config;
use mqrelay::rules::Flow;
use mqrelay::{Metrics, MetricsServer, Relay};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// mqrelay - relay MQTT topics between two brokers
#[derive(Parser, Debug)]
#[command(name = "mqrelay")]
#[command(author = "mqrelay Contributors")]
#[command(version)]
#[command(about = "Rule-driven MQTT topic relay between two brokers")]
struct Args {
    /// Configuration file path (JSON format)
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (warn); RUST_LOG wins when set
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(log_level.to_tracing_level()).into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loaded configuration from {:?}", args.config);
    info!("Starting mqrelay");
    info!("  Source: {}", config.source.address());
    info!("  Destination: {}", config.destination.address());
    for rule in &config.rules {
        let arrow = if rule.is_bidirectional() { "<->" } else { "->" };
        info!(
            "    {} {} {} (qos={})",
            rule.source_topic, arrow, rule.dest_topic, rule.qos
        );
    }

    let metrics = Arc::new(Metrics::new());
    let metrics_config = config.metrics.clone();

    let relay = match Relay::new(config) {
        Ok(relay) => relay.with_metrics(metrics.clone()),
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("  Relay id: {}", relay.id());

    let handle = relay.start();

    if metrics_config.enabled {
        info!("  Metrics: enabled (http://{})", metrics_config.bind);
        let server = MetricsServer::new(metrics, metrics_config.bind);
        let shutdown = handle.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    tokio::signal::ctrl_c().await?;
    info!(
        "Received Ctrl+C (forward: {:?}, reverse: {:?})",
        handle.state(Flow::Forward),
        handle.state(Flow::Reverse)
    );
    handle.shutdown().await;

    Ok(())
}
