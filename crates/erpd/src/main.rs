//! erpd: eRp trust core daemon
//!
//! Usage:
//!   erpd [--config /etc/erp/config.toml] [--log info] [--log-format json|text]

mod admin;
mod daemon;
mod metrics;
mod vau;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use erp_core::config::ErpConfig;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "erpd", version, about = "eRp trust core daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "ERP_CONFIG",
        default_value = "/etc/erp/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "ERP_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides the config file
    #[arg(long, env = "ERP_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first: it carries the default log settings
    let (config, loaded) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.clone().unwrap_or(
        if config.daemon.log_format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
    );
    init_logging(&level, &format);

    if !loaded {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "erpd starting"
    );

    config.validate().context("invalid configuration")?;
    daemon::run(config).await
}

/// Returns the config and whether it came from a file.
async fn load_config(path: &Path) -> Result<(ErpConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        let config =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((ErpConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
