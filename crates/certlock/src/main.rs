//! Certlock - Main entry point
//!
//! Operator tool for validating configuration and holding locks by hand.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use certlock::{CertStorage, LockContext, LockError};
use certlock_config::{Config, LockBackendKind};

/// Certlock - namespaced certificate storage with distributed locking
#[derive(Parser, Debug)]
#[command(name = "certlock")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTLOCK_CONFIG", global = true)]
    config: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test,
    /// Acquire a lock, hold it, then release it
    Hold {
        /// Storage key to lock
        resource: String,

        /// Seconds to hold the lock (until Ctrl-C if omitted)
        #[arg(long = "seconds")]
        seconds: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Test => test_config(cli.config.as_deref()),
        Commands::Hold { resource, seconds } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(hold_lock(cli.config.as_deref(), &resource, seconds))
        }
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            Config::from_file(path).context("Failed to load configuration file")
        }
        None => {
            warn!("No configuration specified, using in-memory storage and locks");
            Ok(Config::default())
        }
    }
}

/// Test configuration file and exit
fn test_config(config_path: Option<&str>) -> Result<()> {
    // Loading a file validates it
    let config = load_config(config_path)?;

    info!("Configuration test successful:");
    info!("  - storage backend: {:?}", config.storage.backend);
    info!("  - bucket: {}, prefix: {:?}", config.storage.bucket, config.storage.prefix);
    info!("  - lock backend: {:?}, ttl: {}s", config.lock.backend, config.lock.ttl_secs);

    if config.lock.backend == LockBackendKind::Memory {
        warn!("Memory lock backend only coordinates within a single process");
    }

    println!(
        "certlock: configuration file {} test is successful",
        config_path.unwrap_or("(default)")
    );
    Ok(())
}

/// Hold a lock until the timer runs out or Ctrl-C
async fn hold_lock(config_path: Option<&str>, key: &str, seconds: Option<u64>) -> Result<()> {
    let config = load_config(config_path)?;
    let storage = CertStorage::from_config(&config)
        .await
        .context("Failed to initialize storage")?;

    let ctx = match config.lock.acquire_timeout() {
        Some(timeout) => LockContext::with_timeout(timeout),
        None => LockContext::background(),
    };

    // Ctrl-C while waiting cancels the acquisition
    let interrupt = ctx.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let lock_result = storage.lock(&ctx, key).await;
    watcher.abort();
    match lock_result {
        Ok(()) => {}
        Err(LockError::Cancelled) => {
            info!("Received shutdown signal while waiting for lock");
            storage.cleanup().await;
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to lock '{key}'")),
    }
    info!(key = %key, "Lock held");

    match seconds {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal");
        }
    }

    if let Err(e) = storage.unlock(key).await {
        warn!(key = %key, error = %e, "Failed to release lock");
    }
    storage.cleanup().await;
    Ok(())
}
