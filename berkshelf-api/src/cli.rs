//! # berkshelf-api CLI
//!
//! Argument parsing and orchestration only. Workers, the cache pipeline, the gateway and
//! supervision all live in [`berkshelf_api_core`].
//!
//! - `start`: load the configuration, bind the listener and run the supervisor until SIGINT/SIGTERM.
//! - `validate`: load the configuration and build every configured worker once.
use crate::load_config::load_config;
use anyhow::{Context, Result};
use berkshelf_api_core::supervisor::{GroupSpec, Shutdown, Supervisor};
use berkshelf_api_core::worker::WorkerRegistry;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Cookbook index server: aggregates cookbook sources into one universe.
#[derive(Parser)]
#[clap(
    name = "berkshelf-api",
    version,
    about = "Aggregate Chef cookbook sources into one dependency universe and serve it over HTTP"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the index server
    Start {
        /// Path to the YAML config file
        #[clap(long, short)]
        config: PathBuf,
        /// Override the configured listen host
        #[clap(long)]
        host: Option<String>,
        /// Override the configured listen port
        #[clap(long, short)]
        port: Option<u16>,
        /// Log filter used when RUST_LOG is unset (e.g. "debug", "berkshelf_api_core=trace")
        #[clap(long)]
        log_level: Option<String>,
    },
    /// Check a config file and every configured endpoint, then exit
    Validate {
        /// Path to the YAML config file
        #[clap(long, short)]
        config: PathBuf,
    },
}

impl Cli {
    pub fn log_level(&self) -> Option<&str> {
        match &self.command {
            Commands::Start { log_level, .. } => log_level.as_deref(),
            Commands::Validate { .. } => None,
        }
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over `fallback`, which defaults to `info`.
pub fn init_tracing(fallback: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Async entrypoint shared by `main` and the integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Start {
            config,
            host,
            port,
            log_level: _,
        } => {
            let mut config = load_config(config)?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            config.trace_loaded();

            let registry = WorkerRegistry::default();
            let spec = GroupSpec::from_config(&config, &registry)
                .context("Failed to prepare the supervision group")?;
            tracing::info!(command = "start", listen = %spec.local_addr()?, "Starting berkshelf-api");

            let shutdown = Shutdown::new();
            let signals = shutdown.listen_for_signals();
            let outcome = Supervisor::new(spec, shutdown.clone()).run().await;
            shutdown.request();
            let _ = signals.await;
            outcome.context("Supervisor failed")?;
            Ok(())
        }
        Commands::Validate { config } => {
            let config = load_config(config)?;
            let registry = WorkerRegistry::default();
            for registration in config.registrations()? {
                registry.build(&registration).with_context(|| {
                    format!(
                        "endpoint #{} ({}) is invalid",
                        registration.index, registration.worker_type
                    )
                })?;
                tracing::info!(
                    command = "validate",
                    index = registration.index,
                    worker_type = %registration.worker_type,
                    priority = registration.priority,
                    "Endpoint OK"
                );
            }
            println!(
                "Configuration OK: {} endpoint(s), listening on {}",
                config.endpoints.len(),
                config.listen_addr()
            );
            Ok(())
        }
    }
}
