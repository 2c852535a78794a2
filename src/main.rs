//! CDO repository server
//!
//! Serves one in-memory repository over the TCP session protocol.

use anyhow::Context;
use cdo_repo::core::Config;
use cdo_repo::net::TcpServer;
use cdo_repo::system::collect_metrics;
use cdo_repo::Repository;
use clap::{Arg, ArgAction, Command};
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, info, warn};

fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let matches = Command::new("cdo-server")
        .version(cdo_repo::VERSION)
        .about("Versioned object repository server.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("bind-addr")
                .long("bind-addr")
                .value_name("ADDR")
                .help("TCP bind address"),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .value_name("NAME")
                .help("Repository name reported to clients"),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .value_name("N")
                .help("Number of worker threads"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("Log format (json, pretty, compact)"),
        )
        .arg(
            Arg::new("print-config")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Print the effective configuration as TOML and exit"),
        )
        .get_matches();

    // Load configuration
    let mut config = if let Some(config_path) = matches.get_one::<String>("config") {
        let mut config = Config::from_file(config_path)?;
        config.apply_env_overrides()?;
        config
    } else {
        Config::load()?
    };

    // Apply CLI overrides
    apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;

    if matches.get_flag("print-config") {
        println!("{}", toml::to_string_pretty(&config).context("serializing configuration")?);
        return Ok(());
    }

    cdo_repo::init_logging(&config.logging)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.optimal_worker_threads())
        .thread_name("cdo-worker")
        .enable_all()
        .build()
        .context("building the tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting CDO repository server v{}", cdo_repo::VERSION);

    let repository = Arc::new(Repository::in_memory(&config.repository));
    info!(repository = %repository.name(), "repository ready");

    let server = TcpServer::new(repository.clone(), config.server.clone());
    let listener = server
        .bind()
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;

    server.serve(listener, shutdown_signal()).await?;
    warn!("Received shutdown signal, closing sessions...");

    for session in repository.sessions().sessions() {
        repository.sessions().close_session(session.id());
    }
    debug!("final metrics:\n{}", collect_metrics());

    info!("Shutdown complete");
    Ok(())
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    if let Some(addr) = matches.get_one::<String>("bind-addr") {
        config.server.bind_addr = addr.parse().with_context(|| format!("invalid bind address {}", addr))?;
    }

    if let Some(name) = matches.get_one::<String>("name") {
        config.repository.name = name.clone();
    }

    if let Some(workers) = matches.get_one::<String>("workers") {
        config.server.worker_threads = workers.parse().with_context(|| format!("invalid worker count {}", workers))?;
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.clone();
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
