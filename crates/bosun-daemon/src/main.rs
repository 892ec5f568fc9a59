use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

mod config;
mod diagnostics;
mod environment;
mod events;
mod filesystem;
mod instance;
mod manager;
mod remote;
mod state_store;
mod throttle;
mod websocket;

use crate::instance::InstanceContext;

#[derive(Debug, Parser)]
#[command(name = "bosun", about = "Node daemon managing containerized game servers")]
struct Cli {
    /// Location of the daemon configuration file.
    #[arg(long, global = true, default_value = config::DEFAULT_LOCATION)]
    config: PathBuf,

    /// Run with verbose logging.
    #[arg(long)]
    debug: bool,

    /// Obtain and manage TLS certificates automatically.
    #[arg(long)]
    auto_tls: bool,

    /// Hostname for the automatically generated certificate.
    #[arg(long)]
    tls_hostname: Option<String>,

    /// Enable the runtime profiler endpoint.
    #[arg(long)]
    profile: bool,

    /// Print the daemon version and exit.
    #[arg(long)]
    version: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Collect system information for a support report.
    Diagnostics,
}

fn main() {
    let mut cli = Cli::parse();

    if cli.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if cli.auto_tls && cli.tls_hostname.as_deref().unwrap_or("").is_empty() {
        eprintln!(
            "A TLS hostname must be provided when running with automatic TLS, e.g.:\n\n    bosun --auto-tls --tls-hostname my.example.com"
        );
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Runtime::new().expect("build tokio runtime");
    let result = match cli.command.take() {
        Some(Command::Diagnostics) => runtime.block_on(diagnostics::run(&cli.config)),
        None => runtime.block_on(run(cli)),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut configuration = match config::Configuration::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            if cli.config == PathBuf::from(config::DEFAULT_LOCATION) {
                eprintln!(
                    "Could not locate the daemon configuration. Copy this node's configuration to {} or pass --config.",
                    config::DEFAULT_LOCATION
                );
                std::process::exit(1);
            }
            return Err(e);
        }
    };
    if cli.debug {
        configuration.debug = true;
    }

    configuration
        .system
        .configure_directories()
        .context("configure system directories")?;

    // Keep stdout logs for interactive use and a non-ANSI daily file under
    // the log directory for everything else.
    let file_appender =
        tracing_appender::rolling::daily(&configuration.system.log_directory, "bosun.log");
    let (file_writer, _file_guard) = tracing_appender::non_blocking(file_appender);

    let filter = if configuration.debug {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    if configuration.debug {
        tracing::debug!("running in debug mode");
    }
    tracing::info!(path = %cli.config.display(), "loaded configuration from path");
    if cli.profile {
        tracing::warn!("profiling requested but no profiler is compiled into this build");
    }

    // Persist whatever boot normalized (e.g. a resolved data directory).
    if let Err(e) = configuration.write_to_disk() {
        tracing::error!(error = %e, "failed to save configuration to disk");
    }

    let docker = Arc::new(
        bollard::Docker::connect_with_local_defaults().context("configure docker client")?,
    );

    let configuration = Arc::new(configuration);
    let states = Arc::new(
        state_store::StateStore::load(configuration.system.states_path()).await,
    );
    let remote = Arc::new(remote::RemoteClient::new(
        configuration.remote.base_url.clone(),
        configuration.remote.token.clone(),
    ));

    let manager = manager::InstanceManager::new(
        docker,
        InstanceContext {
            config: configuration.clone(),
            remote,
            states,
        },
    );

    manager.boot().await.context("load instance configurations")?;
    manager.reconcile().await;

    tracing::info!(
        host = %configuration.api.host,
        port = configuration.api.port,
        auto_tls = cli.auto_tls,
        instances = manager.len().await,
        "daemon is ready; handing the instance manager to the API surface",
    );

    // The HTTP/websocket router consumes the manager from here. Its
    // implementation lives outside this crate; we simply keep the process
    // alive until asked to stop.
    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    tracing::info!("shutdown requested, draining instance machinery");
    manager.shutdown().await;

    Ok(())
}
