//! agentbox: project-aware container CLI

use agentbox::{dispatch, Cli, Context, DockerEngine, ResolvedConfig, Terminal};
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG overrides --debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("agentbox=debug")
        } else {
            EnvFilter::new("agentbox=warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    watch_shutdown_signals(cancel.clone());

    if let Err(e) = run(&cli, cancel).await {
        if e.is_reportable() {
            error!("{}", e);
        }
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: &Cli, cancel: CancellationToken) -> agentbox::Result<()> {
    let workdir = match &cli.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let config = ResolvedConfig::resolve(&workdir, cli.host.as_deref())?;
    debug!(
        socket = %config.socket.display(),
        project = %config.project.key,
        "resolved configuration"
    );

    let engine = Arc::new(DockerEngine::new(&config.socket));
    let terminal = Terminal::stdio()?;
    let ctx = Context::new(engine, terminal, config, cancel);
    dispatch(&ctx, &cli.command).await
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn watch_shutdown_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        debug!("shutdown signal received");
        cancel.cancel();
    });
}
