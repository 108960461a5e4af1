// Tox puppet bridge daemon: puppet sessions, bootstrap node upkeep, operator console.

mod bridge;
mod commands;
mod config;
mod fetch;
mod loopback;
mod nodes;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use crate::bridge::Bridge;
use crate::fetch::HttpFetcher;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("toxpup-linux {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                println!("usage: toxpup-linux [--config <path>] [--version]");
                return Ok(());
            }
            "--config" | "-c" => match args.next() {
                Some(p) => config_path = Some(PathBuf::from(p)),
                None => bail!("--config needs a path"),
            },
            other => bail!("unknown argument {other:?}"),
        }
    }

    let cfg = config::load(config_path.as_deref())?;
    init_logging(&cfg.log_level);

    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    rt.block_on(run(cfg))
}

/// RUST_LOG wins; otherwise the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    tracing::info!(version = VERSION, puppets = cfg.puppets.len(), "starting");
    let fetcher = Arc::new(HttpFetcher::new().context("building http client")?);
    let url = cfg.update_nodes.then_some(cfg.nodes_url.as_str());
    let nodes = nodes::refresh(&cfg.nodes_file, url, fetcher.as_ref()).await;

    let (status_tx, mut status_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(line) = status_rx.recv().await {
            println!("{line}");
        }
    });
    let bridge = Arc::new(Bridge::start(&cfg, nodes, fetcher, status_tx).await?);
    tokio::spawn(console(Arc::clone(&bridge)));

    shutdown_signal().await?;
    tracing::info!("shutting down");
    bridge.shutdown().await;
    Ok(())
}

/// Read operator commands from stdin until EOF.
async fn console(bridge: Arc<Bridge>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%err, "console read failed");
                break;
            }
        };
        match commands::parse(&line) {
            None => {}
            Some(Ok(command)) => println!("{}", bridge.execute(command).await),
            Some(Err(err)) => println!("{err}"),
        }
    }
    tracing::debug!("console closed");
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
