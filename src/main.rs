mod bufferpool;
mod config;
mod dialer;
mod environment;
mod http_proxy;
mod loader;
mod logging;
mod matcher;
mod netutil;
mod socks_proxy;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

/// Dual-front (HTTP + SOCKS5) forwarding proxy with rule-based routing to a
/// direct dial or an upstream HTTP CONNECT tunnel, per a hot-reloadable TOML
/// configuration file.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config", default_value = "proxy.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env = loader::load_initial(&cli.config)
        .with_context(|| format!("failed to load configuration: {}", cli.config.display()))?;
    let watcher = loader::ConfigWatcher::spawn_default(env.with_prefix("config "), cli.config.clone())?;

    env.info(format!("starting with config: {}", cli.config.display()));

    let http = tokio::spawn(http_proxy::run(env.with_prefix("http ")));
    let socks = tokio::spawn(socks_proxy::run(env.with_prefix("socks ")));

    let result = tokio::select! {
        _ = signal::ctrl_c() => {
            env.info("received Ctrl+C, shutting down");
            Ok(())
        }
        res = http => flatten(res, "http front"),
        res = socks => flatten(res, "socks front"),
    };

    watcher.stop();
    result
}

fn flatten(res: Result<Result<()>, tokio::task::JoinError>, front: &str) -> Result<()> {
    match res {
        Ok(inner) => inner.with_context(|| format!("{front} exited")),
        Err(join_err) => Err(join_err).with_context(|| format!("{front} task panicked")),
    }
}
