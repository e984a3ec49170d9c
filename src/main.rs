mod admin;
mod cli;
mod config;
mod dispatcher;
mod error;
mod pool;
mod registry;
mod relay;
mod server;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::GatewayConfig;
use error::Result;
use pool::SystemLauncher;
use server::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.tracing_filter()));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = Arc::new(GatewayConfig::from_cli(&cli));
    println!("{} cdp-relay-gateway listening on {}", "◆".cyan(), format!(":{}", config.port).bold());
    println!(
        "  {} max instances: {}  idle timeout: {}m",
        "✓".green(),
        config.max_instances,
        config.instance_timeout.as_secs() / 60
    );
    let launcher = Box::new(SystemLauncher::new(find_chrome_binary(), Duration::from_secs(30)));
    let gateway = Gateway::new(config, launcher);

    let running = Arc::clone(&gateway);
    let accept_loop = tokio::spawn(async move { running.run().await });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, tearing down");
    gateway.shutdown().await;
    accept_loop.abort();

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn find_chrome_binary() -> PathBuf {
    for candidate in [
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
    ] {
        if let Ok(path) = which_on_path(candidate) {
            return path;
        }
    }
    PathBuf::from("google-chrome")
}

fn which_on_path(name: &str) -> std::result::Result<PathBuf, ()> {
    let path_var = std::env::var_os("PATH").ok_or(())?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(())
}
