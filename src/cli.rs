//! Command-line surface (§6), parsed with `clap`'s derive API in the same
//! style as the teacher's own CLI.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "cdp-relay-gateway", about = "Chrome DevTools Protocol relay gateway", version)]
pub struct Cli {
    /// Port to listen on for WebSocket upgrades.
    #[arg(long, default_value_t = 3000)]
    pub port: u16,

    /// Maximum number of concurrently live legacy Chrome instances.
    #[arg(long = "max-instances", default_value_t = 10)]
    pub max_instances: usize,

    /// Minutes a legacy Chrome instance may sit idle before eviction.
    #[arg(long = "instance-timeout", default_value_t = 60)]
    pub instance_timeout: u64,

    /// Minutes between idle-eviction sweeps of the legacy Chrome pool.
    #[arg(long = "inactive-check-interval", default_value_t = 5)]
    pub inactive_check_interval: u64,

    /// Shared secret required by the legacy direct-launch path.
    #[arg(long, env = "CDP_RELAY_TOKEN")]
    pub token: Option<String>,

    /// Log every CDP frame crossing the relay at debug level.
    #[arg(long = "cdp-logging", default_value_t = false)]
    pub cdp_logging: bool,

    /// Override the root directory for legacy per-user Chrome profiles.
    #[arg(long = "browser-data-dir")]
    pub browser_data_dir: Option<PathBuf>,

    /// Raise the default log level from info to debug.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Cli {
    pub fn tracing_filter(&self) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    }
}
