//! Resolved process configuration (§3 ambient `GatewayConfig`).
//!
//! Built once at startup from [`crate::cli::Cli`] and passed by reference
//! into every component constructor — never read from a hidden global.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub max_instances: usize,
    pub instance_timeout: Duration,
    pub inactive_check_interval: Duration,
    pub message_timeout: Duration,
    pub token: Option<String>,
    pub cdp_logging: bool,
    pub browser_data_root: PathBuf,
}

impl GatewayConfig {
    pub fn from_cli(cli: &crate::cli::Cli) -> Self {
        let browser_data_root = cli.browser_data_dir.clone().unwrap_or_else(default_browser_data_root);
        GatewayConfig {
            port: cli.port,
            max_instances: cli.max_instances,
            instance_timeout: Duration::from_secs(cli.instance_timeout * 60),
            inactive_check_interval: Duration::from_secs(cli.inactive_check_interval * 60),
            message_timeout: Duration::from_secs(30),
            token: cli.token.clone(),
            cdp_logging: cli.cdp_logging,
            browser_data_root,
        }
    }
}

fn default_browser_data_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".browser-go")
        .join("browser_data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn minute_fields_convert_to_duration() {
        let cli = crate::cli::Cli::parse_from(["cdp-relay-gateway", "--instance-timeout", "2"]);
        let config = GatewayConfig::from_cli(&cli);
        assert_eq!(config.instance_timeout, Duration::from_secs(120));
    }

    #[test]
    fn defaults_match_documented_values() {
        let cli = crate::cli::Cli::parse_from(["cdp-relay-gateway"]);
        let config = GatewayConfig::from_cli(&cli);
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_instances, 10);
        assert_eq!(config.instance_timeout, Duration::from_secs(60 * 60));
        assert_eq!(config.inactive_check_interval, Duration::from_secs(5 * 60));
    }
}
