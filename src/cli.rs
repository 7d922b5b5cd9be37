//! Command-line interface for cairn.

use crate::config::{CairnConfig, ObservabilityConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Cairn - backup scheduler and retention manager driving an external
/// workflow engine.
#[derive(Parser)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Base workflow engine API URL used to launch backup workflows
    #[arg(long, env = "CAIRN_CONDUCTOR_API_URL")]
    pub conductor_api_url: String,

    /// Directory for the embedded database
    #[arg(long, env = "CAIRN_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Log level (debug, info, warning, error)
    #[arg(long, env = "CAIRN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Bind address for the HTTP API
    #[arg(long, env = "CAIRN_API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: SocketAddr,

    /// Bind address for the Prometheus metrics server
    #[arg(long, env = "CAIRN_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: SocketAddr,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Build the runtime configuration from the parsed flags.
    pub fn into_config(self) -> CairnConfig {
        let mut config = CairnConfig::default();
        config.conductor.api_url = self.conductor_api_url;
        config.storage.data_dir = self.data_dir;
        config.api.bind_addr = self.api_addr;
        config.observability = ObservabilityConfig {
            metrics_addr: self.metrics_addr,
            log_level: self.log_level,
            json_logs: self.json_logs,
            ..Default::default()
        };
        config
    }
}
