//! Configuration for a cairn instance.

use crate::error::{CairnError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration, assembled from CLI flags in `main`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CairnConfig {
    /// Workflow engine configuration.
    pub conductor: ConductorConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// HTTP API configuration.
    pub api: ApiConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl CairnConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.conductor.api_url.is_empty() {
            return Err(CairnError::InvalidConfig {
                field: "conductor.api_url".to_string(),
                reason: "workflow engine API URL is required".to_string(),
            });
        }
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(CairnError::InvalidConfig {
                field: "storage.data_dir".to_string(),
                reason: "data directory cannot be empty".to_string(),
            });
        }
        if !matches!(
            self.observability.log_level.as_str(),
            "debug" | "info" | "warning" | "error"
        ) {
            return Err(CairnError::InvalidConfig {
                field: "observability.log_level".to_string(),
                reason: format!(
                    "unknown log level '{}' (expected debug, info, warning or error)",
                    self.observability.log_level
                ),
            });
        }
        Ok(())
    }
}

/// Workflow engine connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Base URL of the workflow engine API.
    pub api_url: String,
    /// Connection timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the embedded database.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/cairn/data"),
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server.
    pub bind_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("valid socket address"),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus metrics server.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level (debug, info, warning, error).
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: "0.0.0.0:9090".parse().expect("valid socket address"),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> CairnConfig {
        CairnConfig {
            conductor: ConductorConfig {
                api_url: "http://conductor:8080/api".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_api_url() {
        let config = CairnConfig::default();
        assert!(matches!(
            config.validate().unwrap_err(),
            CairnError::InvalidConfig { field, .. } if field == "conductor.api_url"
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = valid_config();
        config.observability.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }
}
