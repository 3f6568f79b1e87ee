//! Configuration for the kubed service.

use anyhow::Result;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the machine configuration document.
    pub machine_config_path: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Seconds between process table telemetry samples.
    pub telemetry_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let machine_config_path = std::env::var("KEEL_MACHINE_CONFIG")
            .unwrap_or_else(|_| "/system/config/machine.yaml".to_string());

        let log_level = std::env::var("KEEL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let telemetry_interval_secs = std::env::var("KEEL_TELEMETRY_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        Ok(Self {
            machine_config_path,
            log_level,
            telemetry_interval_secs,
        })
    }
}
