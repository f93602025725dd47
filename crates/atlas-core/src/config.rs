//! Bridge configuration.
//!
//! Resolution order: CLI flags → environment variables → defaults. There is
//! no config-file surface (Non-goal); the nested, `#[serde(default)]`-driven
//! struct shape is still useful on its own for testing and for the optional
//! `--config` TOML overlay loaded below CLI/env precedence.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Gateway,
    Client,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Client
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mode: Mode,
    pub gateway: GatewayConfig,
    pub client: ClientConfig,
    pub radio: RadioConfig,
    pub reliability: ReliabilityConfig,
    pub metrics: MetricsConfig,
    pub spool: SpoolConfig,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub node_id: String,
    pub api_base_url: String,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub command: Option<String>,
    pub data: Option<String>,
    pub timeout_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub port: Option<String>,
    pub node_id: Option<String>,
    /// Run against the in-memory radio double instead of real hardware.
    pub simulate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub path: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            gateway: GatewayConfig::default(),
            client: ClientConfig::default(),
            radio: RadioConfig::default(),
            reliability: ReliabilityConfig::default(),
            metrics: MetricsConfig::default(),
            spool: SpoolConfig::default(),
            log_level: "INFO".to_string(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            api_base_url: String::new(),
            api_token: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command: None,
            data: None,
            timeout_seconds: 5.0,
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            port: None,
            node_id: None,
            simulate: false,
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            method: "window".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9700,
            enabled: true,
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            path: default_spool_path(),
        }
    }
}

fn default_spool_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".atlas_meshtastic_spool.json")
}

/// Mirrors the bridge binary's CLI surface. Built by `clap` in the bridge
/// crate and handed here so `atlas-core` doesn't need to depend on it.
#[derive(Debug, Clone, Default)]
pub struct RawArgs {
    pub mode: Option<Mode>,
    pub gateway_node_id: Option<String>,
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
    pub simulate_radio: bool,
    pub timeout: Option<f64>,
    pub command: Option<String>,
    pub data: Option<String>,
    pub spool_path: Option<PathBuf>,
    pub radio_port: Option<String>,
    pub node_id: Option<String>,
    pub metrics_host: Option<String>,
    pub metrics_port: Option<u16>,
    pub disable_metrics: bool,
    pub log_level: Option<String>,
    pub reliability_method: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

impl BridgeConfig {
    /// Builds a config from CLI args, optional base TOML, then env overrides.
    /// Precedence, highest first: CLI args, environment, base file, defaults.
    pub fn from_args(args: RawArgs, base_file: Option<&PathBuf>) -> Result<Self, ConfigError> {
        let mut config = match base_file {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
                toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
            }
            _ => BridgeConfig::default(),
        };

        config.apply_env_overrides();

        if let Some(mode) = args.mode {
            config.mode = mode;
        }
        if let Some(v) = args.gateway_node_id {
            config.gateway.node_id = v;
        }
        if let Some(v) = args.api_base_url {
            config.gateway.api_base_url = v;
        }
        if args.api_token.is_some() {
            config.gateway.api_token = args.api_token;
        }
        if args.simulate_radio {
            config.radio.simulate = true;
        }
        if let Some(v) = args.timeout {
            config.client.timeout_seconds = v;
        }
        if args.command.is_some() {
            config.client.command = args.command;
        }
        if args.data.is_some() {
            config.client.data = args.data;
        }
        if let Some(v) = args.spool_path {
            config.spool.path = v;
        }
        if args.radio_port.is_some() {
            config.radio.port = args.radio_port;
        }
        if args.node_id.is_some() {
            config.radio.node_id = args.node_id;
        }
        if let Some(v) = args.metrics_host {
            config.metrics.host = v;
        }
        if let Some(v) = args.metrics_port {
            config.metrics.port = v;
        }
        if args.disable_metrics {
            config.metrics.enabled = false;
        }
        if let Some(v) = args.log_level {
            config.log_level = v;
        }
        if let Some(v) = args.reliability_method {
            config.reliability.method = v;
        }

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ATLAS_RELIABILITY_METHOD") {
            self.reliability.method = v;
        }
        if let Ok(v) = std::env::var("MESHTASTIC_METRICS_HOST") {
            self.metrics.host = v;
        }
        if let Ok(v) = std::env::var("MESHTASTIC_METRICS_PORT") {
            if let Ok(p) = v.parse() {
                self.metrics.port = p;
            }
        }
        if let Ok(v) = std::env::var("MESHTASTIC_METRICS_ENABLED") {
            self.metrics.enabled = v == "true" || v == "1";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pick_window_reliability_and_enabled_metrics() {
        let config = BridgeConfig::default();
        assert_eq!(config.reliability.method, "window");
        assert!(config.metrics.enabled);
        assert_eq!(config.client.timeout_seconds, 5.0);
    }

    #[test]
    fn cli_args_override_defaults() {
        let args = RawArgs {
            mode: Some(Mode::Gateway),
            timeout: Some(12.5),
            disable_metrics: true,
            ..Default::default()
        };
        let config = BridgeConfig::from_args(args, None).unwrap();
        assert_eq!(config.mode, Mode::Gateway);
        assert_eq!(config.client.timeout_seconds, 12.5);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn env_override_beats_base_file_default() {
        std::env::set_var("ATLAS_RELIABILITY_METHOD", "stage");
        let config = BridgeConfig::from_args(RawArgs::default(), None).unwrap();
        assert_eq!(config.reliability.method, "stage");
        std::env::remove_var("ATLAS_RELIABILITY_METHOD");
    }

    #[test]
    fn cli_args_beat_env_override() {
        std::env::set_var("ATLAS_RELIABILITY_METHOD", "stage");
        let args = RawArgs {
            reliability_method: Some("simple".to_string()),
            ..Default::default()
        };
        let config = BridgeConfig::from_args(args, None).unwrap();
        assert_eq!(config.reliability.method, "simple");
        std::env::remove_var("ATLAS_RELIABILITY_METHOD");
    }
}
