//! Server configuration types
//!
//! Mirrors `config/default.toml`. Library-level settings (readiness, bridge)
//! reuse the crates' own config structs.

use std::collections::HashMap;
use std::path::PathBuf;

use harbor_core::{BridgeConfig, ResolvedBinary};
use harbor_process::{ReadinessConfig, RuntimeConfig, DEFAULT_PORT_PATTERN};
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub instances: InstancesConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4096,
        }
    }
}

/// Instance executable and launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancesConfig {
    /// Path or bare name of the default binary
    pub binary: String,
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_port_pattern")]
    pub port_pattern: String,
    #[serde(default = "default_port_warning_interval")]
    pub port_warning_interval_secs: u64,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
    /// Merged into every launched instance's environment
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

fn default_label() -> String {
    "OpenCode".to_string()
}

fn default_args() -> Vec<String> {
    RuntimeConfig::default().args
}

fn default_port_pattern() -> String {
    DEFAULT_PORT_PATTERN.to_string()
}

fn default_port_warning_interval() -> u64 {
    10
}

fn default_stop_grace() -> u64 {
    2000
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            binary: "opencode".to_string(),
            label: default_label(),
            version: None,
            args: default_args(),
            port_pattern: default_port_pattern(),
            port_warning_interval_secs: default_port_warning_interval(),
            stop_grace_ms: default_stop_grace(),
            environment: HashMap::new(),
        }
    }
}

impl InstancesConfig {
    /// Settings for the process runtime
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            args: self.args.clone(),
            port_pattern: self.port_pattern.clone(),
            port_warning_interval_secs: self.port_warning_interval_secs,
            stop_grace_ms: self.stop_grace_ms,
        }
    }

    /// The configured default binary, unresolved
    pub fn default_binary(&self) -> ResolvedBinary {
        ResolvedBinary {
            path: PathBuf::from(&self.binary),
            label: self.label.clone(),
            version: self.version.clone().filter(|v| !v.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_from_instances() {
        let instances = InstancesConfig {
            args: vec!["serve".to_string()],
            stop_grace_ms: 750,
            ..Default::default()
        };
        let runtime = instances.runtime_config();
        assert_eq!(runtime.args, vec!["serve"]);
        assert_eq!(runtime.stop_grace_ms, 750);
        assert_eq!(runtime.port_pattern, DEFAULT_PORT_PATTERN);
    }

    #[test]
    fn test_empty_version_is_absent() {
        let instances = InstancesConfig {
            version: Some(String::new()),
            ..Default::default()
        };
        let binary = instances.default_binary();
        assert_eq!(binary.version, None);
        assert_eq!(binary.path, PathBuf::from("opencode"));
        assert_eq!(binary.label, "OpenCode");
    }
}
