//! Runtime configuration, loaded from a JSON file.
//!
//! Every field has a default, so `{}` is a valid configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{BackendKind, SliceSpec};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetsliceConfig {
    pub shell: ShellConfig,
    /// Interface that carries NAT traffic. Auto-detected if unset.
    pub upstream_interface: Option<String>,
    /// Backends to try, in order.
    pub backends: Vec<BackendKind>,
    pub access_point: AccessPointConfig,
    pub container: ContainerConfig,
    pub legacy_bridge: LegacyBridgeConfig,
    pub orchestrator: OrchestratorConfig,
    pub session: SessionConfig,
    pub qos: QosConfig,
    /// Slices the operator binary provisions at startup.
    pub slices: Vec<SliceSpec>,
}

impl Default for NetsliceConfig {
    fn default() -> Self {
        Self {
            shell: ShellConfig::default(),
            upstream_interface: None,
            backends: vec![BackendKind::AccessPoint, BackendKind::ContainerNetwork, BackendKind::Simulated],
            access_point: AccessPointConfig::default(),
            container: ContainerConfig::default(),
            legacy_bridge: LegacyBridgeConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            session: SessionConfig::default(),
            qos: QosConfig::default(),
            slices: Vec::new(),
        }
    }
}

impl NetsliceConfig {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Prefix privileged commands with `sudo`.
    pub sudo: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPointConfig {
    /// Wireless interface to run the AP on. The first one `iw dev` lists if unset.
    pub interface: Option<String>,
    pub bridge: String,
    pub country_code: String,
    pub channel: u8,
    /// Where generated daemon configuration and lease files go.
    pub runtime_dir: PathBuf,
    pub ready_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub lease_hours: u32,
    pub stop_grace_secs: u64,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            interface: None,
            bridge: "br-netslice".to_string(),
            country_code: "US".to_string(),
            channel: 6,
            runtime_dir: PathBuf::from("/tmp/netslice"),
            ready_timeout_secs: 10,
            poll_interval_ms: 500,
            lease_hours: 12,
            stop_grace_secs: 2,
        }
    }
}

impl AccessPointConfig {
    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Attach every slice to the runtime's default `bridge` network instead of a dedicated one.
    pub use_default_bridge: bool,
    /// Run a discovery container that serves the slice metadata.
    pub discovery: bool,
    pub discovery_image: String,
    pub discovery_port: u16,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            use_default_bridge: false,
            discovery: true,
            discovery_image: "python:3.12-alpine".to_string(),
            discovery_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyBridgeConfig {
    /// Create and shape the quarantine bridge at startup.
    pub quarantine: bool,
}

impl Default for LegacyBridgeConfig {
    fn default() -> Self {
        Self { quarantine: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound for a single backend attempt.
    pub provisioning_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { provisioning_timeout_secs: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a device stays on a selected slice.
    pub window_hours: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { window_hours: 24 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    pub queue_latency_ms: u32,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self { queue_latency_ms: netslice_qos::profile::DEFAULT_QUEUE_LATENCY_MS }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SliceCategory;

    #[test]
    fn empty_config_uses_defaults() {
        let config = NetsliceConfig::from_json("{}").unwrap();
        assert_eq!(
            config.backends,
            vec![BackendKind::AccessPoint, BackendKind::ContainerNetwork, BackendKind::Simulated]
        );
        assert_eq!(config.access_point.bridge, "br-netslice");
        assert_eq!(config.orchestrator.provisioning_timeout_secs, 60);
        assert_eq!(config.session.window_hours, 24);
        assert!(!config.shell.sudo);
    }

    #[test]
    fn partial_sections() {
        let config = NetsliceConfig::from_json(
            r#"{
                "shell": { "sudo": true },
                "backends": ["legacy_bridge", "simulated"],
                "access_point": { "interface": "wlan1" },
                "slices": [
                    { "name": "arena", "category": "GAMING", "bandwidth_mbps": 50, "latency_ms": 10, "duration_secs": 7200 }
                ]
            }"#,
        )
        .unwrap();

        assert!(config.shell.sudo);
        assert_eq!(config.backends, vec![BackendKind::LegacyBridge, BackendKind::Simulated]);
        assert_eq!(config.access_point.interface.as_deref(), Some("wlan1"));
        assert_eq!(config.access_point.channel, 6);
        assert_eq!(config.slices[0].category, SliceCategory::Gaming);
        assert_eq!(config.slices[0].max_devices, None);
    }

    #[test]
    fn rejects_unknown_backend() {
        assert!(NetsliceConfig::from_json(r#"{ "backends": ["carrier_pigeon"] }"#).is_err());
    }
}
