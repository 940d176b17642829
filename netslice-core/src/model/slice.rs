use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_BANDWIDTH_MBPS: u32 = 100_000;
pub const MAX_LATENCY_MS: u32 = 10_000;
/// Thirty days.
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 3600;
pub const DEFAULT_MAX_DEVICES: u32 = 50;
pub const DEFAULT_DNS_SERVERS: &str = "8.8.8.8,8.8.4.4";

/// Unique identifier of a [`NetworkSlice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SliceId(Uuid);

impl SliceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The first 8 hex digits, used in generated names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SliceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SliceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The kind of traffic a slice is intended for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SliceCategory {
    Corp,
    Guest,
    Iot,
    Gaming,
    Streaming,
}

impl SliceCategory {
    pub const ALL: [Self; 5] = [Self::Corp, Self::Guest, Self::Iot, Self::Gaming, Self::Streaming];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Corp => "CORP",
            Self::Guest => "GUEST",
            Self::Iot => "IOT",
            Self::Gaming => "GAMING",
            Self::Streaming => "STREAMING",
        }
    }

    /// Human readable label, used in SSIDs.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Corp => "Corporate",
            Self::Guest => "Guest",
            Self::Iot => "IoT",
            Self::Gaming => "Gaming",
            Self::Streaming => "Streaming",
        }
    }

    /// Scheduling priority of the category, higher is more important.
    pub const fn priority(&self) -> u8 {
        match self {
            Self::Gaming => 7,
            Self::Streaming => 6,
            Self::Corp => 5,
            Self::Iot => 3,
            Self::Guest => 2,
        }
    }

    /// DSCP marking for traffic of the category.
    pub const fn dscp(&self) -> u8 {
        match self {
            Self::Gaming => 46,
            Self::Streaming | Self::Corp => 34,
            Self::Iot => 18,
            Self::Guest => 10,
        }
    }
}

impl fmt::Display for SliceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SliceCategory {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CORP" | "CORPORATE" => Ok(Self::Corp),
            "GUEST" => Ok(Self::Guest),
            "IOT" => Ok(Self::Iot),
            "GAMING" => Ok(Self::Gaming),
            "STREAMING" => Ok(Self::Streaming),
            _ => Err(ValidationError::new("category", format!("unknown category {s:?}"))),
        }
    }
}

/// Lifecycle state of a slice.
///
/// ```text
/// REQUESTED -> PROVISIONING -> ACTIVE -> INACTIVE
///                    |
///                    +-------> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SliceState {
    Requested,
    Provisioning,
    Active,
    Inactive,
    Failed,
}

impl SliceState {
    pub const LIVE: [Self; 3] = [Self::Requested, Self::Provisioning, Self::Active];

    /// `INACTIVE` and `FAILED` are terminal: a slice never leaves them.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Inactive | Self::Failed)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Provisioning => "PROVISIONING",
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The strategy that realised a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    AccessPoint,
    ContainerNetwork,
    LegacyBridge,
    Simulated,
}

impl BackendKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AccessPoint => "access_point",
            Self::ContainerNetwork => "container_network",
            Self::LegacyBridge => "legacy_bridge",
            Self::Simulated => "simulated",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of applying and reading back the shaping of a slice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QosStatus {
    /// Shaping has not been applied yet.
    #[default]
    Pending,
    Verified,
    /// Shaping could not be applied or did not match the requested bounds.
    Unverified { issues: Vec<String> },
    /// The backend has no interface to shape.
    NotApplicable,
}

impl QosStatus {
    pub fn issues(&self) -> &[String] {
        match self {
            Self::Unverified { issues } => issues,
            _ => &[],
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Unverified { .. } => "unverified",
            Self::NotApplicable => "not applicable",
        }
    }
}

/// A request for a new slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub name: String,
    pub category: SliceCategory,
    pub bandwidth_mbps: u32,
    pub latency_ms: u32,
    pub duration_secs: u64,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub max_devices: Option<u32>,
    /// Comma separated resolvers handed out over DHCP.
    #[serde(default)]
    pub dns_servers: Option<String>,
}

impl SliceSpec {
    pub fn new(
        name: impl Into<String>,
        category: SliceCategory,
        bandwidth_mbps: u32,
        latency_ms: u32,
        duration: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            bandwidth_mbps,
            latency_ms,
            duration_secs: duration.as_secs(),
            owner: None,
            description: None,
            max_devices: None,
            dns_servers: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub const fn with_max_devices(mut self, max_devices: u32) -> Self {
        self.max_devices = Some(max_devices);
        self
    }

    pub fn with_dns_servers(mut self, dns_servers: impl Into<String>) -> Self {
        self.dns_servers = Some(dns_servers.into());
        self
    }

    /// Rejects anything that cannot be provisioned.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ValidationError::new("name", "must not be empty"));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(ValidationError::new("name", format!("must be at most {MAX_NAME_LEN} characters")));
        }

        validate_bounds(self.bandwidth_mbps, self.latency_ms)?;

        if self.duration_secs == 0 {
            return Err(ValidationError::new("duration", "must be positive"));
        }
        if self.duration_secs > MAX_DURATION_SECS {
            return Err(ValidationError::new("duration", format!("must be at most {MAX_DURATION_SECS}s")));
        }

        if self.max_devices == Some(0) {
            return Err(ValidationError::new("max_devices", "must be positive"));
        }

        if let Some(servers) = &self.dns_servers {
            for server in servers.split(',') {
                if server.trim().parse::<std::net::IpAddr>().is_err() {
                    return Err(ValidationError::new("dns_servers", format!("invalid address {server:?}")));
                }
            }
        }

        Ok(())
    }
}

/// Validates a bandwidth and latency pair.
pub fn validate_bounds(bandwidth_mbps: u32, latency_ms: u32) -> Result<(), ValidationError> {
    if bandwidth_mbps == 0 {
        return Err(ValidationError::new("bandwidth", "must be positive"));
    }
    if bandwidth_mbps > MAX_BANDWIDTH_MBPS {
        return Err(ValidationError::new("bandwidth", format!("must be at most {MAX_BANDWIDTH_MBPS} Mbps")));
    }
    if latency_ms > MAX_LATENCY_MS {
        return Err(ValidationError::new("latency", format!("must be at most {MAX_LATENCY_MS} ms")));
    }
    Ok(())
}

/// A bandwidth and latency bounded network segment and everything known about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSlice {
    pub id: SliceId,
    pub name: String,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub category: SliceCategory,
    pub bandwidth_mbps: u32,
    pub latency_ms: u32,
    pub duration_secs: u64,
    pub max_devices: u32,
    pub dns_servers: String,

    pub state: SliceState,
    pub backend: Option<BackendKind>,
    pub vlan_id: Option<u16>,
    pub network_name: Option<String>,
    pub ssid: Option<String>,
    pub passphrase: Option<String>,
    pub qos: QosStatus,
    pub failure_reason: Option<String>,
    pub teardown_issues: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl NetworkSlice {
    /// Creates a `REQUESTED` slice from a validated spec.
    pub fn from_spec(spec: SliceSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: SliceId::new(),
            name: spec.name.trim().to_string(),
            description: spec.description,
            owner: spec.owner,
            category: spec.category,
            bandwidth_mbps: spec.bandwidth_mbps,
            latency_ms: spec.latency_ms,
            duration_secs: spec.duration_secs,
            max_devices: spec.max_devices.unwrap_or(DEFAULT_MAX_DEVICES),
            dns_servers: spec.dns_servers.unwrap_or_else(|| DEFAULT_DNS_SERVERS.to_string()),
            state: SliceState::Requested,
            backend: None,
            vlan_id: None,
            network_name: None,
            ssid: None,
            passphrase: None,
            qos: QosStatus::Pending,
            failure_reason: None,
            teardown_issues: Vec::new(),
            created_at: now,
            activated_at: None,
            expires_at: None,
            deactivated_at: None,
        }
    }

    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn dns_servers(&self) -> Vec<String> {
        self.dns_servers.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
    }

    /// The Wi-Fi connection URI understood by phone cameras, if the slice has credentials.
    pub fn wifi_uri(&self) -> Option<String> {
        match (&self.ssid, &self.passphrase) {
            (Some(ssid), Some(passphrase)) => Some(format!("WIFI:S:{ssid};T:WPA;P:{passphrase};;")),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SliceSpec {
        SliceSpec::new("lobby", SliceCategory::Guest, 10, 50, Duration::from_secs(3600))
    }

    #[test]
    fn validation() {
        assert!(spec().validate().is_ok());

        let mut s = spec();
        s.name = "   ".to_string();
        assert_eq!(s.validate().unwrap_err().field, "name");

        s = spec();
        s.name = "x".repeat(101);
        assert_eq!(s.validate().unwrap_err().field, "name");

        s = spec();
        s.bandwidth_mbps = 0;
        assert_eq!(s.validate().unwrap_err().field, "bandwidth");

        s = spec();
        s.bandwidth_mbps = 100_001;
        assert_eq!(s.validate().unwrap_err().field, "bandwidth");

        s = spec();
        s.duration_secs = 0;
        assert_eq!(s.validate().unwrap_err().field, "duration");

        assert_eq!(spec().with_max_devices(0).validate().unwrap_err().field, "max_devices");
        assert_eq!(spec().with_dns_servers("1.1.1.1,nope").validate().unwrap_err().field, "dns_servers");
    }

    #[test]
    fn category_parsing_and_profiles() {
        assert_eq!("gaming".parse::<SliceCategory>().unwrap(), SliceCategory::Gaming);
        assert_eq!("Corporate".parse::<SliceCategory>().unwrap(), SliceCategory::Corp);
        assert!("VIP".parse::<SliceCategory>().is_err());

        assert_eq!(SliceCategory::Gaming.priority(), 7);
        assert_eq!(SliceCategory::Gaming.dscp(), 46);
        assert_eq!(SliceCategory::Guest.dscp(), 10);
    }

    #[test]
    fn new_slices_are_requested() {
        let slice = NetworkSlice::from_spec(spec(), Utc::now());
        assert_eq!(slice.state, SliceState::Requested);
        assert_eq!(slice.max_devices, DEFAULT_MAX_DEVICES);
        assert_eq!(slice.dns_servers(), vec!["8.8.8.8", "8.8.4.4"]);
        assert_eq!(slice.id.short().len(), 8);
        assert!(slice.wifi_uri().is_none());
    }

    #[test]
    fn serde_names() {
        assert_eq!(serde_json::to_string(&SliceState::Provisioning).unwrap(), "\"PROVISIONING\"");
        assert_eq!(serde_json::to_string(&BackendKind::ContainerNetwork).unwrap(), "\"container_network\"");
        let status = QosStatus::Unverified { issues: vec!["no qdisc".to_string()] };
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"status":"unverified","issues":["no qdisc"]}"#
        );
    }
}
