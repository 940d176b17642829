//! Backends that turn a slice request into real network resources.
//!
//! ```text
//!              Orchestrator
//!                   |  check / provision / deprovision
//!      +------------+-------------+----------------+
//!      |            |             |                |
//! AccessPoint   Container    LegacyBridge      Simulated
//! hostapd,      docker        ip link           bookkeeping
//! dnsmasq       networks      bridges           only
//! ```
//!
//! Every backend talks to the host through a [`Shell`], so a
//! [`FakeHost`](netslice_shell::testing::FakeHost) can stand in for it.

use std::{fmt, net::Ipv4Addr, ops::RangeInclusive, sync::Arc, time::Duration};

use async_trait::async_trait;
use netslice_net::{NatConfigurator, NatError, Subnet, UpstreamResolver};
use netslice_qos::QosError;
use netslice_shell::Shell;
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use thiserror::Error;

use crate::{
    model::{BackendKind, MacAddress, SliceCategory, SliceId},
    vlan::{VlanExhausted, SLICE_RANGE},
};

mod access_point;
pub use access_point::AccessPointProvisioner;

mod container;
pub use container::ContainerProvisioner;

pub mod hostapd;

mod legacy;
pub use legacy::LegacyBridgeProvisioner;

mod simulated;
pub use simulated::SimulatedProvisioner;

const PASSPHRASE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The backend cannot run on this host. The orchestrator falls back to the next one.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Shell(#[from] netslice_shell::Error),
    #[error(transparent)]
    Nat(#[from] NatError),
    #[error(transparent)]
    Qos(#[from] QosError),
    #[error("{daemon} did not become ready within {timeout:?}")]
    NotReady { daemon: &'static str, timeout: Duration },
    #[error("{0} exited unexpectedly")]
    DaemonExited(&'static str),
    #[error(transparent)]
    Vlan(#[from] VlanExhausted),
    #[error("provisioning timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Wi-Fi credentials generated for every slice.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub passphrase: String,
}

impl WifiCredentials {
    /// `NetSlice_<Category>_<id8>` and a random alphanumeric passphrase.
    pub fn generate(category: SliceCategory, id: &SliceId) -> Self {
        let passphrase =
            rand::thread_rng().sample_iter(&Alphanumeric).take(PASSPHRASE_LEN).map(char::from).collect();
        Self { ssid: format!("NetSlice_{}_{}", category.label(), id.short()), passphrase }
    }
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials").field("ssid", &self.ssid).finish_non_exhaustive()
    }
}

/// Everything a backend needs to realise a slice.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub slice_id: SliceId,
    pub name: String,
    pub category: SliceCategory,
    pub vlan_id: u16,
    pub bandwidth_mbps: u32,
    pub latency_ms: u32,
    pub credentials: WifiCredentials,
    pub dns_servers: Vec<String>,
}

/// Where a running discovery service can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryService {
    pub container: String,
    pub port: u16,
}

/// What a backend created for a slice. Handed back to the same backend on teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    pub slice_id: SliceId,
    pub backend: BackendKind,
    pub vlan_id: u16,
    pub subnet: Subnet,
    pub gateway: Ipv4Addr,
    pub network_name: String,
    /// Interface the orchestrator shapes, if any.
    pub shaping_interface: Option<String>,
    /// Whether other slices may share the network and its shaping interface.
    pub shared_network: bool,
    /// Upstream interface NAT was attached to.
    pub upstream: Option<String>,
    pub discovery: Option<DiscoveryService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownFailure {
    pub step: String,
    pub error: String,
}

/// Collects the failures of a best-effort teardown. Every step is attempted regardless.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Records `result` under `step`, returning the value on success.
    pub fn record<T, E: fmt::Display>(&mut self, step: impl Into<String>, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                let step = step.into();
                tracing::warn!(%step, error = %e, "teardown step failed");
                self.failures.push(TeardownFailure { step, error: e.to_string() });
                None
            }
        }
    }

    pub fn extend(&mut self, other: Self) {
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn issues(&self) -> Vec<String> {
        self.failures.iter().map(|f| format!("{}: {}", f.step, f.error)).collect()
    }
}

/// How a device reassignment was carried out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Reassignment {
    /// The backend moved the device at the network level.
    Enforced,
    /// The backend cannot move devices. The change exists in the records only.
    RecordedOnly { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedDevice {
    pub mac: String,
    pub ip: String,
    pub hostname: Option<String>,
    /// Lease expiry as a UNIX timestamp, if the device got its address over DHCP.
    pub lease_expires: Option<u64>,
}

/// Live information a backend can report about an allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub discoverable: bool,
    pub discovery_url: Option<String>,
    pub connected_devices: Vec<ConnectedDevice>,
}

/// Host facilities shared by all backends.
#[derive(Debug, Clone)]
pub struct HostContext {
    pub shell: Shell,
    pub nat: Arc<NatConfigurator>,
    pub upstream: Arc<UpstreamResolver>,
}

impl HostContext {
    pub fn new(shell: Shell, upstream_interface: Option<String>) -> Self {
        Self {
            nat: Arc::new(NatConfigurator::new(shell.clone())),
            upstream: Arc::new(UpstreamResolver::new(shell.clone(), upstream_interface)),
            shell,
        }
    }
}

/// A strategy for realising slices.
#[async_trait]
pub trait Provisioner: fmt::Debug + Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// The VLAN ids this backend accepts.
    fn vlan_range(&self) -> RangeInclusive<u16> {
        SLICE_RANGE
    }

    /// Checks that the backend can run on this host. Fails with
    /// [`ProvisionError::Unavailable`] if not.
    async fn check_available(&self) -> Result<(), ProvisionError>;

    /// Creates the resources of a slice. On error, whatever was created is removed again.
    async fn provision(&self, request: &ProvisionRequest) -> Result<AllocationRecord, ProvisionError>;

    /// Removes the resources of a slice, best-effort.
    async fn deprovision(&self, record: &AllocationRecord) -> TeardownReport;

    /// Removes whatever an interrupted [`Provisioner::provision`] may have left behind.
    async fn cleanup(&self, _request: &ProvisionRequest) -> TeardownReport {
        TeardownReport::default()
    }

    /// Moves a device onto the slice of `record`.
    async fn reassign(&self, _record: &AllocationRecord, _mac: &MacAddress) -> Result<Reassignment, ProvisionError> {
        Ok(Reassignment::RecordedOnly { reason: format!("{} backend cannot move devices", self.kind()) })
    }

    async fn network_info(&self, _record: &AllocationRecord) -> NetworkInfo {
        NetworkInfo::default()
    }

    /// Slices whose resources this backend had to take over since the last call. They are no
    /// longer served and must be deactivated.
    fn take_displaced(&self) -> Vec<SliceId> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_format() {
        let id = SliceId::new();
        let credentials = WifiCredentials::generate(SliceCategory::Iot, &id);

        assert_eq!(credentials.ssid, format!("NetSlice_IoT_{}", id.short()));
        assert_eq!(credentials.passphrase.len(), PASSPHRASE_LEN);
        assert!(credentials.passphrase.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!format!("{credentials:?}").contains(&credentials.passphrase));
    }

    #[test]
    fn teardown_report_collects_failures() {
        let mut report = TeardownReport::default();
        assert_eq!(report.record("remove shaping", Ok::<_, String>(3)), Some(3));
        assert!(report.is_clean());

        assert_eq!(report.record("stop hostapd", Err::<(), _>("gone")), None);
        assert_eq!(report.issues(), vec!["stop hostapd: gone".to_string()]);
    }
}
