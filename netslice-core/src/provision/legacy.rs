use std::{net::Ipv4Addr, ops::RangeInclusive};

use async_trait::async_trait;
use netslice_net::{
    ip::{self, vlan_subnet},
    Subnet,
};
use netslice_qos::QosShaper;
use netslice_shell::ShellCommand;

use super::{
    AllocationRecord, HostContext, ProvisionError, ProvisionRequest, Provisioner, Reassignment, TeardownReport,
};
use crate::{
    model::{BackendKind, MacAddress},
    vlan::{LEGACY_RANGE, QUARANTINE_VLAN},
};

const SUBNET_BASE: Ipv4Addr = Ipv4Addr::new(10, 100, 0, 0);
const QUARANTINE_SUBNET: Subnet = Subnet::new(Ipv4Addr::new(192, 168, 99, 0), 24);
const QUARANTINE_BANDWIDTH_MBIT_S: f64 = 0.1;
const QUARANTINE_LATENCY_MS: u32 = 100;

pub fn bridge_name(vlan: u16) -> String {
    format!("br-vlan{vlan}")
}

/// One Linux bridge per VLAN, routed and NATed through the upstream interface.
#[derive(Debug)]
pub struct LegacyBridgeProvisioner {
    host: HostContext,
    shaper: QosShaper,
}

impl LegacyBridgeProvisioner {
    pub const fn new(host: HostContext, shaper: QosShaper) -> Self {
        Self { host, shaper }
    }

    /// Creates the quarantine bridge and throttles it. Unauthenticated devices live here.
    pub async fn ensure_quarantine(&self) -> Result<(), ProvisionError> {
        let bridge = bridge_name(QUARANTINE_VLAN);
        let shell = &self.host.shell;

        ip::ensure_bridge(shell, &bridge).await?;
        ip::assign_address(shell, &bridge, QUARANTINE_SUBNET.host(1), QUARANTINE_SUBNET.mask).await?;
        self.shaper.apply(&bridge, QUARANTINE_BANDWIDTH_MBIT_S, QUARANTINE_LATENCY_MS).await?;

        tracing::info!(%bridge, subnet = %QUARANTINE_SUBNET, "quarantine bridge ready");
        Ok(())
    }

    async fn bring_up(
        &self,
        bridge: &str,
        subnet: &Subnet,
        gateway: Ipv4Addr,
        upstream: &str,
        consumer: &str,
    ) -> Result<(), ProvisionError> {
        ip::ensure_bridge(&self.host.shell, bridge).await?;
        ip::assign_address(&self.host.shell, bridge, gateway, subnet.mask).await?;
        self.host.nat.attach(consumer, subnet, upstream).await?;
        Ok(())
    }

    async fn tear_down(&self, bridge: &str, subnet: &Subnet, upstream: &str, consumer: &str) -> TeardownReport {
        let mut report = TeardownReport::default();
        report.record("detach nat", self.host.nat.detach(consumer, subnet, upstream).await);
        report.record(format!("remove bridge {bridge}"), ip::remove_link(&self.host.shell, bridge).await);
        report
    }
}

#[async_trait]
impl Provisioner for LegacyBridgeProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::LegacyBridge
    }

    fn vlan_range(&self) -> RangeInclusive<u16> {
        LEGACY_RANGE
    }

    async fn check_available(&self) -> Result<(), ProvisionError> {
        let available = self
            .host
            .shell
            .succeeds(ShellCommand::new("which").arg("ip"))
            .await
            .map_err(|e| ProvisionError::Unavailable(e.to_string()))?;

        if available {
            Ok(())
        } else {
            Err(ProvisionError::Unavailable("ip is not installed".to_string()))
        }
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<AllocationRecord, ProvisionError> {
        let bridge = bridge_name(request.vlan_id);
        let subnet = vlan_subnet(SUBNET_BASE, request.vlan_id);
        let gateway = subnet.host(1);
        let upstream = self.host.upstream.resolve().await;
        let consumer = request.slice_id.to_string();

        if let Err(e) = self.bring_up(&bridge, &subnet, gateway, &upstream, &consumer).await {
            let report = self.tear_down(&bridge, &subnet, &upstream, &consumer).await;
            tracing::warn!(%bridge, error = %e, cleanup_issues = report.failures.len(), "bridge setup failed");
            return Err(e);
        }

        tracing::info!(slice = %request.slice_id, %bridge, %subnet, %upstream, "bridge slice up");

        Ok(AllocationRecord {
            slice_id: request.slice_id,
            backend: BackendKind::LegacyBridge,
            vlan_id: request.vlan_id,
            subnet,
            gateway,
            network_name: bridge.clone(),
            shaping_interface: Some(bridge),
            shared_network: false,
            upstream: Some(upstream),
            discovery: None,
        })
    }

    async fn deprovision(&self, record: &AllocationRecord) -> TeardownReport {
        let upstream = match &record.upstream {
            Some(upstream) => upstream.clone(),
            None => self.host.upstream.resolve().await,
        };
        self.tear_down(&record.network_name, &record.subnet, &upstream, &record.slice_id.to_string()).await
    }

    async fn cleanup(&self, request: &ProvisionRequest) -> TeardownReport {
        let upstream = self.host.upstream.resolve().await;
        let subnet = vlan_subnet(SUBNET_BASE, request.vlan_id);
        self.tear_down(&bridge_name(request.vlan_id), &subnet, &upstream, &request.slice_id.to_string()).await
    }

    async fn reassign(&self, _record: &AllocationRecord, _mac: &MacAddress) -> Result<Reassignment, ProvisionError> {
        Ok(Reassignment::RecordedOnly {
            reason: "bridge slices are reached through their VLAN trunk, devices are not moved".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use netslice_qos::ShaperOptions;
    use netslice_shell::{testing::FakeHost, Shell};

    use super::*;
    use crate::{
        model::{SliceCategory, SliceId},
        provision::WifiCredentials,
    };

    fn provisioner(host: &FakeHost) -> LegacyBridgeProvisioner {
        let shell = Shell::new(host.clone());
        LegacyBridgeProvisioner::new(
            HostContext::new(shell.clone(), None),
            QosShaper::new(shell, ShaperOptions::default()),
        )
    }

    fn request(vlan_id: u16) -> ProvisionRequest {
        let slice_id = SliceId::new();
        ProvisionRequest {
            slice_id,
            name: "lab".to_string(),
            category: SliceCategory::Corp,
            vlan_id,
            bandwidth_mbps: 100,
            latency_ms: 5,
            credentials: WifiCredentials::generate(SliceCategory::Corp, &slice_id),
            dns_servers: vec!["8.8.8.8".to_string()],
        }
    }

    #[tokio::test]
    async fn provision_and_deprovision() {
        let _ = tracing_subscriber::fmt::try_init();

        let host = FakeHost::new();
        let backend = provisioner(&host);

        let record = backend.provision(&request(300)).await.unwrap();
        assert_eq!(record.network_name, "br-vlan300");
        assert_eq!(record.subnet.to_string(), "10.101.44.0/24");
        assert_eq!(host.link_addrs("br-vlan300"), vec!["10.101.44.1/24"]);
        assert_eq!(host.iptables_rules("nat", "POSTROUTING").len(), 1);

        let report = backend.deprovision(&record).await;
        assert!(report.is_clean(), "{report:?}");
        assert!(!host.link_exists("br-vlan300"));
        assert!(host.iptables_rules("nat", "POSTROUTING").is_empty());
    }

    #[tokio::test]
    async fn failed_setup_is_rolled_back() {
        let host = FakeHost::new();
        host.fail_on("ip addr add");
        let backend = provisioner(&host);

        assert!(backend.provision(&request(42)).await.is_err());
        assert!(!host.link_exists("br-vlan42"));
    }

    #[tokio::test]
    async fn quarantine_is_throttled() {
        let host = FakeHost::new();
        provisioner(&host).ensure_quarantine().await.unwrap();

        assert_eq!(host.link_addrs("br-vlan99"), vec!["192.168.99.1/24"]);
        let show = host.qdisc_show("br-vlan99");
        assert!(show.contains("rate 100Kbit"), "{show}");
        assert!(show.contains("delay 100ms"), "{show}");
    }
}
