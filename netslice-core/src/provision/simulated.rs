use std::net::Ipv4Addr;

use async_trait::async_trait;
use netslice_net::ip::vlan_subnet;

use super::{AllocationRecord, ProvisionError, ProvisionRequest, Provisioner, Reassignment, TeardownReport};
use crate::model::{BackendKind, MacAddress};

const SUBNET_BASE: Ipv4Addr = Ipv4Addr::new(10, 200, 0, 0);

/// Records slices without touching the host. The last resort of the fallback chain.
#[derive(Debug, Default)]
pub struct SimulatedProvisioner;

impl SimulatedProvisioner {
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    async fn check_available(&self) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<AllocationRecord, ProvisionError> {
        let subnet = vlan_subnet(SUBNET_BASE, request.vlan_id);
        tracing::info!(slice = %request.slice_id, vlan = request.vlan_id, %subnet, "simulated slice recorded");

        Ok(AllocationRecord {
            slice_id: request.slice_id,
            backend: BackendKind::Simulated,
            vlan_id: request.vlan_id,
            subnet,
            gateway: subnet.host(1),
            network_name: format!("simulated_vlan_{}", request.vlan_id),
            shaping_interface: None,
            shared_network: false,
            upstream: None,
            discovery: None,
        })
    }

    async fn deprovision(&self, _record: &AllocationRecord) -> TeardownReport {
        TeardownReport::default()
    }

    async fn reassign(&self, _record: &AllocationRecord, _mac: &MacAddress) -> Result<Reassignment, ProvisionError> {
        Ok(Reassignment::RecordedOnly { reason: "simulated slices have no network to move devices to".to_string() })
    }
}
