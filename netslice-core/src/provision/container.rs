use std::net::Ipv4Addr;

use async_trait::async_trait;
use netslice_net::{ip::vlan_subnet, Subnet};
use netslice_shell::{timeouts, tolerate, ShellCommand};
use serde_json::json;

use super::{
    AllocationRecord, DiscoveryService, HostContext, NetworkInfo, ProvisionError, ProvisionRequest, Provisioner,
    Reassignment, TeardownReport,
};
use crate::{
    config::ContainerConfig,
    model::{BackendKind, MacAddress, SliceId},
};

const SUBNET_BASE: Ipv4Addr = Ipv4Addr::new(172, 20, 0, 0);
const DEFAULT_NETWORK: &str = "bridge";
const DEFAULT_BRIDGE: &str = "docker0";
const DEFAULT_SUBNET: Subnet = Subnet::new(Ipv4Addr::new(172, 17, 0, 0), 16);

const LABEL_SLICE: &str = "netslice.slice_id";
const LABEL_DISCOVERY: &str = "netslice.discovery";

/// Serves the JSON in `NETSLICE_SLICE` on `NETSLICE_PORT`.
const DISCOVERY_SERVER: &str = r#"import http.server, os
body = os.environ["NETSLICE_SLICE"].encode()
class Handler(http.server.BaseHTTPRequestHandler):
    def do_GET(self):
        self.send_response(200)
        self.send_header("Content-Type", "application/json")
        self.end_headers()
        self.wfile.write(body)
http.server.HTTPServer(("", int(os.environ["NETSLICE_PORT"])), Handler).serve_forever()
"#;

fn docker() -> ShellCommand {
    ShellCommand::new("docker").timeout(timeouts::DOCKER)
}

fn slice_label(id: &SliceId) -> String {
    format!("{LABEL_SLICE}={id}")
}

/// Container runtime bridge networks, one per slice, plus an optional discovery container.
#[derive(Debug)]
pub struct ContainerProvisioner {
    host: HostContext,
    config: ContainerConfig,
}

impl ContainerProvisioner {
    pub const fn new(host: HostContext, config: ContainerConfig) -> Self {
        Self { host, config }
    }

    pub fn network_name(request: &ProvisionRequest) -> String {
        format!("slice_vlan_{}_{}", request.vlan_id, request.slice_id.short())
    }

    pub fn discovery_name(id: &SliceId) -> String {
        format!("slice_discovery_{}", id.short())
    }

    async fn create_network(
        &self,
        request: &ProvisionRequest,
    ) -> Result<(String, String, Subnet, Ipv4Addr), ProvisionError> {
        if self.config.use_default_bridge {
            tracing::warn!(
                slice = %request.slice_id,
                "using the shared default bridge, shaping applies to every container attached to it"
            );
            return Ok((
                DEFAULT_NETWORK.to_string(),
                DEFAULT_BRIDGE.to_string(),
                DEFAULT_SUBNET,
                DEFAULT_SUBNET.host(1),
            ));
        }

        let name = Self::network_name(request);
        let bridge = format!("nsbr{}", request.vlan_id);
        let subnet = vlan_subnet(SUBNET_BASE, request.vlan_id);
        let gateway = subnet.host(254);

        let cmd = docker()
            .args(["network", "create", "--driver", "bridge"])
            .args(["--subnet", &subnet.to_string(), "--gateway", &gateway.to_string()])
            .args(["--label", &slice_label(&request.slice_id)])
            .args(["--label", &format!("netslice.vlan_id={}", request.vlan_id)])
            .args(["--label", &format!("netslice.slice_name={}", request.name)])
            .args(["--label", &format!("netslice.category={}", request.category)])
            .args(["--label", &format!("netslice.ssid={}", request.credentials.ssid)])
            .args(["-o", &format!("com.docker.network.bridge.name={bridge}")])
            .arg(&name);

        // An existing network of the same name is this slice's from an earlier attempt.
        self.host.shell.run_tolerant(cmd, tolerate::ALREADY_EXISTS).await?;
        tracing::debug!(network = %name, %bridge, %subnet, "container network created");

        Ok((name, bridge, subnet, gateway))
    }

    async fn start_discovery(
        &self,
        request: &ProvisionRequest,
        network: &str,
    ) -> Result<DiscoveryService, ProvisionError> {
        let container = Self::discovery_name(&request.slice_id);
        let metadata = json!({
            "slice_id": request.slice_id,
            "name": request.name,
            "category": request.category,
            "vlan_id": request.vlan_id,
            "bandwidth_mbps": request.bandwidth_mbps,
            "latency_ms": request.latency_ms,
            "ssid": request.credentials.ssid,
        });

        let cmd = ShellCommand::new("docker")
            .timeout(timeouts::CONTAINER_RUN)
            .args(["run", "-d", "--rm", "--name", &container, "--network", network])
            .args(["--label", &slice_label(&request.slice_id)])
            .args(["--label", &format!("{LABEL_DISCOVERY}=true")])
            .args(["-e", &format!("NETSLICE_SLICE={metadata}")])
            .args(["-e", &format!("NETSLICE_PORT={}", self.config.discovery_port)])
            .args([self.config.discovery_image.as_str(), "python3", "-c", DISCOVERY_SERVER]);

        self.host.shell.run_tolerant(cmd, tolerate::ALREADY_EXISTS).await?;
        Ok(DiscoveryService { container, port: self.config.discovery_port })
    }

    /// Removes every container and, unless `keep_networks`, every network labelled with `id`.
    async fn remove_labelled(&self, id: &SliceId, keep_networks: bool) -> TeardownReport {
        let mut report = TeardownReport::default();
        let shell = &self.host.shell;

        let ps = docker().args(["ps", "-a", "-q", "--filter", &format!("label={}", slice_label(id))]);
        if let Some(output) = report.record("list containers", shell.run(ps).await) {
            for container in output.stdout.split_whitespace() {
                let rm = docker().args(["rm", "-f", container]);
                report.record(
                    format!("remove container {container}"),
                    shell.run_tolerant(rm, tolerate::NOT_FOUND).await,
                );
            }
        }

        if keep_networks {
            return report;
        }

        let ls = docker().args(["network", "ls", "-q", "--filter", &format!("label={}", slice_label(id))]);
        if let Some(output) = report.record("list networks", shell.run(ls).await) {
            for network in output.stdout.split_whitespace() {
                let rm = docker().args(["network", "rm", network]);
                report.record(format!("remove network {network}"), shell.run_tolerant(rm, tolerate::NOT_FOUND).await);
            }
        }

        report
    }

    async fn discovery_url(&self, service: &DiscoveryService) -> Option<String> {
        let inspect = docker().args([
            "inspect",
            "-f",
            "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
            &service.container,
        ]);

        let output = self.host.shell.run(inspect).await.ok()?;
        let ip = output.stdout.trim();
        (!ip.is_empty()).then(|| format!("http://{ip}:{}", service.port))
    }
}

#[async_trait]
impl Provisioner for ContainerProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::ContainerNetwork
    }

    async fn check_available(&self) -> Result<(), ProvisionError> {
        let info = docker().args(["info", "--format", "{{.ServerVersion}}"]);
        match self.host.shell.run(info).await {
            Ok(_) => Ok(()),
            Err(e) => Err(ProvisionError::Unavailable(format!("container runtime: {e}"))),
        }
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<AllocationRecord, ProvisionError> {
        let (network_name, bridge, subnet, gateway) = self.create_network(request).await?;

        let discovery = if self.config.discovery {
            match self.start_discovery(request, &network_name).await {
                Ok(service) => Some(service),
                Err(e) => {
                    tracing::warn!(slice = %request.slice_id, error = %e, "discovery container failed to start");
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(slice = %request.slice_id, network = %network_name, %subnet, "container slice up");

        Ok(AllocationRecord {
            slice_id: request.slice_id,
            backend: BackendKind::ContainerNetwork,
            vlan_id: request.vlan_id,
            subnet,
            gateway,
            network_name,
            shaping_interface: Some(bridge),
            shared_network: self.config.use_default_bridge,
            upstream: None,
            discovery,
        })
    }

    async fn deprovision(&self, record: &AllocationRecord) -> TeardownReport {
        self.remove_labelled(&record.slice_id, record.shared_network).await
    }

    async fn cleanup(&self, request: &ProvisionRequest) -> TeardownReport {
        self.remove_labelled(&request.slice_id, self.config.use_default_bridge).await
    }

    async fn reassign(&self, _record: &AllocationRecord, _mac: &MacAddress) -> Result<Reassignment, ProvisionError> {
        Ok(Reassignment::RecordedOnly {
            reason: "container networks have no per-device VLAN assignment".to_string(),
        })
    }

    async fn network_info(&self, record: &AllocationRecord) -> NetworkInfo {
        let Some(service) = &record.discovery else {
            return NetworkInfo::default();
        };

        let ps = docker().args([
            "ps",
            "-q",
            "--filter",
            &format!("label={}", slice_label(&record.slice_id)),
            "--filter",
            &format!("label={LABEL_DISCOVERY}=true"),
        ]);
        let running = self.host.shell.run(ps).await.is_ok_and(|o| !o.stdout.trim().is_empty());
        if !running {
            return NetworkInfo::default();
        }

        NetworkInfo {
            discoverable: true,
            discovery_url: self.discovery_url(service).await,
            connected_devices: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use netslice_shell::{testing::FakeHost, Shell};

    use super::*;
    use crate::{model::SliceCategory, provision::WifiCredentials};

    fn provisioner(host: &FakeHost, config: ContainerConfig) -> ContainerProvisioner {
        ContainerProvisioner::new(HostContext::new(Shell::new(host.clone()), None), config)
    }

    fn request(vlan_id: u16) -> ProvisionRequest {
        let slice_id = SliceId::new();
        ProvisionRequest {
            slice_id,
            name: "lan party".to_string(),
            category: SliceCategory::Gaming,
            vlan_id,
            bandwidth_mbps: 50,
            latency_ms: 10,
            credentials: WifiCredentials::generate(SliceCategory::Gaming, &slice_id),
            dns_servers: vec!["1.1.1.1".to_string()],
        }
    }

    #[tokio::test]
    async fn dedicated_network_with_discovery() {
        let _ = tracing_subscriber::fmt::try_init();

        let host = FakeHost::new();
        let backend = provisioner(&host, ContainerConfig::default());
        let request = request(150);

        backend.check_available().await.unwrap();
        let record = backend.provision(&request).await.unwrap();

        let network = format!("slice_vlan_150_{}", request.slice_id.short());
        assert_eq!(record.network_name, network);
        assert_eq!(record.shaping_interface.as_deref(), Some("nsbr150"));
        assert_eq!(record.gateway, Ipv4Addr::new(172, 20, 150, 254));
        assert!(host.link_exists("nsbr150"));
        assert!(host.docker_networks().contains(&network));

        let info = backend.network_info(&record).await;
        assert!(info.discoverable);
        assert_eq!(info.discovery_url.as_deref(), Some("http://172.20.150.2:8080"));

        let report = backend.deprovision(&record).await;
        assert!(report.is_clean(), "{report:?}");
        assert!(host.containers().is_empty());
        assert!(!host.docker_networks().contains(&network));
        assert!(!host.link_exists("nsbr150"));
    }

    #[tokio::test]
    async fn existing_network_is_reused() {
        let host = FakeHost::new();
        let backend = provisioner(&host, ContainerConfig { discovery: false, ..Default::default() });
        let request = request(151);

        backend.provision(&request).await.unwrap();
        backend.provision(&request).await.unwrap();
        assert_eq!(host.docker_networks().len(), 2);
    }

    #[tokio::test]
    async fn default_bridge_is_shared_and_kept() {
        let host = FakeHost::new();
        let backend = provisioner(&host, ContainerConfig { use_default_bridge: true, ..Default::default() });

        let record = backend.provision(&request(152)).await.unwrap();
        assert_eq!(record.network_name, "bridge");
        assert_eq!(record.shaping_interface.as_deref(), Some("docker0"));
        assert!(record.shared_network);

        assert!(backend.deprovision(&record).await.is_clean());
        assert!(host.docker_networks().contains(&"bridge".to_string()));
        assert!(host.containers().is_empty());
    }

    #[tokio::test]
    async fn unavailable_without_runtime() {
        let host = FakeHost::new().without_docker();
        let err = provisioner(&host, ContainerConfig::default()).check_available().await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
