use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use netslice_net::{
    ip::{self, vlan_subnet},
    Subnet,
};
use netslice_shell::{timeouts, tolerate, Daemon, ShellCommand};
use parking_lot::Mutex;
use tokio::{io::AsyncWriteExt, time::Instant};

use super::{
    hostapd::{parse_leases, DnsmasqConfig, HostapdConfig},
    AllocationRecord, ConnectedDevice, HostContext, NetworkInfo, ProvisionError, ProvisionRequest, Provisioner,
    Reassignment, TeardownReport,
};
use crate::{
    config::AccessPointConfig,
    model::{BackendKind, MacAddress, SliceId},
};

const SUBNET_BASE: Ipv4Addr = Ipv4Addr::new(10, 50, 0, 0);
const DHCP_FIRST_HOST: u8 = 10;
const DHCP_LAST_HOST: u8 = 200;

fn iw<'a>(args: impl IntoIterator<Item = &'a str>) -> ShellCommand {
    ShellCommand::new("iw").args(args).timeout(timeouts::QUICK)
}

fn nmcli<'a>(args: impl IntoIterator<Item = &'a str>) -> ShellCommand {
    ShellCommand::new("nmcli").args(args).timeout(timeouts::QUICK)
}

/// Extracts interface names from `iw dev` output.
pub fn parse_iw_interfaces(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Interface "))
        .map(|name| name.trim().to_string())
        .collect()
}

#[derive(Debug, Clone)]
struct ApFiles {
    hostapd_conf: PathBuf,
    accept: PathBuf,
    dnsmasq_conf: PathBuf,
    leases: PathBuf,
}

/// The slice currently on air and the daemons serving it.
#[derive(Debug)]
struct ActiveAp {
    slice_id: SliceId,
    interface: String,
    vlan_id: u16,
    /// In start order.
    daemons: Vec<Box<dyn Daemon>>,
    files: ApFiles,
}

/// Runs slices as a WPA2 access point on the host's wireless interface, with `hostapd` for the
/// radio and `dnsmasq` for DHCP and DNS on a bridge.
///
/// There is one radio, so only one slice is on air at a time. Provisioning a new slice takes
/// the radio over from the previous one, which is reported through
/// [`Provisioner::take_displaced`].
#[derive(Debug)]
pub struct AccessPointProvisioner {
    host: HostContext,
    config: AccessPointConfig,
    /// Held from the handoff check until the new access point is fully up, so two `hostapd`
    /// instances never run at once.
    radio: tokio::sync::Mutex<Option<ActiveAp>>,
    displaced: Mutex<Vec<SliceId>>,
}

impl AccessPointProvisioner {
    pub fn new(host: HostContext, config: AccessPointConfig) -> Self {
        Self { host, config, radio: tokio::sync::Mutex::new(None), displaced: Mutex::default() }
    }

    /// The slice currently on air.
    pub async fn on_air(&self) -> Option<SliceId> {
        self.radio.lock().await.as_ref().map(|ap| ap.slice_id)
    }

    fn files(&self, request: &ProvisionRequest) -> ApFiles {
        let dir = &self.config.runtime_dir;
        let ssid = &request.credentials.ssid;
        let bridge = &self.config.bridge;

        ApFiles {
            hostapd_conf: dir.join(format!("hostapd_{ssid}.conf")),
            accept: dir.join(format!("hostapd_{ssid}.accept")),
            dnsmasq_conf: dir.join(format!("dnsmasq_{bridge}.conf")),
            leases: dir.join(format!("dnsmasq_{bridge}.leases")),
        }
    }

    async fn wireless_interface(&self) -> Result<String, ProvisionError> {
        if let Some(interface) = &self.config.interface {
            return Ok(interface.clone());
        }

        let output = self
            .host
            .shell
            .run(iw(["dev"]))
            .await
            .map_err(|e| ProvisionError::Unavailable(format!("cannot list wireless interfaces: {e}")))?;

        parse_iw_interfaces(&output.stdout)
            .into_iter()
            .next()
            .ok_or_else(|| ProvisionError::Unavailable("no wireless interface".to_string()))
    }

    async fn release_from_network_manager(&self, interface: &str) {
        let commands = [nmcli(["dev", "set", interface, "managed", "no"]), nmcli(["dev", "disconnect", interface])];
        for cmd in commands {
            if let Err(e) = self.host.shell.run(cmd).await {
                tracing::debug!(interface, error = %e, "network manager did not release the interface");
            }
        }
    }

    async fn return_to_network_manager(&self, interface: &str) {
        if let Err(e) = self.host.shell.run(nmcli(["dev", "set", interface, "managed", "yes"])).await {
            tracing::debug!(interface, error = %e, "network manager did not take the interface back");
        }
    }

    /// Polls until `hostapd` has switched the interface into AP mode.
    async fn wait_until_ready(&self, interface: &str, hostapd: &mut Box<dyn Daemon>) -> Result<(), ProvisionError> {
        let timeout = self.config.ready_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            if !hostapd.is_alive() {
                return Err(ProvisionError::DaemonExited("hostapd"));
            }

            let info = self.host.shell.output(iw(["dev", interface, "info"])).await;
            if info.is_ok_and(|o| o.is_success() && o.stdout.contains("type AP")) {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(ProvisionError::NotReady { daemon: "hostapd", timeout });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Brings the access point up, pushing every daemon it starts onto `daemons`.
    async fn bring_up(
        &self,
        interface: &str,
        request: &ProvisionRequest,
        subnet: &Subnet,
        upstream: &str,
        files: &ApFiles,
        daemons: &mut Vec<Box<dyn Daemon>>,
    ) -> Result<(), ProvisionError> {
        let shell = &self.host.shell;
        let bridge = self.config.bridge.as_str();
        let gateway = subnet.host(1);

        tokio::fs::create_dir_all(&self.config.runtime_dir).await?;

        self.release_from_network_manager(interface).await;
        shell.run(ip::addr_flush(interface)).await?;
        shell.run(ip::link_set_down(interface)).await?;
        shell.run(ip::link_set_up(interface)).await?;
        ip::ensure_bridge(shell, bridge).await?;
        shell.run(ip::addr_flush(bridge)).await?;

        tokio::fs::write(&files.accept, "").await?;
        let hostapd_conf = HostapdConfig {
            interface,
            bridge,
            ssid: &request.credentials.ssid,
            passphrase: &request.credentials.passphrase,
            country_code: &self.config.country_code,
            channel: self.config.channel,
            accept_mac_file: &files.accept,
        };
        tokio::fs::write(&files.hostapd_conf, hostapd_conf.render()).await?;

        let hostapd = shell.spawn(ShellCommand::new("hostapd").arg(files.hostapd_conf.display().to_string())).await?;
        let hostapd = push(daemons, hostapd);
        self.wait_until_ready(interface, hostapd).await?;

        shell.run_tolerant(ip::link_set_master(interface, bridge), tolerate::ALREADY_EXISTS).await?;
        ip::assign_address(shell, bridge, gateway, subnet.mask).await?;

        let dnsmasq_conf = DnsmasqConfig {
            bridge,
            range_start: subnet.host(DHCP_FIRST_HOST),
            range_end: subnet.host(DHCP_LAST_HOST),
            gateway,
            dns_servers: &request.dns_servers,
            lease_hours: self.config.lease_hours,
            lease_file: &files.leases,
        };
        tokio::fs::write(&files.dnsmasq_conf, dnsmasq_conf.render()).await?;

        let dnsmasq = shell
            .spawn(
                ShellCommand::new("dnsmasq")
                    .arg("--keep-in-foreground")
                    .arg(format!("--conf-file={}", files.dnsmasq_conf.display())),
            )
            .await?;
        if !push(daemons, dnsmasq).is_alive() {
            return Err(ProvisionError::DaemonExited("dnsmasq"));
        }

        self.host.nat.attach(&request.slice_id.to_string(), subnet, upstream).await?;
        Ok(())
    }

    /// Stops the daemons and clears the addresses and neighbors of the radio.
    async fn stop(&self, active: ActiveAp) -> TeardownReport {
        let mut report = TeardownReport::default();
        let shell = &self.host.shell;
        let bridge = self.config.bridge.as_str();
        let interface = active.interface.as_str();

        for mut daemon in active.daemons.into_iter().rev() {
            let step = format!("stop {}", daemon.program());
            report.record(step, daemon.stop(self.config.stop_grace()).await);
        }

        report.record(
            "detach interface",
            shell
                .run_tolerant(
                    ShellCommand::new("ip").args(["link", "set", "dev", interface, "nomaster"]),
                    tolerate::NOT_FOUND,
                )
                .await,
        );
        for dev in [interface, bridge] {
            report.record(
                format!("flush addresses of {dev}"),
                shell.run_tolerant(ip::addr_flush(dev), tolerate::NOT_FOUND).await,
            );
            report.record(
                format!("flush neighbors of {dev}"),
                shell.run_tolerant(ip::neigh_flush(dev), tolerate::NOT_FOUND).await,
            );
        }

        for path in [&active.files.hostapd_conf, &active.files.accept, &active.files.dnsmasq_conf] {
            remove_file(path).await;
        }

        tracing::info!(slice = %active.slice_id, vlan = active.vlan_id, interface, "access point stopped");
        report
    }

    /// Stops the radio if `slice_id` is on air.
    async fn stop_if_on_air(&self, slice_id: &SliceId) -> TeardownReport {
        let mut radio = self.radio.lock().await;
        if !radio.as_ref().is_some_and(|ap| ap.slice_id == *slice_id) {
            return TeardownReport::default();
        }

        let mut report = TeardownReport::default();
        if let Some(active) = radio.take() {
            let interface = active.interface.clone();
            report.extend(self.stop(active).await);
            self.return_to_network_manager(&interface).await;
        }
        report
    }

    async fn connected_devices(&self, leases: &Path) -> Vec<ConnectedDevice> {
        let shell = &self.host.shell;

        let cat = ShellCommand::new("cat").arg(leases.display().to_string()).timeout(timeouts::QUICK);
        let mut devices = match shell.run(cat).await {
            Ok(output) => parse_leases(&output.stdout),
            Err(_) => Vec::new(),
        };

        if let Ok(output) = shell.run(ip::neigh_show(&self.config.bridge)).await {
            for neighbor in ip::parse_neighbors(&output.stdout) {
                let Some(mac) = neighbor.mac else { continue };
                if devices.iter().any(|d| d.mac == mac) {
                    continue;
                }
                devices.push(ConnectedDevice { mac, ip: neighbor.ip, hostname: None, lease_expires: None });
            }
        }

        devices
    }
}

fn push(daemons: &mut Vec<Box<dyn Daemon>>, daemon: Box<dyn Daemon>) -> &mut Box<dyn Daemon> {
    daemons.push(daemon);
    let last = daemons.len() - 1;
    &mut daemons[last]
}

async fn remove_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove file");
        }
    }
}

#[async_trait]
impl Provisioner for AccessPointProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::AccessPoint
    }

    async fn check_available(&self) -> Result<(), ProvisionError> {
        let shell = &self.host.shell;
        let interface = self.wireless_interface().await?;

        if !ip::link_exists(shell, &interface).await.unwrap_or(false) {
            return Err(ProvisionError::Unavailable(format!("interface {interface} does not exist")));
        }

        for program in ["hostapd", "dnsmasq"] {
            let which = ShellCommand::new("which").arg(program).timeout(timeouts::QUICK);
            if !shell.succeeds(which).await.unwrap_or(false) {
                return Err(ProvisionError::Unavailable(format!("{program} is not installed")));
            }
        }

        let list = shell
            .run(iw(["list"]))
            .await
            .map_err(|e| ProvisionError::Unavailable(format!("cannot read wireless capabilities: {e}")))?;
        if !list.stdout.lines().any(|line| line.trim() == "* AP") {
            return Err(ProvisionError::Unavailable(format!("{interface} does not support AP mode")));
        }

        Ok(())
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<AllocationRecord, ProvisionError> {
        let interface = self.wireless_interface().await?;
        let subnet = vlan_subnet(SUBNET_BASE, request.vlan_id);
        let upstream = self.host.upstream.resolve().await;
        let files = self.files(request);

        let mut radio = self.radio.lock().await;

        if let Some(previous) = radio.take() {
            if previous.slice_id != request.slice_id {
                tracing::info!(previous = %previous.slice_id, next = %request.slice_id, "handing the radio over");
                self.displaced.lock().push(previous.slice_id);
            }
            let report = self.stop(previous).await;
            if !report.is_clean() {
                tracing::warn!(issues = ?report.issues(), "previous access point did not stop cleanly");
            }
        }

        let mut daemons = Vec::with_capacity(2);
        if let Err(e) = self.bring_up(&interface, request, &subnet, &upstream, &files, &mut daemons).await {
            tracing::warn!(slice = %request.slice_id, error = %e, "access point failed to start");
            let partial = ActiveAp {
                slice_id: request.slice_id,
                interface: interface.clone(),
                vlan_id: request.vlan_id,
                daemons,
                files,
            };
            let mut report = self.stop(partial).await;
            report.record("detach nat", self.host.nat.detach(&request.slice_id.to_string(), &subnet, &upstream).await);
            self.return_to_network_manager(&interface).await;
            return Err(e);
        }

        *radio = Some(ActiveAp {
            slice_id: request.slice_id,
            interface: interface.clone(),
            vlan_id: request.vlan_id,
            daemons,
            files,
        });

        let ssid = &request.credentials.ssid;
        tracing::info!(slice = %request.slice_id, %ssid, %interface, %subnet, "access point on air");

        Ok(AllocationRecord {
            slice_id: request.slice_id,
            backend: BackendKind::AccessPoint,
            vlan_id: request.vlan_id,
            subnet,
            gateway: subnet.host(1),
            network_name: request.credentials.ssid.clone(),
            shaping_interface: Some(self.config.bridge.clone()),
            shared_network: false,
            upstream: Some(upstream),
            discovery: None,
        })
    }

    async fn deprovision(&self, record: &AllocationRecord) -> TeardownReport {
        let mut report = self.stop_if_on_air(&record.slice_id).await;

        let upstream = match &record.upstream {
            Some(upstream) => upstream.clone(),
            None => self.host.upstream.resolve().await,
        };
        let consumer = record.slice_id.to_string();
        report.record("detach nat", self.host.nat.detach(&consumer, &record.subnet, &upstream).await);
        report
    }

    async fn cleanup(&self, request: &ProvisionRequest) -> TeardownReport {
        let mut report = self.stop_if_on_air(&request.slice_id).await;

        let upstream = self.host.upstream.resolve().await;
        let subnet = vlan_subnet(SUBNET_BASE, request.vlan_id);
        report.record("detach nat", self.host.nat.detach(&request.slice_id.to_string(), &subnet, &upstream).await);
        report
    }

    async fn reassign(&self, record: &AllocationRecord, mac: &MacAddress) -> Result<Reassignment, ProvisionError> {
        let radio = self.radio.lock().await;
        let Some((accept, interface)) = radio
            .as_ref()
            .filter(|ap| ap.slice_id == record.slice_id)
            .map(|ap| (ap.files.accept.clone(), ap.interface.clone()))
        else {
            return Ok(Reassignment::RecordedOnly { reason: "the slice is no longer on air".to_string() });
        };

        // The radio stays locked until hostapd has reloaded.
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&accept).await?;
        file.write_all(format!("{mac} {}\n", record.vlan_id).as_bytes()).await?;
        file.flush().await?;

        let reload = ShellCommand::new("hostapd_cli").args(["-i", interface.as_str(), "reload"]);
        if let Err(e) = self.host.shell.run(reload).await {
            tracing::warn!(%mac, error = %e, "hostapd did not reload its access list");
            return Ok(Reassignment::RecordedOnly { reason: format!("hostapd reload failed: {e}") });
        }

        tracing::info!(%mac, vlan = record.vlan_id, slice = %record.slice_id, "device admitted");
        Ok(Reassignment::Enforced)
    }

    async fn network_info(&self, record: &AllocationRecord) -> NetworkInfo {
        let leases = {
            let radio = self.radio.lock().await;
            match radio.as_ref().filter(|ap| ap.slice_id == record.slice_id) {
                Some(active) => active.files.leases.clone(),
                None => return NetworkInfo::default(),
            }
        };

        let connected_devices = self.connected_devices(&leases).await;
        NetworkInfo { discoverable: true, discovery_url: None, connected_devices }
    }

    fn take_displaced(&self) -> Vec<SliceId> {
        std::mem::take(&mut *self.displaced.lock())
    }
}
