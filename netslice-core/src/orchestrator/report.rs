//! Per-slice inspection reports for the operator surface.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use netslice_net::stats::InterfaceStats;
use serde::Serialize;

use crate::{
    model::{BackendKind, QosStatus, SliceCategory, SliceId, SliceState},
    provision::ConnectedDevice,
};

/// Which slices to inspect.
#[derive(Debug, Clone, Default)]
pub struct InspectFilter {
    /// Include terminal slices.
    pub all: bool,
    pub slice_id: Option<SliceId>,
}

impl InspectFilter {
    pub const fn all() -> Self {
        Self { all: true, slice_id: None }
    }

    pub const fn slice(id: SliceId) -> Self {
        Self { all: true, slice_id: Some(id) }
    }
}

/// Everything the operator sees about one slice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SliceReport {
    pub id: SliceId,
    pub name: String,
    pub category: SliceCategory,
    pub priority: u8,
    pub dscp: u8,
    pub state: SliceState,
    pub backend: Option<BackendKind>,
    pub vlan_id: Option<u16>,
    pub network_name: Option<String>,
    pub ssid: Option<String>,
    pub wifi_uri: Option<String>,
    pub discoverable: bool,
    pub discovery_url: Option<String>,

    pub requested_bandwidth_mbps: u32,
    pub requested_latency_ms: u32,
    pub actual_bandwidth_mbps: Option<f64>,
    pub actual_latency_ms: Option<f64>,
    pub qos: QosStatus,
    pub shaping_interface: Option<String>,
    /// Raw `tc qdisc show` output of the shaping interface.
    pub scheduler_state: Option<String>,

    pub connected_devices: Vec<ConnectedDevice>,
    pub interface_stats: Option<InterfaceStats>,
    pub expires_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub teardown_issues: Vec<String>,
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Renders reports as one human-readable block per slice.
pub fn render_text(reports: &[SliceReport]) -> String {
    if reports.is_empty() {
        return "no slices\n".to_string();
    }

    let mut out = String::new();
    for r in reports {
        let _ = writeln!(out, "slice {} ({})", r.name, r.id);
        let _ = writeln!(out, "  category     {} (priority {}, dscp {})", r.category.label(), r.priority, r.dscp);
        let _ = writeln!(out, "  state        {}", r.state);
        let _ = writeln!(out, "  backend      {}", or_dash(r.backend));
        let _ = writeln!(out, "  vlan         {}", or_dash(r.vlan_id));
        let _ = writeln!(out, "  network      {}", or_dash(r.network_name.as_deref()));
        if let Some(ssid) = &r.ssid {
            let _ = writeln!(out, "  ssid         {ssid}");
        }
        if let Some(uri) = &r.wifi_uri {
            let _ = writeln!(out, "  wifi uri     {uri}");
        }
        let _ = writeln!(
            out,
            "  discoverable {}{}",
            if r.discoverable { "yes" } else { "no" },
            r.discovery_url.as_deref().map(|url| format!(" at {url}")).unwrap_or_default()
        );

        let _ = writeln!(
            out,
            "  bandwidth    {} Mbit/s requested, {} actual",
            r.requested_bandwidth_mbps,
            r.actual_bandwidth_mbps.map_or_else(|| "-".to_string(), |bw| format!("{bw:.1} Mbit/s"))
        );
        let _ = writeln!(
            out,
            "  latency      {} ms requested, {} actual",
            r.requested_latency_ms,
            r.actual_latency_ms.map_or_else(|| "-".to_string(), |lat| format!("{lat:.1} ms"))
        );
        let _ = writeln!(out, "  qos          {} on {}", r.qos.as_str(), or_dash(r.shaping_interface.as_deref()));
        for issue in r.qos.issues() {
            let _ = writeln!(out, "    ! {issue}");
        }
        if let Some(raw) = &r.scheduler_state {
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                let _ = writeln!(out, "    | {line}");
            }
        }

        let _ = writeln!(out, "  devices      {}", r.connected_devices.len());
        for device in &r.connected_devices {
            let _ = writeln!(out, "    {} {} {}", device.mac, device.ip, device.hostname.as_deref().unwrap_or("*"));
        }
        if let Some(stats) = &r.interface_stats {
            let _ = writeln!(
                out,
                "  traffic      rx {} B / {} pkts, tx {} B / {} pkts",
                stats.rx_bytes, stats.rx_packets, stats.tx_bytes, stats.tx_packets
            );
        }
        let _ = writeln!(out, "  expires      {}", or_dash(r.expires_at.map(|t| t.to_rfc3339())));

        if let Some(reason) = &r.failure_reason {
            let _ = writeln!(out, "  failure      {reason}");
        }
        for issue in &r.teardown_issues {
            let _ = writeln!(out, "  leaked       {issue}");
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> SliceReport {
        SliceReport {
            id: SliceId::new(),
            name: "lobby".to_string(),
            category: SliceCategory::Guest,
            priority: 2,
            dscp: 10,
            state: SliceState::Active,
            backend: Some(BackendKind::AccessPoint),
            vlan_id: Some(120),
            network_name: Some("NetSlice_Guest_0badf00d".to_string()),
            ssid: Some("NetSlice_Guest_0badf00d".to_string()),
            wifi_uri: Some("WIFI:S:NetSlice_Guest_0badf00d;T:WPA;P:abc;;".to_string()),
            discoverable: true,
            discovery_url: None,
            requested_bandwidth_mbps: 10,
            requested_latency_ms: 50,
            actual_bandwidth_mbps: Some(10.0),
            actual_latency_ms: Some(50.0),
            qos: QosStatus::Verified,
            shaping_interface: Some("br-netslice".to_string()),
            scheduler_state: Some("qdisc tbf 1: root refcnt 2 rate 10Mbit burst 15000b lat 200ms\n".to_string()),
            connected_devices: vec![ConnectedDevice {
                mac: "aa:bb:cc:00:11:22".to_string(),
                ip: "10.50.120.23".to_string(),
                hostname: Some("phone".to_string()),
                lease_expires: None,
            }],
            interface_stats: None,
            expires_at: None,
            failure_reason: None,
            teardown_issues: vec![],
        }
    }

    #[test]
    fn text() {
        let text = render_text(&[report()]);

        assert!(text.contains("  category     Guest (priority 2, dscp 10)\n"), "{text}");
        assert!(text.contains("  vlan         120\n"));
        assert!(text.contains("  bandwidth    10 Mbit/s requested, 10.0 Mbit/s actual\n"));
        assert!(text.contains("  qos          verified on br-netslice\n"));
        assert!(text.contains("    | qdisc tbf 1: root"));
        assert!(text.contains("    aa:bb:cc:00:11:22 10.50.120.23 phone\n"));
        assert!(text.contains("  expires      -\n"));

        assert_eq!(render_text(&[]), "no slices\n");
    }

    #[test]
    fn json() {
        let value = serde_json::to_value(report()).unwrap();
        assert_eq!(value["state"], "ACTIVE");
        assert_eq!(value["backend"], "access_point");
        assert_eq!(value["qos"]["status"], "verified");
        assert_eq!(value["connected_devices"][0]["hostname"], "phone");
    }
}
