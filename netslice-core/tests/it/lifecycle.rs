use std::time::Duration;

use netslice_core::{
    model::{AuditEventKind, BackendKind, QosStatus, SliceState},
    orchestrator::InspectFilter,
    repository::{AuditFilter, AuditRepository},
};
use netslice_shell::testing::FakeHost;

use crate::helpers::{active, config, guest, netslice, until_state};

#[tokio::test]
async fn guest_slice_on_the_access_point() {
    let _ = tracing_subscriber::fmt::try_init();

    let host = FakeHost::new().with_wifi("wlan0");
    let netslice = netslice(&host, &config()).await;
    let orchestrator = &netslice.orchestrator;

    let slice = active(orchestrator, guest("lobby")).await;
    assert_eq!(slice.backend, Some(BackendKind::AccessPoint));
    assert!((100..=999).contains(&slice.vlan_id.unwrap()));
    assert_eq!(slice.qos, QosStatus::Verified);
    assert!(slice.ssid.as_deref().unwrap().starts_with("NetSlice_Guest_"));

    let lifetime = slice.expires_at.unwrap() - slice.activated_at.unwrap();
    assert_eq!(lifetime.num_seconds(), 3600);

    assert_eq!(host.alive("hostapd"), 1);
    assert_eq!(host.alive("dnsmasq"), 1);
    assert!(host.has_qdisc("br-netslice"));
    assert_eq!(host.iptables_rules("nat", "POSTROUTING").len(), 1);

    let report = orchestrator.terminate(slice.id).await.unwrap();
    assert!(report.is_clean(), "{report:?}");

    let slice = orchestrator.get(slice.id).await.unwrap();
    assert_eq!(slice.state, SliceState::Inactive);
    assert!(slice.deactivated_at.is_some());
    assert_eq!(host.alive("hostapd"), 0);
    assert_eq!(host.alive("dnsmasq"), 0);
    assert!(!host.has_qdisc("br-netslice"));
    assert!(host.iptables_rules("nat", "POSTROUTING").is_empty());
    assert!(orchestrator.allocation(&slice.id).is_none());
}

#[tokio::test]
async fn access_point_handoff() {
    let _ = tracing_subscriber::fmt::try_init();

    let host = FakeHost::new().with_wifi("wlan0");
    let netslice = netslice(&host, &config()).await;
    let orchestrator = &netslice.orchestrator;

    let first = active(orchestrator, guest("first")).await;
    let second = active(orchestrator, guest("second")).await;
    assert_eq!(second.backend, Some(BackendKind::AccessPoint));

    let first = until_state(orchestrator, first.id, SliceState::Inactive).await;
    assert!(first.deactivated_at.is_some());

    // Two access points were never on air at the same time.
    assert_eq!(host.max_concurrent("hostapd"), 1);
    assert_eq!(host.alive("hostapd"), 1);

    // The remaining slice keeps its shaping and its NAT rule.
    assert!(host.has_qdisc("br-netslice"));
    assert_eq!(host.iptables_rules("nat", "POSTROUTING").len(), 1);
    assert_eq!(orchestrator.get(second.id).await.unwrap().state, SliceState::Active);

    let deactivated = netslice
        .repository
        .list_audit(&AuditFilter {
            kind: Some(AuditEventKind::SliceDeactivated),
            slice: Some(first.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(deactivated.len(), 1);
    assert_eq!(deactivated[0].detail, "displaced by another slice");
}

#[tokio::test]
async fn falls_back_through_the_backends() {
    let host = FakeHost::new();
    let no_radio = netslice(&host, &config()).await;
    let slice = active(&no_radio.orchestrator, guest("no radio")).await;
    assert_eq!(slice.backend, Some(BackendKind::ContainerNetwork));
    assert_eq!(host.alive("hostapd"), 0);

    let host = FakeHost::new().without_docker();
    let bare = netslice(&host, &config()).await;
    let slice = active(&bare.orchestrator, guest("nothing at all")).await;
    assert_eq!(slice.backend, Some(BackendKind::Simulated));
    assert_eq!(slice.qos, QosStatus::NotApplicable);
}

#[tokio::test]
async fn legacy_bridge_quarantine_is_set_up_at_startup() {
    let host = FakeHost::new();
    let mut config = config();
    config.backends = vec![BackendKind::LegacyBridge];

    let netslice = netslice(&host, &config).await;
    assert!(host.link_exists("br-vlan99"));
    assert!(host.has_qdisc("br-vlan99"));

    let slice = active(&netslice.orchestrator, guest("wired")).await;
    assert_eq!(slice.backend, Some(BackendKind::LegacyBridge));
    assert_ne!(slice.vlan_id, Some(99));
}

#[tokio::test]
async fn inspection() {
    let host = FakeHost::new().with_wifi("wlan0");
    let netslice = netslice(&host, &config()).await;
    let orchestrator = &netslice.orchestrator;

    let slice = active(orchestrator, guest("lobby")).await;

    let reports = orchestrator.inspect(&InspectFilter::default()).await.unwrap();
    assert_eq!(reports.len(), 1);

    let report = &reports[0];
    assert_eq!(report.id, slice.id);
    assert_eq!(report.shaping_interface.as_deref(), Some("br-netslice"));
    assert!(report.discoverable);
    assert!(report.wifi_uri.as_deref().unwrap().starts_with("WIFI:S:NetSlice_Guest_"));
    assert!(report.scheduler_state.as_deref().unwrap().contains("tbf"));

    orchestrator.terminate(slice.id).await.unwrap();
    assert!(orchestrator.inspect(&InspectFilter::default()).await.unwrap().is_empty());
    assert_eq!(orchestrator.inspect(&InspectFilter::all()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn qos_can_be_adjusted_while_active() {
    let host = FakeHost::new().with_wifi("wlan0");
    let netslice = netslice(&host, &config()).await;
    let orchestrator = &netslice.orchestrator;

    let slice = active(orchestrator, guest("lobby")).await;
    let slice = orchestrator.adjust_qos(slice.id, 25, 20).await.unwrap();
    assert_eq!((slice.bandwidth_mbps, slice.latency_ms), (25, 20));
    assert_eq!(slice.qos, QosStatus::Verified);
    assert!(host.qdisc_show("br-netslice").contains("25Mbit"));
}

#[tokio::test]
async fn shutdown_releases_everything() {
    let host = FakeHost::new();
    let netslice = netslice(&host, &config()).await;
    let orchestrator = &netslice.orchestrator;

    let a = active(orchestrator, guest("a")).await;
    let b = active(orchestrator, guest("b")).await;
    assert_ne!(a.vlan_id, b.vlan_id);

    let reports = tokio::time::timeout(Duration::from_secs(5), orchestrator.shutdown()).await.unwrap().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|(_, report)| report.is_clean()));

    for id in [a.id, b.id] {
        assert_eq!(orchestrator.get(id).await.unwrap().state, SliceState::Inactive);
    }
    assert!(host.docker_networks().iter().all(|n| !n.starts_with("slice_vlan_")));
    assert!(host.iptables_rules("nat", "POSTROUTING").is_empty());
}
