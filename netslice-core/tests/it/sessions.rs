use chrono::Utc;
use netslice_core::{
    identity::Credentials,
    model::{AuditEventKind, MacAddress, SessionState, SliceState},
    repository::{AuditFilter, AuditRepository},
    SessionError,
};
use netslice_shell::testing::FakeHost;

use crate::helpers::{active, config, guest, netslice};

#[tokio::test]
async fn portal_flow_on_the_access_point() {
    let _ = tracing_subscriber::fmt::try_init();

    let host = FakeHost::new().with_wifi("wlan0");
    let config = config();
    let netslice = netslice(&host, &config).await;

    let slice = active(&netslice.orchestrator, guest("lobby")).await;
    let mac: MacAddress = "AA-BB-CC-00-00-01".parse().unwrap();

    let session = netslice.sessions.connect(mac.clone(), None).await.unwrap();
    assert_eq!(session.state, SessionState::Quarantine);

    let session =
        netslice.sessions.authenticate(session.id, &Credentials::new("alice", "hunter2")).await.unwrap();
    assert_eq!(session.state, SessionState::Authenticating);
    assert_eq!(session.identity.as_ref().unwrap().username, "alice");

    let session = netslice.sessions.select_slice(session.id, slice.id).await.unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert_eq!(session.current_slice, Some(slice.id));

    // The device is admitted on the slice's VLAN by the access point.
    let accept = config.access_point.runtime_dir.join(format!("hostapd_{}.accept", slice.ssid.unwrap()));
    assert_eq!(
        std::fs::read_to_string(accept).unwrap(),
        format!("aa:bb:cc:00:00:01 {}\n", slice.vlan_id.unwrap())
    );

    let trail: Vec<AuditEventKind> = netslice
        .repository
        .list_audit(&AuditFilter { session: Some(session.id), ..Default::default() })
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.kind)
        .collect();
    assert_eq!(
        trail,
        vec![
            AuditEventKind::Redirect,
            AuditEventKind::LoginSuccess,
            AuditEventKind::SliceSelected,
            AuditEventKind::VlanChanged,
        ]
    );
}

#[tokio::test]
async fn full_slice_turns_devices_away() {
    let host = FakeHost::new();
    let netslice = netslice(&host, &config()).await;
    let slice = active(&netslice.orchestrator, guest("tiny").with_max_devices(1)).await;

    let mut sessions = Vec::new();
    for n in 1..=2u8 {
        let mac: MacAddress = format!("aa:bb:cc:00:00:{n:02x}").parse().unwrap();
        let session = netslice.sessions.connect(mac, None).await.unwrap();
        netslice.sessions.authenticate(session.id, &Credentials::new("alice", "hunter2")).await.unwrap();
        sessions.push(session.id);
    }

    netslice.sessions.select_slice(sessions[0], slice.id).await.unwrap();
    let err = netslice.sessions.select_slice(sessions[1], slice.id).await.unwrap_err();
    assert!(matches!(err, SessionError::SliceAtCapacity { max_devices: 1, .. }), "{err}");

    // Room frees up once the first device leaves.
    netslice.sessions.terminate(sessions[0]).await.unwrap();
    let second = netslice.sessions.select_slice(sessions[1], slice.id).await.unwrap();
    assert_eq!(second.state, SessionState::Active);
}

#[tokio::test]
async fn sessions_on_a_deactivated_slice() {
    let host = FakeHost::new();
    let netslice = netslice(&host, &config()).await;
    let slice = active(&netslice.orchestrator, guest("short")).await;

    let mac: MacAddress = "aa:bb:cc:00:00:09".parse().unwrap();
    let session = netslice.sessions.connect(mac, None).await.unwrap();
    netslice.sessions.authenticate(session.id, &Credentials::new("alice", "hunter2")).await.unwrap();

    netslice.orchestrator.deactivate(slice.id).await.unwrap();
    assert_eq!(netslice.orchestrator.get(slice.id).await.unwrap().state, SliceState::Inactive);

    let err = netslice.sessions.select_slice(session.id, slice.id).await.unwrap_err();
    assert!(matches!(err, SessionError::SliceNotActive { .. }), "{err}");

    // Nothing to expire: the device never got onto a slice.
    let later = Utc::now() + chrono::Duration::days(2);
    assert!(netslice.sessions.expire_sessions(later).await.unwrap().is_empty());
}
