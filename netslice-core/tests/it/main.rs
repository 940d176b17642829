mod lifecycle;
mod sessions;

/// Helper functions.
mod helpers {
    use std::{sync::Arc, time::Duration};

    use netslice_core::{
        identity::StaticIdentityProvider,
        model::{NetworkSlice, SliceCategory, SliceId, SliceSpec, SliceState},
        Netslice, NetsliceConfig, Orchestrator,
    };
    use netslice_shell::{testing::FakeHost, Shell};

    /// A configuration whose access point writes into a fresh temporary directory.
    pub fn config() -> NetsliceConfig {
        let mut config = NetsliceConfig::default();
        config.access_point.runtime_dir =
            std::env::temp_dir().join(format!("netslice-it-{}", uuid::Uuid::new_v4()));
        config
    }

    /// Runs the full stack against `host`, with a single portal user `alice`.
    pub async fn netslice(host: &FakeHost, config: &NetsliceConfig) -> Netslice {
        let identity = StaticIdentityProvider::new().with_user("alice", "hunter2");
        Netslice::from_config(config, Shell::new(host.clone()), Arc::new(identity)).await.unwrap()
    }

    pub fn guest(name: &str) -> SliceSpec {
        SliceSpec::new(name, SliceCategory::Guest, 10, 50, Duration::from_secs(3600))
    }

    pub async fn active(orchestrator: &Orchestrator, spec: SliceSpec) -> NetworkSlice {
        let slice = orchestrator.create(spec).await.unwrap();
        let slice = orchestrator.wait_settled(slice.id).await.unwrap();
        assert_eq!(slice.state, SliceState::Active, "{:?}", slice.failure_reason);
        slice
    }

    /// Polls until the slice reaches `state`.
    pub async fn until_state(orchestrator: &Orchestrator, id: SliceId, state: SliceState) -> NetworkSlice {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let slice = orchestrator.get(id).await.unwrap();
                if slice.state == state {
                    return slice;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }
}
