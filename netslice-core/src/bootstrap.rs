//! Wires a [`NetsliceConfig`] into a running [`Orchestrator`] and [`SessionManager`].

use std::{sync::Arc, time::Duration};

use netslice_qos::{QosShaper, ShaperOptions};
use netslice_shell::{RunnerOptions, Shell};

use crate::{
    config::NetsliceConfig,
    identity::IdentityProvider,
    model::BackendKind,
    orchestrator::{Orchestrator, OrchestratorOptions},
    provision::{
        AccessPointProvisioner, ContainerProvisioner, HostContext, LegacyBridgeProvisioner, ProvisionError,
        Provisioner, SimulatedProvisioner,
    },
    repository::InMemoryRepository,
    session::{SessionManager, SessionOptions},
};

/// Everything a running netslice instance needs.
#[derive(Debug)]
pub struct Netslice {
    pub orchestrator: Orchestrator,
    pub sessions: SessionManager,
    pub repository: Arc<InMemoryRepository>,
    pub shaper: QosShaper,
}

impl Netslice {
    /// Runs commands on the local host, with `sudo` if the configuration asks for it.
    pub async fn system(
        config: &NetsliceConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, ProvisionError> {
        let shell = Shell::system(RunnerOptions::default().with_sudo(config.shell.sudo));
        Self::from_config(config, shell, identity).await
    }

    /// Builds the configured backends in order. When the legacy bridge backend is enabled, its
    /// quarantine bridge is created before anything else runs.
    pub async fn from_config(
        config: &NetsliceConfig,
        shell: Shell,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, ProvisionError> {
        let shaper =
            QosShaper::new(shell.clone(), ShaperOptions::default().with_queue_latency_ms(config.qos.queue_latency_ms));
        let host = HostContext::new(shell, config.upstream_interface.clone());

        let mut provisioners: Vec<Arc<dyn Provisioner>> = Vec::with_capacity(config.backends.len());
        for kind in &config.backends {
            let provisioner: Arc<dyn Provisioner> = match kind {
                BackendKind::AccessPoint => {
                    Arc::new(AccessPointProvisioner::new(host.clone(), config.access_point.clone()))
                }
                BackendKind::ContainerNetwork => {
                    Arc::new(ContainerProvisioner::new(host.clone(), config.container.clone()))
                }
                BackendKind::LegacyBridge => {
                    let legacy = LegacyBridgeProvisioner::new(host.clone(), shaper.clone());
                    if config.legacy_bridge.quarantine {
                        legacy.ensure_quarantine().await?;
                    }
                    Arc::new(legacy)
                }
                BackendKind::Simulated => Arc::new(SimulatedProvisioner::new()),
            };
            provisioners.push(provisioner);
        }
        tracing::info!(backends = ?config.backends, "backends configured");

        let repository = Arc::new(InMemoryRepository::new());
        let orchestrator = Orchestrator::new(
            repository.clone(),
            repository.clone(),
            provisioners,
            shaper.clone(),
            OrchestratorOptions::default()
                .with_provisioning_timeout(Duration::from_secs(config.orchestrator.provisioning_timeout_secs)),
        );
        let sessions = SessionManager::new(
            repository.clone(),
            repository.clone(),
            identity,
            orchestrator.clone(),
            SessionOptions::default().with_window(Duration::from_secs(config.session.window_hours * 60 * 60)),
        );

        Ok(Self { orchestrator, sessions, repository, shaper })
    }
}
