//! The slice lifecycle.
//!
//! ```text
//! create ──> REQUESTED ──> PROVISIONING ──> ACTIVE ──> INACTIVE
//!                               │               ^
//!                               └──> FAILED     └── deactivate / terminate / expiry / delete
//! ```
//!
//! Provisioning runs on its own task. It walks the configured [`Provisioner`]s in order and
//! stops at the first one that succeeds: an unavailable or failing backend only moves on to the
//! next one. The slice becomes `FAILED` when every backend has failed. After a backend succeeds,
//! the orchestrator shapes the interface named in the [`AllocationRecord`] and schedules the
//! expiry of the slice on a [`DeferredQueue`].
//!
//! Every transition of a slice happens under that slice's lock, and is broadcast to
//! [`Orchestrator::subscribe`]rs.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use netslice_common::DeferredQueue;
use netslice_qos::QosShaper;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::Instrument;

use crate::{
    error::ValidationError,
    model::{
        validate_bounds, AuditEventKind, MacAddress, NetworkSlice, NewAuditEntry, QosStatus, SliceId, SliceSpec,
        SliceState,
    },
    provision::{
        AllocationRecord, ProvisionError, ProvisionRequest, Provisioner, Reassignment, TeardownReport,
        WifiCredentials,
    },
    repository::{AuditRepository, RepositoryError, SliceFilter, SliceRepository},
    vlan::VlanAllocator,
};

mod locks;
use locks::SliceLocks;

mod report;
pub use report::{render_text, InspectFilter, SliceReport};

const EVENT_CAPACITY: usize = 256;
const DEFAULT_PROVISIONING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("slice {0} not found")]
    NotFound(SliceId),
    #[error("slice {id} is already {state}")]
    AlreadyTerminal { id: SliceId, state: SliceState },
    #[error("slice {id} is {state}, expected {expected}")]
    InvalidState { id: SliceId, state: SliceState, expected: SliceState },
    #[error("slice {0} has no network allocation")]
    NotAllocated(SliceId),
    #[error("device reassignment failed: {0}")]
    Reassignment(#[source] ProvisionError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Upper bound for a single backend attempt.
    pub provisioning_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self { provisioning_timeout: DEFAULT_PROVISIONING_TIMEOUT }
    }
}

impl OrchestratorOptions {
    pub const fn with_provisioning_timeout(mut self, timeout: Duration) -> Self {
        self.provisioning_timeout = timeout;
        self
    }
}

/// A lifecycle transition of a slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceTransition {
    pub slice_id: SliceId,
    pub from: SliceState,
    pub to: SliceState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Allocation {
    provisioner: Arc<dyn Provisioner>,
    record: AllocationRecord,
}

#[derive(Debug)]
struct Inner {
    slices: Arc<dyn SliceRepository>,
    audit: Arc<dyn AuditRepository>,
    provisioners: Vec<Arc<dyn Provisioner>>,
    shaper: QosShaper,
    vlans: VlanAllocator,
    locks: SliceLocks,
    /// Live allocations. Never held across an await.
    allocations: RwLock<FxHashMap<SliceId, Allocation>>,
    expiry: DeferredQueue<SliceId>,
    events: broadcast::Sender<SliceTransition>,
    options: OrchestratorOptions,
}

/// Owns the lifecycle of every slice. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Creates an orchestrator that tries `provisioners` in order.
    pub fn new(
        slices: Arc<dyn SliceRepository>,
        audit: Arc<dyn AuditRepository>,
        provisioners: Vec<Arc<dyn Provisioner>>,
        shaper: QosShaper,
        options: OrchestratorOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                slices,
                audit,
                provisioners,
                shaper,
                vlans: VlanAllocator::new(),
                locks: SliceLocks::default(),
                allocations: RwLock::default(),
                expiry: DeferredQueue::new(),
                events,
                options,
            }),
        }
    }

    /// Validates `spec`, stores the slice as `REQUESTED` and starts provisioning it in the
    /// background. Backend failures never surface here: they end up in the slice state.
    pub async fn create(&self, spec: SliceSpec) -> Result<NetworkSlice> {
        spec.validate()?;

        let slice = self.inner.slices.create_slice(NetworkSlice::from_spec(spec, Utc::now())).await?;
        tracing::info!(slice = %slice.id, name = %slice.name, category = %slice.category, "slice requested");

        let this = self.clone();
        let id = slice.id;
        tokio::spawn(async move { this.provision(id).await }.instrument(tracing::info_span!("provision", slice = %id)));

        Ok(slice)
    }

    pub async fn get(&self, id: SliceId) -> Result<NetworkSlice> {
        self.inner.slices.get_slice(id).await.map_err(|e| match e {
            RepositoryError::NotFound { .. } => OrchestratorError::NotFound(id),
            e => e.into(),
        })
    }

    pub async fn list(&self, filter: &SliceFilter) -> Result<Vec<NetworkSlice>> {
        Ok(self.inner.slices.list_slices(filter).await?)
    }

    /// Returns a receiver for every lifecycle transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SliceTransition> {
        self.inner.events.subscribe()
    }

    /// Waits until the slice has left `REQUESTED` and `PROVISIONING`.
    pub async fn wait_settled(&self, id: SliceId) -> Result<NetworkSlice> {
        let mut events = self.subscribe();

        loop {
            let slice = self.get(id).await?;
            if !matches!(slice.state, SliceState::Requested | SliceState::Provisioning) {
                return Ok(slice);
            }

            loop {
                match events.recv().await {
                    Ok(transition) if transition.slice_id == id => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return self.get(id).await,
                }
            }
        }
    }

    /// The network allocation of a live slice.
    pub fn allocation(&self, id: &SliceId) -> Option<AllocationRecord> {
        self.inner.allocations.read().get(id).map(|a| a.record.clone())
    }

    /// Tears the slice down and marks it `INACTIVE`. A no-op on a terminal slice.
    pub async fn deactivate(&self, id: SliceId) -> Result<TeardownReport> {
        self.deactivate_because(id, "deactivated").await
    }

    async fn deactivate_because(&self, id: SliceId, reason: &str) -> Result<TeardownReport> {
        let _guard = self.inner.locks.lock(id).await;
        self.inner.expiry.cancel(&id);

        let mut slice = self.get(id).await?;
        if slice.is_terminal() {
            tracing::debug!(slice = %id, state = %slice.state, "already terminal");
            return Ok(TeardownReport::default());
        }

        Ok(self.teardown(&mut slice, reason).await)
    }

    /// Forced early expiry. Fails on a slice that is already terminal.
    pub async fn terminate(&self, id: SliceId) -> Result<TeardownReport> {
        let _guard = self.inner.locks.lock(id).await;
        self.inner.expiry.cancel(&id);

        let mut slice = self.get(id).await?;
        if slice.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal { id, state: slice.state });
        }

        Ok(self.teardown(&mut slice, "terminated by operator").await)
    }

    /// Removes the slice record, tearing the slice down first if it is still live.
    pub async fn delete(&self, id: SliceId) -> Result<TeardownReport> {
        let guard = self.inner.locks.lock(id).await;
        self.inner.expiry.cancel(&id);

        let mut slice = self.get(id).await?;
        let report = if slice.is_terminal() {
            TeardownReport::default()
        } else {
            self.teardown(&mut slice, "deleted").await
        };

        self.inner.slices.delete_slice(id).await?;
        drop(guard);
        self.inner.locks.forget(&id);

        tracing::info!(slice = %id, "slice deleted");
        Ok(report)
    }

    /// Changes the bounds of an `ACTIVE` slice, then re-applies and re-verifies its shaping.
    pub async fn adjust_qos(&self, id: SliceId, bandwidth_mbps: u32, latency_ms: u32) -> Result<NetworkSlice> {
        validate_bounds(bandwidth_mbps, latency_ms)?;

        let _guard = self.inner.locks.lock(id).await;
        let mut slice = self.get(id).await?;
        if slice.state != SliceState::Active {
            return Err(OrchestratorError::InvalidState { id, state: slice.state, expected: SliceState::Active });
        }

        let record = self.allocation(&id).ok_or(OrchestratorError::NotAllocated(id))?;
        slice.bandwidth_mbps = bandwidth_mbps;
        slice.latency_ms = latency_ms;
        slice.qos = self.shape(&record, bandwidth_mbps, latency_ms).await;

        let slice = self.inner.slices.update_slice(slice).await?;
        tracing::info!(slice = %id, bandwidth_mbps, latency_ms, qos = slice.qos.as_str(), "qos adjusted");
        Ok(slice)
    }

    /// Asks the backend of `slice_id` to move the device onto it.
    pub async fn reassign_device(
        &self,
        slice_id: SliceId,
        mac: &MacAddress,
        from_vlan: Option<u16>,
    ) -> Result<Reassignment> {
        let allocation = self.inner.allocations.read().get(&slice_id).cloned();
        let Allocation { provisioner, record } = allocation.ok_or(OrchestratorError::NotAllocated(slice_id))?;

        let outcome = provisioner.reassign(&record, mac).await.map_err(OrchestratorError::Reassignment)?;
        tracing::info!(%mac, from = ?from_vlan, to = record.vlan_id, ?outcome, "device reassigned");
        Ok(outcome)
    }

    /// Builds the operator report of every slice matching `filter`.
    pub async fn inspect(&self, filter: &InspectFilter) -> Result<Vec<SliceReport>> {
        let slices = match filter.slice_id {
            Some(id) => vec![self.get(id).await?],
            None if filter.all => self.list(&SliceFilter::default()).await?,
            None => self.list(&SliceFilter::live()).await?,
        };

        let mut reports = Vec::with_capacity(slices.len());
        for slice in slices {
            reports.push(self.report(slice).await);
        }
        Ok(reports)
    }

    /// Cancels every expiry timer and terminates every live slice.
    pub async fn shutdown(&self) -> Result<Vec<(SliceId, TeardownReport)>> {
        self.inner.expiry.cancel_all();

        let mut reports = Vec::new();
        for slice in self.list(&SliceFilter::live()).await? {
            match self.terminate(slice.id).await {
                Ok(report) => reports.push((slice.id, report)),
                Err(OrchestratorError::AlreadyTerminal { .. }) => {}
                Err(e) => tracing::warn!(slice = %slice.id, error = %e, "failed to terminate slice"),
            }
        }
        Ok(reports)
    }

    async fn provision(&self, id: SliceId) {
        let _guard = self.inner.locks.lock(id).await;

        let mut slice = match self.inner.slices.get_slice(id).await {
            Ok(slice) if slice.state == SliceState::Requested => slice,
            Ok(slice) => {
                tracing::debug!(state = %slice.state, "slice left REQUESTED before provisioning started");
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "slice is gone");
                return;
            }
        };

        if let Err(e) = self.transition(&mut slice, SliceState::Provisioning).await {
            tracing::error!(error = %e, "failed to record provisioning");
            return;
        }

        let credentials = WifiCredentials::generate(slice.category, &id);
        let mut failures = Vec::new();
        let mut displaced = Vec::new();
        let mut chosen = None;

        for provisioner in &self.inner.provisioners {
            let kind = provisioner.kind();
            let result = self.attempt(provisioner.as_ref(), &slice, &credentials).await;
            displaced.extend(provisioner.take_displaced());

            match result {
                Ok(record) => {
                    chosen = Some(Allocation { provisioner: Arc::clone(provisioner), record });
                    break;
                }
                Err(e) if e.is_unavailable() => {
                    tracing::warn!(backend = %kind, error = %e, "backend unavailable, falling back");
                    failures.push(format!("{kind}: {e}"));
                }
                Err(e) => {
                    tracing::warn!(backend = %kind, error = %e, "backend failed, falling back");
                    failures.push(format!("{kind}: {e}"));
                }
            }
        }

        match chosen {
            Some(allocation) => self.activate(&mut slice, allocation, credentials).await,
            None => self.fail(&mut slice, failures).await,
        }

        // Only now that the new allocation is registered, so the displaced teardown sees that
        // the shared shaping interface is still in use.
        for other in displaced.into_iter().filter(|other| *other != id) {
            self.spawn_deactivation(other, "displaced by another slice");
        }
    }

    async fn attempt(
        &self,
        provisioner: &dyn Provisioner,
        slice: &NetworkSlice,
        credentials: &WifiCredentials,
    ) -> std::result::Result<AllocationRecord, ProvisionError> {
        provisioner.check_available().await?;

        let vlan_id = self.inner.vlans.allocate(slice.id, provisioner.vlan_range())?;
        let request = ProvisionRequest {
            slice_id: slice.id,
            name: slice.name.clone(),
            category: slice.category,
            vlan_id,
            bandwidth_mbps: slice.bandwidth_mbps,
            latency_ms: slice.latency_ms,
            credentials: credentials.clone(),
            dns_servers: slice.dns_servers(),
        };

        let timeout = self.inner.options.provisioning_timeout;
        let result = match tokio::time::timeout(timeout, provisioner.provision(&request)).await {
            Ok(result) => result,
            Err(_) => {
                let report = provisioner.cleanup(&request).await;
                if !report.is_clean() {
                    tracing::warn!(issues = ?report.issues(), "cleanup of timed out attempt incomplete");
                }
                Err(ProvisionError::Timeout(timeout))
            }
        };

        if result.is_err() {
            self.inner.vlans.release(&slice.id);
        }
        result
    }

    async fn activate(&self, slice: &mut NetworkSlice, allocation: Allocation, credentials: WifiCredentials) {
        let record = &allocation.record;
        let (backend, vlan_id) = (record.backend, record.vlan_id);

        slice.qos = self.shape(record, slice.bandwidth_mbps, slice.latency_ms).await;
        slice.backend = Some(backend);
        slice.vlan_id = Some(vlan_id);
        slice.network_name = Some(record.network_name.clone());
        slice.ssid = Some(credentials.ssid);
        slice.passphrase = Some(credentials.passphrase);

        let now = Utc::now();
        slice.activated_at = Some(now);
        slice.expires_at = Some(now + chrono::Duration::seconds(slice.duration_secs as i64));

        self.inner.allocations.write().insert(slice.id, allocation);

        if let Err(e) = self.transition(slice, SliceState::Active).await {
            tracing::error!(error = %e, "failed to record activation");
            return;
        }

        self.schedule_expiry(slice.id, slice.duration());
        self.audit(
            NewAuditEntry::new(AuditEventKind::SliceActivated, format!("{backend} on vlan {vlan_id}")).slice(slice.id),
        )
        .await;
    }

    async fn fail(&self, slice: &mut NetworkSlice, failures: Vec<String>) {
        let reason =
            if failures.is_empty() { "no backends configured".to_string() } else { failures.join("; ") };
        tracing::error!(%reason, "every backend failed");

        slice.failure_reason = Some(reason.clone());
        if let Err(e) = self.transition(slice, SliceState::Failed).await {
            tracing::error!(error = %e, "failed to record failure");
        }
        self.audit(NewAuditEntry::new(AuditEventKind::SliceFailed, reason).slice(slice.id)).await;
    }

    /// Applies and reads back shaping. Shaping problems never fail the slice.
    async fn shape(&self, record: &AllocationRecord, bandwidth_mbps: u32, latency_ms: u32) -> QosStatus {
        let Some(dev) = record.shaping_interface.as_deref() else {
            return QosStatus::NotApplicable;
        };
        if record.shared_network {
            tracing::warn!(%dev, "shaping a shared network, every slice on it is affected");
        }

        let bandwidth = f64::from(bandwidth_mbps);
        if let Err(e) = self.inner.shaper.apply(dev, bandwidth, latency_ms).await {
            tracing::warn!(%dev, error = %e, "failed to apply shaping");
            return QosStatus::Unverified { issues: vec![format!("apply failed: {e}")] };
        }

        let verification = self.inner.shaper.verify(dev, bandwidth, latency_ms).await;
        if verification.verified {
            return QosStatus::Verified;
        }

        let mut issues = verification.issues;
        if issues.is_empty() {
            issues.push("shaping does not match the requested bounds".to_string());
        }
        tracing::warn!(%dev, ?issues, "shaping unverified");
        QosStatus::Unverified { issues }
    }

    /// Releases everything the slice holds, in reverse order of creation, and marks it
    /// `INACTIVE`. Every step runs even if an earlier one failed.
    async fn teardown(&self, slice: &mut NetworkSlice, reason: &str) -> TeardownReport {
        let mut report = TeardownReport::default();

        let allocation = self.inner.allocations.write().remove(&slice.id);
        if let Some(Allocation { provisioner, record }) = allocation {
            if let Some(dev) = record.shaping_interface.as_deref() {
                let in_use = self
                    .inner
                    .allocations
                    .read()
                    .values()
                    .any(|other| other.record.shaping_interface.as_deref() == Some(dev));

                if in_use {
                    tracing::debug!(%dev, "shaping interface still in use, leaving its shaping");
                } else {
                    report.record(format!("remove shaping on {dev}"), self.inner.shaper.remove(dev).await);
                }
            }

            report.extend(provisioner.deprovision(&record).await);
        }
        self.inner.vlans.release(&slice.id);

        slice.teardown_issues = report.issues();
        slice.deactivated_at = Some(Utc::now());
        if let Err(e) = self.transition(slice, SliceState::Inactive).await {
            report.record("record deactivation", Err::<(), _>(e));
        }

        self.audit(NewAuditEntry::new(AuditEventKind::SliceDeactivated, reason).slice(slice.id)).await;
        if !report.is_clean() {
            let issues = report.issues();
            tracing::warn!(slice = %slice.id, ?issues, "teardown incomplete, resources may have leaked");
            self.audit(
                NewAuditEntry::new(AuditEventKind::TeardownIncomplete, report.issues().join("; ")).slice(slice.id),
            )
            .await;
        }

        report
    }

    async fn transition(&self, slice: &mut NetworkSlice, to: SliceState) -> std::result::Result<(), RepositoryError> {
        let from = slice.state;
        slice.state = to;
        *slice = self.inner.slices.update_slice(slice.clone()).await?;

        tracing::info!(slice = %slice.id, %from, %to, "slice transition");
        let _ = self.inner.events.send(SliceTransition { slice_id: slice.id, from, to, at: Utc::now() });
        Ok(())
    }

    fn schedule_expiry(&self, id: SliceId, after: Duration) {
        let inner = Arc::downgrade(&self.inner);
        let work = async move {
            let Some(inner) = inner.upgrade() else { return };
            if let Err(e) = (Self { inner }).deactivate_because(id, "expired").await {
                tracing::warn!(error = %e, "failed to expire slice");
            }
        };

        self.inner.expiry.schedule(id, after, work.instrument(tracing::info_span!("expire", slice = %id)));
    }

    fn spawn_deactivation(&self, id: SliceId, reason: &'static str) {
        let this = self.clone();
        let work = async move {
            if let Err(e) = this.deactivate_because(id, reason).await {
                tracing::warn!(error = %e, "failed to deactivate slice");
            }
        };

        tokio::spawn(work.instrument(tracing::info_span!("deactivate", slice = %id, reason)));
    }

    async fn audit(&self, entry: NewAuditEntry) {
        if let Err(e) = self.inner.audit.append(entry).await {
            tracing::error!(error = %e, "failed to write audit entry");
        }
    }

    async fn report(&self, slice: NetworkSlice) -> SliceReport {
        let allocation = self.inner.allocations.read().get(&slice.id).cloned();

        let mut info = None;
        let mut verification = None;
        let mut stats = None;
        let mut shaping_interface = None;

        if let Some(Allocation { provisioner, record }) = allocation {
            info = Some(provisioner.network_info(&record).await);

            if let Some(dev) = record.shaping_interface {
                let shaper = &self.inner.shaper;
                verification = Some(shaper.verify(&dev, f64::from(slice.bandwidth_mbps), slice.latency_ms).await);
                stats = netslice_net::stats::read(shaper.shell(), &dev).await.ok().flatten();
                shaping_interface = Some(dev);
            }
        }
        let info = info.unwrap_or_default();

        SliceReport {
            id: slice.id,
            name: slice.name.clone(),
            category: slice.category,
            priority: slice.category.priority(),
            dscp: slice.category.dscp(),
            state: slice.state,
            backend: slice.backend,
            vlan_id: slice.vlan_id,
            network_name: slice.network_name.clone(),
            ssid: slice.ssid.clone(),
            wifi_uri: slice.wifi_uri(),
            discoverable: info.discoverable,
            discovery_url: info.discovery_url,
            requested_bandwidth_mbps: slice.bandwidth_mbps,
            requested_latency_ms: slice.latency_ms,
            actual_bandwidth_mbps: verification.as_ref().and_then(|v| v.actual_bandwidth_mbit_s),
            actual_latency_ms: verification.as_ref().and_then(|v| v.actual_latency_ms),
            qos: slice.qos.clone(),
            shaping_interface,
            scheduler_state: verification.map(|v| v.raw),
            connected_devices: info.connected_devices,
            interface_stats: stats,
            expires_at: slice.expires_at,
            failure_reason: slice.failure_reason,
            teardown_issues: slice.teardown_issues,
        }
    }
}
