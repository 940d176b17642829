//! Captive-portal device sessions.
//!
//! ```text
//! QUARANTINE ──authenticate──> AUTHENTICATING ──select_slice──> ACTIVE ──> EXPIRED
//!      └──────────────────────────────┴──────────────────────────┴──────> TERMINATED
//! ```
//!
//! A device that is not known yet starts in quarantine. Once authenticated it picks an `ACTIVE`
//! slice with room left, among those its [`Identity`] may use, after which the [`Orchestrator`]
//! is asked to move the device onto the slice's network.

use std::{net::IpAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::{
    identity::{Credentials, IdentityProvider},
    model::{
        AuditEventKind, DeviceSession, Identity, MacAddress, NetworkSlice, NewAuditEntry, SessionId, SessionState,
        SliceId, SliceState,
    },
    orchestrator::{Orchestrator, OrchestratorError},
    provision::Reassignment,
    repository::{AuditRepository, RepositoryError, SessionFilter, SessionRepository, SliceFilter},
};

const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session {id} is {state}, expected {expected}")]
    InvalidState { id: SessionId, state: SessionState, expected: &'static str },
    #[error("slice {slice} is {state}, not ACTIVE")]
    SliceNotActive { slice: SliceId, state: SliceState },
    #[error("slice {slice} is at its capacity of {max_devices} devices")]
    SliceAtCapacity { slice: SliceId, max_devices: u32 },
    #[error("slice {slice} is not available to this user")]
    SliceNotPermitted { slice: SliceId },
    #[error("session {0} has no default slice to select")]
    NoDefaultSlice(SessionId),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// What the portal offers an authenticated device.
#[derive(Debug, Clone)]
pub struct SliceChoices {
    /// `ACTIVE` slices the session's identity may use.
    pub slices: Vec<NetworkSlice>,
    /// The identity's default, if it is among `slices`.
    pub default_slice: Option<SliceId>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long a session stays `ACTIVE` after selecting a slice.
    pub window: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { window: DEFAULT_WINDOW }
    }
}

impl SessionOptions {
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

#[derive(Debug)]
pub struct SessionManager {
    sessions: Arc<dyn SessionRepository>,
    audit: Arc<dyn AuditRepository>,
    identity: Arc<dyn IdentityProvider>,
    orchestrator: Orchestrator,
    /// Serialises slice selection, so the capacity check and the activation are one step.
    selection: Mutex<()>,
    options: SessionOptions,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        audit: Arc<dyn AuditRepository>,
        identity: Arc<dyn IdentityProvider>,
        orchestrator: Orchestrator,
        options: SessionOptions,
    ) -> Self {
        Self { sessions, audit, identity, orchestrator, selection: Mutex::new(()), options }
    }

    pub async fn get(&self, id: SessionId) -> Result<DeviceSession> {
        self.sessions.get_session(id).await.map_err(|e| match e {
            RepositoryError::NotFound { .. } => SessionError::NotFound(id),
            e => e.into(),
        })
    }

    /// Returns the active session of `mac`, or quarantines the device in a new one.
    pub async fn connect(&self, mac: MacAddress, ip: Option<IpAddr>) -> Result<DeviceSession> {
        let now = Utc::now();

        if let Some(mut session) = self.sessions.find_active_session(&mac).await? {
            session.last_seen = now;
            if ip.is_some() {
                session.ip = ip;
            }
            return Ok(self.sessions.update_session(session).await?);
        }

        let session = self.sessions.create_session(DeviceSession::new(mac, ip, now)).await?;
        tracing::info!(session = %session.id, mac = %session.mac, "device quarantined");
        self.audit(
            NewAuditEntry::new(AuditEventKind::Redirect, "redirected to the captive portal")
                .session(session.id)
                .mac(&session.mac),
        )
        .await;

        Ok(session)
    }

    /// Checks the credentials with the identity provider. On success the session moves to
    /// `AUTHENTICATING`. On failure it stays where it was.
    pub async fn authenticate(&self, id: SessionId, credentials: &Credentials) -> Result<DeviceSession> {
        let mut session = self.get(id).await?;
        if session.state.is_terminal() {
            return Err(SessionError::InvalidState { id, state: session.state, expected: "a live session" });
        }

        let Some(identity) = self.identity.authenticate(credentials).await else {
            tracing::info!(session = %id, username = %credentials.username, "login failed");
            self.audit(
                NewAuditEntry::new(AuditEventKind::LoginFailed, format!("user {}", credentials.username))
                    .session(id)
                    .mac(&session.mac),
            )
            .await;
            return Err(SessionError::AuthenticationFailed);
        };

        let now = Utc::now();
        let detail = format!("user {}", identity.username);
        session.identity = Some(identity);
        session.authenticated_at = Some(now);
        session.last_seen = now;
        session.state = SessionState::Authenticating;
        let session = self.sessions.update_session(session).await?;

        tracing::info!(session = %id, %detail, "login succeeded");
        self.audit(NewAuditEntry::new(AuditEventKind::LoginSuccess, detail).session(id).mac(&session.mac)).await;

        Ok(session)
    }

    /// Lists the slices an authenticated session may select.
    pub async fn slice_choices(&self, id: SessionId) -> Result<SliceChoices> {
        let session = self.get(id).await?;
        let identity = authenticated_identity(&session)?;

        let filter = SliceFilter { states: Some(vec![SliceState::Active]), ..Default::default() };
        let slices: Vec<NetworkSlice> =
            self.orchestrator.list(&filter).await?.into_iter().filter(|s| identity.may_use(s.id)).collect();
        let default_slice = identity.default_slice.filter(|d| slices.iter().any(|s| s.id == *d));

        Ok(SliceChoices { slices, default_slice })
    }

    /// Selects the default slice of the session's identity.
    pub async fn select_default_slice(&self, id: SessionId) -> Result<DeviceSession> {
        let session = self.get(id).await?;
        let identity = authenticated_identity(&session)?;
        let slice_id = identity.default_slice.ok_or(SessionError::NoDefaultSlice(id))?;

        self.select_slice(id, slice_id).await
    }

    /// Moves an authenticated session onto `slice_id`, then asks the orchestrator to move the
    /// device. A failed reassignment is audited but does not undo the selection.
    pub async fn select_slice(&self, id: SessionId, slice_id: SliceId) -> Result<DeviceSession> {
        let span = tracing::info_span!("select_slice", session = %id, slice = %slice_id);

        let (session, from_vlan) = async {
            let _selection = self.selection.lock().await;

            let mut session = self.get(id).await?;
            if !authenticated_identity(&session)?.may_use(slice_id) {
                tracing::info!(username = ?session.identity.as_ref().map(|i| &i.username), "slice not permitted");
                return Err(SessionError::SliceNotPermitted { slice: slice_id });
            }

            let slice = self.orchestrator.get(slice_id).await?;
            if slice.state != SliceState::Active {
                return Err(SessionError::SliceNotActive { slice: slice_id, state: slice.state });
            }

            // Every live session still on the slice holds a place, swept or not.
            let devices = self
                .sessions
                .list_sessions(&SessionFilter::on_slice(slice_id))
                .await?
                .into_iter()
                .filter(|s| s.id != id)
                .count();
            if devices >= slice.max_devices as usize {
                tracing::info!(devices, max_devices = slice.max_devices, "slice is full");
                return Err(SessionError::SliceAtCapacity { slice: slice_id, max_devices: slice.max_devices });
            }

            let from_vlan = match session.current_slice {
                Some(previous) => self.orchestrator.get(previous).await.ok().and_then(|s| s.vlan_id),
                None => None,
            };

            session.activate(slice_id, Utc::now(), self.options.window);
            let session = self.sessions.update_session(session).await?;
            Ok::<_, SessionError>((session, from_vlan))
        }
        .instrument(span.clone())
        .await?;

        tracing::info!(parent: &span, previous = ?session.previous_slice, "slice selected");
        self.audit(
            NewAuditEntry::new(AuditEventKind::SliceSelected, format!("selected slice {slice_id}"))
                .session(id)
                .slice(slice_id)
                .mac(&session.mac),
        )
        .await;

        let detail = match self.orchestrator.reassign_device(slice_id, &session.mac, from_vlan).await {
            Ok(Reassignment::Enforced) => format!("moved from vlan {} to slice {slice_id}", vlan_label(from_vlan)),
            Ok(Reassignment::RecordedOnly { reason }) => {
                format!("recorded move from vlan {} to slice {slice_id} only: {reason}", vlan_label(from_vlan))
            }
            Err(e) => {
                tracing::warn!(parent: &span, error = %e, "device reassignment failed");
                format!("reassignment to slice {slice_id} failed: {e}")
            }
        };
        self.audit(
            NewAuditEntry::new(AuditEventKind::VlanChanged, detail).session(id).slice(slice_id).mac(&session.mac),
        )
        .await;

        Ok(session)
    }

    /// Ends the session. Idempotent.
    pub async fn terminate(&self, id: SessionId) -> Result<DeviceSession> {
        let mut session = self.get(id).await?;
        if session.state.is_terminal() {
            return Ok(session);
        }

        session.end(SessionState::Terminated, Utc::now());
        let session = self.sessions.update_session(session).await?;
        tracing::info!(session = %id, "session terminated");
        Ok(session)
    }

    /// Whether the session window has passed.
    pub fn is_expired(&self, session: &DeviceSession) -> bool {
        session.is_expired(Utc::now())
    }

    /// Marks every `ACTIVE` session whose window has passed at `now` as `EXPIRED`.
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> Result<Vec<DeviceSession>> {
        let filter = SessionFilter { state: Some(SessionState::Active), active_only: true, ..Default::default() };

        let mut expired = Vec::new();
        for mut session in self.sessions.list_sessions(&filter).await? {
            if !session.is_expired(now) {
                continue;
            }

            session.end(SessionState::Expired, now);
            let session = self.sessions.update_session(session).await?;
            self.audit(
                NewAuditEntry::new(AuditEventKind::SessionExpired, "session window passed")
                    .session(session.id)
                    .mac(&session.mac),
            )
            .await;
            expired.push(session);
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "sessions expired");
        }
        Ok(expired)
    }

    /// Adds to the traffic counters of the active session of `mac`, if there is one.
    pub async fn record_traffic(
        &self,
        mac: &MacAddress,
        uploaded: u64,
        downloaded: u64,
    ) -> Result<Option<DeviceSession>> {
        let Some(mut session) = self.sessions.find_active_session(mac).await? else {
            return Ok(None);
        };

        session.bytes_uploaded = session.bytes_uploaded.saturating_add(uploaded);
        session.bytes_downloaded = session.bytes_downloaded.saturating_add(downloaded);
        session.last_seen = Utc::now();
        Ok(Some(self.sessions.update_session(session).await?))
    }

    async fn audit(&self, entry: NewAuditEntry) {
        if let Err(e) = self.audit.append(entry).await {
            tracing::error!(error = %e, "failed to write audit entry");
        }
    }
}

/// The identity of a session that may select a slice.
fn authenticated_identity(session: &DeviceSession) -> Result<&Identity> {
    match (&session.state, &session.identity) {
        (SessionState::Authenticating, Some(identity)) => Ok(identity),
        (state, _) => Err(SessionError::InvalidState { id: session.id, state: *state, expected: "AUTHENTICATING" }),
    }
}

fn vlan_label(vlan: Option<u16>) -> String {
    vlan.map_or_else(|| "quarantine".to_string(), |v| v.to_string())
}
