//! Persistence seams for slices, sessions and the audit trail.
//!
//! The core only talks to the traits in this module. [`InMemoryRepository`] implements all
//! three and is what the operator binary and the tests use.

use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::model::{
    AuditEventKind, AuditLogEntry, DeviceSession, MacAddress, NetworkSlice, NewAuditEntry, SessionId,
    SessionState, SliceId, SliceState,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} {key} already exists")]
    AlreadyExists { entity: &'static str, key: String },
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Selects slices. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct SliceFilter {
    pub id: Option<SliceId>,
    pub owner: Option<String>,
    pub states: Option<Vec<SliceState>>,
}

impl SliceFilter {
    /// Only slices that have not reached a terminal state.
    pub fn live() -> Self {
        Self { states: Some(SliceState::LIVE.to_vec()), ..Default::default() }
    }

    pub const fn id(mut self, id: SliceId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn matches(&self, slice: &NetworkSlice) -> bool {
        self.id.map_or(true, |id| id == slice.id)
            && self.owner.as_ref().map_or(true, |o| slice.owner.as_ref() == Some(o))
            && self.states.as_ref().map_or(true, |s| s.contains(&slice.state))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub slice: Option<SliceId>,
    pub state: Option<SessionState>,
    pub mac: Option<MacAddress>,
    pub active_only: bool,
}

impl SessionFilter {
    /// Live sessions whose current slice is `slice`, whatever their state. These are the
    /// devices counted against the slice's capacity.
    pub const fn on_slice(slice: SliceId) -> Self {
        Self { slice: Some(slice), state: None, mac: None, active_only: true }
    }

    pub fn matches(&self, session: &DeviceSession) -> bool {
        self.slice.map_or(true, |s| session.current_slice == Some(s))
            && self.state.map_or(true, |s| session.state == s)
            && self.mac.as_ref().map_or(true, |m| session.mac == *m)
            && (!self.active_only || session.is_active)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub kind: Option<AuditEventKind>,
    pub session: Option<SessionId>,
    pub slice: Option<SliceId>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.kind.map_or(true, |k| entry.kind == k)
            && self.session.map_or(true, |s| entry.session == Some(s))
            && self.slice.map_or(true, |s| entry.slice == Some(s))
    }
}

#[async_trait]
pub trait SliceRepository: fmt::Debug + Send + Sync + 'static {
    /// Stores a new slice. Fails if a live slice with the same name exists for the same owner.
    async fn create_slice(&self, slice: NetworkSlice) -> Result<NetworkSlice>;

    async fn get_slice(&self, id: SliceId) -> Result<NetworkSlice>;

    async fn update_slice(&self, slice: NetworkSlice) -> Result<NetworkSlice>;

    async fn delete_slice(&self, id: SliceId) -> Result<()>;

    /// Lists matching slices, oldest first.
    async fn list_slices(&self, filter: &SliceFilter) -> Result<Vec<NetworkSlice>>;
}

#[async_trait]
pub trait SessionRepository: fmt::Debug + Send + Sync + 'static {
    /// Stores a new session. Fails if the MAC already has an active session.
    async fn create_session(&self, session: DeviceSession) -> Result<DeviceSession>;

    async fn get_session(&self, id: SessionId) -> Result<DeviceSession>;

    async fn update_session(&self, session: DeviceSession) -> Result<DeviceSession>;

    /// The active session of `mac`, if any.
    async fn find_active_session(&self, mac: &MacAddress) -> Result<Option<DeviceSession>>;

    /// Lists matching sessions, oldest first.
    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<DeviceSession>>;
}

#[async_trait]
pub trait AuditRepository: fmt::Debug + Send + Sync + 'static {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditLogEntry>;

    /// Lists matching entries in insertion order.
    async fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>>;
}

/// Keeps everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    slices: RwLock<FxHashMap<SliceId, NetworkSlice>>,
    sessions: RwLock<FxHashMap<SessionId, DeviceSession>>,
    audit: RwLock<Vec<AuditLogEntry>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SliceRepository for InMemoryRepository {
    async fn create_slice(&self, slice: NetworkSlice) -> Result<NetworkSlice> {
        let mut slices = self.slices.write();

        if slices.contains_key(&slice.id) {
            return Err(RepositoryError::AlreadyExists { entity: "slice", key: slice.id.to_string() });
        }
        if slices.values().any(|s| !s.is_terminal() && s.name == slice.name && s.owner == slice.owner) {
            return Err(RepositoryError::AlreadyExists { entity: "slice", key: slice.name });
        }

        slices.insert(slice.id, slice.clone());
        Ok(slice)
    }

    async fn get_slice(&self, id: SliceId) -> Result<NetworkSlice> {
        self.slices
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound { entity: "slice", id: id.to_string() })
    }

    async fn update_slice(&self, slice: NetworkSlice) -> Result<NetworkSlice> {
        match self.slices.write().get_mut(&slice.id) {
            Some(stored) => {
                *stored = slice.clone();
                Ok(slice)
            }
            None => Err(RepositoryError::NotFound { entity: "slice", id: slice.id.to_string() }),
        }
    }

    async fn delete_slice(&self, id: SliceId) -> Result<()> {
        self.slices
            .write()
            .remove(&id)
            .map(drop)
            .ok_or_else(|| RepositoryError::NotFound { entity: "slice", id: id.to_string() })
    }

    async fn list_slices(&self, filter: &SliceFilter) -> Result<Vec<NetworkSlice>> {
        let mut slices: Vec<NetworkSlice> =
            self.slices.read().values().filter(|s| filter.matches(s)).cloned().collect();
        slices.sort_by_key(|s| (s.created_at, s.id));
        Ok(slices)
    }
}

#[async_trait]
impl SessionRepository for InMemoryRepository {
    async fn create_session(&self, session: DeviceSession) -> Result<DeviceSession> {
        let mut sessions = self.sessions.write();

        if session.is_active && sessions.values().any(|s| s.is_active && s.mac == session.mac) {
            return Err(RepositoryError::AlreadyExists {
                entity: "active session for",
                key: session.mac.to_string(),
            });
        }

        sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: SessionId) -> Result<DeviceSession> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound { entity: "session", id: id.to_string() })
    }

    async fn update_session(&self, session: DeviceSession) -> Result<DeviceSession> {
        let mut sessions = self.sessions.write();

        if session.is_active
            && sessions.values().any(|s| s.id != session.id && s.is_active && s.mac == session.mac)
        {
            return Err(RepositoryError::AlreadyExists {
                entity: "active session for",
                key: session.mac.to_string(),
            });
        }

        match sessions.get_mut(&session.id) {
            Some(stored) => {
                *stored = session.clone();
                Ok(session)
            }
            None => Err(RepositoryError::NotFound { entity: "session", id: session.id.to_string() }),
        }
    }

    async fn find_active_session(&self, mac: &MacAddress) -> Result<Option<DeviceSession>> {
        Ok(self.sessions.read().values().find(|s| s.is_active && s.mac == *mac).cloned())
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<DeviceSession>> {
        let mut sessions: Vec<DeviceSession> =
            self.sessions.read().values().filter(|s| filter.matches(s)).cloned().collect();
        sessions.sort_by_key(|s| (s.connected_at, s.id));
        Ok(sessions)
    }
}

#[async_trait]
impl AuditRepository for InMemoryRepository {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditLogEntry> {
        let entry = entry.into_entry(Utc::now());
        self.audit.write().push(entry.clone());
        Ok(entry)
    }

    async fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>> {
        Ok(self.audit.read().iter().filter(|e| filter.matches(e)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{SliceCategory, SliceSpec};

    fn spec(name: &str) -> SliceSpec {
        SliceSpec::new(name, SliceCategory::Corp, 100, 10, Duration::from_secs(60))
    }

    fn slice(name: &str) -> NetworkSlice {
        NetworkSlice::from_spec(spec(name), Utc::now())
    }

    #[tokio::test]
    async fn live_slice_names_are_unique() {
        let repo = InMemoryRepository::new();
        let mut first = repo.create_slice(slice("office")).await.unwrap();

        let err = repo.create_slice(slice("office")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::AlreadyExists { .. }));

        // A different owner is a different scope.
        repo.create_slice(NetworkSlice::from_spec(spec("office").with_owner("bob"), Utc::now())).await.unwrap();

        first.state = SliceState::Inactive;
        repo.update_slice(first).await.unwrap();
        repo.create_slice(slice("office")).await.unwrap();

        assert_eq!(repo.list_slices(&SliceFilter::live()).await.unwrap().len(), 2);
        assert_eq!(repo.list_slices(&SliceFilter::default()).await.unwrap().len(), 3);
        assert_eq!(repo.list_slices(&SliceFilter::default().owner("bob")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_active_session_per_mac() {
        let repo = InMemoryRepository::new();
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();

        let mut first = repo.create_session(DeviceSession::new(mac.clone(), None, Utc::now())).await.unwrap();
        assert!(repo.create_session(DeviceSession::new(mac.clone(), None, Utc::now())).await.is_err());

        first.end(SessionState::Terminated, Utc::now());
        repo.update_session(first).await.unwrap();
        assert!(repo.find_active_session(&mac).await.unwrap().is_none());

        let second = repo.create_session(DeviceSession::new(mac.clone(), None, Utc::now())).await.unwrap();
        assert_eq!(repo.find_active_session(&mac).await.unwrap().map(|s| s.id), Some(second.id));
    }

    #[tokio::test]
    async fn audit_filters() {
        let repo = InMemoryRepository::new();
        let slice_id = SliceId::new();

        repo.append(NewAuditEntry::new(AuditEventKind::SliceActivated, "up").slice(slice_id)).await.unwrap();
        repo.append(NewAuditEntry::new(AuditEventKind::Redirect, "portal")).await.unwrap();

        let filter = AuditFilter { slice: Some(slice_id), ..Default::default() };
        let entries = repo.list_audit(&filter).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, AuditEventKind::SliceActivated);
    }
}
