use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MacAddress, SessionId, SliceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    Redirect,
    LoginSuccess,
    LoginFailed,
    SliceSelected,
    SessionExpired,
    VlanChanged,
    SliceActivated,
    SliceFailed,
    SliceDeactivated,
    TeardownIncomplete,
}

impl AuditEventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Redirect => "REDIRECT",
            Self::LoginSuccess => "LOGIN_SUCCESS",
            Self::LoginFailed => "LOGIN_FAILED",
            Self::SliceSelected => "SLICE_SELECTED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::VlanChanged => "VLAN_CHANGED",
            Self::SliceActivated => "SLICE_ACTIVATED",
            Self::SliceFailed => "SLICE_FAILED",
            Self::SliceDeactivated => "SLICE_DEACTIVATED",
            Self::TeardownIncomplete => "TEARDOWN_INCOMPLETE",
        }
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only record of something that happened to a session or slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub kind: AuditEventKind,
    pub session: Option<SessionId>,
    pub slice: Option<SliceId>,
    pub mac: Option<MacAddress>,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// An audit entry before the repository assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditEntry {
    pub kind: AuditEventKind,
    pub session: Option<SessionId>,
    pub slice: Option<SliceId>,
    pub mac: Option<MacAddress>,
    pub detail: String,
}

impl NewAuditEntry {
    pub fn new(kind: AuditEventKind, detail: impl Into<String>) -> Self {
        Self { kind, session: None, slice: None, mac: None, detail: detail.into() }
    }

    pub const fn session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub const fn slice(mut self, slice: SliceId) -> Self {
        self.slice = Some(slice);
        self
    }

    pub fn mac(mut self, mac: &MacAddress) -> Self {
        self.mac = Some(mac.clone());
        self
    }

    pub fn into_entry(self, timestamp: DateTime<Utc>) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4(),
            kind: self.kind,
            session: self.session,
            slice: self.slice,
            mac: self.mac,
            detail: self.detail,
            timestamp,
        }
    }
}
