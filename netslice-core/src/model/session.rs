use std::{fmt, net::IpAddr, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SliceId;
use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A hardware address in lowercase, colon separated form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::new("mac", format!("invalid hardware address {s:?}"));

        let octets: Vec<&str> = s.trim().split([':', '-']).collect();
        if octets.len() != 6 || !octets.iter().all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit())) {
            return Err(invalid());
        }

        Ok(Self(octets.join(":").to_ascii_lowercase()))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a device is in the captive-portal flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Quarantine,
    Authenticating,
    Active,
    Expired,
    Terminated,
}

impl SessionState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Terminated)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Quarantine => "QUARANTINE",
            Self::Authenticating => "AUTHENTICATING",
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user a device authenticated as, and the slices that user may pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
    /// Empty means every slice.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_slices: Vec<SliceId>,
    /// The slice offered first, and picked when the device asks for its default.
    #[serde(default)]
    pub default_slice: Option<SliceId>,
}

impl Identity {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self { id: id.into(), username: username.into(), allowed_slices: Vec::new(), default_slice: None }
    }

    /// Whether this identity may select `slice`.
    pub fn may_use(&self, slice: SliceId) -> bool {
        self.allowed_slices.is_empty() || self.allowed_slices.contains(&slice)
    }
}

/// A device's association with the portal and, once active, with a slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSession {
    pub id: SessionId,
    pub mac: MacAddress,
    pub ip: Option<IpAddr>,
    pub state: SessionState,
    /// Cleared once the session reaches a terminal state. At most one session per MAC is active.
    pub is_active: bool,
    pub identity: Option<Identity>,
    pub current_slice: Option<SliceId>,
    pub previous_slice: Option<SliceId>,
    pub connected_at: DateTime<Utc>,
    pub authenticated_at: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl DeviceSession {
    /// A new session in quarantine.
    pub fn new(mac: MacAddress, ip: Option<IpAddr>, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            mac,
            ip,
            state: SessionState::Quarantine,
            is_active: true,
            identity: None,
            current_slice: None,
            previous_slice: None,
            connected_at: now,
            authenticated_at: None,
            last_seen: now,
            expires_at: None,
            ended_at: None,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
        }
    }

    /// Whether the session window has passed at `now`. Sessions without a window never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }

    /// Moves the session onto `slice` for `window`. This is the only way into `ACTIVE`, so an
    /// active session always has a slice and an expiry.
    pub(crate) fn activate(&mut self, slice: SliceId, now: DateTime<Utc>, window: Duration) {
        self.previous_slice = self.current_slice.take();
        self.current_slice = Some(slice);
        self.state = SessionState::Active;
        self.expires_at = Some(now + chrono::Duration::seconds(window.as_secs() as i64));
        self.last_seen = now;
    }

    /// Ends the session in `state`.
    pub(crate) fn end(&mut self, state: SessionState, now: DateTime<Utc>) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.is_active = false;
        self.ended_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_normalisation() {
        let mac: MacAddress = "AA-BB-CC-00-11-22".parse().unwrap();
        assert_eq!(mac.as_str(), "aa:bb:cc:00:11:22");

        assert!("aa:bb:cc:00:11".parse::<MacAddress>().is_err());
        assert!("aa:bb:cc:00:11:zz".parse::<MacAddress>().is_err());
        assert!(serde_json::from_str::<MacAddress>("\"nope\"").is_err());
    }

    #[test]
    fn expiry() {
        let now = Utc::now();
        let mut session = DeviceSession::new("aa:bb:cc:dd:ee:ff".parse().unwrap(), None, now);
        assert!(!session.is_expired(now + chrono::Duration::days(365)));

        session.activate(SliceId::new(), now, Duration::from_secs(60));
        assert_eq!(session.state, SessionState::Active);
        assert!(!session.is_expired(now + chrono::Duration::seconds(59)));
        assert!(session.is_expired(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn activation_tracks_previous_slice() {
        let now = Utc::now();
        let (a, b) = (SliceId::new(), SliceId::new());
        let mut session = DeviceSession::new("aa:bb:cc:dd:ee:ff".parse().unwrap(), None, now);

        session.activate(a, now, Duration::from_secs(60));
        session.activate(b, now, Duration::from_secs(60));
        assert_eq!(session.current_slice, Some(b));
        assert_eq!(session.previous_slice, Some(a));
    }
}
