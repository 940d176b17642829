use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::model::{Identity, SliceId};

/// What a device submits to the captive portal.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("username", &self.username).finish_non_exhaustive()
    }
}

/// Checks portal credentials.
#[async_trait]
pub trait IdentityProvider: fmt::Debug + Send + Sync + 'static {
    /// Returns the identity the credentials belong to, or `None` if they are not valid.
    async fn authenticate(&self, credentials: &Credentials) -> Option<Identity>;
}

#[derive(Default)]
struct StaticUser {
    password: String,
    allowed_slices: Vec<SliceId>,
    default_slice: Option<SliceId>,
}

/// A fixed username to password table, with per-user slice permissions.
///
/// A user without grants may select any slice. Grants can be added while the portal runs,
/// and apply from the user's next login.
#[derive(Default)]
pub struct StaticIdentityProvider {
    users: RwLock<FxHashMap<String, StaticUser>>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users
            .write()
            .insert(username.into(), StaticUser { password: password.into(), ..Default::default() });
        self
    }

    /// Allows `username` to select `slice`, and makes it the user's default if `default` is set.
    /// Returns `false` for an unknown user.
    pub fn grant(&self, username: &str, slice: SliceId, default: bool) -> bool {
        let mut users = self.users.write();
        let Some(user) = users.get_mut(username) else {
            return false;
        };

        if !user.allowed_slices.contains(&slice) {
            user.allowed_slices.push(slice);
        }
        if default {
            user.default_slice = Some(slice);
        }

        tracing::debug!(username, %slice, default, "slice granted");
        true
    }

    /// Removes the grant of `slice`, clearing the default if it pointed there.
    pub fn revoke(&self, username: &str, slice: SliceId) {
        if let Some(user) = self.users.write().get_mut(username) {
            user.allowed_slices.retain(|s| *s != slice);
            if user.default_slice == Some(slice) {
                user.default_slice = None;
            }
        }
    }
}

impl fmt::Debug for StaticIdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticIdentityProvider").field("users", &self.users.read().len()).finish()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self, credentials: &Credentials) -> Option<Identity> {
        let users = self.users.read();
        let user = users.get(&credentials.username).filter(|u| u.password == credentials.password)?;

        let mut identity = Identity::new(format!("static:{}", credentials.username), credentials.username.clone());
        identity.allowed_slices = user.allowed_slices.clone();
        identity.default_slice = user.default_slice;
        Some(identity)
    }
}
