//! The netslice core: network slices from request to teardown, and the captive-portal device
//! sessions that get assigned to them.
//!
//! The [`Orchestrator`] owns the slice lifecycle. It validates requests, picks a
//! [`Provisioner`](provision::Provisioner) from an ordered strategy list, applies QoS shaping,
//! schedules expiry and tears everything down again. The [`SessionManager`] moves devices from
//! quarantine through authentication onto an active slice.
//!
//! Persistence and identity checks are collaborators behind the traits in [`repository`] and
//! [`identity`].

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod identity;
pub mod model;
pub mod orchestrator;
pub mod provision;
pub mod repository;
pub mod session;
pub mod vlan;

pub use bootstrap::Netslice;
pub use config::NetsliceConfig;
pub use error::ValidationError;
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorOptions};
pub use session::{SessionError, SessionManager, SessionOptions};
