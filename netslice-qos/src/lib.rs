//! QoS enforcement on Linux interfaces with `tc`.
//!
//! A shaped interface carries a two-level tree: a token bucket filter (`tbf`) as the root
//! discipline enforcing the bandwidth cap, and, when a target latency is requested, a `netem`
//! child adding a constant delay.
//!
//! ```text
//! root 1: tbf (rate, burst, limit)
//!   └── 1:1 -> 10: netem (delay)
//! ```
//!
//! [`QosShaper`] installs, removes and reads back that tree. Read-back produces a
//! [`QosVerification`] comparing the live state with what was requested.

pub mod parse;
pub mod profile;
pub mod tc;

mod shaper;
pub use profile::ShapingProfile;
pub use shaper::{QosShaper, QosVerification, ShaperOptions};

#[derive(Debug, thiserror::Error)]
pub enum QosError {
    #[error(transparent)]
    Shell(#[from] netslice_shell::Error),
    #[error("invalid shaping profile: {0}")]
    InvalidProfile(String),
}

pub type Result<T> = std::result::Result<T, QosError>;
