//! Host networking primitives: links, bridges and addresses ([`ip`]), kernel parameters
//! ([`sysctl`]), source NAT ([`nat`]), egress interface resolution ([`upstream`]) and
//! interface counters ([`stats`]).

pub mod ip;
pub mod nat;
pub mod stats;
pub mod sysctl;
pub mod upstream;

pub use ip::Subnet;
pub use nat::{NatConfigurator, NatError};
pub use upstream::UpstreamResolver;
