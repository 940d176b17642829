//! Slices, device sessions and the audit trail.

mod audit;
pub use audit::{AuditEventKind, AuditLogEntry, NewAuditEntry};

mod session;
pub use session::{DeviceSession, Identity, MacAddress, SessionId, SessionState};

mod slice;
pub use slice::{
    validate_bounds, BackendKind, NetworkSlice, QosStatus, SliceCategory, SliceId, SliceSpec, SliceState,
    DEFAULT_DNS_SERVERS, DEFAULT_MAX_DEVICES, MAX_BANDWIDTH_MBPS, MAX_DURATION_SECS, MAX_LATENCY_MS,
    MAX_NAME_LEN,
};
