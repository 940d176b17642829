mod deferred;
pub use deferred::DeferredQueue;

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;

    /// Standard Ethernet MTU in bytes.
    pub const MTU_ETHERNET: u32 = 1500;
}
