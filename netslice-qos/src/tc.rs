//! `tc` command builders.

use netslice_shell::ShellCommand;

use crate::ShapingProfile;

/// Handle of the root rate limiter.
pub const ROOT_HANDLE: &str = "1:";
/// The class of the rate limiter that holds its inner qdisc.
pub const RATE_LIMITER_CLASS: &str = "1:1";
/// Handle of the delay emulator below the rate limiter.
pub const DELAY_HANDLE: &str = "10:";

/// RateLimiter represents the root `tbf` qdisc of a shaped interface.
#[derive(Debug, Clone)]
pub struct RateLimiter<'a> {
    /// The interface to shape.
    pub dev: &'a str,
    /// Rate in kbit/s.
    pub rate_kbit: u64,
    /// Burst size in bytes.
    pub burst: u32,
    /// Queue limit in bytes.
    pub limit: u32,
}

impl<'a> RateLimiter<'a> {
    pub fn new(dev: &'a str, profile: &ShapingProfile) -> Self {
        Self {
            dev,
            rate_kbit: profile.rate_kbit(),
            burst: profile.effective_burst_bytes(),
            limit: profile.effective_limit_bytes(),
        }
    }

    /// Builds the command to install the rate limiter as root qdisc.
    pub fn build(&self) -> ShellCommand {
        ShellCommand::new("tc").args([
            "qdisc",
            "add",
            "dev",
            self.dev,
            "root",
            "handle",
            ROOT_HANDLE,
            "tbf",
            "rate",
            &format!("{}kbit", self.rate_kbit),
            "burst",
            &self.burst.to_string(),
            "limit",
            &self.limit.to_string(),
        ])
    }
}

/// DelayEmulator represents the `netem` qdisc attached below the rate limiter.
#[derive(Debug, Clone)]
pub struct DelayEmulator<'a> {
    pub dev: &'a str,
    /// Constant delay in ms.
    pub delay_ms: u32,
}

impl<'a> DelayEmulator<'a> {
    pub const fn new(dev: &'a str, delay_ms: u32) -> Self {
        Self { dev, delay_ms }
    }

    /// Builds the command to attach the delay emulator to the rate limiter.
    pub fn build(&self) -> ShellCommand {
        ShellCommand::new("tc").args([
            "qdisc",
            "add",
            "dev",
            self.dev,
            "parent",
            RATE_LIMITER_CLASS,
            "handle",
            DELAY_HANDLE,
            "netem",
            "delay",
            &format!("{}ms", self.delay_ms),
        ])
    }
}

/// Builds the command to delete the root qdisc, and everything below it.
pub fn delete_root(dev: &str) -> ShellCommand {
    ShellCommand::new("tc").args(["qdisc", "del", "dev", dev, "root"])
}

/// Builds the command to print the qdiscs of an interface.
pub fn show(dev: &str) -> ShellCommand {
    ShellCommand::new("tc").args(["qdisc", "show", "dev", dev])
}
