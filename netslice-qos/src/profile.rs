//! Shaping profiles.

use netslice_common::constants::{KiB, MTU_ETHERNET};

use crate::QosError;

/// Default time a packet may wait in the rate limiter queue before being dropped.
pub const DEFAULT_QUEUE_LATENCY_MS: u32 = 200;

/// Largest bandwidth a profile accepts, in Mbit/s.
pub const MAX_BANDWIDTH_MBIT_S: f64 = 100_000.0;

/// The bandwidth and latency bounds to enforce on an interface.
///
/// # Bandwidth limiting
///
/// The cap is enforced by a Token Bucket Filter:
///
/// 1. Tokens accumulate at `bandwidth_mbit_s`
/// 2. Each byte transmitted consumes one token
/// 3. Burst allows temporary excess up to [`effective_burst_bytes`](Self::effective_burst_bytes)
/// 4. When tokens are exhausted, packets queue (up to [`effective_limit_bytes`](Self::effective_limit_bytes))
/// 5. If the queue overflows, packets are dropped
///
/// # Latency
///
/// A non-zero `latency_ms` adds a `netem` delay below the rate limiter. This is a constant
/// delay on every packet, unlike the queueing delay bounded by `queue_latency_ms`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapingProfile {
    /// Maximum bandwidth in megabits per second (Mbit/s).
    pub bandwidth_mbit_s: f64,

    /// Constant delay added to every packet, in milliseconds. Zero disables delay emulation.
    pub latency_ms: u32,

    /// Burst size in kibibytes (KiB).
    ///
    /// When `None`, a default is computed: `max(bandwidth_bytes_per_sec / 8, 15_000)`, i.e.
    /// either 1/8 second of traffic or 10 MTU-sized packets, whichever is larger. The floor
    /// keeps low rates from being starved by a burst smaller than a handful of packets.
    pub burst_kib: Option<u32>,

    /// Maximum queueing latency in milliseconds, used to size the rate limiter queue:
    /// `limit = rate x queue_latency + burst`. Defaults to 200ms.
    pub queue_latency_ms: Option<u32>,
}

impl ShapingProfile {
    pub fn new(bandwidth_mbit_s: f64, latency_ms: u32) -> Self {
        Self { bandwidth_mbit_s, latency_ms, burst_kib: None, queue_latency_ms: None }
    }

    pub const fn with_burst_kib(mut self, burst_kib: u32) -> Self {
        self.burst_kib = Some(burst_kib);
        self
    }

    pub const fn with_queue_latency_ms(mut self, queue_latency_ms: u32) -> Self {
        self.queue_latency_ms = Some(queue_latency_ms);
        self
    }

    /// Checks the bandwidth is a positive, finite number no larger than
    /// [`MAX_BANDWIDTH_MBIT_S`].
    pub fn validate(&self) -> Result<(), QosError> {
        if !self.bandwidth_mbit_s.is_finite() || self.bandwidth_mbit_s <= 0.0 {
            return Err(QosError::InvalidProfile(format!(
                "bandwidth must be positive, got {}",
                self.bandwidth_mbit_s
            )));
        }

        if self.bandwidth_mbit_s > MAX_BANDWIDTH_MBIT_S {
            return Err(QosError::InvalidProfile(format!(
                "bandwidth must be at most {MAX_BANDWIDTH_MBIT_S} Mbit/s, got {}",
                self.bandwidth_mbit_s
            )));
        }

        Ok(())
    }

    /// Returns `true` if a delay discipline is needed.
    pub const fn has_delay(&self) -> bool {
        self.latency_ms > 0
    }

    /// The rate in kbit/s, as passed to `tc`.
    pub fn rate_kbit(&self) -> u64 {
        (self.bandwidth_mbit_s * 1_000.0).round() as u64
    }

    /// Compute the bandwidth rate in bytes per second.
    pub fn bandwidth_bytes_per_sec(&self) -> u64 {
        (self.bandwidth_mbit_s * 1_000_000.0 / 8.0) as u64
    }

    /// Compute the effective burst size in bytes. Saturates at `u32::MAX`.
    pub fn effective_burst_bytes(&self) -> u32 {
        saturate(self.burst_bytes())
    }

    /// Compute the effective queue limit in bytes, using `limit = rate x queue_latency + burst`
    /// from iproute2. Saturates at `u32::MAX`.
    pub fn effective_limit_bytes(&self) -> u32 {
        let queue_latency_ms = u64::from(self.queue_latency_ms.unwrap_or(DEFAULT_QUEUE_LATENCY_MS));
        let rate_bytes_per_ms = self.bandwidth_bytes_per_sec() / 1000;
        saturate(rate_bytes_per_ms.saturating_mul(queue_latency_ms).saturating_add(self.burst_bytes()))
    }

    fn burst_bytes(&self) -> u64 {
        if let Some(burst_kib) = self.burst_kib {
            return u64::from(burst_kib).saturating_mul(u64::from(KiB));
        }

        let one_eighth_second = self.bandwidth_bytes_per_sec() / 8;
        let ten_packets = u64::from(MTU_ETHERNET) * 10;
        std::cmp::max(one_eighth_second, ten_packets)
    }
}

fn saturate(bytes: u64) -> u32 {
    u32::try_from(bytes).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_an_eighth_of_a_second_at_high_rates() {
        // 100 Mbit/s = 12.5 MB/s, 1/8 s = 1_562_500 bytes.
        let profile = ShapingProfile::new(100.0, 0);
        assert_eq!(profile.effective_burst_bytes(), 1_562_500);
    }

    #[test]
    fn burst_has_a_floor_at_low_rates() {
        // 0.1 Mbit/s would give 1_562 bytes, below ten packets.
        let profile = ShapingProfile::new(0.1, 100);
        assert_eq!(profile.effective_burst_bytes(), 15_000);

        let profile = ShapingProfile::new(10.0, 50);
        assert_eq!(profile.effective_burst_bytes(), 156_250);
    }

    #[test]
    fn explicit_burst_wins() {
        let profile = ShapingProfile::new(10.0, 0).with_burst_kib(32);
        assert_eq!(profile.effective_burst_bytes(), 32 * 1024);
    }

    #[test]
    fn limit_covers_queue_latency_and_burst() {
        // 10 Mbit/s = 1_250 bytes/ms, x 200ms = 250_000, + 156_250 burst.
        let profile = ShapingProfile::new(10.0, 0);
        assert_eq!(profile.effective_limit_bytes(), 406_250);

        let profile = profile.with_queue_latency_ms(100);
        assert_eq!(profile.effective_limit_bytes(), 281_250);
    }

    #[test]
    fn sizes_saturate_at_the_largest_bandwidth() {
        // 100 Gbit/s = 12_500_000 bytes/ms, x 1000ms overflows 32 bits.
        let profile = ShapingProfile::new(MAX_BANDWIDTH_MBIT_S, 0).with_queue_latency_ms(1000);
        assert_eq!(profile.effective_burst_bytes(), 1_562_500_000);
        assert_eq!(profile.effective_limit_bytes(), u32::MAX);

        let profile = ShapingProfile::new(10.0, 0).with_burst_kib(u32::MAX);
        assert_eq!(profile.effective_burst_bytes(), u32::MAX);
        assert_eq!(profile.effective_limit_bytes(), u32::MAX);

        // Just below the point of overflow, nothing is clamped.
        let profile = ShapingProfile::new(MAX_BANDWIDTH_MBIT_S, 0).with_queue_latency_ms(200);
        assert_eq!(profile.effective_limit_bytes(), 2_500_000_000 + 1_562_500_000);
    }

    #[test]
    fn rate_is_rendered_in_kbit() {
        assert_eq!(ShapingProfile::new(10.0, 0).rate_kbit(), 10_000);
        assert_eq!(ShapingProfile::new(0.1, 0).rate_kbit(), 100);
    }

    #[test]
    fn validate_rejects_non_positive_bandwidth() {
        assert!(ShapingProfile::new(0.0, 0).validate().is_err());
        assert!(ShapingProfile::new(-1.0, 0).validate().is_err());
        assert!(ShapingProfile::new(f64::NAN, 0).validate().is_err());
        assert!(ShapingProfile::new(1.0, 0).validate().is_ok());
    }

    #[test]
    fn validate_rejects_bandwidth_above_the_maximum() {
        assert!(ShapingProfile::new(MAX_BANDWIDTH_MBIT_S, 0).validate().is_ok());
        assert!(ShapingProfile::new(MAX_BANDWIDTH_MBIT_S + 1.0, 0).validate().is_err());
        assert!(ShapingProfile::new(f64::INFINITY, 0).validate().is_err());
    }
}
