use netslice_shell::{tolerate, Shell};
use serde::Serialize;

use crate::{
    parse::{parse_qdisc_show, QdiscEntry},
    profile::DEFAULT_QUEUE_LATENCY_MS,
    tc::{self, DelayEmulator, RateLimiter},
    Result, ShapingProfile,
};

#[derive(Debug, Clone)]
pub struct ShaperOptions {
    /// Queueing latency used to size the rate limiter queue.
    pub queue_latency_ms: u32,
    /// Absolute tolerance when comparing bandwidth, in Mbit/s.
    pub bandwidth_tolerance_mbit_s: f64,
    /// Absolute tolerance when comparing latency, in ms.
    pub latency_tolerance_ms: f64,
}

impl Default for ShaperOptions {
    fn default() -> Self {
        Self {
            queue_latency_ms: DEFAULT_QUEUE_LATENCY_MS,
            bandwidth_tolerance_mbit_s: 0.1,
            latency_tolerance_ms: 1.0,
        }
    }
}

impl ShaperOptions {
    pub const fn with_queue_latency_ms(mut self, queue_latency_ms: u32) -> Self {
        self.queue_latency_ms = queue_latency_ms;
        self
    }
}

/// The result of reading back the shaping state of an interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QosVerification {
    pub interface: String,
    /// Whether any non-default qdisc is installed.
    pub qdisc_configured: bool,
    pub expected_bandwidth_mbit_s: f64,
    pub expected_latency_ms: u32,
    pub actual_bandwidth_mbit_s: Option<f64>,
    pub actual_latency_ms: Option<f64>,
    pub bandwidth_matches: bool,
    pub latency_matches: bool,
    /// `true` only if a qdisc is configured and both bandwidth and latency match.
    pub verified: bool,
    /// Everything that prevented verification.
    pub issues: Vec<String>,
    /// Raw `tc qdisc show` output.
    pub raw: String,
    pub qdiscs: Vec<QdiscEntry>,
}

/// Installs, removes and verifies the shaping tree of an interface.
#[derive(Debug, Clone)]
pub struct QosShaper {
    shell: Shell,
    options: ShaperOptions,
}

impl QosShaper {
    pub const fn new(shell: Shell, options: ShaperOptions) -> Self {
        Self { shell, options }
    }

    pub const fn shell(&self) -> &Shell {
        &self.shell
    }

    /// Returns the profile the shaper installs for the given bounds.
    pub fn profile(&self, bandwidth_mbit_s: f64, latency_ms: u32) -> ShapingProfile {
        ShapingProfile::new(bandwidth_mbit_s, latency_ms)
            .with_queue_latency_ms(self.options.queue_latency_ms)
    }

    /// Shapes `dev` to the given bounds, replacing any existing root qdisc.
    pub async fn apply(&self, dev: &str, bandwidth_mbit_s: f64, latency_ms: u32) -> Result<ShapingProfile> {
        let profile = self.profile(bandwidth_mbit_s, latency_ms);
        self.apply_profile(dev, &profile).await?;
        Ok(profile)
    }

    /// Installs `profile` on `dev`. Idempotent: any existing root qdisc is removed first.
    pub async fn apply_profile(&self, dev: &str, profile: &ShapingProfile) -> Result<()> {
        profile.validate()?;

        tracing::debug!(dev, bandwidth = profile.bandwidth_mbit_s, latency = profile.latency_ms, "applying shaping");

        self.remove(dev).await?;
        self.shell.run(RateLimiter::new(dev, profile).build()).await?;

        if profile.has_delay() {
            self.shell.run(DelayEmulator::new(dev, profile.latency_ms).build()).await?;
        }

        tracing::info!(dev, bandwidth = profile.bandwidth_mbit_s, latency = profile.latency_ms, "shaping applied");
        Ok(())
    }

    /// Removes the root qdisc of `dev`. Succeeds if there is nothing to remove or the device is
    /// gone.
    pub async fn remove(&self, dev: &str) -> Result<()> {
        self.shell.run_tolerant(tc::delete_root(dev), tolerate::NOT_FOUND).await?;
        Ok(())
    }

    /// Returns the raw `tc qdisc show` output of `dev`.
    pub async fn show(&self, dev: &str) -> Result<String> {
        Ok(self.shell.run(tc::show(dev)).await?.stdout)
    }

    /// Reads back the shaping state of `dev` and compares it with the expected bounds.
    ///
    /// Never fails: anything that prevents a positive verification is recorded in
    /// [`QosVerification::issues`] and leaves `verified` unset.
    pub async fn verify(&self, dev: &str, expected_bandwidth_mbit_s: f64, expected_latency_ms: u32) -> QosVerification {
        let mut verification = QosVerification {
            interface: dev.to_string(),
            qdisc_configured: false,
            expected_bandwidth_mbit_s,
            expected_latency_ms,
            actual_bandwidth_mbit_s: None,
            actual_latency_ms: None,
            bandwidth_matches: false,
            latency_matches: false,
            verified: false,
            issues: Vec::new(),
            raw: String::new(),
            qdiscs: Vec::new(),
        };

        let raw = match self.show(dev).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(dev, ?e, "failed to read scheduler state");
                verification.issues.push(format!("failed to read scheduler state: {e}"));
                return verification;
            }
        };

        let entries = parse_qdisc_show(&raw);
        verification.raw = raw;

        let shaped: Vec<&QdiscEntry> = entries.iter().filter(|e| !e.is_default()).collect();
        verification.qdisc_configured = !shaped.is_empty();

        if !verification.qdisc_configured {
            verification.issues.push(format!("no queueing discipline configured on {dev}"));
            verification.qdiscs = entries;
            return verification;
        }

        for entry in &shaped {
            for value in &entry.unparsed {
                verification.issues.push(format!("unable to parse `{value}` of {} qdisc", entry.kind));
            }
        }

        verification.actual_bandwidth_mbit_s = shaped.iter().find_map(|e| e.rate_mbit_s);
        verification.actual_latency_ms = shaped.iter().find_map(|e| e.delay_ms);
        let has_delay_qdisc = shaped.iter().any(|e| e.kind == "netem");

        match verification.actual_bandwidth_mbit_s {
            Some(actual) => {
                verification.bandwidth_matches =
                    (actual - expected_bandwidth_mbit_s).abs() <= self.options.bandwidth_tolerance_mbit_s;
                if !verification.bandwidth_matches {
                    verification.issues.push(format!(
                        "bandwidth mismatch: expected {expected_bandwidth_mbit_s} Mbit/s, found {actual} Mbit/s"
                    ));
                }
            }
            None => verification.issues.push("no bandwidth limit found".to_string()),
        }

        match verification.actual_latency_ms {
            Some(actual) => {
                verification.latency_matches =
                    (actual - f64::from(expected_latency_ms)).abs() <= self.options.latency_tolerance_ms;
                if !verification.latency_matches {
                    verification.issues.push(format!(
                        "latency mismatch: expected {expected_latency_ms} ms, found {actual} ms"
                    ));
                }
            }
            // A delay qdisc whose delay could not be parsed never counts as a match.
            None if expected_latency_ms == 0 && !has_delay_qdisc => verification.latency_matches = true,
            None => verification.issues.push(format!("expected {expected_latency_ms} ms delay, none found")),
        }

        verification.verified = verification.bandwidth_matches && verification.latency_matches;
        verification.qdiscs = entries;

        if !verification.verified {
            tracing::debug!(dev, issues = ?verification.issues, "shaping not verified");
        }

        verification
    }
}

#[cfg(test)]
mod tests {
    use netslice_shell::testing::FakeHost;

    use super::*;

    fn shaper(host: &FakeHost) -> QosShaper {
        QosShaper::new(Shell::new(host.clone()), ShaperOptions::default())
    }

    #[tokio::test]
    async fn apply_then_verify() {
        let _ = tracing_subscriber::fmt::try_init();

        let host = FakeHost::new().with_link("br-netslice");
        let shaper = shaper(&host);

        shaper.apply("br-netslice", 10.0, 50).await.unwrap();
        let verification = shaper.verify("br-netslice", 10.0, 50).await;

        assert!(verification.qdisc_configured);
        assert_eq!(verification.actual_bandwidth_mbit_s, Some(10.0));
        assert_eq!(verification.actual_latency_ms, Some(50.0));
        assert!(verification.verified, "{:?}", verification.issues);
        assert!(verification.issues.is_empty());
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let host = FakeHost::new().with_link("br0");
        let shaper = shaper(&host);

        shaper.apply("br0", 10.0, 50).await.unwrap();
        shaper.apply("br0", 20.0, 0).await.unwrap();

        let verification = shaper.verify("br0", 20.0, 0).await;
        assert!(verification.verified, "{:?}", verification.issues);
        assert_eq!(verification.qdiscs.len(), 1);
    }

    #[tokio::test]
    async fn zero_latency_installs_no_delay() {
        let host = FakeHost::new().with_link("br0");
        shaper(&host).apply("br0", 5.0, 0).await.unwrap();

        assert!(!host.commands().iter().any(|c| c.contains("netem")));
    }

    #[tokio::test]
    async fn verify_without_qdisc_never_matches() {
        let host = FakeHost::new().with_link("br0");
        let verification = shaper(&host).verify("br0", 10.0, 0).await;

        assert!(!verification.qdisc_configured);
        assert!(!verification.verified);
        assert_eq!(verification.actual_bandwidth_mbit_s, None);
        assert!(!verification.issues.is_empty());
    }

    #[tokio::test]
    async fn verify_reports_mismatch() {
        let host = FakeHost::new().with_link("br0");
        let shaper = shaper(&host);

        shaper.apply("br0", 10.0, 50).await.unwrap();
        let verification = shaper.verify("br0", 25.0, 10).await;

        assert!(verification.qdisc_configured);
        assert!(!verification.bandwidth_matches);
        assert!(!verification.latency_matches);
        assert!(!verification.verified);
        assert_eq!(verification.issues.len(), 2);
    }

    #[tokio::test]
    async fn verify_missing_device_is_reported() {
        let host = FakeHost::new();
        let verification = shaper(&host).verify("br-gone", 10.0, 0).await;

        assert!(!verification.qdisc_configured);
        assert!(!verification.verified);
        assert!(verification.issues[0].contains("failed to read scheduler state"));
    }

    #[tokio::test]
    async fn remove_is_safe_without_qdisc() {
        let host = FakeHost::new().with_link("br0");
        let shaper = shaper(&host);

        shaper.remove("br0").await.unwrap();
        shaper.remove("br-gone").await.unwrap();

        shaper.apply("br0", 1.0, 0).await.unwrap();
        shaper.remove("br0").await.unwrap();
        assert!(!host.has_qdisc("br0"));
    }

    #[tokio::test]
    async fn apply_rejects_invalid_bandwidth() {
        let host = FakeHost::new().with_link("br0");
        assert!(matches!(
            shaper(&host).apply("br0", 0.0, 0).await,
            Err(crate::QosError::InvalidProfile(_))
        ));
        assert!(host.commands().is_empty());
    }
}
