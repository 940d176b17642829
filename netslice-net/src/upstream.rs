//! Resolution of the egress interface used for NAT.

use netslice_shell::{timeouts, Shell, ShellCommand};
use parking_lot::Mutex;

use crate::ip;

/// Interfaces tried, in order, when the routing table gives no answer.
pub const CANDIDATES: &[&str] = &["eth0", "enp0s25", "enp2s0", "wlan0"];

/// Used when nothing else resolves.
pub const FALLBACK: &str = "eth0";

/// Destination used to ask the routing table for the default egress interface.
const ROUTE_LOOKUP_DESTINATION: &str = "1.1.1.1";

/// Determines the upstream interface: the configured value if any, else the interface of the
/// default route, else the first existing well-known interface, else [`FALLBACK`].
///
/// The first resolution is cached.
#[derive(Debug)]
pub struct UpstreamResolver {
    shell: Shell,
    configured: Option<String>,
    candidates: Vec<String>,
    cached: Mutex<Option<String>>,
}

impl UpstreamResolver {
    pub fn new(shell: Shell, configured: Option<String>) -> Self {
        Self {
            shell,
            configured,
            candidates: CANDIDATES.iter().map(|c| c.to_string()).collect(),
            cached: Mutex::new(None),
        }
    }

    /// Replaces the candidate interface names.
    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Returns the upstream interface. Never fails: resolution errors fall through to the
    /// next strategy.
    pub async fn resolve(&self) -> String {
        if let Some(cached) = self.cached.lock().clone() {
            return cached;
        }

        let resolved = self.resolve_uncached().await;
        *self.cached.lock() = Some(resolved.clone());
        resolved
    }

    async fn resolve_uncached(&self) -> String {
        if let Some(configured) = &self.configured {
            tracing::debug!(upstream = %configured, "using configured upstream interface");
            return configured.clone();
        }

        let route =
            ShellCommand::new("ip").args(["-o", "route", "get", ROUTE_LOOKUP_DESTINATION]).timeout(timeouts::QUICK);
        match self.shell.run(route).await {
            Ok(output) => {
                if let Some(dev) = parse_route_dev(&output.stdout) {
                    tracing::info!(upstream = %dev, "resolved upstream interface from default route");
                    return dev;
                }
            }
            Err(e) => tracing::debug!(?e, "default route lookup failed"),
        }

        for candidate in &self.candidates {
            if ip::link_exists(&self.shell, candidate).await.unwrap_or(false) {
                tracing::info!(upstream = %candidate, "resolved upstream interface from candidates");
                return candidate.clone();
            }
        }

        tracing::warn!(upstream = FALLBACK, "could not resolve upstream interface, using fallback");
        FALLBACK.to_string()
    }
}

/// Returns the token following `dev` in `ip route get` output.
pub fn parse_route_dev(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "dev" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use netslice_shell::testing::FakeHost;

    use super::*;

    #[test]
    fn parses_route_output() {
        let output = "1.1.1.1 via 192.168.1.1 dev enp3s0 src 192.168.1.10 uid 1000 \\    cache ";
        assert_eq!(parse_route_dev(output).as_deref(), Some("enp3s0"));
        assert_eq!(parse_route_dev("unreachable"), None);
        assert_eq!(parse_route_dev("1.1.1.1 dev"), None);
    }

    #[tokio::test]
    async fn configured_value_wins() {
        let host = FakeHost::new();
        let resolver = UpstreamResolver::new(Shell::new(host.clone()), Some("wan0".to_string()));

        assert_eq!(resolver.resolve().await, "wan0");
        assert!(host.commands().is_empty());
    }

    #[tokio::test]
    async fn uses_default_route_and_caches() {
        let host = FakeHost::new().with_link("enp5s0").with_default_route(Some("enp5s0"));
        let resolver = UpstreamResolver::new(Shell::new(host.clone()), None);

        assert_eq!(resolver.resolve().await, "enp5s0");
        assert_eq!(resolver.resolve().await, "enp5s0");
        assert_eq!(host.commands().len(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_candidates() {
        let host = FakeHost::new().with_default_route(None).without_link("eth0").with_link("enp2s0");
        let resolver = UpstreamResolver::new(Shell::new(host), None);

        assert_eq!(resolver.resolve().await, "enp2s0");
    }

    #[tokio::test]
    async fn falls_back_to_eth0() {
        let host = FakeHost::new().with_default_route(None).without_link("eth0");
        let resolver = UpstreamResolver::new(Shell::new(host), None);

        assert_eq!(resolver.resolve().await, FALLBACK);
    }
}
