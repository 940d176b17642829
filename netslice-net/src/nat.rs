//! Source NAT and forwarding rules towards the upstream interface.
//!
//! Three `iptables` rules make a private subnet reachable from the outside world:
//!
//! ```text
//! -t nat POSTROUTING -s <subnet> -o <upstream> -j MASQUERADE
//! FORWARD -s <subnet> -o <upstream> -j ACCEPT
//! FORWARD -d <subnet> -i <upstream> -m state --state RELATED,ESTABLISHED -j ACCEPT
//! ```
//!
//! Rules are always checked with `-C` before being added with `-A`, so repeated activations
//! never accumulate duplicates.

use netslice_shell::{tolerate, Shell, ShellCommand};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    sysctl::{self, Ip, Protocol},
    Subnet,
};

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("failed to enable ip forwarding: {0}")]
    Forwarding(#[source] netslice_shell::Error),
    #[error(transparent)]
    Shell(#[from] netslice_shell::Error),
}

/// A single `iptables` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: Option<&'static str>,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl Rule {
    fn command(&self, op: &str) -> ShellCommand {
        let mut cmd = ShellCommand::new("iptables");
        if let Some(table) = self.table {
            cmd = cmd.args(["-t", table]);
        }
        cmd.args([op, self.chain]).args(self.spec.iter().cloned())
    }

    /// `iptables -C`: exits successfully if the rule exists.
    pub fn check(&self) -> ShellCommand {
        self.command("-C")
    }

    /// `iptables -A`
    pub fn append(&self) -> ShellCommand {
        self.command("-A")
    }

    /// `iptables -D`
    pub fn delete(&self) -> ShellCommand {
        self.command("-D")
    }
}

/// Returns the MASQUERADE rule followed by the two FORWARD rules for `subnet`.
pub fn rules(subnet: &Subnet, upstream: &str) -> [Rule; 3] {
    let subnet = subnet.to_string();
    let spec = |parts: &[&str]| parts.iter().map(|p| p.to_string()).collect::<Vec<_>>();

    [
        Rule {
            table: Some("nat"),
            chain: "POSTROUTING",
            spec: spec(&["-s", &subnet, "-o", upstream, "-j", "MASQUERADE"]),
        },
        Rule { table: None, chain: "FORWARD", spec: spec(&["-s", &subnet, "-o", upstream, "-j", "ACCEPT"]) },
        Rule {
            table: None,
            chain: "FORWARD",
            spec: spec(&[
                "-d",
                &subnet,
                "-i",
                upstream,
                "-m",
                "state",
                "--state",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ]),
        },
    ]
}

type NatKey = (Subnet, String);

/// Installs and removes NAT rules, tracking which consumers rely on each `(subnet, upstream)`
/// pair so shared rules outlive all but the last of them.
#[derive(Debug)]
pub struct NatConfigurator {
    shell: Shell,
    consumers: Mutex<FxHashMap<NatKey, FxHashSet<String>>>,
}

impl NatConfigurator {
    pub fn new(shell: Shell) -> Self {
        Self { shell, consumers: Mutex::default() }
    }

    /// Enables forwarding and makes sure the NAT and forwarding rules for `subnet` exist.
    ///
    /// Returns the number of rules that had to be added.
    pub async fn ensure_nat(&self, subnet: &Subnet, upstream: &str) -> Result<usize, NatError> {
        sysctl::write(&self.shell, Ip::Forwarding, Protocol::V4, "1").await.map_err(NatError::Forwarding)?;

        let rules = rules(subnet, upstream);

        // All checks happen before any addition.
        let mut missing = Vec::with_capacity(rules.len());
        for rule in &rules {
            if !self.shell.succeeds(rule.check()).await? {
                missing.push(rule);
            }
        }

        for rule in &missing {
            self.shell.run(rule.append()).await?;
        }

        if missing.is_empty() {
            tracing::debug!(%subnet, upstream, "nat rules already present");
        } else {
            tracing::info!(%subnet, upstream, added = missing.len(), "nat rules installed");
        }

        Ok(missing.len())
    }

    /// Removes the NAT and forwarding rules for `subnet`. Rules that are already gone are
    /// skipped.
    pub async fn remove_nat(&self, subnet: &Subnet, upstream: &str) -> Result<(), NatError> {
        for rule in &rules(subnet, upstream) {
            if self.shell.succeeds(rule.check()).await? {
                self.shell.run_tolerant(rule.delete(), tolerate::NOT_FOUND).await?;
            }
        }

        tracing::info!(%subnet, upstream, "nat rules removed");
        Ok(())
    }

    /// Ensures NAT for `subnet` and registers `consumer` as relying on it.
    pub async fn attach(&self, consumer: &str, subnet: &Subnet, upstream: &str) -> Result<(), NatError> {
        self.ensure_nat(subnet, upstream).await?;
        self.consumers
            .lock()
            .entry((*subnet, upstream.to_string()))
            .or_default()
            .insert(consumer.to_string());
        Ok(())
    }

    /// Unregisters `consumer`, removing the rules if it was the last one.
    ///
    /// Returns `true` if the rules were removed.
    pub async fn detach(&self, consumer: &str, subnet: &Subnet, upstream: &str) -> Result<bool, NatError> {
        let key = (*subnet, upstream.to_string());
        let last = {
            let mut consumers = self.consumers.lock();
            match consumers.get_mut(&key) {
                Some(set) => {
                    set.remove(consumer);
                    if set.is_empty() {
                        consumers.remove(&key);
                        true
                    } else {
                        false
                    }
                }
                // Unknown to us, e.g. attached before a restart: treat as the last consumer.
                None => true,
            }
        };

        if last {
            self.remove_nat(subnet, upstream).await?;
        } else {
            tracing::debug!(%subnet, upstream, consumer, "nat rules still in use");
        }

        Ok(last)
    }

    /// Number of consumers currently relying on the rules of `subnet`.
    pub fn consumers(&self, subnet: &Subnet, upstream: &str) -> usize {
        self.consumers.lock().get(&(*subnet, upstream.to_string())).map_or(0, FxHashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use netslice_shell::testing::FakeHost;

    use super::*;

    fn subnet() -> Subnet {
        Subnet::new(Ipv4Addr::new(10, 50, 100, 0), 24)
    }

    #[test]
    fn test_rule_cmds() {
        let [masquerade, outbound, inbound] = rules(&subnet(), "eth0");

        assert_eq!(
            masquerade.check().to_string(),
            "iptables -t nat -C POSTROUTING -s 10.50.100.0/24 -o eth0 -j MASQUERADE"
        );
        assert_eq!(outbound.append().to_string(), "iptables -A FORWARD -s 10.50.100.0/24 -o eth0 -j ACCEPT");
        assert_eq!(
            inbound.delete().to_string(),
            "iptables -D FORWARD -d 10.50.100.0/24 -i eth0 -m state --state RELATED,ESTABLISHED -j ACCEPT"
        );
    }

    #[tokio::test]
    async fn ensure_nat_twice_adds_no_duplicates() {
        let _ = tracing_subscriber::fmt::try_init();

        let host = FakeHost::new();
        let nat = NatConfigurator::new(Shell::new(host.clone()));

        assert_eq!(nat.ensure_nat(&subnet(), "eth0").await.unwrap(), 3);
        assert_eq!(nat.ensure_nat(&subnet(), "eth0").await.unwrap(), 0);

        assert_eq!(host.iptables_rules("nat", "POSTROUTING").len(), 1);
        assert_eq!(host.iptables_rules("filter", "FORWARD").len(), 2);
        assert_eq!(host.sysctl("net.ipv4.ip_forward").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn checks_precede_additions() {
        let host = FakeHost::new();
        let nat = NatConfigurator::new(Shell::new(host.clone()));

        nat.ensure_nat(&subnet(), "eth0").await.unwrap();

        let iptables: Vec<String> =
            host.commands().into_iter().filter(|c| c.starts_with("iptables")).collect();
        let last_check = iptables.iter().rposition(|c| c.contains(" -C ")).unwrap();
        let first_add = iptables.iter().position(|c| c.contains(" -A ")).unwrap();
        assert!(last_check < first_add, "{iptables:#?}");
    }

    #[tokio::test]
    async fn forwarding_failure_is_reported() {
        let host = FakeHost::new();
        host.fail_on("sysctl");
        let nat = NatConfigurator::new(Shell::new(host.clone()));

        assert!(matches!(nat.ensure_nat(&subnet(), "eth0").await, Err(NatError::Forwarding(_))));
        assert!(host.iptables_rules("nat", "POSTROUTING").is_empty());
    }

    #[tokio::test]
    async fn detach_removes_rules_with_last_consumer() {
        let host = FakeHost::new();
        let nat = NatConfigurator::new(Shell::new(host.clone()));
        let shared = Subnet::new(Ipv4Addr::new(172, 17, 0, 0), 16);

        nat.attach("slice-a", &shared, "eth0").await.unwrap();
        nat.attach("slice-b", &shared, "eth0").await.unwrap();
        assert_eq!(nat.consumers(&shared, "eth0"), 2);
        assert_eq!(host.iptables_rules("nat", "POSTROUTING").len(), 1);

        assert!(!nat.detach("slice-a", &shared, "eth0").await.unwrap());
        assert_eq!(host.iptables_rules("filter", "FORWARD").len(), 2);

        assert!(nat.detach("slice-b", &shared, "eth0").await.unwrap());
        assert!(host.iptables_rules("nat", "POSTROUTING").is_empty());
        assert!(host.iptables_rules("filter", "FORWARD").is_empty());

        // Removing again is harmless.
        nat.remove_nat(&shared, "eth0").await.unwrap();
    }
}
