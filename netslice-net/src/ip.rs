//! `ip` command builders and helpers.

use std::{
    fmt,
    net::Ipv4Addr,
    str::FromStr,
};

use netslice_shell::{tolerate, Shell, ShellCommand};
use serde::{Serialize, Serializer};

/// An IPv4 subnet in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    pub address: Ipv4Addr,
    pub mask: u8,
}

impl Subnet {
    pub const fn new(address: Ipv4Addr, mask: u8) -> Self {
        Self { address, mask }
    }

    /// Returns the `n`-th host address of the subnet, e.g. `.1` for the usual gateway.
    pub fn host(&self, n: u8) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) + u32::from(n))
    }

    /// Returns the first three octets of the network address, for building DHCP ranges.
    pub fn prefix24(&self) -> String {
        let [a, b, c, _] = self.address.octets();
        format!("{a}.{b}.{c}")
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.mask)
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, mask) = s.split_once('/').ok_or_else(|| format!("missing prefix length in {s}"))?;
        let address = address.parse::<Ipv4Addr>().map_err(|e| format!("invalid address {address}: {e}"))?;
        let mask = mask.parse::<u8>().ok().filter(|m| *m <= 32).ok_or_else(|| format!("invalid prefix length {mask}"))?;

        Ok(Self::new(address, mask))
    }
}

impl Serialize for Subnet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Derives the `/24` subnet of a VLAN inside a `/16`-style block starting at `base`.
///
/// The VLAN id selects the third octet and carries into the second one, so every id of the
/// 1-4094 range gets a distinct subnet: `10.50.0.0` and VLAN 300 give `10.51.44.0/24`.
pub fn vlan_subnet(base: Ipv4Addr, vlan: u16) -> Subnet {
    Subnet::new(Ipv4Addr::from(u32::from(base) + (u32::from(vlan) << 8)), 24)
}

pub fn link_show(dev: &str) -> ShellCommand {
    ShellCommand::new("ip").args(["link", "show", dev])
}

pub fn link_add_bridge(name: &str) -> ShellCommand {
    ShellCommand::new("ip").args(["link", "add", "name", name, "type", "bridge"])
}

pub fn link_set_up(dev: &str) -> ShellCommand {
    ShellCommand::new("ip").args(["link", "set", "dev", dev, "up"])
}

pub fn link_set_down(dev: &str) -> ShellCommand {
    ShellCommand::new("ip").args(["link", "set", "dev", dev, "down"])
}

pub fn link_set_master(dev: &str, master: &str) -> ShellCommand {
    ShellCommand::new("ip").args(["link", "set", "dev", dev, "master", master])
}

pub fn link_delete(dev: &str) -> ShellCommand {
    ShellCommand::new("ip").args(["link", "delete", "dev", dev])
}

pub fn addr_flush(dev: &str) -> ShellCommand {
    ShellCommand::new("ip").args(["addr", "flush", "dev", dev])
}

pub fn addr_add(address: Ipv4Addr, mask: u8, dev: &str) -> ShellCommand {
    ShellCommand::new("ip").args(["addr", "add", &format!("{address}/{mask}"), "dev", dev])
}

pub fn neigh_show(dev: &str) -> ShellCommand {
    ShellCommand::new("ip").args(["neigh", "show", "dev", dev])
}

pub fn neigh_flush(dev: &str) -> ShellCommand {
    ShellCommand::new("ip").args(["neigh", "flush", "dev", dev])
}

/// Returns `true` if the link exists.
pub async fn link_exists(shell: &Shell, dev: &str) -> netslice_shell::Result<bool> {
    shell.succeeds(link_show(dev)).await
}

/// Creates the bridge if needed and brings it up.
pub async fn ensure_bridge(shell: &Shell, name: &str) -> netslice_shell::Result<()> {
    shell.run_tolerant(link_add_bridge(name), tolerate::ALREADY_EXISTS).await?;
    shell.run(link_set_up(name)).await?;
    Ok(())
}

/// Assigns an address to a link. An address that is already assigned counts as success.
pub async fn assign_address(shell: &Shell, dev: &str, address: Ipv4Addr, mask: u8) -> netslice_shell::Result<()> {
    shell.run_tolerant(addr_add(address, mask, dev), tolerate::ALREADY_EXISTS).await?;
    Ok(())
}

/// Brings a link down and deletes it. A missing link counts as success.
pub async fn remove_link(shell: &Shell, dev: &str) -> netslice_shell::Result<()> {
    shell.run_tolerant(link_set_down(dev), tolerate::NOT_FOUND).await?;
    shell.run_tolerant(link_delete(dev), tolerate::NOT_FOUND).await?;
    Ok(())
}

/// An entry of the neighbor table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Neighbor {
    pub ip: String,
    pub mac: Option<String>,
    pub state: Option<String>,
}

/// Parses `ip neigh show` output, e.g. `10.50.100.23 dev br-netslice lladdr aa:bb:.. REACHABLE`.
pub fn parse_neighbors(output: &str) -> Vec<Neighbor> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let ip = tokens.first()?.to_string();
            let mac = tokens
                .iter()
                .position(|t| *t == "lladdr")
                .and_then(|i| tokens.get(i + 1))
                .map(|m| m.to_ascii_lowercase());
            let state = tokens.last().filter(|t| t.chars().all(|c| c.is_ascii_uppercase())).map(|s| s.to_string());

            Some(Neighbor { ip, mac, state })
        })
        .collect()
}
