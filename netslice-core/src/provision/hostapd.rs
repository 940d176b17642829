//! Configuration files for the access point daemons, and the DHCP lease file format.

use std::{fmt::Write, net::Ipv4Addr, path::Path};

use super::ConnectedDevice;

/// `hostapd` configuration for a WPA2-PSK access point attached to a bridge.
#[derive(Debug, Clone)]
pub struct HostapdConfig<'a> {
    pub interface: &'a str,
    pub bridge: &'a str,
    pub ssid: &'a str,
    pub passphrase: &'a str,
    pub country_code: &'a str,
    pub channel: u8,
    pub accept_mac_file: &'a Path,
}

impl HostapdConfig<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut line = |key: &str, value: &dyn std::fmt::Display| {
            let _ = writeln!(out, "{key}={value}");
        };

        line("interface", &self.interface);
        line("driver", &"nl80211");
        line("bridge", &self.bridge);
        line("country_code", &self.country_code);
        line("ieee80211d", &1);
        line("ieee80211n", &1);
        line("ssid", &self.ssid);
        line("hw_mode", &"g");
        line("channel", &self.channel);
        line("wmm_enabled", &1);
        line("auth_algs", &1);
        line("ignore_broadcast_ssid", &0);
        line("wpa", &2);
        line("wpa_passphrase", &self.passphrase);
        line("wpa_key_mgmt", &"WPA-PSK");
        line("rsn_pairwise", &"CCMP");
        line("macaddr_acl", &0);
        line("accept_mac_file", &self.accept_mac_file.display());

        out
    }
}

/// `dnsmasq` configuration serving DHCP and DNS on the AP bridge.
#[derive(Debug, Clone)]
pub struct DnsmasqConfig<'a> {
    pub bridge: &'a str,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_servers: &'a [String],
    pub lease_hours: u32,
    pub lease_file: &'a Path,
}

impl DnsmasqConfig<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "interface={}", self.bridge);
        for flag in ["bind-interfaces", "dhcp-authoritative", "domain-needed", "bogus-priv", "no-resolv"] {
            let _ = writeln!(out, "{flag}");
        }
        let _ = writeln!(
            out,
            "dhcp-range={},{},255.255.255.0,{}h",
            self.range_start, self.range_end, self.lease_hours
        );
        let _ = writeln!(out, "dhcp-option=3,{}", self.gateway);
        if !self.dns_servers.is_empty() {
            let _ = writeln!(out, "dhcp-option=6,{}", self.dns_servers.join(","));
        }
        for server in self.dns_servers {
            let _ = writeln!(out, "server={server}");
        }
        let _ = writeln!(out, "dhcp-leasefile={}", self.lease_file.display());

        out
    }
}

/// Parses a dnsmasq lease file: `<expiry> <mac> <ip> <hostname> <client-id>` per line, with
/// `*` for an unknown hostname.
pub fn parse_leases(contents: &str) -> Vec<ConnectedDevice> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let expiry = fields.next()?.parse::<u64>().ok();
            let mac = fields.next()?.to_ascii_lowercase();
            let ip = fields.next()?.to_string();
            let hostname = fields.next().filter(|h| *h != "*").map(str::to_string);

            Some(ConnectedDevice { mac, ip, hostname, lease_expires: expiry.filter(|e| *e != 0) })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn hostapd_config() {
        let accept = PathBuf::from("/tmp/netslice/hostapd_test.accept");
        let config = HostapdConfig {
            interface: "wlan0",
            bridge: "br-netslice",
            ssid: "NetSlice_Guest_0badf00d",
            passphrase: "s3cretpass12",
            country_code: "US",
            channel: 6,
            accept_mac_file: &accept,
        }
        .render();

        assert!(config.starts_with("interface=wlan0\ndriver=nl80211\nbridge=br-netslice\n"));
        assert!(config.contains("ssid=NetSlice_Guest_0badf00d\n"));
        assert!(config.contains("wpa=2\nwpa_passphrase=s3cretpass12\nwpa_key_mgmt=WPA-PSK\nrsn_pairwise=CCMP\n"));
        assert!(config.ends_with("macaddr_acl=0\naccept_mac_file=/tmp/netslice/hostapd_test.accept\n"));
    }

    #[test]
    fn dnsmasq_config() {
        let leases = PathBuf::from("/tmp/netslice/dnsmasq_br-netslice.leases");
        let dns = vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()];
        let config = DnsmasqConfig {
            bridge: "br-netslice",
            range_start: Ipv4Addr::new(10, 50, 100, 10),
            range_end: Ipv4Addr::new(10, 50, 100, 200),
            gateway: Ipv4Addr::new(10, 50, 100, 1),
            dns_servers: &dns,
            lease_hours: 12,
            lease_file: &leases,
        }
        .render();

        assert_eq!(
            config,
            "interface=br-netslice\n\
             bind-interfaces\n\
             dhcp-authoritative\n\
             domain-needed\n\
             bogus-priv\n\
             no-resolv\n\
             dhcp-range=10.50.100.10,10.50.100.200,255.255.255.0,12h\n\
             dhcp-option=3,10.50.100.1\n\
             dhcp-option=6,8.8.8.8,8.8.4.4\n\
             server=8.8.8.8\n\
             server=8.8.4.4\n\
             dhcp-leasefile=/tmp/netslice/dnsmasq_br-netslice.leases\n"
        );
    }

    #[test]
    fn leases() {
        let devices = parse_leases(
            "1718000000 AA:BB:CC:00:11:22 10.50.100.23 phone 01:aa:bb:cc:00:11:22\n\
             0 de:ad:be:ef:00:01 10.50.100.24 * *\n\
             garbage\n",
        );

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].mac, "aa:bb:cc:00:11:22");
        assert_eq!(devices[0].hostname.as_deref(), Some("phone"));
        assert_eq!(devices[0].lease_expires, Some(1_718_000_000));
        assert_eq!(devices[1].hostname, None);
        assert_eq!(devices[1].lease_expires, None);
    }
}
