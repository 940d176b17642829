//! Interface traffic counters from `/proc/net/dev`.

use netslice_shell::{timeouts, Shell, ShellCommand};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Parses the counters of `dev` out of `/proc/net/dev`.
pub fn parse_proc_net_dev(contents: &str, dev: &str) -> Option<InterfaceStats> {
    contents.lines().find_map(|line| {
        let (name, counters) = line.split_once(':')?;
        if name.trim() != dev {
            return None;
        }

        let fields: Vec<u64> = counters.split_whitespace().filter_map(|f| f.parse().ok()).collect();
        if fields.len() < 10 {
            return None;
        }

        Some(InterfaceStats {
            rx_bytes: fields[0],
            rx_packets: fields[1],
            tx_bytes: fields[8],
            tx_packets: fields[9],
        })
    })
}

/// Reads the counters of `dev`. Returns `None` if the interface is not listed.
pub async fn read(shell: &Shell, dev: &str) -> netslice_shell::Result<Option<InterfaceStats>> {
    let output = shell.run(ShellCommand::new("cat").arg("/proc/net/dev").timeout(timeouts::QUICK)).await?;
    Ok(parse_proc_net_dev(&output.stdout, dev))
}

#[cfg(test)]
mod tests {
    use netslice_shell::testing::FakeHost;

    use super::*;

    const SAMPLE: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     789    0    0    0     0          0         0   123456     789    0    0    0     0       0          0
br-netslice: 9876543 6543 0 0 0 0 0 12 1234567 4321 0 0 0 0 0 0
";

    #[test]
    fn parses_counters() {
        let stats = parse_proc_net_dev(SAMPLE, "br-netslice").unwrap();
        assert_eq!(
            stats,
            InterfaceStats { rx_bytes: 9_876_543, rx_packets: 6_543, tx_bytes: 1_234_567, tx_packets: 4_321 }
        );
        assert_eq!(parse_proc_net_dev(SAMPLE, "lo").unwrap().rx_packets, 789);
        assert_eq!(parse_proc_net_dev(SAMPLE, "wlan0"), None);
    }

    #[tokio::test]
    async fn reads_through_shell() {
        let host = FakeHost::new();
        host.set_link_stats("docker0", [10, 1, 20, 2]);

        let stats = read(&Shell::new(host), "docker0").await.unwrap().unwrap();
        assert_eq!(stats.tx_bytes, 20);
    }
}
