//! Kernel network parameters, read and written with the `sysctl` tool.
//!
//! Going through the tool rather than `/proc/sys` directly lets the writes run with the
//! privileges of the configured [`Shell`].
//!
//! ```no_run
//! use netslice_net::sysctl::{self, Ip, Protocol};
//! # async fn f(shell: netslice_shell::Shell) -> netslice_shell::Result<()> {
//! sysctl::write(&shell, Ip::Forwarding, Protocol::V4, "1").await?;
//! assert_eq!(sysctl::read(&shell, Ip::Forwarding, Protocol::V4).await?, "1");
//! # Ok(())
//! # }
//! ```

use netslice_shell::{Shell, ShellCommand};

/// IP protocol version for sysctl keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// IPv4 (`net.ipv4.*`)
    #[default]
    V4,
    /// IPv6 (`net.ipv6.*`)
    V6,
}

/// Trait for sysctl parameters that can be read/written.
pub trait SysctlParam {
    /// Returns the dotted sysctl key for the given protocol.
    fn key(&self, protocol: Protocol) -> String;
}

/// General IP parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ip {
    /// Forward packets between interfaces. Required for NAT towards the upstream interface.
    Forwarding,
}

impl SysctlParam for Ip {
    fn key(&self, protocol: Protocol) -> String {
        match (self, protocol) {
            (Self::Forwarding, Protocol::V4) => "net.ipv4.ip_forward".to_string(),
            (Self::Forwarding, Protocol::V6) => "net.ipv6.conf.all.forwarding".to_string(),
        }
    }
}

/// Builds the command writing `value` to `param`.
pub fn write_cmd(param: impl SysctlParam, protocol: Protocol, value: &str) -> ShellCommand {
    ShellCommand::new("sysctl").args(["-w", &format!("{}={value}", param.key(protocol))])
}

/// Writes `value` to `param`.
pub async fn write(
    shell: &Shell,
    param: impl SysctlParam,
    protocol: Protocol,
    value: &str,
) -> netslice_shell::Result<()> {
    shell.run(write_cmd(param, protocol, value)).await?;
    Ok(())
}

/// Reads the current value of `param`.
pub async fn read(shell: &Shell, param: impl SysctlParam, protocol: Protocol) -> netslice_shell::Result<String> {
    let output = shell.run(ShellCommand::new("sysctl").args(["-n", &param.key(protocol)])).await?;
    Ok(output.stdout.trim().to_string())
}

#[cfg(test)]
mod tests {
    use netslice_shell::testing::FakeHost;

    use super::*;

    #[test]
    fn test_write_cmd() {
        assert_eq!(write_cmd(Ip::Forwarding, Protocol::V4, "1").to_string(), "sysctl -w net.ipv4.ip_forward=1");
        assert_eq!(
            write_cmd(Ip::Forwarding, Protocol::V6, "0").to_string(),
            "sysctl -w net.ipv6.conf.all.forwarding=0"
        );
    }

    #[tokio::test]
    async fn write_then_read() {
        let host = FakeHost::new();
        let shell = Shell::new(host.clone());

        write(&shell, Ip::Forwarding, Protocol::V4, "1").await.unwrap();
        assert_eq!(read(&shell, Ip::Forwarding, Protocol::V4).await.unwrap(), "1");
        assert_eq!(host.sysctl("net.ipv4.ip_forward").as_deref(), Some("1"));
    }
}
