//! An in-process stand-in for a Linux host.
//!
//! [`FakeHost`] implements [`CommandRunner`] by interpreting the subset of `ip`, `tc`,
//! `iptables`, `sysctl`, `iw`, `nmcli`, `docker`, `which`, `pkill` and `cat` that netslice
//! drives, against an in-memory model of links, addresses, queueing disciplines, firewall rules,
//! container networks and daemons. Failures are reported the way the real tools report them
//! (exit status plus stderr), so idempotency handling is exercised for real.
//!
//! Every command line and every daemon start/stop is recorded as a [`HostEvent`], which lets
//! tests assert on ordering. Faults can be injected with [`FakeHost::fail_on`],
//! [`FakeHost::hang_on`], [`FakeHost::with_missing_program`] and [`FakeHost::short_lived`].

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{CommandRunner, Daemon, Error, Output, Result, ShellCommand};

const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";

/// Something that happened on the fake host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A command line was executed.
    Command(String),
    DaemonStarted { program: String, pid: u32 },
    DaemonStopped { program: String, pid: u32 },
}

#[derive(Debug, Clone, Default)]
struct Link {
    kind: Option<String>,
    up: bool,
    addrs: Vec<String>,
    master: Option<String>,
    stats: [u64; 4],
}

#[derive(Debug, Clone)]
struct Qdisc {
    kind: String,
    handle: String,
    parent: Option<String>,
    params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    table: String,
    chain: String,
    spec: Vec<String>,
}

#[derive(Debug, Clone)]
struct Process {
    program: String,
    alive: bool,
}

#[derive(Debug, Clone, Default)]
struct Network {
    subnet: Option<String>,
    bridge: String,
    labels: Vec<String>,
}

#[derive(Debug, Clone)]
struct Container {
    network: String,
    labels: Vec<String>,
    ip: String,
}

#[derive(Debug, Default)]
struct HostState {
    events: Vec<HostEvent>,
    links: BTreeMap<String, Link>,
    qdiscs: BTreeMap<String, Vec<Qdisc>>,
    rules: Vec<Rule>,
    sysctl: BTreeMap<String, String>,
    processes: BTreeMap<u32, Process>,
    next_pid: u32,
    max_alive: BTreeMap<String, usize>,
    networks: BTreeMap<String, Network>,
    containers: BTreeMap<String, Container>,
    neighbors: BTreeMap<String, Vec<(String, String)>>,
    files: BTreeMap<String, String>,
    route_dev: Option<String>,
    wifi: Option<String>,
    ap_capable: bool,
    docker: bool,
    missing: BTreeSet<String>,
    failures: Vec<String>,
    hangs: Vec<String>,
    short_lived: BTreeSet<String>,
}

/// An in-memory host. Cloning shares the same host.
#[derive(Debug, Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    /// A host with `lo`, `eth0` (the default route) and `docker0`, a running container runtime
    /// and no wireless interface.
    pub fn new() -> Self {
        let mut state = HostState {
            next_pid: 1000,
            route_dev: Some("eth0".to_string()),
            docker: true,
            ..Default::default()
        };

        state.links.insert("lo".to_string(), Link { up: true, ..Default::default() });
        state.links.insert(
            "eth0".to_string(),
            Link { up: true, addrs: vec!["192.168.1.10/24".to_string()], ..Default::default() },
        );
        state.links.insert(
            "docker0".to_string(),
            Link {
                kind: Some("bridge".to_string()),
                up: true,
                addrs: vec!["172.17.0.1/16".to_string()],
                ..Default::default()
            },
        );
        state.networks.insert(
            "bridge".to_string(),
            Network {
                subnet: Some("172.17.0.0/16".to_string()),
                bridge: "docker0".to_string(),
                labels: Vec::new(),
            },
        );

        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Adds an AP-capable wireless interface.
    pub fn with_wifi(self, iface: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.links.insert(iface.to_string(), Link { up: true, ..Default::default() });
            state.wifi = Some(iface.to_string());
            state.ap_capable = true;
        }
        self
    }

    /// Makes the wireless interface report no AP support in `iw list`.
    pub fn without_ap_support(self) -> Self {
        self.state.lock().ap_capable = false;
        self
    }

    pub fn with_link(self, name: &str) -> Self {
        self.state.lock().links.insert(name.to_string(), Link { up: true, ..Default::default() });
        self
    }

    pub fn without_link(self, name: &str) -> Self {
        self.state.lock().links.remove(name);
        self
    }

    /// Makes the container runtime unreachable.
    pub fn without_docker(self) -> Self {
        self.state.lock().docker = false;
        self
    }

    /// Makes `program` unknown to `which` and to the command runner.
    pub fn with_missing_program(self, program: &str) -> Self {
        self.state.lock().missing.insert(program.to_string());
        self
    }

    /// Sets the device reported by `ip route get`, `None` for no default route.
    pub fn with_default_route(self, dev: Option<&str>) -> Self {
        self.state.lock().route_dev = dev.map(str::to_string);
        self
    }

    /// Every command line containing `pattern` exits with status 1.
    pub fn fail_on(&self, pattern: &str) {
        self.state.lock().failures.push(pattern.to_string());
    }

    /// Every command line containing `pattern` hangs until its timeout.
    pub fn hang_on(&self, pattern: &str) {
        self.state.lock().hangs.push(pattern.to_string());
    }

    /// Removes all injected failures and hangs.
    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.hangs.clear();
    }

    /// Daemons running `program` exit right after starting.
    pub fn short_lived(&self, program: &str) {
        self.state.lock().short_lived.insert(program.to_string());
    }

    pub fn add_neighbor(&self, dev: &str, ip: &str, mac: &str) {
        self.state
            .lock()
            .neighbors
            .entry(dev.to_string())
            .or_default()
            .push((ip.to_string(), mac.to_string()));
    }

    /// Sets the contents returned by `cat <path>`.
    pub fn write_file(&self, path: &str, contents: &str) {
        self.state.lock().files.insert(path.to_string(), contents.to_string());
    }

    /// Sets the `[rx_bytes, rx_packets, tx_bytes, tx_packets]` counters of a link.
    pub fn set_link_stats(&self, name: &str, stats: [u64; 4]) {
        if let Some(link) = self.state.lock().links.get_mut(name) {
            link.stats = stats;
        }
    }

    /// Every command line executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                HostEvent::Command(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every event so far, in order.
    pub fn events(&self) -> Vec<HostEvent> {
        self.state.lock().events.clone()
    }

    /// Returns the rules of `table`/`chain` in `iptables -S` form, without the `-A <chain>`.
    pub fn iptables_rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .rules
            .iter()
            .filter(|r| r.table == table && r.chain == chain)
            .map(|r| r.spec.join(" "))
            .collect()
    }

    /// Returns the output `tc qdisc show dev <dev>` would print.
    pub fn qdisc_show(&self, dev: &str) -> String {
        render_qdiscs(self.state.lock().qdiscs.get(dev).map(Vec::as_slice).unwrap_or_default())
    }

    pub fn has_qdisc(&self, dev: &str) -> bool {
        self.state.lock().qdiscs.get(dev).is_some_and(|q| !q.is_empty())
    }

    pub fn link_exists(&self, name: &str) -> bool {
        self.state.lock().links.contains_key(name)
    }

    pub fn link_is_up(&self, name: &str) -> bool {
        self.state.lock().links.get(name).is_some_and(|l| l.up)
    }

    pub fn link_addrs(&self, name: &str) -> Vec<String> {
        self.state.lock().links.get(name).map(|l| l.addrs.clone()).unwrap_or_default()
    }

    pub fn link_master(&self, name: &str) -> Option<String> {
        self.state.lock().links.get(name).and_then(|l| l.master.clone())
    }

    pub fn neighbors(&self, dev: &str) -> usize {
        self.state.lock().neighbors.get(dev).map_or(0, Vec::len)
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.state.lock().sysctl.get(key).cloned()
    }

    /// Number of live daemons running `program`.
    pub fn alive(&self, program: &str) -> usize {
        self.state.lock().alive(program)
    }

    /// The highest number of `program` daemons that were ever alive at the same time.
    pub fn max_concurrent(&self, program: &str) -> usize {
        self.state.lock().max_alive.get(program).copied().unwrap_or_default()
    }

    pub fn docker_networks(&self) -> Vec<String> {
        self.state.lock().networks.keys().cloned().collect()
    }

    pub fn containers(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn output(&self, cmd: &ShellCommand) -> Result<Output> {
        let line = cmd.to_string();
        let hangs = {
            let mut state = self.state.lock();
            state.events.push(HostEvent::Command(line.clone()));
            state.hangs.iter().any(|p| line.contains(p.as_str()))
        };

        if hangs {
            tokio::time::sleep(cmd.get_timeout()).await;
            return Err(Error::Timeout { command: line, after: cmd.get_timeout() });
        }

        let mut state = self.state.lock();
        if state.missing.contains(cmd.get_program()) {
            return Err(Error::Io {
                command: line,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        if state.failures.iter().any(|p| line.contains(p.as_str())) {
            return Ok(Output::failure(1, "injected failure"));
        }

        let args: Vec<&str> = cmd.get_args().iter().map(String::as_str).collect();
        Ok(state.execute(cmd.get_program(), &args))
    }

    async fn spawn(&self, cmd: &ShellCommand) -> Result<Box<dyn Daemon>> {
        let line = cmd.to_string();
        let mut state = self.state.lock();
        state.events.push(HostEvent::Command(line.clone()));

        if state.missing.contains(cmd.get_program()) {
            return Err(Error::Io {
                command: line,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        if state.failures.iter().any(|p| line.contains(p.as_str())) {
            return Err(Error::Io {
                command: line,
                source: std::io::Error::other("injected failure"),
            });
        }

        let program = cmd.get_program().to_string();
        let pid = state.next_pid;
        state.next_pid += 1;

        let alive = !state.short_lived.contains(&program);
        state.processes.insert(pid, Process { program: program.clone(), alive });
        state.events.push(HostEvent::DaemonStarted { program: program.clone(), pid });

        let now_alive = state.alive(&program);
        let max = state.max_alive.entry(program.clone()).or_default();
        *max = (*max).max(now_alive);

        if !alive {
            state.events.push(HostEvent::DaemonStopped { program: program.clone(), pid });
        }

        Ok(Box::new(FakeDaemon { host: self.clone(), program, pid }))
    }
}

#[derive(Debug)]
struct FakeDaemon {
    host: FakeHost,
    program: String,
    pid: u32,
}

#[async_trait]
impl Daemon for FakeDaemon {
    fn program(&self) -> &str {
        &self.program
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&mut self) -> bool {
        self.host.state.lock().processes.get(&self.pid).is_some_and(|p| p.alive)
    }

    async fn stop(&mut self, _grace: Duration) -> Result<()> {
        self.host.state.lock().kill(self.pid);
        Ok(())
    }
}

fn ok(stdout: impl Into<String>) -> Output {
    Output::success(stdout)
}

fn no_device(dev: &str) -> Output {
    Output::failure(1, format!("Cannot find device \"{dev}\"\n"))
}

/// Strips an optional leading `dev` keyword.
fn skip_dev<'a>(args: &'a [&'a str]) -> &'a [&'a str] {
    match args {
        ["dev", rest @ ..] => rest,
        _ => args,
    }
}

/// Returns the value following `flag`.
fn flag_value<'a>(args: &[&'a str], flag: &str) -> Option<&'a str> {
    args.iter().position(|a| *a == flag).and_then(|i| args.get(i + 1)).copied()
}

/// Formats a rate given to `tc` (e.g. `10000kbit`) the way `tc qdisc show` prints it.
fn render_rate(rate: &str) -> String {
    let lower = rate.to_ascii_lowercase();
    let (number, multiplier) = if let Some(n) = lower.strip_suffix("gbit") {
        (n, 1e9)
    } else if let Some(n) = lower.strip_suffix("mbit") {
        (n, 1e6)
    } else if let Some(n) = lower.strip_suffix("kbit") {
        (n, 1e3)
    } else if let Some(n) = lower.strip_suffix("bit") {
        (n, 1.0)
    } else {
        return rate.to_string();
    };

    let Ok(value) = number.parse::<f64>() else {
        return rate.to_string();
    };
    let bits = value * multiplier;

    if bits >= 1e9 {
        format!("{}Gbit", bits / 1e9)
    } else if bits >= 1e6 {
        format!("{}Mbit", bits / 1e6)
    } else if bits >= 1e3 {
        format!("{}Kbit", bits / 1e3)
    } else {
        format!("{bits}bit")
    }
}

fn render_qdiscs(qdiscs: &[Qdisc]) -> String {
    if qdiscs.is_empty() {
        return "qdisc noqueue 0: root refcnt 2 \n".to_string();
    }

    let mut out = String::new();
    for q in qdiscs {
        let position = match &q.parent {
            Some(parent) => format!("parent {parent}"),
            None => "root refcnt 2".to_string(),
        };

        let mut params = Vec::new();
        let mut iter = q.params.iter();
        while let Some(key) = iter.next() {
            let value = iter.next().map(String::as_str).unwrap_or_default();
            match (q.kind.as_str(), key.as_str()) {
                ("tbf", "rate") => params.push(format!("rate {}", render_rate(value))),
                ("tbf", "burst") => params.push(format!("burst {value}b")),
                ("tbf", "limit") => params.push(format!("limit {value}b")),
                ("netem", "delay") => params.push(format!("limit 1000 delay {value}")),
                (_, key) => params.push(format!("{key} {value}")),
            }
        }

        out.push_str(&format!("qdisc {} {} {} {}\n", q.kind, q.handle, position, params.join(" ")));
    }

    out
}

impl HostState {
    fn alive(&self, program: &str) -> usize {
        self.processes.values().filter(|p| p.alive && p.program == program).count()
    }

    fn kill(&mut self, pid: u32) {
        if let Some(process) = self.processes.get_mut(&pid) {
            if process.alive {
                process.alive = false;
                let program = process.program.clone();
                self.events.push(HostEvent::DaemonStopped { program, pid });
            }
        }
    }

    fn execute(&mut self, program: &str, args: &[&str]) -> Output {
        match program {
            "ip" => self.ip(args),
            "tc" => self.tc(args),
            "iptables" => self.iptables(args),
            "sysctl" => self.sysctl(args),
            "iw" => self.iw(args),
            "docker" => self.docker(args),
            "which" => match args.first() {
                Some(p) if !self.missing.contains(*p) => ok(format!("/usr/sbin/{p}\n")),
                _ => Output::failure(1, ""),
            },
            "pkill" => {
                let Some(target) = args.last() else {
                    return Output::failure(2, "pkill: no matching criteria specified");
                };
                let pids: Vec<u32> = self
                    .processes
                    .iter()
                    .filter(|(_, p)| p.alive && p.program == *target)
                    .map(|(pid, _)| *pid)
                    .collect();
                if pids.is_empty() {
                    return Output::failure(1, "");
                }
                for pid in pids {
                    self.kill(pid);
                }
                ok("")
            }
            "cat" => self.cat(args),
            _ => ok(""),
        }
    }

    fn cat(&self, args: &[&str]) -> Output {
        let Some(path) = args.first() else {
            return Output::failure(1, "cat: missing operand");
        };

        if *path == "/proc/net/dev" {
            let mut out = String::from(
                "Inter-|   Receive                                                |  Transmit\n \
                 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n",
            );
            for (name, link) in &self.links {
                let [rxb, rxp, txb, txp] = link.stats;
                out.push_str(&format!(
                    "{name:>6}: {rxb} {rxp} 0 0 0 0 0 0 {txb} {txp} 0 0 0 0 0 0\n"
                ));
            }
            return ok(out);
        }

        match self.files.get(*path) {
            Some(contents) => ok(contents.clone()),
            None => Output::failure(1, format!("cat: {path}: No such file or directory\n")),
        }
    }

    fn ip(&mut self, args: &[&str]) -> Output {
        match args {
            ["-o", "route", "get", dst] | ["route", "get", dst] => match &self.route_dev {
                Some(dev) => ok(format!(
                    "{dst} via 192.168.1.1 dev {dev} src 192.168.1.10 uid 0 \\    cache \n"
                )),
                None => Output::failure(2, "RTNETLINK answers: Network is unreachable\n"),
            },
            ["link", "show", rest @ ..] => {
                let Some(name) = skip_dev(rest).first() else {
                    let names: Vec<String> = self.links.keys().cloned().collect();
                    return ok(names.join("\n"));
                };
                match self.links.get(*name) {
                    Some(link) => ok(format!(
                        "3: {name}: <BROADCAST,MULTICAST{}> mtu 1500 state {}\n",
                        if link.up { ",UP" } else { "" },
                        if link.up { "UP" } else { "DOWN" }
                    )),
                    None => Output::failure(1, format!("Device \"{name}\" does not exist.\n")),
                }
            }
            ["link", "add", rest @ ..] => {
                let rest = match rest {
                    ["name", rest @ ..] => rest,
                    _ => rest,
                };
                let Some(name) = rest.first() else {
                    return Output::failure(1, "Not enough information: \"dev\" argument is required.");
                };
                if self.links.contains_key(*name) {
                    return Output::failure(2, "RTNETLINK answers: File exists\n");
                }
                let kind = flag_value(rest, "type").map(str::to_string);
                self.links.insert(name.to_string(), Link { kind, ..Default::default() });
                ok("")
            }
            ["link", "set", rest @ ..] => {
                let rest = skip_dev(rest);
                let Some(name) = rest.first() else {
                    return Output::failure(1, "Not enough information");
                };
                let master = flag_value(rest, "master");
                if let Some(master) = master {
                    if !self.links.contains_key(master) {
                        return no_device(master);
                    }
                }
                let Some(link) = self.links.get_mut(*name) else {
                    return no_device(name);
                };
                for arg in &rest[1..] {
                    match *arg {
                        "up" => link.up = true,
                        "down" => link.up = false,
                        "nomaster" => link.master = None,
                        _ => {}
                    }
                }
                if let Some(master) = master {
                    link.master = Some(master.to_string());
                }
                ok("")
            }
            ["link", "del" | "delete", rest @ ..] => {
                let Some(name) = skip_dev(rest).first() else {
                    return Output::failure(1, "Not enough information");
                };
                if self.links.remove(*name).is_none() {
                    return no_device(name);
                }
                self.qdiscs.remove(*name);
                for link in self.links.values_mut() {
                    if link.master.as_deref() == Some(*name) {
                        link.master = None;
                    }
                }
                ok("")
            }
            ["addr" | "address", "flush", rest @ ..] => {
                let Some(name) = skip_dev(rest).first() else {
                    return Output::failure(1, "Not enough information");
                };
                match self.links.get_mut(*name) {
                    Some(link) => {
                        link.addrs.clear();
                        ok("")
                    }
                    None => no_device(name),
                }
            }
            ["addr" | "address", "add", addr, "dev", name] => {
                let Some(link) = self.links.get_mut(*name) else {
                    return no_device(name);
                };
                if link.addrs.iter().any(|a| a == addr) {
                    return Output::failure(2, "RTNETLINK answers: File exists\n");
                }
                link.addrs.push(addr.to_string());
                ok("")
            }
            ["addr" | "address", "show", rest @ ..] => {
                let Some(name) = skip_dev(rest).first() else {
                    return ok("");
                };
                match self.links.get(*name) {
                    Some(link) => {
                        let mut out = format!("3: {name}: <BROADCAST,MULTICAST> mtu 1500\n");
                        for addr in &link.addrs {
                            out.push_str(&format!("    inet {addr} scope global {name}\n"));
                        }
                        ok(out)
                    }
                    None => Output::failure(1, format!("Device \"{name}\" does not exist.\n")),
                }
            }
            ["neigh", "show", rest @ ..] => {
                let dev = skip_dev(rest).first().copied();
                let mut out = String::new();
                for (d, entries) in &self.neighbors {
                    if dev.is_some_and(|dev| dev != d) {
                        continue;
                    }
                    for (ip, mac) in entries {
                        out.push_str(&format!("{ip} dev {d} lladdr {mac} REACHABLE\n"));
                    }
                }
                ok(out)
            }
            ["neigh", "flush", rest @ ..] => {
                if let Some(dev) = skip_dev(rest).first() {
                    self.neighbors.remove(*dev);
                }
                ok("")
            }
            ["neigh", "del", ip, "dev", dev] => {
                let entries = self.neighbors.entry(dev.to_string()).or_default();
                let before = entries.len();
                entries.retain(|(i, _)| i != ip);
                if entries.len() == before {
                    return Output::failure(2, "RTNETLINK answers: No such file or directory\n");
                }
                ok("")
            }
            _ => Output::failure(255, format!("Command \"{}\" is unknown, try \"ip help\".", args.join(" "))),
        }
    }

    fn tc(&mut self, args: &[&str]) -> Output {
        match args {
            ["qdisc", "show", "dev", dev] => {
                if !self.links.contains_key(*dev) {
                    return no_device(dev);
                }
                ok(render_qdiscs(self.qdiscs.get(*dev).map(Vec::as_slice).unwrap_or_default()))
            }
            ["qdisc", "del", "dev", dev, "root"] => {
                if !self.links.contains_key(*dev) {
                    return no_device(dev);
                }
                match self.qdiscs.get_mut(*dev) {
                    Some(q) if !q.is_empty() => {
                        q.clear();
                        ok("")
                    }
                    _ => Output::failure(2, "Error: Cannot delete qdisc with handle of zero.\n"),
                }
            }
            ["qdisc", "add", "dev", dev, rest @ ..] => {
                if !self.links.contains_key(*dev) {
                    return no_device(dev);
                }
                let (parent, rest) = match rest {
                    ["root", rest @ ..] => (None, rest),
                    ["parent", parent, rest @ ..] => (Some(parent.to_string()), rest),
                    _ => return Output::failure(1, "Error: parent or root expected"),
                };
                let (handle, rest) = match rest {
                    ["handle", handle, rest @ ..] => (handle.to_string(), rest),
                    _ => ("0:".to_string(), rest),
                };
                let Some((kind, params)) = rest.split_first() else {
                    return Output::failure(1, "Error: qdisc kind expected");
                };

                let existing = self.qdiscs.entry(dev.to_string()).or_default();
                match &parent {
                    None if existing.iter().any(|q| q.parent.is_none()) => {
                        return Output::failure(2, "Error: Exclusivity flag on, cannot modify.\n");
                    }
                    Some(parent) => {
                        let major = parent.split(':').next().unwrap_or_default();
                        if !existing.iter().any(|q| q.handle.trim_end_matches(':') == major) {
                            return Output::failure(2, "Error: Failed to find specified qdisc.\n");
                        }
                    }
                    None => {}
                }

                existing.push(Qdisc {
                    kind: kind.to_string(),
                    handle,
                    parent,
                    params: params.iter().map(|p| p.to_string()).collect(),
                });
                ok("")
            }
            _ => Output::failure(1, format!("Command \"{}\" is unknown, try \"tc help\".", args.join(" "))),
        }
    }

    fn iptables(&mut self, args: &[&str]) -> Output {
        let (table, rest) = match args {
            ["-t", table, rest @ ..] => (*table, rest),
            _ => ("filter", args),
        };
        let [op, chain, spec @ ..] = rest else {
            return Output::failure(2, "iptables: no command specified");
        };

        let rule = Rule {
            table: table.to_string(),
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
        };

        match *op {
            "-C" => {
                if self.rules.contains(&rule) {
                    ok("")
                } else {
                    Output::failure(1, BAD_RULE)
                }
            }
            "-A" => {
                self.rules.push(rule);
                ok("")
            }
            "-D" => match self.rules.iter().position(|r| *r == rule) {
                Some(i) => {
                    self.rules.remove(i);
                    ok("")
                }
                None => Output::failure(1, BAD_RULE),
            },
            "-S" => {
                let lines: Vec<String> = self
                    .rules
                    .iter()
                    .filter(|r| r.table == table && r.chain == *chain)
                    .map(|r| format!("-A {} {}", r.chain, r.spec.join(" ")))
                    .collect();
                ok(lines.join("\n"))
            }
            _ => Output::failure(2, format!("iptables: unknown option \"{op}\"")),
        }
    }

    fn sysctl(&mut self, args: &[&str]) -> Output {
        match args {
            ["-w", assignment] => match assignment.split_once('=') {
                Some((key, value)) => {
                    self.sysctl.insert(key.to_string(), value.to_string());
                    ok(format!("{key} = {value}\n"))
                }
                None => Output::failure(255, "sysctl: malformed setting"),
            },
            ["-n", key] => match self.sysctl.get(*key) {
                Some(value) => ok(format!("{value}\n")),
                None => ok("0\n"),
            },
            _ => Output::failure(255, "sysctl: unsupported invocation"),
        }
    }

    fn iw(&self, args: &[&str]) -> Output {
        let ap_running = self.alive("hostapd") > 0;
        match args {
            ["dev"] => match &self.wifi {
                Some(wifi) => ok(format!(
                    "phy#0\n\tInterface {wifi}\n\t\tifindex 3\n\t\ttype {}\n",
                    if ap_running { "AP" } else { "managed" }
                )),
                None => ok(""),
            },
            ["dev", dev, "info"] => match &self.wifi {
                Some(wifi) if wifi == dev => ok(format!(
                    "Interface {dev}\n\tifindex 3\n\ttype {}\n\twiphy 0\n",
                    if ap_running { "AP" } else { "managed" }
                )),
                _ => Output::failure(237, "command failed: No such device (-19)\n"),
            },
            ["list"] => {
                if self.wifi.is_none() {
                    return ok("");
                }
                let mut out = String::from(
                    "Wiphy phy0\n\tSupported interface modes:\n\t\t * IBSS\n\t\t * managed\n",
                );
                if self.ap_capable {
                    out.push_str("\t\t * AP\n\t\t * AP/VLAN\n");
                }
                out.push_str("\t\t * monitor\n");
                ok(out)
            }
            _ => Output::failure(1, "iw: unsupported invocation"),
        }
    }

    fn docker(&mut self, args: &[&str]) -> Output {
        if !self.docker {
            return Output::failure(
                1,
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?\n",
            );
        }

        // Flags that take a value. Everything else starting with '-' is a switch.
        const VALUED: &[&str] = &[
            "--driver", "--subnet", "--gateway", "--label", "-o", "--opt", "--name", "--network",
            "-e", "--env", "--filter", "--format", "-f", "-p",
        ];

        let mut values: Vec<(&str, &str)> = Vec::new();
        let mut positional: Vec<&str> = Vec::new();
        let (subcommand, rest) = match args {
            ["network", sub, rest @ ..] => (format!("network {sub}"), rest),
            [sub, rest @ ..] => (sub.to_string(), rest),
            [] => return Output::failure(1, "docker: no command"),
        };

        let mut i = 0;
        while i < rest.len() {
            let arg = rest[i];
            // `docker run` stops parsing flags at the image name.
            if subcommand == "run" && !positional.is_empty() {
                positional.push(arg);
            } else if VALUED.contains(&arg) && !(subcommand == "rm" && arg == "-f") {
                if let Some(value) = rest.get(i + 1) {
                    values.push((arg, value));
                }
                i += 1;
            } else if !arg.starts_with('-') {
                positional.push(arg);
            }
            i += 1;
        }

        let get = |flag: &str| values.iter().find(|(f, _)| *f == flag).map(|(_, v)| *v);
        let all = |flags: &[&str]| -> Vec<String> {
            values.iter().filter(|(f, _)| flags.contains(f)).map(|(_, v)| v.to_string()).collect()
        };
        let matches_filters = |labels: &[String]| {
            all(&["--filter"]).iter().all(|filter| match filter.strip_prefix("label=") {
                Some(label) => labels.iter().any(|l| l == label),
                None => true,
            })
        };

        match subcommand.as_str() {
            "info" | "version" => ok("24.0.7\n"),
            "network create" => {
                let Some(name) = positional.last() else {
                    return Output::failure(1, "\"docker network create\" requires exactly 1 argument.");
                };
                if self.networks.contains_key(*name) {
                    return Output::failure(
                        1,
                        format!("Error response from daemon: network with name {name} already exists\n"),
                    );
                }
                let bridge = all(&["-o", "--opt"])
                    .iter()
                    .find_map(|o| o.strip_prefix("com.docker.network.bridge.name=").map(str::to_string))
                    .unwrap_or_else(|| format!("br-{}", &format!("{:012x}", self.next_pid)[..12]));
                self.next_pid += 1;
                self.links.insert(
                    bridge.clone(),
                    Link { kind: Some("bridge".to_string()), up: true, ..Default::default() },
                );
                self.networks.insert(
                    name.to_string(),
                    Network {
                        subnet: get("--subnet").map(str::to_string),
                        bridge,
                        labels: all(&["--label"]),
                    },
                );
                ok(format!("{:064x}\n", self.next_pid))
            }
            "network rm" => {
                for name in &positional {
                    let Some(network) = self.networks.get(*name) else {
                        return Output::failure(1, format!("Error: No such network: {name}\n"));
                    };
                    if self.containers.values().any(|c| c.network == *name) {
                        return Output::failure(
                            1,
                            format!("Error response from daemon: error while removing network: network {name} has active endpoints\n"),
                        );
                    }
                    let bridge = network.bridge.clone();
                    self.networks.remove(*name);
                    self.links.remove(&bridge);
                    self.qdiscs.remove(&bridge);
                }
                ok(positional.join("\n"))
            }
            "network ls" => {
                let names: Vec<&String> = self
                    .networks
                    .iter()
                    .filter(|(_, n)| matches_filters(&n.labels))
                    .map(|(name, _)| name)
                    .collect();
                ok(names.iter().map(|n| format!("{n}\n")).collect::<String>())
            }
            "run" => {
                let Some(name) = get("--name") else {
                    return Output::failure(125, "docker: --name is required by this fake");
                };
                let network = get("--network").unwrap_or("bridge");
                if self.containers.contains_key(name) {
                    return Output::failure(
                        125,
                        format!("docker: Error response from daemon: Conflict. The container name \"/{name}\" is already in use.\n"),
                    );
                }
                let Some(net) = self.networks.get(network) else {
                    return Output::failure(
                        125,
                        format!("docker: Error response from daemon: network {network} not found.\n"),
                    );
                };
                let attached = self.containers.values().filter(|c| c.network == network).count();
                let base = net.subnet.as_deref().unwrap_or("172.17.0.0/16");
                let base = base.split('/').next().unwrap_or(base);
                let prefix: Vec<&str> = base.split('.').take(3).collect();
                let ip = format!("{}.{}", prefix.join("."), attached + 2);
                self.containers.insert(
                    name.to_string(),
                    Container { network: network.to_string(), labels: all(&["--label"]), ip },
                );
                ok(format!("{:064x}\n", self.containers.len()))
            }
            "ps" => {
                let names: Vec<&String> = self
                    .containers
                    .iter()
                    .filter(|(_, c)| matches_filters(&c.labels))
                    .map(|(name, _)| name)
                    .collect();
                ok(names.iter().map(|n| format!("{n}\n")).collect::<String>())
            }
            "rm" => {
                for name in &positional {
                    if self.containers.remove(*name).is_none() {
                        return Output::failure(1, format!("Error: No such container: {name}\n"));
                    }
                }
                ok(positional.join("\n"))
            }
            "inspect" => match positional.first().and_then(|n| self.containers.get(*n)) {
                Some(container) => ok(format!("{}\n", container.ip)),
                None => Output::failure(1, "Error: No such object\n"),
            },
            _ => ok(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shell;

    fn cmd(line: &str) -> ShellCommand {
        ShellCommand::by_str(line).unwrap()
    }

    #[tokio::test]
    async fn tc_round_trip() {
        let host = FakeHost::new();
        let shell = Shell::new(host.clone());

        shell
            .run(cmd("tc qdisc add dev eth0 root handle 1: tbf rate 10000kbit burst 15000 limit 140000"))
            .await
            .unwrap();
        shell.run(cmd("tc qdisc add dev eth0 parent 1:1 handle 10: netem delay 50ms")).await.unwrap();

        let show = shell.run(cmd("tc qdisc show dev eth0")).await.unwrap().stdout;
        assert_eq!(
            show,
            "qdisc tbf 1: root refcnt 2 rate 10Mbit burst 15000b limit 140000b\n\
             qdisc netem 10: parent 1:1 limit 1000 delay 50ms\n"
        );

        let again = shell.output(cmd("tc qdisc add dev eth0 root handle 1: tbf rate 1mbit")).await.unwrap();
        assert!(again.stderr.contains("Exclusivity flag on"));

        shell.run(cmd("tc qdisc del dev eth0 root")).await.unwrap();
        let del = shell.output(cmd("tc qdisc del dev eth0 root")).await.unwrap();
        assert!(del.stderr.contains("handle of zero"));
    }

    #[tokio::test]
    async fn daemons_are_tracked() {
        let host = FakeHost::new();
        let shell = Shell::new(host.clone());

        let mut first = shell.spawn(cmd("hostapd /tmp/a.conf")).await.unwrap();
        let mut second = shell.spawn(cmd("hostapd /tmp/b.conf")).await.unwrap();
        assert_eq!(host.alive("hostapd"), 2);
        assert_eq!(host.max_concurrent("hostapd"), 2);

        first.stop(Duration::ZERO).await.unwrap();
        assert!(!first.is_alive());
        assert!(second.is_alive());

        shell.run(cmd("pkill hostapd")).await.unwrap();
        assert!(!second.is_alive());
        assert_eq!(host.alive("hostapd"), 0);
    }

    #[tokio::test]
    async fn short_lived_daemons_exit() {
        let host = FakeHost::new();
        host.short_lived("dnsmasq");

        let mut daemon = Shell::new(host.clone()).spawn(cmd("dnsmasq -k")).await.unwrap();
        assert!(!daemon.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn hangs_time_out() {
        let host = FakeHost::new();
        host.hang_on("docker");

        let err = Shell::new(host).run(cmd("docker info")).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn docker_label_filters() {
        let host = FakeHost::new();
        let shell = Shell::new(host.clone());

        shell
            .run(cmd("docker network create --driver bridge --subnet 172.20.100.0/24 --label app=a -o com.docker.network.bridge.name=nsbr100 net-a"))
            .await
            .unwrap();
        shell.run(cmd("docker network create --label app=b net-b")).await.unwrap();
        assert!(host.link_exists("nsbr100"));

        let ls = shell.run(cmd("docker network ls -q --filter label=app=a")).await.unwrap();
        assert_eq!(ls.stdout, "net-a\n");

        shell.run(cmd("docker run -d --rm --name c1 --network net-a --label app=a alpine sleep 1")).await.unwrap();
        let ip = shell.run(cmd("docker inspect -f {{.Name}} c1")).await.unwrap();
        assert_eq!(ip.stdout.trim(), "172.20.100.2");

        let busy = shell.output(cmd("docker network rm net-a")).await.unwrap();
        assert!(busy.stderr.contains("active endpoints"));

        shell.run(cmd("docker rm -f c1")).await.unwrap();
        shell.run(cmd("docker network rm net-a")).await.unwrap();
        assert!(!host.link_exists("nsbr100"));
    }
}
