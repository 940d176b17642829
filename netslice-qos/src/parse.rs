//! Parsing of `tc qdisc show` output.

use serde::Serialize;

/// Qdisc kinds the kernel installs by itself. Their presence does not mean an interface is
/// shaped.
const DEFAULT_KINDS: &[&str] = &["noqueue", "pfifo_fast", "fq_codel", "mq", "fq", "pfifo"];

/// One `qdisc ...` line of `tc qdisc show`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QdiscEntry {
    pub kind: String,
    pub handle: String,
    /// `None` for the root qdisc.
    pub parent: Option<String>,
    /// The `rate` parameter normalised to Mbit/s, if present and parseable.
    pub rate_mbit_s: Option<f64>,
    /// The `delay` parameter normalised to ms, if present and parseable.
    pub delay_ms: Option<f64>,
    /// Set if a `rate` or `delay` parameter was present but could not be parsed.
    pub unparsed: Vec<String>,
}

impl QdiscEntry {
    /// Returns `true` for qdiscs the kernel installs by default.
    pub fn is_default(&self) -> bool {
        DEFAULT_KINDS.contains(&self.kind.as_str()) || self.handle == "0:"
    }
}

/// Parses the output of `tc qdisc show`, skipping lines that do not describe a qdisc.
pub fn parse_qdisc_show(output: &str) -> Vec<QdiscEntry> {
    output.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<QdiscEntry> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let ["qdisc", kind, handle, rest @ ..] = tokens.as_slice() else {
        return None;
    };

    let parent = match rest {
        ["parent", parent, ..] => Some(parent.to_string()),
        _ => None,
    };

    let mut entry = QdiscEntry {
        kind: kind.to_string(),
        handle: handle.to_string(),
        parent,
        rate_mbit_s: None,
        delay_ms: None,
        unparsed: Vec::new(),
    };

    let value_after = |key: &str| rest.iter().position(|t| *t == key).map(|i| rest.get(i + 1).copied());

    match value_after("rate") {
        Some(Some(token)) => match parse_rate_mbit(token) {
            Some(rate) => entry.rate_mbit_s = Some(rate),
            None => entry.unparsed.push(format!("rate {token}")),
        },
        Some(None) => entry.unparsed.push("rate".to_string()),
        None => {}
    }

    match value_after("delay") {
        Some(Some(token)) => match parse_time_ms(token) {
            Some(delay) => entry.delay_ms = Some(delay),
            None => entry.unparsed.push(format!("delay {token}")),
        },
        Some(None) => entry.unparsed.push("delay".to_string()),
        None => {}
    }

    Some(entry)
}

/// Parses a `tc` rate such as `10Mbit`, `500Kbit`, `1Gbit` or `800bit` into Mbit/s.
pub fn parse_rate_mbit(token: &str) -> Option<f64> {
    let lower = token.to_ascii_lowercase();
    let (number, bits_per_unit) = if let Some(n) = lower.strip_suffix("gbit") {
        (n, 1e9)
    } else if let Some(n) = lower.strip_suffix("mbit") {
        (n, 1e6)
    } else if let Some(n) = lower.strip_suffix("kbit") {
        (n, 1e3)
    } else if let Some(n) = lower.strip_suffix("bit") {
        (n, 1.0)
    } else {
        return None;
    };

    number.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v * bits_per_unit / 1e6)
}

/// Parses a `tc` time such as `50ms`, `50.0ms`, `1s` or `500us` into milliseconds.
pub fn parse_time_ms(token: &str) -> Option<f64> {
    let (number, us_per_unit) = if let Some(n) = token.strip_suffix("us") {
        (n, 1.0)
    } else if let Some(n) = token.strip_suffix("ms") {
        (n, 1e3)
    } else if let Some(n) = token.strip_suffix('s') {
        (n, 1e6)
    } else {
        return None;
    };

    number.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v * us_per_unit / 1e3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tbf_and_netem() {
        let output = "qdisc tbf 1: root refcnt 2 rate 10Mbit burst 156250b limit 406250b\n\
                      qdisc netem 10: parent 1:1 limit 1000 delay 50ms\n";
        let entries = parse_qdisc_show(output);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "tbf");
        assert_eq!(entries[0].parent, None);
        assert_eq!(entries[0].rate_mbit_s, Some(10.0));
        assert!(!entries[0].is_default());

        assert_eq!(entries[1].kind, "netem");
        assert_eq!(entries[1].parent.as_deref(), Some("1:1"));
        assert_eq!(entries[1].delay_ms, Some(50.0));
    }

    #[test]
    fn default_qdiscs_are_recognised() {
        let entries = parse_qdisc_show("qdisc noqueue 0: root refcnt 2 \n");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_default());

        let entries = parse_qdisc_show(
            "qdisc mq 0: root \nqdisc fq_codel 0: parent :1 limit 10240p flows 1024 quantum 1514\n",
        );
        assert!(entries.iter().all(QdiscEntry::is_default));
    }

    #[test]
    fn rates_are_normalised() {
        assert_eq!(parse_rate_mbit("10Mbit"), Some(10.0));
        assert_eq!(parse_rate_mbit("1Gbit"), Some(1_000.0));
        assert_eq!(parse_rate_mbit("800bit"), Some(0.0008));
        assert_eq!(parse_rate_mbit("100Kbit"), Some(0.1));
        assert_eq!(parse_rate_mbit("1.5Mbit"), Some(1.5));
        assert_eq!(parse_rate_mbit("fast"), None);
        assert_eq!(parse_rate_mbit("10Mbps"), None);
    }

    #[test]
    fn times_are_normalised() {
        assert_eq!(parse_time_ms("50ms"), Some(50.0));
        assert_eq!(parse_time_ms("50.0ms"), Some(50.0));
        assert_eq!(parse_time_ms("1s"), Some(1_000.0));
        assert_eq!(parse_time_ms("500us"), Some(0.5));
        assert_eq!(parse_time_ms("soon"), None);
    }

    #[test]
    fn unparseable_values_are_reported() {
        let entries = parse_qdisc_show("qdisc tbf 1: root refcnt 2 rate ???\n");
        assert_eq!(entries[0].rate_mbit_s, None);
        assert_eq!(entries[0].unparsed, vec!["rate ???".to_string()]);
    }

    #[test]
    fn ignores_noise() {
        assert!(parse_qdisc_show("").is_empty());
        assert!(parse_qdisc_show("Cannot find device \"eth9\"\n").is_empty());
    }
}
