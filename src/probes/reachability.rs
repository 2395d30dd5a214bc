use serde::Serialize;
use std::fs;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::warn;

use super::command::{run_command, CommandError};
use super::{ProbeDetail, ProbeKind, ProbeResult};

const ROUTE_TABLE: &str = "/proc/net/route";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRole {
    Gateway,
    Upstream,
    Resolver,
    Custom,
}

#[derive(Debug, Clone)]
pub struct ReachTarget {
    pub role: TargetRole,
    /// `None` when the gateway could not be detected.
    pub address: Option<String>,
}

impl ReachTarget {
    pub fn new(role: TargetRole, address: Option<String>) -> Self {
        Self { role, address }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReachability {
    pub role: TargetRole,
    pub address: Option<String>,
    pub avg_rtt_ms: Option<f64>,
    pub loss_percent: Option<f64>,
    pub error: Option<String>,
}

impl TargetReachability {
    fn failed(target: ReachTarget, error: impl Into<String>) -> Self {
        Self {
            role: target.role,
            address: target.address,
            avg_rtt_ms: None,
            loss_percent: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReachabilityDetail {
    pub targets: Vec<TargetReachability>,
}

impl ReachabilityDetail {
    pub fn gateway_latency_ms(&self) -> Option<f64> {
        self.targets
            .iter()
            .filter(|t| matches!(t.role, TargetRole::Gateway | TargetRole::Custom))
            .find_map(|t| t.avg_rtt_ms)
    }

    /// Mean latency over the targets beyond the local gateway.
    pub fn internet_latency_ms(&self) -> Option<f64> {
        mean(
            self.targets
                .iter()
                .filter(|t| matches!(t.role, TargetRole::Upstream | TargetRole::Resolver))
                .filter_map(|t| t.avg_rtt_ms),
        )
    }

    pub fn mean_loss_percent(&self) -> Option<f64> {
        mean(self.targets.iter().filter_map(|t| t.loss_percent))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingSummary {
    pub loss_percent: Option<f64>,
    pub avg_rtt_ms: Option<f64>,
}

/// Pings every target concurrently. Succeeds when at least one target
/// answered.
pub async fn run(
    targets: Vec<ReachTarget>,
    count: u32,
    wait_secs: u64,
    label: Option<String>,
) -> ProbeResult {
    let mut tasks = JoinSet::new();
    for (index, target) in targets.into_iter().enumerate() {
        tasks.spawn(async move { (index, ping_target(target, count, wait_secs).await) });
    }

    let mut measured = Vec::new();
    let mut missing_ping = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(entry))) => measured.push((index, entry)),
            Ok((_, Err(program))) => missing_ping = Some(program),
            Err(err) => warn!(error = %err, "ping task failed"),
        }
    }

    if let Some(program) = missing_ping {
        return ProbeResult::unavailable(
            ProbeKind::Reachability,
            label,
            &program,
            "install iputils-ping",
        );
    }

    measured.sort_by_key(|(index, _)| *index);
    let detail = ReachabilityDetail {
        targets: measured.into_iter().map(|(_, entry)| entry).collect(),
    };

    let numeric = detail
        .gateway_latency_ms()
        .or_else(|| detail.internet_latency_ms());
    if detail.targets.iter().any(|t| t.avg_rtt_ms.is_some()) {
        ProbeResult::success(
            ProbeKind::Reachability,
            label,
            numeric,
            ProbeDetail::Reachability(detail),
        )
    } else {
        ProbeResult::failure_with_detail(
            ProbeKind::Reachability,
            label,
            "no target responded",
            ProbeDetail::Reachability(detail),
        )
    }
}

/// `Err` carries the program name when ping itself is missing.
async fn ping_target(
    target: ReachTarget,
    count: u32,
    wait_secs: u64,
) -> Result<TargetReachability, String> {
    let Some(address) = target.address.clone() else {
        return Ok(TargetReachability::failed(target, "no default gateway found"));
    };

    let count_arg = count.to_string();
    let wait_arg = wait_secs.to_string();
    let budget = ping_budget(count, wait_secs);
    let output = match run_command(
        "ping",
        &["-n", "-q", "-c", &count_arg, "-W", &wait_arg, &address],
        budget,
    )
    .await
    {
        Ok(output) => output,
        Err(CommandError::NotFound { program }) => return Err(program),
        Err(err) => {
            warn!(host = %address, error = %err, "ping failed");
            return Ok(TargetReachability::failed(target, err.to_string()));
        }
    };

    // Exit code 1 means no replies; the summary is still printed.
    let summary = parse_ping_summary(&output.stdout);
    if summary.loss_percent.is_none() {
        warn!(host = %address, exit_code = output.exit_code, "ping produced no summary");
        return Ok(TargetReachability::failed(target, output.error_summary()));
    }

    let error = match summary.avg_rtt_ms {
        Some(_) => None,
        None => Some("no reply".to_string()),
    };
    Ok(TargetReachability {
        role: target.role,
        address: target.address,
        avg_rtt_ms: summary.avg_rtt_ms,
        loss_percent: summary.loss_percent,
        error,
    })
}

/// Reads the loss and average RTT from ping's summary. Handles both the
/// iputils (`rtt min/avg/max/mdev`) and busybox (`round-trip min/avg/max`)
/// spellings.
pub fn parse_ping_summary(stdout: &str) -> PingSummary {
    let mut summary = PingSummary {
        loss_percent: None,
        avg_rtt_ms: None,
    };

    for line in stdout.lines() {
        if line.contains("packet loss") {
            summary.loss_percent = line
                .split(',')
                .find(|part| part.contains("packet loss"))
                .and_then(|part| part.split_whitespace().next())
                .and_then(|token| token.trim_end_matches('%').parse::<f64>().ok());
        } else if line.contains("min/avg/max") {
            summary.avg_rtt_ms = line
                .split('=')
                .nth(1)
                .and_then(|values| values.trim().split('/').nth(1))
                .and_then(|avg| avg.trim().parse::<f64>().ok());
        }
    }

    summary
}

/// Default IPv4 gateway from the kernel routing table.
pub fn detect_default_gateway() -> Option<Ipv4Addr> {
    match fs::read_to_string(ROUTE_TABLE) {
        Ok(table) => parse_default_gateway(&table),
        Err(err) => {
            warn!(path = ROUTE_TABLE, error = %err, "route table unreadable");
            None
        }
    }
}

/// Picks the default route (destination 0.0.0.0) with the lowest metric.
/// Addresses in the table are little-endian hex.
pub fn parse_default_gateway(table: &str) -> Option<Ipv4Addr> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 7 || cols[1] != "00000000" {
                return None;
            }
            let raw = u32::from_str_radix(cols[2], 16).ok()?;
            if raw == 0 {
                return None;
            }
            let metric = cols[6].parse::<u32>().unwrap_or(u32::MAX);
            Some((metric, Ipv4Addr::from(raw.to_le_bytes())))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, gateway)| gateway)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0_u32), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / f64::from(n))
}

/// Wall-clock bound for one `ping` run.
pub fn ping_budget(count: u32, wait_secs: u64) -> Duration {
    Duration::from_secs(u64::from(count) * wait_secs.max(1) + 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPUTILS: &str = "\
PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.

--- 8.8.8.8 ping statistics ---
5 packets transmitted, 5 received, 0% packet loss, time 4006ms
rtt min/avg/max/mdev = 19.234/19.820/20.512/0.443 ms
";

    const BUSYBOX_LOSSY: &str = "\
--- 192.168.1.1 ping statistics ---
5 packets transmitted, 4 packets received, 20% packet loss
round-trip min/avg/max = 1.101/3.402/7.950 ms
";

    const NO_REPLY: &str = "\
--- 10.9.9.9 ping statistics ---
5 packets transmitted, 0 received, 100% packet loss, time 4090ms
";

    #[test]
    fn parses_iputils_summary() {
        let summary = parse_ping_summary(IPUTILS);
        assert_eq!(summary.loss_percent, Some(0.0));
        assert_eq!(summary.avg_rtt_ms, Some(19.820));
    }

    #[test]
    fn parses_busybox_summary() {
        let summary = parse_ping_summary(BUSYBOX_LOSSY);
        assert_eq!(summary.loss_percent, Some(20.0));
        assert_eq!(summary.avg_rtt_ms, Some(3.402));
    }

    #[test]
    fn total_loss_has_no_rtt() {
        let summary = parse_ping_summary(NO_REPLY);
        assert_eq!(summary.loss_percent, Some(100.0));
        assert_eq!(summary.avg_rtt_ms, None);
    }

    #[test]
    fn default_gateway_is_decoded_from_route_table() {
        let table = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
wlan0\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0
eth0\t00000000\tFE01A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
wlan0\t0001A8C0\t00000000\t0001\t0\t0\t600\t00FFFFFF\t0\t0\t0
";
        assert_eq!(
            parse_default_gateway(table),
            Some(Ipv4Addr::new(192, 168, 1, 254))
        );
    }

    #[test]
    fn missing_default_route_yields_none() {
        let table = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
wlan0\t0001A8C0\t00000000\t0001\t0\t0\t600\t00FFFFFF\t0\t0\t0
";
        assert_eq!(parse_default_gateway(table), None);
    }

    #[tokio::test]
    async fn undetected_gateway_is_reported_per_target() {
        let entry = ping_target(ReachTarget::new(TargetRole::Gateway, None), 1, 1)
            .await
            .expect("no command is run");
        assert_eq!(entry.error.as_deref(), Some("no default gateway found"));
        assert_eq!(entry.avg_rtt_ms, None);
    }

    #[test]
    fn gateway_and_internet_latency_are_split_by_role() {
        let detail = ReachabilityDetail {
            targets: vec![
                TargetReachability {
                    role: TargetRole::Gateway,
                    address: Some("192.168.1.1".into()),
                    avg_rtt_ms: Some(3.0),
                    loss_percent: Some(0.0),
                    error: None,
                },
                TargetReachability {
                    role: TargetRole::Resolver,
                    address: Some("8.8.8.8".into()),
                    avg_rtt_ms: Some(20.0),
                    loss_percent: Some(0.0),
                    error: None,
                },
                TargetReachability {
                    role: TargetRole::Resolver,
                    address: Some("1.1.1.1".into()),
                    avg_rtt_ms: Some(30.0),
                    loss_percent: Some(20.0),
                    error: None,
                },
            ],
        };
        assert_eq!(detail.gateway_latency_ms(), Some(3.0));
        assert_eq!(detail.internet_latency_ms(), Some(25.0));
        let loss = detail.mean_loss_percent().expect("loss");
        assert!((loss - 20.0 / 3.0).abs() < 1e-9);
    }
}
