use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::warn;

use super::command::run_command;
use super::{ProbeDetail, ProbeKind, ProbeResult};

/// One TTL step. Both fields are `None` for a hop that did not answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hop {
    pub ttl: u32,
    pub address: Option<String>,
    pub latency_ms: Option<f64>,
}

impl Hop {
    pub fn responded(&self) -> bool {
        self.latency_ms.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceDetail {
    pub destination: String,
    pub hops: Vec<Hop>,
}

impl TraceDetail {
    pub fn final_latency_ms(&self) -> Option<f64> {
        self.hops.iter().rev().find_map(|hop| hop.latency_ms)
    }
}

pub async fn run(destination: &str, max_hops: u32, wait_secs: u64) -> ProbeResult {
    let max_arg = max_hops.to_string();
    let wait_arg = wait_secs.to_string();
    let budget = trace_budget(max_hops, wait_secs);
    let target = Some(destination.to_string());

    let output = match run_command(
        "traceroute",
        &["-n", "-q", "1", "-w", &wait_arg, "-m", &max_arg, destination],
        budget,
    )
    .await
    {
        Ok(output) => output,
        Err(err) => {
            warn!(destination, error = %err, "traceroute failed");
            return err.into_result(ProbeKind::PathTrace, target, "install traceroute");
        }
    };

    let hops = parse_traceroute(&output.stdout);
    if hops.is_empty() {
        return ProbeResult::failure(ProbeKind::PathTrace, target, output.error_summary());
    }

    let detail = TraceDetail {
        destination: destination.to_string(),
        hops,
    };
    ProbeResult::success(
        ProbeKind::PathTrace,
        target,
        detail.final_latency_ms(),
        ProbeDetail::PathTrace(detail),
    )
}

/// Parses `traceroute -n -q 1` output. Lines that do not start with a TTL
/// (the header, wrapped continuation lines) are skipped.
pub fn parse_traceroute(stdout: &str) -> Vec<Hop> {
    stdout.lines().filter_map(parse_hop_line).collect()
}

fn parse_hop_line(line: &str) -> Option<Hop> {
    let mut tokens = line.split_whitespace().peekable();
    let ttl = tokens.next()?.parse::<u32>().ok()?;

    let mut address = None;
    let mut latency_ms = None;
    while let Some(token) = tokens.next() {
        if token == "*" {
            continue;
        }
        if address.is_none() && token.parse::<IpAddr>().is_ok() {
            address = Some(token.to_string());
            continue;
        }
        if latency_ms.is_none() {
            let value = if let Some(stripped) = token.strip_suffix("ms") {
                stripped.parse::<f64>().ok()
            } else if tokens.peek() == Some(&"ms") {
                token.parse::<f64>().ok()
            } else {
                None
            };
            if value.is_some() {
                latency_ms = value;
            }
        }
    }

    // A latency without an address cannot be attributed to a hop.
    if address.is_none() {
        latency_ms = None;
    }
    Some(Hop {
        ttl,
        address,
        latency_ms,
    })
}

/// Worst case every hop waits the full per-hop timeout.
pub fn trace_budget(max_hops: u32, wait_secs: u64) -> Duration {
    Duration::from_secs(u64::from(max_hops) * wait_secs.max(1) + 5)
}
