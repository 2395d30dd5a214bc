use serde::Serialize;
use std::fs;
use std::time::{Duration, Instant};
use sysinfo::{NetworkExt, NetworksExt, System, SystemExt};
use tracing::debug;

use super::{ProbeDetail, ProbeKind, ProbeResult};

const TCP_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];
const UDP_TABLES: [&str; 2] = ["/proc/net/udp", "/proc/net/udp6"];
const TCP_ESTABLISHED: &str = "01";
const TCP_LISTEN: &str = "0A";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counters {
    rx_bytes: u64,
    tx_bytes: u64,
    errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub tcp_established: u64,
    pub tcp_listening: u64,
    pub tcp_total: u64,
    pub udp_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputDetail {
    pub interface: String,
    pub sample_secs: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub interface_errors: u64,
    pub connections: Option<ConnectionStats>,
}

/// Samples interface byte counters twice and reports the rate in between.
/// Download rate is the numeric value.
pub async fn run(interface: &str, sample: Duration) -> ProbeResult {
    let target = Some(interface.to_string());
    let mut system = System::new();
    system.refresh_networks_list();
    let Some(before) = read_counters(&system, interface) else {
        return ProbeResult::failure(
            ProbeKind::Throughput,
            target,
            format!("interface {interface} not found"),
        );
    };
    let start = Instant::now();

    tokio::time::sleep(sample).await;

    system.refresh_networks();
    let Some(after) = read_counters(&system, interface) else {
        return ProbeResult::failure(
            ProbeKind::Throughput,
            target,
            format!("interface {interface} disappeared during sampling"),
        );
    };

    let secs = start.elapsed().as_secs_f64().max(f64::EPSILON);
    let rx_bytes = after.rx_bytes.saturating_sub(before.rx_bytes);
    let tx_bytes = after.tx_bytes.saturating_sub(before.tx_bytes);
    let connections = read_connection_stats();

    let detail = ThroughputDetail {
        interface: interface.to_string(),
        sample_secs: secs,
        download_mbps: to_mbps(rx_bytes, secs),
        upload_mbps: to_mbps(tx_bytes, secs),
        rx_bytes,
        tx_bytes,
        interface_errors: after.errors.saturating_sub(before.errors),
        connections,
    };
    let download = detail.download_mbps;
    ProbeResult::success(
        ProbeKind::Throughput,
        target,
        Some(download),
        ProbeDetail::Throughput(detail),
    )
}

fn read_counters(system: &System, interface: &str) -> Option<Counters> {
    system
        .networks()
        .iter()
        .find(|(name, _)| name.as_str() == interface)
        .map(|(_, data)| Counters {
            rx_bytes: data.total_received(),
            tx_bytes: data.total_transmitted(),
            errors: data.total_errors_on_received() + data.total_errors_on_transmitted(),
        })
}

pub fn to_mbps(bytes: u64, secs: f64) -> f64 {
    (bytes as f64 * 8.0) / secs / 1_000_000.0
}

fn read_connection_stats() -> Option<ConnectionStats> {
    let mut stats = ConnectionStats::default();
    let mut any = false;
    for path in TCP_TABLES {
        match fs::read_to_string(path) {
            Ok(table) => {
                any = true;
                tally_tcp(&table, &mut stats);
            }
            Err(err) => debug!(path, error = %err, "socket table unreadable"),
        }
    }
    for path in UDP_TABLES {
        match fs::read_to_string(path) {
            Ok(table) => {
                any = true;
                stats.udp_total += socket_rows(&table).count() as u64;
            }
            Err(err) => debug!(path, error = %err, "socket table unreadable"),
        }
    }
    any.then_some(stats)
}

fn socket_rows(table: &str) -> impl Iterator<Item = Vec<&str>> + '_ {
    table
        .lines()
        .skip(1)
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|cols| cols.len() > 3)
}

pub fn tally_tcp(table: &str, stats: &mut ConnectionStats) {
    for cols in socket_rows(table) {
        stats.tcp_total += 1;
        match cols[3] {
            TCP_ESTABLISHED => stats.tcp_established += 1,
            TCP_LISTEN => stats.tcp_listening += 1,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbps_conversion() {
        assert_eq!(to_mbps(1_250_000, 1.0), 10.0);
        assert_eq!(to_mbps(2_500_000, 2.0), 10.0);
        assert_eq!(to_mbps(0, 2.0), 0.0);
    }

    #[test]
    fn tcp_states_are_tallied() {
        let table = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1 1 0 100 0 0 10 0
   1: 0F02000A:A2B4 2E3AD58E:01BB 01 00000000:00000000 02:00000D2B 00000000  1000        0 2 2 0 20 4 30 10 -1
   2: 0F02000A:A2B6 2E3AD58E:01BB 06 00000000:00000000 03:00001780 00000000     0        0 0 3 0
";
        let mut stats = ConnectionStats::default();
        tally_tcp(table, &mut stats);
        assert_eq!(
            stats,
            ConnectionStats {
                tcp_established: 1,
                tcp_listening: 1,
                tcp_total: 3,
                udp_total: 0,
            }
        );
    }

    #[tokio::test]
    async fn unknown_interface_is_a_failure() {
        let result = run("netsleuth-nope0", Duration::from_millis(10)).await;
        assert!(!result.succeeded);
        assert_eq!(result.numeric_value, None);
        assert_eq!(
            result.error_message.as_deref(),
            Some("interface netsleuth-nope0 not found")
        );
    }
}
