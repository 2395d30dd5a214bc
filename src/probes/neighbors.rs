use serde::Serialize;
use std::fs;
use std::time::Duration;
use tracing::debug;

use super::command::run_command;
use super::{ProbeDetail, ProbeKind, ProbeResult};

const ARP_TABLE: &str = "/proc/net/arp";
const ARP_FLAG_COMPLETE: u32 = 0x2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub ip: String,
    pub mac: String,
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeighborDetail {
    pub source: &'static str,
    pub neighbors: Vec<Neighbor>,
}

/// Lists resolved link-layer neighbours, optionally limited to one
/// interface. Reads the kernel table and falls back to `arp -n`.
pub async fn run(interface: Option<&str>, limit: Duration) -> ProbeResult {
    let target = interface.map(str::to_string);
    let (source, mut neighbors) = match fs::read_to_string(ARP_TABLE) {
        Ok(table) => ("proc", parse_proc_arp(&table)),
        Err(err) => {
            debug!(path = ARP_TABLE, error = %err, "arp table unreadable, trying arp -n");
            match run_command("arp", &["-n"], limit).await {
                Ok(output) if output.success() => ("arp", parse_arp_command(&output.stdout)),
                Ok(output) => {
                    return ProbeResult::failure(
                        ProbeKind::NeighborScan,
                        target,
                        output.error_summary(),
                    )
                }
                Err(err) => return err.into_result(ProbeKind::NeighborScan, target, "install net-tools"),
            }
        }
    };

    if let Some(interface) = interface {
        neighbors.retain(|n| n.interface.as_deref() == Some(interface));
    }
    let count = neighbors.len() as f64;
    ProbeResult::success(
        ProbeKind::NeighborScan,
        target,
        Some(count),
        ProbeDetail::NeighborScan(NeighborDetail { source, neighbors }),
    )
}

/// Parses `/proc/net/arp`, keeping only complete entries.
pub fn parse_proc_arp(table: &str) -> Vec<Neighbor> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 6 {
                return None;
            }
            let flags = u32::from_str_radix(cols[2].trim_start_matches("0x"), 16).ok()?;
            if flags & ARP_FLAG_COMPLETE == 0 || cols[3] == "00:00:00:00:00:00" {
                return None;
            }
            Some(Neighbor {
                ip: cols[0].to_string(),
                mac: cols[3].to_ascii_lowercase(),
                interface: Some(cols[5].to_string()),
            })
        })
        .collect()
}

/// Parses net-tools `arp -n` output.
pub fn parse_arp_command(stdout: &str) -> Vec<Neighbor> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            // Incomplete rows carry "(incomplete)" in place of the MAC.
            if cols.len() < 3 || !cols[2].contains(':') {
                return None;
            }
            Some(Neighbor {
                ip: cols[0].to_string(),
                mac: cols[2].to_ascii_lowercase(),
                interface: cols.last().map(|s| s.to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_table_skips_incomplete_entries() {
        let table = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         AA:BB:CC:DD:EE:FF     *        wlan0
192.168.1.77     0x1         0x0         00:00:00:00:00:00     *        wlan0
10.0.0.5         0x1         0x2         11:22:33:44:55:66     *        eth0
";
        let neighbors = parse_proc_arp(table);
        assert_eq!(neighbors.len(), 2);
        assert_eq!(
            neighbors[0],
            Neighbor {
                ip: "192.168.1.1".into(),
                mac: "aa:bb:cc:dd:ee:ff".into(),
                interface: Some("wlan0".into()),
            }
        );
        assert_eq!(neighbors[1].interface.as_deref(), Some("eth0"));
    }

    #[test]
    fn arp_command_output_is_parsed() {
        let out = "\
Address                  HWtype  HWaddress           Flags Mask            Iface
192.168.1.1              ether   aa:bb:cc:dd:ee:ff   C                     wlan0
192.168.1.9                      (incomplete)                              wlan0
";
        let neighbors = parse_arp_command(out);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(neighbors[0].interface.as_deref(), Some("wlan0"));
    }
}
