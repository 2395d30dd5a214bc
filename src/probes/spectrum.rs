use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::command::run_command;
use super::{ProbeDetail, ProbeKind, ProbeResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WifiNetwork {
    /// `None` for hidden networks.
    pub ssid: Option<String>,
    pub bssid: Option<String>,
    pub channel: Option<u32>,
    pub signal_dbm: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkInfo {
    pub ssid: Option<String>,
    pub frequency_mhz: Option<u32>,
    pub channel: Option<u32>,
    pub signal_dbm: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpectrumDetail {
    pub interface: String,
    pub networks: Vec<WifiNetwork>,
    pub current_channel: Option<u32>,
    pub current_signal_dbm: Option<f64>,
    pub link_quality: Option<&'static str>,
}

/// Scans neighbouring networks and reads the current association.
pub async fn run(interface: &str, limit: Duration) -> ProbeResult {
    let target = Some(interface.to_string());
    let scan_args = [interface, "scan"];
    let link_args = ["dev", interface, "link"];
    let (scan, link) = tokio::join!(
        run_command("iwlist", &scan_args, limit),
        run_command("iw", &link_args, limit),
    );

    let scan = match scan {
        Ok(output) if output.success() => output,
        Ok(output) => {
            let reason = output.error_summary();
            warn!(interface, error = %reason, "wireless scan failed");
            return ProbeResult::failure(
                ProbeKind::SpectrumScan,
                target,
                format!("wireless scan failed: {reason}"),
            );
        }
        Err(err) => {
            warn!(interface, error = %err, "wireless scan failed");
            return err.into_result(ProbeKind::SpectrumScan, target, "install wireless-tools");
        }
    };

    let link = match link {
        Ok(output) if output.success() => parse_iw_link(&output.stdout),
        Ok(output) => {
            debug!(interface, error = %output.error_summary(), "link query failed");
            LinkInfo::default()
        }
        Err(err) => {
            debug!(interface, error = %err, "link query unavailable");
            LinkInfo::default()
        }
    };

    let networks = parse_iwlist_scan(&scan.stdout);
    let current_channel = link.channel.or_else(|| {
        // Without iw, fall back to the scan entry for the associated SSID.
        let ssid = link.ssid.as_ref()?;
        networks
            .iter()
            .find(|n| n.ssid.as_ref() == Some(ssid))
            .and_then(|n| n.channel)
    });
    let detail = SpectrumDetail {
        interface: interface.to_string(),
        networks,
        current_channel,
        current_signal_dbm: link.signal_dbm,
        link_quality: link.signal_dbm.map(signal_quality_label),
    };
    ProbeResult::success(
        ProbeKind::SpectrumScan,
        target,
        link.signal_dbm,
        ProbeDetail::SpectrumScan(detail),
    )
}

/// Parses `iwlist <if> scan`. Each `Cell NN - Address:` line opens a new
/// network.
pub fn parse_iwlist_scan(stdout: &str) -> Vec<WifiNetwork> {
    let mut networks = Vec::new();
    let mut current: Option<WifiNetwork> = None;

    for raw in stdout.lines() {
        let line = raw.trim();
        if line.starts_with("Cell ") {
            if let Some(done) = current.take() {
                networks.push(done);
            }
            let bssid = line
                .split("Address:")
                .nth(1)
                .map(|addr| addr.trim().to_ascii_lowercase());
            current = Some(WifiNetwork {
                ssid: None,
                bssid,
                channel: None,
                signal_dbm: None,
            });
            continue;
        }

        let Some(network) = current.as_mut() else {
            continue;
        };
        if let Some(rest) = line.strip_prefix("Channel:") {
            network.channel = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("Frequency:") {
            if network.channel.is_none() {
                network.channel = rest
                    .split("(Channel")
                    .nth(1)
                    .and_then(|tail| tail.trim().trim_end_matches(')').trim().parse().ok());
            }
        } else if let Some(rest) = line.strip_prefix("ESSID:") {
            let ssid = rest.trim().trim_matches('"');
            network.ssid = (!ssid.is_empty()).then(|| ssid.to_string());
        } else if let Some(pos) = line.find("Signal level=") {
            let value = &line[pos + "Signal level=".len()..];
            network.signal_dbm = value
                .split_whitespace()
                .next()
                .and_then(|v| v.split('/').next())
                .and_then(|v| v.parse().ok());
        }
    }

    if let Some(done) = current {
        networks.push(done);
    }
    networks
}

/// Parses `iw dev <if> link`. Returns an empty record when not associated.
pub fn parse_iw_link(stdout: &str) -> LinkInfo {
    let mut info = LinkInfo::default();
    for raw in stdout.lines() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix("SSID:") {
            info.ssid = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("freq:") {
            info.frequency_mhz = rest
                .trim()
                .parse::<f64>()
                .ok()
                .map(|mhz| mhz.round() as u32);
        } else if let Some(rest) = line.strip_prefix("signal:") {
            info.signal_dbm = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok());
        }
    }
    info.channel = info.frequency_mhz.and_then(frequency_to_channel);
    info
}

/// Maps a centre frequency in MHz to its IEEE 802.11 channel number.
pub fn frequency_to_channel(mhz: u32) -> Option<u32> {
    match mhz {
        2484 => Some(14),
        2412..=2472 => Some((mhz - 2407) / 5),
        5160..=5885 => Some((mhz - 5000) / 5),
        5955..=7115 => Some((mhz - 5950) / 5),
        _ => None,
    }
}

pub fn signal_quality_label(dbm: f64) -> &'static str {
    if dbm >= -50.0 {
        "excellent"
    } else if dbm >= -60.0 {
        "good"
    } else if dbm >= -70.0 {
        "fair"
    } else if dbm >= -80.0 {
        "weak"
    } else {
        "very weak"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCAN: &str = r#"wlan0     Scan completed :
          Cell 01 - Address: AA:BB:CC:DD:EE:01
                    Channel:6
                    Frequency:2.437 GHz (Channel 6)
                    Quality=46/70  Signal level=-64 dBm
                    Encryption key:on
                    ESSID:"HomeNet"
          Cell 02 - Address: AA:BB:CC:DD:EE:02
                    Frequency:5.18 GHz (Channel 36)
                    Quality=30/70  Signal level=-80 dBm
                    ESSID:""
          Cell 03 - Address: AA:BB:CC:DD:EE:03
                    Channel:11
                    Quality=70/70  Signal level=-41 dBm
                    ESSID:"Cafe"
"#;

    const LINK: &str = "\
Connected to aa:bb:cc:dd:ee:01 (on wlan0)
\tSSID: HomeNet
\tfreq: 2437.0
\tRX: 123456 bytes (789 packets)
\tsignal: -64 dBm
\ttx bitrate: 72.2 MBit/s
";

    #[test]
    fn scan_yields_one_network_per_cell() {
        let networks = parse_iwlist_scan(SCAN);
        assert_eq!(networks.len(), 3);
        assert_eq!(networks[0].ssid.as_deref(), Some("HomeNet"));
        assert_eq!(networks[0].bssid.as_deref(), Some("aa:bb:cc:dd:ee:01"));
        assert_eq!(networks[0].channel, Some(6));
        assert_eq!(networks[0].signal_dbm, Some(-64.0));
    }

    #[test]
    fn hidden_network_and_frequency_only_channel() {
        let networks = parse_iwlist_scan(SCAN);
        assert_eq!(networks[1].ssid, None);
        assert_eq!(networks[1].channel, Some(36));
        assert_eq!(networks[2].channel, Some(11));
    }

    #[test]
    fn link_reports_channel_and_signal() {
        let link = parse_iw_link(LINK);
        assert_eq!(link.ssid.as_deref(), Some("HomeNet"));
        assert_eq!(link.frequency_mhz, Some(2437));
        assert_eq!(link.channel, Some(6));
        assert_eq!(link.signal_dbm, Some(-64.0));
    }

    #[test]
    fn not_connected_link_is_empty() {
        assert_eq!(parse_iw_link("Not connected.\n"), LinkInfo::default());
    }

    #[test]
    fn frequencies_map_to_channels() {
        assert_eq!(frequency_to_channel(2412), Some(1));
        assert_eq!(frequency_to_channel(2462), Some(11));
        assert_eq!(frequency_to_channel(2484), Some(14));
        assert_eq!(frequency_to_channel(5180), Some(36));
        assert_eq!(frequency_to_channel(5745), Some(149));
        assert_eq!(frequency_to_channel(900), None);
    }

    #[test]
    fn signal_labels_follow_dbm_bands() {
        assert_eq!(signal_quality_label(-45.0), "excellent");
        assert_eq!(signal_quality_label(-55.0), "good");
        assert_eq!(signal_quality_label(-64.0), "fair");
        assert_eq!(signal_quality_label(-75.0), "weak");
        assert_eq!(signal_quality_label(-90.0), "very weak");
    }
}
