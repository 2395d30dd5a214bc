use serde::Serialize;
use std::collections::BTreeMap;

use crate::evidence::Finding;
use crate::probes::spectrum::WifiNetwork;

const SOURCE: &str = "congestion_scorer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Band {
    #[serde(rename = "2.4GHz")]
    TwoPointFour,
    #[serde(rename = "5GHz")]
    Five,
}

impl Band {
    pub fn of_channel(channel: u32) -> Option<Band> {
        match channel {
            // 14 is Japan-only but still 2.4GHz.
            1..=14 => Some(Band::TwoPointFour),
            c if c >= 36 => Some(Band::Five),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Band::TwoPointFour => "2.4GHz",
            Band::Five => "5GHz",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelRecommendation {
    pub channel: u32,
    pub networks: u32,
    pub band: Band,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CongestionReport {
    pub total_networks: u32,
    pub channel_counts: BTreeMap<u32, u32>,
    pub congested_channels: Vec<u32>,
    pub current_channel: Option<u32>,
    pub recommendation: Option<ChannelRecommendation>,
    pub insufficient_data: bool,
}

impl CongestionReport {
    pub fn findings(&self) -> Vec<Finding> {
        if self.insufficient_data {
            return vec![Finding::info(
                SOURCE,
                format!(
                    "insufficient data: {} network(s) observed",
                    self.total_networks
                ),
            )];
        }

        let mut out = Vec::new();
        for channel in &self.congested_channels {
            let count = self.channel_counts.get(channel).copied().unwrap_or(0);
            let on_current = self.current_channel == Some(*channel);
            let description = if on_current {
                format!("current channel {channel} is heavily congested ({count} networks)")
            } else {
                format!("channel {channel} is heavily congested ({count} networks)")
            };
            out.push(if on_current {
                Finding::warning(SOURCE, description)
            } else {
                Finding::info(SOURCE, description)
            });
        }
        if let (Some(rec), Some(current)) = (&self.recommendation, self.current_channel) {
            out.push(Finding::warning(
                SOURCE,
                format!(
                    "switch from channel {current} to channel {} ({} networks in {})",
                    rec.channel,
                    rec.networks,
                    rec.band.label()
                ),
            ));
        }
        out
    }
}

pub fn channel_counts(networks: &[WifiNetwork]) -> BTreeMap<u32, u32> {
    let mut counts = BTreeMap::new();
    for channel in networks.iter().filter_map(|n| n.channel) {
        *counts.entry(channel).or_insert(0) += 1;
    }
    counts
}

pub fn assess_networks(
    networks: &[WifiNetwork],
    current_channel: Option<u32>,
    threshold: u32,
) -> CongestionReport {
    score_channels(&channel_counts(networks), current_channel, threshold)
}

/// Flags channels at or above `threshold` and recommends the least used
/// channel in the current channel's band when it beats the current one.
/// Ties go to the lowest channel number.
pub fn score_channels(
    counts: &BTreeMap<u32, u32>,
    current_channel: Option<u32>,
    threshold: u32,
) -> CongestionReport {
    let total_networks: u32 = counts.values().sum();
    let mut report = CongestionReport {
        total_networks,
        channel_counts: counts.clone(),
        congested_channels: Vec::new(),
        current_channel,
        recommendation: None,
        insufficient_data: total_networks < 2,
    };
    if report.insufficient_data {
        return report;
    }

    report.congested_channels = counts
        .iter()
        .filter(|(_, count)| **count >= threshold)
        .map(|(channel, _)| *channel)
        .collect();

    let Some(current) = current_channel else {
        return report;
    };
    let Some(band) = Band::of_channel(current) else {
        return report;
    };
    let current_count = counts.get(&current).copied().unwrap_or(0);
    report.recommendation = counts
        .iter()
        .filter(|(channel, _)| Band::of_channel(**channel) == Some(band))
        .min_by_key(|(_, count)| **count)
        .filter(|(_, count)| **count < current_count)
        .map(|(channel, count)| ChannelRecommendation {
            channel: *channel,
            networks: *count,
            band,
        });
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::Severity;

    fn counts(pairs: &[(u32, u32)]) -> BTreeMap<u32, u32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn band_edges() {
        assert_eq!(Band::of_channel(1), Some(Band::TwoPointFour));
        assert_eq!(Band::of_channel(13), Some(Band::TwoPointFour));
        assert_eq!(Band::of_channel(14), Some(Band::TwoPointFour));
        assert_eq!(Band::of_channel(15), None);
        assert_eq!(Band::of_channel(0), None);
        assert_eq!(Band::of_channel(36), Some(Band::Five));
    }

    #[test]
    fn recommends_quietest_channel_in_same_band() {
        let report = score_channels(
            &counts(&[(1, 6), (6, 9), (11, 2), (36, 1), (40, 1)]),
            Some(6),
            5,
        );
        assert_eq!(report.total_networks, 19);
        assert_eq!(report.congested_channels, vec![1, 6]);
        assert_eq!(
            report.recommendation,
            Some(ChannelRecommendation {
                channel: 11,
                networks: 2,
                band: Band::TwoPointFour,
            })
        );

        let findings = report.findings();
        assert!(findings.iter().any(|f| f.severity == Severity::Warning
            && f.description == "current channel 6 is heavily congested (9 networks)"));
        assert!(findings
            .iter()
            .any(|f| f.description.starts_with("switch from channel 6 to channel 11")));
    }

    #[test]
    fn too_few_networks_is_insufficient_data() {
        let report = score_channels(&counts(&[(6, 1)]), Some(6), 5);
        assert!(report.insufficient_data);
        assert_eq!(report.recommendation, None);
        let findings = report.findings();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.starts_with("insufficient data"));
    }

    #[test]
    fn no_recommendation_when_current_is_already_quietest() {
        let report = score_channels(&counts(&[(1, 4), (6, 1), (11, 3)]), Some(6), 5);
        assert_eq!(report.recommendation, None);
        assert!(report.congested_channels.is_empty());
        assert!(report.findings().is_empty());
    }

    #[test]
    fn five_ghz_current_stays_in_band() {
        let report = score_channels(&counts(&[(6, 2), (36, 4), (44, 1)]), Some(36), 5);
        assert_eq!(report.recommendation.map(|r| r.channel), Some(44));
    }

    #[test]
    fn networks_without_channel_are_ignored() {
        let networks = vec![
            WifiNetwork {
                ssid: Some("a".into()),
                bssid: None,
                channel: Some(6),
                signal_dbm: None,
            },
            WifiNetwork {
                ssid: None,
                bssid: None,
                channel: None,
                signal_dbm: None,
            },
            WifiNetwork {
                ssid: Some("b".into()),
                bssid: None,
                channel: Some(6),
                signal_dbm: None,
            },
        ];
        assert_eq!(channel_counts(&networks), counts(&[(6, 2)]));
    }
}
