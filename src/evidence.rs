use serde::Serialize;
use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::analysis::{congestion, hops};
use crate::config::Thresholds;
use crate::probes::{ProbeDetail, ProbeResult};

pub const ROUTER_LATENCY: &str = "router_latency";
pub const INTERNET_LATENCY: &str = "internet_latency";
pub const PACKET_LOSS: &str = "packet_loss";
pub const SIGNAL_QUALITY: &str = "signal_quality";
pub const DNS_LATENCY: &str = "dns_latency";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Fast,
    Normal,
    Slow,
    Good,
    Fair,
    Poor,
}

impl Classification {
    pub fn is_degraded(self) -> bool {
        matches!(self, Classification::Slow | Classification::Poor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub source: &'static str,
    pub description: String,
}

impl Finding {
    pub fn info(source: &'static str, description: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            source,
            description: description.into(),
        }
    }

    pub fn warning(source: &'static str, description: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            source,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedMetric {
    pub value: f64,
    pub unit: &'static str,
    pub class: Classification,
}

/// Everything one diagnostic cycle learned. Built once by [`aggregate`]
/// and not mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceRecord {
    pub symptom: Option<String>,
    pub collected_at: String,
    pub classified_metrics: BTreeMap<String, ClassifiedMetric>,
    pub findings: Vec<Finding>,
    pub raw_results: Vec<ProbeResult>,
}

impl EvidenceRecord {
    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    pub fn has_warnings(&self) -> bool {
        self.warnings().next().is_some()
    }

    pub fn metric_class(&self, name: &str) -> Option<Classification> {
        self.classified_metrics.get(name).map(|m| m.class)
    }
}

pub fn classify_latency(ms: f64, t: &Thresholds) -> Classification {
    if ms < t.latency_fast_ms {
        Classification::Fast
    } else if ms <= t.latency_slow_ms {
        Classification::Normal
    } else {
        Classification::Slow
    }
}

pub fn classify_signal(dbm: f64, t: &Thresholds) -> Classification {
    if dbm >= t.signal_good_dbm {
        Classification::Good
    } else if dbm >= t.signal_poor_dbm {
        Classification::Fair
    } else {
        Classification::Poor
    }
}

pub fn classify_loss(percent: f64, t: &Thresholds) -> Classification {
    if percent <= 0.0 {
        Classification::Good
    } else if percent <= t.loss_fair_max_percent {
        Classification::Fair
    } else {
        Classification::Poor
    }
}

/// Classifies what the probes measured and collects the analyzers'
/// findings. Failed probes contribute an informational finding and no
/// metrics.
pub fn aggregate(results: Vec<ProbeResult>, thresholds: &Thresholds) -> EvidenceRecord {
    let mut metrics = BTreeMap::new();
    let mut findings = Vec::new();
    let mut failures = Vec::new();

    for result in &results {
        if !result.succeeded {
            let reason = result.error_message.as_deref().unwrap_or("unknown error");
            failures.push(Finding::info(
                "aggregator",
                format!("{} probe failed: {reason}", result.probe_name),
            ));
            continue;
        }

        match &result.detail {
            ProbeDetail::Reachability(detail) => {
                if let Some(ms) = detail.gateway_latency_ms() {
                    insert_metric(&mut metrics, &mut findings, ROUTER_LATENCY, ms, "ms", classify_latency(ms, thresholds));
                }
                if let Some(ms) = detail.internet_latency_ms() {
                    insert_metric(&mut metrics, &mut findings, INTERNET_LATENCY, ms, "ms", classify_latency(ms, thresholds));
                }
                if let Some(pct) = detail.mean_loss_percent() {
                    insert_metric(&mut metrics, &mut findings, PACKET_LOSS, pct, "%", classify_loss(pct, thresholds));
                }
            }
            ProbeDetail::DnsLatency(_) => {
                if let Some(ms) = result.numeric_value {
                    insert_metric(&mut metrics, &mut findings, DNS_LATENCY, ms, "ms", classify_latency(ms, thresholds));
                }
            }
            ProbeDetail::SpectrumScan(detail) => {
                if let Some(dbm) = detail.current_signal_dbm {
                    insert_metric(&mut metrics, &mut findings, SIGNAL_QUALITY, dbm, "dBm", classify_signal(dbm, thresholds));
                }
                let report = congestion::assess_networks(
                    &detail.networks,
                    detail.current_channel,
                    thresholds.congestion_threshold,
                );
                findings.extend(report.findings());
            }
            ProbeDetail::PathTrace(detail) => {
                findings.push(hops::analyze_hops(&detail.hops, thresholds).to_finding());
            }
            ProbeDetail::PacketAnalysis(detail) => {
                if detail.retransmission_rate_percent > thresholds.retransmission_warn_percent {
                    findings.push(Finding::warning(
                        "packet_analysis",
                        format!(
                            "tcp retransmission rate {:.1}% across {} packets",
                            detail.retransmission_rate_percent, detail.total_packets
                        ),
                    ));
                }
            }
            ProbeDetail::Throughput(detail) => {
                if detail.interface_errors > 0 {
                    findings.push(Finding::warning(
                        "throughput",
                        format!(
                            "{} interface errors on {} during sampling",
                            detail.interface_errors, detail.interface
                        ),
                    ));
                }
            }
            ProbeDetail::NeighborScan(_) | ProbeDetail::None => {}
        }
    }

    findings.extend(failures);
    EvidenceRecord {
        symptom: None,
        collected_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
        classified_metrics: metrics,
        findings,
        raw_results: results,
    }
}

fn insert_metric(
    metrics: &mut BTreeMap<String, ClassifiedMetric>,
    findings: &mut Vec<Finding>,
    name: &'static str,
    value: f64,
    unit: &'static str,
    class: Classification,
) {
    if class.is_degraded() {
        findings.push(Finding::warning(
            "aggregator",
            format!("{name} is {} ({value:.1} {unit})", class_label(class)),
        ));
    }
    metrics.insert(name.to_string(), ClassifiedMetric { value, unit, class });
}

fn class_label(class: Classification) -> &'static str {
    match class {
        Classification::Fast => "fast",
        Classification::Normal => "normal",
        Classification::Slow => "slow",
        Classification::Good => "good",
        Classification::Fair => "fair",
        Classification::Poor => "poor",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::dns::{DnsDetail, ResolverTiming};
    use crate::probes::reachability::{ReachabilityDetail, TargetReachability, TargetRole};
    use crate::probes::ProbeKind;

    fn target(role: TargetRole, rtt: f64) -> TargetReachability {
        TargetReachability {
            role,
            address: Some("x".into()),
            avg_rtt_ms: Some(rtt),
            loss_percent: Some(0.0),
            error: None,
        }
    }

    fn reachability(gateway: f64, internet: f64) -> ProbeResult {
        ProbeResult::success(
            ProbeKind::Reachability,
            None,
            Some(gateway),
            ProbeDetail::Reachability(ReachabilityDetail {
                targets: vec![
                    target(TargetRole::Gateway, gateway),
                    target(TargetRole::Resolver, internet),
                ],
            }),
        )
    }

    #[test]
    fn latency_and_signal_classes() {
        let t = Thresholds::default();
        assert_eq!(classify_latency(19.82, &t), Classification::Fast);
        assert_eq!(classify_latency(120.0, &t), Classification::Normal);
        assert_eq!(classify_latency(208.52, &t), Classification::Slow);
        assert_eq!(classify_signal(-45.0, &t), Classification::Good);
        assert_eq!(classify_signal(-64.0, &t), Classification::Fair);
        assert_eq!(classify_signal(-75.0, &t), Classification::Poor);
        assert_eq!(classify_loss(0.0, &t), Classification::Good);
        assert_eq!(classify_loss(20.0, &t), Classification::Poor);
    }

    #[test]
    fn slow_internet_latency_raises_warning() {
        let record = aggregate(vec![reachability(19.82, 208.52)], &Thresholds::default());
        assert_eq!(record.metric_class(ROUTER_LATENCY), Some(Classification::Fast));
        assert_eq!(record.metric_class(INTERNET_LATENCY), Some(Classification::Slow));
        assert_eq!(record.metric_class(PACKET_LOSS), Some(Classification::Good));
        let warnings: Vec<_> = record.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].description.starts_with("internet_latency is slow"));
    }

    #[test]
    fn failed_probe_does_not_drop_other_metrics() {
        let dns = ProbeResult::success(
            ProbeKind::DnsLatency,
            None,
            Some(32.0),
            ProbeDetail::DnsLatency(DnsDetail {
                hostname: "google.com".into(),
                resolvers: vec![ResolverTiming {
                    server: "8.8.8.8".into(),
                    succeeded: true,
                    latency_ms: Some(32.0),
                    answers: 1,
                    error: None,
                }],
            }),
        );
        let results = vec![
            reachability(3.0, 20.0),
            ProbeResult::timed_out(ProbeKind::SpectrumScan, None),
            dns,
        ];
        let record = aggregate(results, &Thresholds::default());

        assert_eq!(record.raw_results.len(), 3);
        assert!(record.classified_metrics.contains_key(DNS_LATENCY));
        assert!(record.classified_metrics.contains_key(ROUTER_LATENCY));
        assert!(!record.classified_metrics.contains_key(SIGNAL_QUALITY));
        assert!(!record.has_warnings());
        assert!(record
            .findings
            .iter()
            .any(|f| f.severity == Severity::Info && f.description == "spectrum_scan probe failed: timeout"));
    }

    #[test]
    fn record_serializes_lowercase_classes() {
        let record = aggregate(vec![reachability(19.82, 30.0)], &Thresholds::default());
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["classified_metrics"]["router_latency"]["class"], "fast");
        assert_eq!(json["raw_results"][0]["probe_name"], "reachability");
    }
}
