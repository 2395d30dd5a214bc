//! Symptom-driven sequencing: pick a probe set, run it, aggregate, and
//! optionally ask the reasoning service what it makes of the evidence.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Thresholds;
use crate::evidence::{self, Classification, EvidenceRecord};
use crate::probes::{ProbeKind, ProbeRegistry};
use crate::reasoning::ReasoningClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymptomHint {
    Health,
    Latency,
    ConnectivityLoss,
    Dns,
    Wifi,
    Throughput,
    Full,
}

#[derive(Debug, Error)]
#[error("unknown symptom '{0}'")]
pub struct UnknownSymptom(pub String);

impl SymptomHint {
    pub const ALL: [SymptomHint; 7] = [
        SymptomHint::Health,
        SymptomHint::Latency,
        SymptomHint::ConnectivityLoss,
        SymptomHint::Dns,
        SymptomHint::Wifi,
        SymptomHint::Throughput,
        SymptomHint::Full,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            SymptomHint::Health => "health",
            SymptomHint::Latency => "latency",
            SymptomHint::ConnectivityLoss => "connectivity_loss",
            SymptomHint::Dns => "dns",
            SymptomHint::Wifi => "wifi",
            SymptomHint::Throughput => "throughput",
            SymptomHint::Full => "full",
        }
    }

    /// Probes run for this symptom, in the order their results appear in
    /// the evidence record. Packet analysis needs a capture file and is
    /// never part of a cycle.
    pub fn probe_set(self) -> &'static [ProbeKind] {
        match self {
            SymptomHint::Health => &[
                ProbeKind::Reachability,
                ProbeKind::DnsLatency,
                ProbeKind::SpectrumScan,
            ],
            SymptomHint::Latency => &[
                ProbeKind::Reachability,
                ProbeKind::PathTrace,
                ProbeKind::SpectrumScan,
                ProbeKind::DnsLatency,
            ],
            SymptomHint::ConnectivityLoss => &[ProbeKind::Reachability, ProbeKind::NeighborScan],
            SymptomHint::Dns => &[ProbeKind::DnsLatency, ProbeKind::Reachability],
            SymptomHint::Wifi => &[ProbeKind::SpectrumScan, ProbeKind::Reachability],
            SymptomHint::Throughput => &[ProbeKind::Throughput, ProbeKind::Reachability],
            SymptomHint::Full => &[
                ProbeKind::Reachability,
                ProbeKind::PathTrace,
                ProbeKind::SpectrumScan,
                ProbeKind::DnsLatency,
                ProbeKind::Throughput,
                ProbeKind::NeighborScan,
            ],
        }
    }
}

impl fmt::Display for SymptomHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SymptomHint {
    type Err = UnknownSymptom;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let hint = match normalized.as_str() {
            "health" => SymptomHint::Health,
            "latency" | "slow" => SymptomHint::Latency,
            "connectivity" | "connectivity_loss" | "offline" => SymptomHint::ConnectivityLoss,
            "dns" => SymptomHint::Dns,
            "wifi" | "signal" => SymptomHint::Wifi,
            "throughput" | "bandwidth" => SymptomHint::Throughput,
            "full" => SymptomHint::Full,
            _ => return Err(UnknownSymptom(s.to_string())),
        };
        Ok(hint)
    }
}

/// Narrower follow-up symptom for a degraded record. Falls back to a full
/// cycle when nothing points anywhere specific.
pub fn escalation_for(record: &EvidenceRecord) -> SymptomHint {
    let degraded = |name: &str| record.metric_class(name).is_some_and(Classification::is_degraded);

    let reachability_dead = record
        .raw_results
        .iter()
        .any(|r| r.probe_name == ProbeKind::Reachability && !r.succeeded && !r.is_timeout());

    if reachability_dead || degraded(evidence::PACKET_LOSS) {
        SymptomHint::ConnectivityLoss
    } else if degraded(evidence::INTERNET_LATENCY) || degraded(evidence::ROUTER_LATENCY) {
        SymptomHint::Latency
    } else if degraded(evidence::DNS_LATENCY) {
        SymptomHint::Dns
    } else if degraded(evidence::SIGNAL_QUALITY) {
        SymptomHint::Wifi
    } else {
        SymptomHint::Full
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub evidence: EvidenceRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hypotheses: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_error: Option<String>,
}

pub struct Diagnostician {
    registry: Arc<ProbeRegistry>,
    thresholds: Thresholds,
    reasoning: Option<ReasoningClient>,
}

impl Diagnostician {
    pub fn new(
        registry: Arc<ProbeRegistry>,
        thresholds: Thresholds,
        reasoning: Option<ReasoningClient>,
    ) -> Self {
        Self {
            registry,
            thresholds,
            reasoning,
        }
    }

    pub fn registry(&self) -> &Arc<ProbeRegistry> {
        &self.registry
    }

    pub async fn run_diagnostic_cycle(&self, symptom: SymptomHint) -> EvidenceRecord {
        let kinds = symptom.probe_set();
        let results = self.registry.run_set(kinds).await;
        let mut record = evidence::aggregate(results, &self.thresholds);
        record.symptom = Some(symptom.as_str().to_string());
        info!(
            symptom = %symptom,
            probes = kinds.len(),
            warnings = record.warnings().count(),
            "диагностический цикл завершён"
        );
        record
    }

    /// A cycle followed by the reasoning hand-off. Evidence is returned even
    /// when the reasoning service is unreachable.
    pub async fn diagnose(&self, symptom: SymptomHint) -> Diagnosis {
        let evidence = self.run_diagnostic_cycle(symptom).await;
        let Some(client) = &self.reasoning else {
            return Diagnosis {
                evidence,
                hypotheses: None,
                reasoning_error: None,
            };
        };

        match client.request_hypotheses(&evidence).await {
            Ok(hypotheses) => Diagnosis {
                evidence,
                hypotheses: Some(hypotheses),
                reasoning_error: None,
            },
            Err(err) => {
                warn!(endpoint = client.endpoint(), error = %err, "сервис гипотез недоступен");
                Diagnosis {
                    evidence,
                    hypotheses: None,
                    reasoning_error: Some(err.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ReasoningConfig};
    use crate::probes::reachability::{ReachabilityDetail, TargetReachability, TargetRole};
    use crate::probes::{ProbeDetail, ProbeResult};

    fn offline_config() -> Config {
        let mut cfg = Config::default();
        cfg.targets.gateway = Some("127.0.0.1".to_string());
        cfg.targets.upstream = None;
        cfg.targets.resolvers = Vec::new();
        cfg.dns.resolvers = vec!["not-an-address".to_string()];
        cfg.probes.ping_count = 1;
        cfg.probes.ping_wait_secs = 1;
        cfg.timeouts.reachability_secs = 5;
        cfg.timeouts.dns_latency_secs = 2;
        cfg
    }

    fn reach(gateway_ms: f64, loss: f64) -> ProbeResult {
        ProbeResult::success(
            ProbeKind::Reachability,
            None,
            Some(gateway_ms),
            ProbeDetail::Reachability(ReachabilityDetail {
                targets: vec![TargetReachability {
                    role: TargetRole::Gateway,
                    address: Some("192.168.1.1".into()),
                    avg_rtt_ms: Some(gateway_ms),
                    loss_percent: Some(loss),
                    error: None,
                }],
            }),
        )
    }

    #[test]
    fn symptom_names_and_aliases() {
        for hint in SymptomHint::ALL {
            assert_eq!(hint.as_str().parse::<SymptomHint>().expect("parse"), hint);
        }
        assert_eq!("Slow".parse::<SymptomHint>().expect("alias"), SymptomHint::Latency);
        assert_eq!(
            "connectivity-loss".parse::<SymptomHint>().expect("dash"),
            SymptomHint::ConnectivityLoss
        );
        assert!("sunspots".parse::<SymptomHint>().is_err());
    }

    #[test]
    fn latency_and_connectivity_sets() {
        assert_eq!(
            SymptomHint::Latency.probe_set(),
            &[
                ProbeKind::Reachability,
                ProbeKind::PathTrace,
                ProbeKind::SpectrumScan,
                ProbeKind::DnsLatency,
            ]
        );
        assert_eq!(
            SymptomHint::ConnectivityLoss.probe_set(),
            &[ProbeKind::Reachability, ProbeKind::NeighborScan]
        );
        for hint in SymptomHint::ALL {
            assert!(!hint.probe_set().contains(&ProbeKind::PacketAnalysis));
        }
    }

    #[test]
    fn escalation_follows_the_degraded_metric() {
        let t = Thresholds::default();
        let slow = evidence::aggregate(vec![reach(250.0, 0.0)], &t);
        assert_eq!(escalation_for(&slow), SymptomHint::Latency);

        let lossy = evidence::aggregate(vec![reach(5.0, 60.0)], &t);
        assert_eq!(escalation_for(&lossy), SymptomHint::ConnectivityLoss);

        let dead = evidence::aggregate(
            vec![ProbeResult::failure(ProbeKind::Reachability, None, "no target responded")],
            &t,
        );
        assert_eq!(escalation_for(&dead), SymptomHint::ConnectivityLoss);

        let fine = evidence::aggregate(vec![reach(5.0, 0.0)], &t);
        assert_eq!(escalation_for(&fine), SymptomHint::Full);
    }

    #[tokio::test]
    async fn cycle_keeps_probe_order_and_tags_symptom() {
        let cfg = offline_config();
        let registry = Arc::new(ProbeRegistry::new(&cfg));
        let diagnostician = Diagnostician::new(registry, cfg.thresholds.clone(), None);

        let diagnosis = diagnostician.diagnose(SymptomHint::Dns).await;
        let record = &diagnosis.evidence;
        assert_eq!(record.symptom.as_deref(), Some("dns"));
        let names: Vec<_> = record.raw_results.iter().map(|r| r.probe_name.as_str()).collect();
        assert_eq!(names, vec!["dns_latency", "reachability"]);
        assert!(!record.raw_results[0].succeeded);
        assert!(!record.classified_metrics.contains_key(evidence::DNS_LATENCY));
        assert!(diagnosis.hypotheses.is_none());
        assert!(diagnosis.reasoning_error.is_none());
    }

    #[tokio::test]
    async fn unreachable_reasoning_service_keeps_evidence() {
        let cfg = offline_config();
        let reasoning = ReasoningClient::from_config(&ReasoningConfig {
            endpoint: Some("http://127.0.0.1:9/hypotheses".to_string()),
            timeout_secs: 2,
        })
        .expect("build")
        .expect("client");
        let diagnostician = Diagnostician::new(
            Arc::new(ProbeRegistry::new(&cfg)),
            cfg.thresholds.clone(),
            Some(reasoning),
        );

        let diagnosis = diagnostician.diagnose(SymptomHint::Dns).await;
        assert_eq!(diagnosis.evidence.raw_results.len(), 2);
        assert!(diagnosis.hypotheses.is_none());
        assert!(diagnosis.reasoning_error.is_some());
    }
}
