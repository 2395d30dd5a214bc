use serde::Serialize;

use crate::config::Thresholds;
use crate::evidence::Finding;
use crate::probes::trace::Hop;

const SOURCE: &str = "hop_analyzer";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopDelta {
    pub ttl: u32,
    pub address: Option<String>,
    pub latency_ms: f64,
    pub delta_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HopAssessment {
    DelayPoint {
        ttl: u32,
        address: Option<String>,
        delta_ms: f64,
        prior_max_delta_ms: f64,
    },
    Gradual {
        total_ms: f64,
    },
    Nominal {
        total_ms: f64,
    },
    NoResponsiveHops,
}

impl HopAssessment {
    pub fn to_finding(&self) -> Finding {
        match self {
            HopAssessment::DelayPoint {
                ttl,
                address,
                delta_ms,
                ..
            } => Finding::warning(
                SOURCE,
                format!(
                    "delay detected at hop {ttl} ({}): +{delta_ms:.0}ms",
                    address.as_deref().unwrap_or("unknown")
                ),
            ),
            HopAssessment::Gradual { total_ms } => Finding::warning(
                SOURCE,
                format!("no localized delay point; latency increases gradually ({total_ms:.0}ms end to end)"),
            ),
            HopAssessment::Nominal { .. } => Finding::info(SOURCE, "path latency nominal"),
            HopAssessment::NoResponsiveHops => {
                Finding::info(SOURCE, "no hop answered; path latency unknown")
            }
        }
    }
}

/// Latency added by each responsive hop relative to the previous
/// responsive hop. The first responsive hop is measured from zero.
pub fn hop_deltas(hops: &[Hop]) -> Vec<HopDelta> {
    let mut previous = 0.0;
    hops.iter()
        .filter_map(|hop| {
            let latency = hop.latency_ms?;
            let delta = latency - previous;
            previous = latency;
            Some(HopDelta {
                ttl: hop.ttl,
                address: hop.address.clone(),
                latency_ms: latency,
                delta_ms: delta,
            })
        })
        .collect()
}

/// Finds the first hop whose added latency is both above the absolute
/// threshold and at least `delay_ratio` times every earlier delta.
pub fn analyze_hops(hops: &[Hop], t: &Thresholds) -> HopAssessment {
    let deltas = hop_deltas(hops);
    let Some(last) = deltas.last() else {
        return HopAssessment::NoResponsiveHops;
    };

    let mut prior_max: f64 = 0.0;
    for delta in &deltas {
        if delta.delta_ms > t.delay_threshold_ms && delta.delta_ms >= t.delay_ratio * prior_max {
            return HopAssessment::DelayPoint {
                ttl: delta.ttl,
                address: delta.address.clone(),
                delta_ms: delta.delta_ms,
                prior_max_delta_ms: prior_max,
            };
        }
        prior_max = prior_max.max(delta.delta_ms);
    }

    let total_ms = last.latency_ms;
    if total_ms > t.latency_slow_ms {
        HopAssessment::Gradual { total_ms }
    } else {
        HopAssessment::Nominal { total_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::Severity;

    fn hops_from_deltas(deltas: &[Option<f64>]) -> Vec<Hop> {
        let mut total = 0.0;
        deltas
            .iter()
            .enumerate()
            .map(|(i, delta)| match delta {
                Some(d) => {
                    total += d;
                    Hop {
                        ttl: i as u32 + 1,
                        address: Some(format!("10.0.0.{}", i + 1)),
                        latency_ms: Some(total),
                    }
                }
                None => Hop {
                    ttl: i as u32 + 1,
                    address: None,
                    latency_ms: None,
                },
            })
            .collect()
    }

    #[test]
    fn localizes_jump_at_fourth_hop() {
        let hops = hops_from_deltas(&[Some(5.0), Some(10.0), Some(8.0), Some(235.0), Some(6.0)]);
        let assessment = analyze_hops(&hops, &Thresholds::default());
        assert_eq!(
            assessment,
            HopAssessment::DelayPoint {
                ttl: 4,
                address: Some("10.0.0.4".into()),
                delta_ms: 235.0,
                prior_max_delta_ms: 10.0,
            }
        );
        let finding = assessment.to_finding();
        assert_eq!(finding.severity, Severity::Warning);
        assert_eq!(finding.description, "delay detected at hop 4 (10.0.0.4): +235ms");
    }

    #[test]
    fn small_even_deltas_are_nominal() {
        let hops = hops_from_deltas(&[Some(20.0), Some(25.0), Some(22.0), Some(24.0)]);
        let assessment = analyze_hops(&hops, &Thresholds::default());
        assert_eq!(assessment, HopAssessment::Nominal { total_ms: 91.0 });
        assert_eq!(assessment.to_finding().description, "path latency nominal");
    }

    #[test]
    fn silent_hops_are_bridged() {
        let hops = hops_from_deltas(&[Some(5.0), None, None, Some(150.0)]);
        let deltas = hop_deltas(&hops);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[1].ttl, 4);
        assert_eq!(deltas[1].delta_ms, 150.0);
        assert!(matches!(
            analyze_hops(&hops, &Thresholds::default()),
            HopAssessment::DelayPoint { ttl: 4, .. }
        ));
    }

    #[test]
    fn first_hop_uses_zero_baseline_and_steady_growth_is_gradual() {
        let hops = hops_from_deltas(&[Some(120.0), Some(110.0), Some(115.0)]);
        // The first hop already exceeds the threshold against a zero baseline.
        let assessment = analyze_hops(&hops, &Thresholds::default());
        assert!(matches!(assessment, HopAssessment::DelayPoint { ttl: 1, .. }));

        let hops = hops_from_deltas(&[Some(60.0), Some(70.0), Some(80.0)]);
        let assessment = analyze_hops(&hops, &Thresholds::default());
        assert_eq!(assessment, HopAssessment::Gradual { total_ms: 210.0 });
        assert!(assessment
            .to_finding()
            .description
            .starts_with("no localized delay point; latency increases gradually"));
    }

    #[test]
    fn all_silent_has_no_data() {
        let hops = hops_from_deltas(&[None, None]);
        assert_eq!(
            analyze_hops(&hops, &Thresholds::default()),
            HopAssessment::NoResponsiveHops
        );
    }
}
