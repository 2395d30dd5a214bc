use crate::capture::{CaptureStatus, SessionState};
use crate::evidence::{EvidenceRecord, Severity};
use crate::state::{now_unix, State};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub netsleuth_probe_runs_total: CounterVec,
    pub netsleuth_probe_duration_ms: GaugeVec,
    pub netsleuth_metric_value: GaugeVec,
    pub netsleuth_metric_degraded: GaugeVec,
    pub netsleuth_findings: GaugeVec,
    pub netsleuth_cycles: Gauge,
    pub netsleuth_escalations_total: CounterVec,
    pub netsleuth_capture_running: Gauge,
    pub netsleuth_capture_files: Gauge,
    pub netsleuth_uptime_seconds: Gauge,
    pub netsleuth_scrape_count_total: Counter,
    pub netsleuth_last_cycle_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let netsleuth_probe_runs_total = CounterVec::new(
            opts!(
                "netsleuth_probe_runs_total",
                "Probe invocations by probe and outcome"
            ),
            &["probe", "outcome"],
        )?;
        let netsleuth_probe_duration_ms = GaugeVec::new(
            opts!(
                "netsleuth_probe_duration_ms",
                "Wall time of the last run of each probe in milliseconds"
            ),
            &["probe"],
        )?;
        let netsleuth_metric_value = GaugeVec::new(
            opts!(
                "netsleuth_metric_value",
                "Classified metric values from the last diagnostic cycle"
            ),
            &["metric", "unit"],
        )?;
        let netsleuth_metric_degraded = GaugeVec::new(
            opts!(
                "netsleuth_metric_degraded",
                "1 when the metric was classified slow or poor in the last cycle"
            ),
            &["metric"],
        )?;
        let netsleuth_findings = GaugeVec::new(
            opts!(
                "netsleuth_findings",
                "Findings of the last diagnostic cycle by severity"
            ),
            &["severity"],
        )?;
        let netsleuth_cycles = Gauge::with_opts(opts!(
            "netsleuth_cycles",
            "Diagnostic cycles completed since start"
        ))?;
        let netsleuth_escalations_total = CounterVec::new(
            opts!(
                "netsleuth_escalations_total",
                "Escalation events by kind"
            ),
            &["kind"],
        )?;
        let netsleuth_capture_running = Gauge::with_opts(opts!(
            "netsleuth_capture_running",
            "1 while a capture session is running"
        ))?;
        let netsleuth_capture_files = Gauge::with_opts(opts!(
            "netsleuth_capture_files",
            "Retained capture files on disk"
        ))?;
        let netsleuth_uptime_seconds =
            Gauge::with_opts(opts!("netsleuth_uptime_seconds", "Daemon uptime in seconds"))?;
        let netsleuth_scrape_count_total = Counter::with_opts(opts!(
            "netsleuth_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let netsleuth_last_cycle_timestamp_seconds = Gauge::with_opts(opts!(
            "netsleuth_last_cycle_timestamp_seconds",
            "Unix timestamp of the last diagnostic cycle"
        ))?;

        register(&registry, &netsleuth_probe_runs_total)?;
        register(&registry, &netsleuth_probe_duration_ms)?;
        register(&registry, &netsleuth_metric_value)?;
        register(&registry, &netsleuth_metric_degraded)?;
        register(&registry, &netsleuth_findings)?;
        register(&registry, &netsleuth_cycles)?;
        register(&registry, &netsleuth_escalations_total)?;
        register(&registry, &netsleuth_capture_running)?;
        register(&registry, &netsleuth_capture_files)?;
        register(&registry, &netsleuth_uptime_seconds)?;
        register(&registry, &netsleuth_scrape_count_total)?;
        register(&registry, &netsleuth_last_cycle_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            netsleuth_probe_runs_total,
            netsleuth_probe_duration_ms,
            netsleuth_metric_value,
            netsleuth_metric_degraded,
            netsleuth_findings,
            netsleuth_cycles,
            netsleuth_escalations_total,
            netsleuth_capture_running,
            netsleuth_capture_files,
            netsleuth_uptime_seconds,
            netsleuth_scrape_count_total,
            netsleuth_last_cycle_timestamp_seconds,
        }))
    }

    /// Counts the probe runs of a finished cycle and replaces the per-cycle
    /// gauges with its values.
    pub fn observe_evidence(&self, record: &EvidenceRecord) {
        for result in &record.raw_results {
            let outcome = if result.succeeded {
                "ok"
            } else if result.is_timeout() {
                "timeout"
            } else {
                "failed"
            };
            let probe = result.probe_name.as_str();
            self.netsleuth_probe_runs_total
                .with_label_values(&[probe, outcome])
                .inc();
            self.netsleuth_probe_duration_ms
                .with_label_values(&[probe])
                .set(result.duration_ms as f64);
        }

        self.netsleuth_metric_value.reset();
        self.netsleuth_metric_degraded.reset();
        for (name, metric) in &record.classified_metrics {
            self.netsleuth_metric_value
                .with_label_values(&[name.as_str(), metric.unit])
                .set(metric.value);
            self.netsleuth_metric_degraded
                .with_label_values(&[name.as_str()])
                .set(if metric.class.is_degraded() { 1.0 } else { 0.0 });
        }

        for severity in [Severity::Info, Severity::Warning] {
            let count = record
                .findings
                .iter()
                .filter(|f| f.severity == severity)
                .count();
            self.netsleuth_findings
                .with_label_values(&[severity.as_str()])
                .set(count as f64);
        }
    }

    pub fn update_capture(&self, status: &CaptureStatus) {
        let running = status.state == SessionState::Running;
        self.netsleuth_capture_running
            .set(if running { 1.0 } else { 0.0 });
        self.netsleuth_capture_files.set(status.file_count as f64);
    }

    pub fn update_from_state(&self, state: &State) {
        self.netsleuth_cycles.set(state.cycles_total as f64);
        self.netsleuth_last_cycle_timestamp_seconds
            .set(state.last_cycle_unix as f64);
        let uptime = now_unix().saturating_sub(state.started_at_unix) as f64;
        self.netsleuth_uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.netsleuth_scrape_count_total.inc();
    }

    pub fn inc_escalation(&self, kind: &str) {
        self.netsleuth_escalations_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;
    use crate::evidence::aggregate;
    use crate::probes::{ProbeKind, ProbeResult};

    fn encoded(metrics: &Metrics) -> String {
        String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8")
    }

    #[test]
    fn failed_and_timed_out_probes_are_counted_apart() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let record = aggregate(
            vec![
                ProbeResult::timed_out(ProbeKind::SpectrumScan, None),
                ProbeResult::failure(ProbeKind::DnsLatency, None, "no resolver answered"),
            ],
            &Thresholds::default(),
        );
        metrics.observe_evidence(&record);

        let text = encoded(&metrics);
        assert!(text.contains(
            "netsleuth_probe_runs_total{outcome=\"timeout\",probe=\"spectrum_scan\"} 1"
        ));
        assert!(text.contains(
            "netsleuth_probe_runs_total{outcome=\"failed\",probe=\"dns_latency\"} 1"
        ));
        assert!(text.contains("netsleuth_findings{severity=\"info\"} 2"));
        assert!(text.contains("netsleuth_findings{severity=\"warning\"} 0"));
    }

    #[test]
    fn state_drives_cycle_gauges() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut state = State::new(now_unix());
        state.record_cycle(1_700_000_000, aggregate(Vec::new(), &Thresholds::default()));
        metrics.update_from_state(&state);
        metrics.inc_escalation("escalate");

        let text = encoded(&metrics);
        assert!(text.contains("netsleuth_cycles 1"));
        assert!(text.contains("netsleuth_last_cycle_timestamp_seconds 1700000000"));
        assert!(text.contains("netsleuth_escalations_total{kind=\"escalate\"} 1"));
    }
}
