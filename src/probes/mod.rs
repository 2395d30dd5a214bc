pub mod command;
pub mod dns;
pub mod neighbors;
pub mod packets;
pub mod reachability;
pub mod spectrum;
pub mod throughput;
pub mod trace;

use crate::config::{Config, DnsConfig, ProbesConfig, TargetsConfig, TimeoutsConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, warn};

use self::dns::DnsDetail;
use self::neighbors::NeighborDetail;
use self::packets::PacketDetail;
use self::reachability::{ReachTarget, ReachabilityDetail, TargetRole};
use self::spectrum::SpectrumDetail;
use self::throughput::ThroughputDetail;
use self::trace::TraceDetail;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Reachability,
    PathTrace,
    SpectrumScan,
    DnsLatency,
    Throughput,
    NeighborScan,
    PacketAnalysis,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 7] = [
        ProbeKind::Reachability,
        ProbeKind::PathTrace,
        ProbeKind::SpectrumScan,
        ProbeKind::DnsLatency,
        ProbeKind::Throughput,
        ProbeKind::NeighborScan,
        ProbeKind::PacketAnalysis,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ProbeKind::Reachability => "reachability",
            ProbeKind::PathTrace => "path_trace",
            ProbeKind::SpectrumScan => "spectrum_scan",
            ProbeKind::DnsLatency => "dns_latency",
            ProbeKind::Throughput => "throughput",
            ProbeKind::NeighborScan => "neighbor_scan",
            ProbeKind::PacketAnalysis => "packet_analysis",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        ProbeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| ProbeError::UnknownProbe(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unknown probe: {0}")]
    UnknownProbe(String),
}

/// Optional per-invocation overrides. Probes fall back to the configured
/// targets when a field is unset.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProbeParams {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl ProbeParams {
    pub fn for_file(path: impl Into<PathBuf>) -> Self {
        Self {
            target: None,
            file: Some(path.into()),
        }
    }
}

/// Probe-specific structured payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeDetail {
    Reachability(ReachabilityDetail),
    PathTrace(TraceDetail),
    SpectrumScan(SpectrumDetail),
    DnsLatency(DnsDetail),
    Throughput(ThroughputDetail),
    NeighborScan(NeighborDetail),
    PacketAnalysis(PacketDetail),
    None,
}

/// Outcome of one probe invocation. A failed probe still yields a result;
/// the error lives in `error_message`.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub probe_name: ProbeKind,
    pub target: Option<String>,
    pub succeeded: bool,
    pub numeric_value: Option<f64>,
    pub detail: ProbeDetail,
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

impl ProbeResult {
    pub fn success(
        kind: ProbeKind,
        target: Option<String>,
        numeric_value: Option<f64>,
        detail: ProbeDetail,
    ) -> Self {
        Self {
            probe_name: kind,
            target,
            succeeded: true,
            numeric_value,
            detail,
            error_message: None,
            duration_ms: 0,
        }
    }

    pub fn failure(kind: ProbeKind, target: Option<String>, message: impl Into<String>) -> Self {
        Self {
            probe_name: kind,
            target,
            succeeded: false,
            numeric_value: None,
            detail: ProbeDetail::None,
            error_message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn failure_with_detail(
        kind: ProbeKind,
        target: Option<String>,
        message: impl Into<String>,
        detail: ProbeDetail,
    ) -> Self {
        Self {
            detail,
            ..Self::failure(kind, target, message)
        }
    }

    /// The external facility the probe depends on is missing.
    pub fn unavailable(kind: ProbeKind, target: Option<String>, facility: &str, hint: &str) -> Self {
        Self::failure(kind, target, format!("{facility} not available: {hint}"))
    }

    pub fn timed_out(kind: ProbeKind, target: Option<String>) -> Self {
        Self::failure(kind, target, "timeout")
    }

    pub fn is_timeout(&self) -> bool {
        self.error_message.as_deref() == Some("timeout")
    }

    fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = elapsed.as_millis() as u64;
        self
    }
}

/// Fixed name -> probe table. Holds the slices of configuration the probes
/// need; cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ProbeRegistry {
    interface: String,
    targets: TargetsConfig,
    dns: DnsConfig,
    probes: ProbesConfig,
    timeouts: TimeoutsConfig,
}

impl ProbeRegistry {
    pub fn new(cfg: &Config) -> Self {
        Self {
            interface: cfg.interface.clone(),
            targets: cfg.targets.clone(),
            dns: cfg.dns.clone(),
            probes: cfg.probes.clone(),
            timeouts: cfg.timeouts.clone(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        ProbeKind::ALL.iter().map(|kind| kind.as_str()).collect()
    }

    pub fn timeout_for(&self, kind: ProbeKind) -> Duration {
        self.timeouts.for_probe(kind)
    }

    /// Runs a probe by name. Unknown names are the only error; everything
    /// that goes wrong inside a probe is reported in the result.
    pub async fn run(
        &self,
        probe_name: &str,
        params: &ProbeParams,
        timeout: Option<Duration>,
    ) -> Result<ProbeResult, ProbeError> {
        let kind: ProbeKind = probe_name.parse()?;
        let timeout = timeout.unwrap_or_else(|| self.timeout_for(kind));
        Ok(self.run_kind(kind, params, timeout).await)
    }

    pub async fn run_default(&self, kind: ProbeKind, params: &ProbeParams) -> ProbeResult {
        self.run_kind(kind, params, self.timeout_for(kind)).await
    }

    pub async fn run_kind(
        &self,
        kind: ProbeKind,
        params: &ProbeParams,
        timeout: Duration,
    ) -> ProbeResult {
        with_deadline(
            kind,
            params.target.clone(),
            timeout,
            self.dispatch(kind, params, timeout),
        )
        .await
    }

    /// Runs probes concurrently with default parameters. Results come back
    /// in the order of `kinds`.
    pub async fn run_set(self: &Arc<Self>, kinds: &[ProbeKind]) -> Vec<ProbeResult> {
        let mut tasks = JoinSet::new();
        for (index, kind) in kinds.iter().copied().enumerate() {
            let registry = Arc::clone(self);
            tasks.spawn(async move {
                let result = registry.run_default(kind, &ProbeParams::default()).await;
                (index, result)
            });
        }

        let mut slots: Vec<Option<ProbeResult>> = vec![None; kinds.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => warn!(error = %err, "probe task failed"),
            }
        }

        slots
            .into_iter()
            .zip(kinds.iter().copied())
            .map(|(slot, kind)| {
                slot.unwrap_or_else(|| ProbeResult::failure(kind, None, "probe task aborted"))
            })
            .collect()
    }

    /// `limit` bounds every external command the probe starts.
    async fn dispatch(
        &self,
        kind: ProbeKind,
        params: &ProbeParams,
        limit: Duration,
    ) -> ProbeResult {
        match kind {
            ProbeKind::Reachability => {
                let targets = self.reach_targets(params);
                reachability::run(
                    targets,
                    self.probes.ping_count,
                    self.probes.ping_wait_secs,
                    params.target.clone(),
                )
                .await
            }
            ProbeKind::PathTrace => {
                let destination = params
                    .target
                    .clone()
                    .or_else(|| self.targets.resolvers.first().cloned())
                    .unwrap_or_else(|| "8.8.8.8".to_string());
                trace::run(&destination, self.probes.max_hops, self.probes.hop_wait_secs).await
            }
            ProbeKind::SpectrumScan => {
                let interface = params.target.as_deref().unwrap_or(&self.interface);
                spectrum::run(interface, limit).await
            }
            ProbeKind::DnsLatency => {
                let resolvers = match &params.target {
                    Some(server) => vec![server.clone()],
                    None => self.dns.resolvers.clone(),
                };
                dns::run(
                    &self.dns.hostname,
                    &resolvers,
                    Duration::from_millis(self.probes.dns_query_timeout_ms),
                )
                .await
            }
            ProbeKind::Throughput => {
                let interface = params.target.as_deref().unwrap_or(&self.interface);
                throughput::run(
                    interface,
                    Duration::from_secs(self.probes.throughput_sample_secs),
                )
                .await
            }
            ProbeKind::NeighborScan => neighbors::run(params.target.as_deref(), limit).await,
            ProbeKind::PacketAnalysis => match &params.file {
                Some(file) => packets::run(&self.probes.decoder_binary, file, limit).await,
                None => ProbeResult::failure(kind, None, "no capture file given"),
            },
        }
    }

    fn reach_targets(&self, params: &ProbeParams) -> Vec<ReachTarget> {
        if let Some(target) = &params.target {
            return vec![ReachTarget::new(TargetRole::Custom, Some(target.clone()))];
        }

        let gateway = self
            .targets
            .gateway
            .clone()
            .or_else(|| reachability::detect_default_gateway().map(|ip| ip.to_string()));
        let mut targets = vec![ReachTarget::new(TargetRole::Gateway, gateway)];
        if let Some(upstream) = &self.targets.upstream {
            targets.push(ReachTarget::new(TargetRole::Upstream, Some(upstream.clone())));
        }
        for resolver in &self.targets.resolvers {
            targets.push(ReachTarget::new(TargetRole::Resolver, Some(resolver.clone())));
        }
        targets
    }
}

async fn with_deadline<F>(
    kind: ProbeKind,
    target: Option<String>,
    timeout: Duration,
    probe: F,
) -> ProbeResult
where
    F: Future<Output = ProbeResult>,
{
    let start = Instant::now();
    let result = match time::timeout(timeout, probe).await {
        Ok(result) => result,
        Err(_elapsed) => {
            warn!(probe = %kind, timeout = ?timeout, "probe timeout");
            ProbeResult::timed_out(kind, target)
        }
    };
    debug!(
        probe = %kind,
        succeeded = result.succeeded,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "probe finished"
    );
    result.with_duration(start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<ProbeRegistry> {
        Arc::new(ProbeRegistry::new(&Config::default()))
    }

    #[test]
    fn probe_names_round_trip_through_from_str() {
        for kind in ProbeKind::ALL {
            assert_eq!(kind.as_str().parse::<ProbeKind>().ok(), Some(kind));
        }
        assert_eq!("Path-Trace".parse::<ProbeKind>().ok(), Some(ProbeKind::PathTrace));
    }

    #[tokio::test]
    async fn unknown_probe_name_is_an_error() {
        let err = registry()
            .run("teleport", &ProbeParams::default(), None)
            .await
            .expect_err("unknown probe must fail");
        assert!(matches!(err, ProbeError::UnknownProbe(name) if name == "teleport"));
    }

    #[tokio::test]
    async fn packet_analysis_without_file_fails_in_result() {
        let result = registry()
            .run("packet_analysis", &ProbeParams::default(), None)
            .await
            .expect("known probe");
        assert!(!result.succeeded);
        assert_eq!(result.numeric_value, None);
        assert_eq!(result.error_message.as_deref(), Some("no capture file given"));
    }

    #[tokio::test]
    async fn hung_probe_yields_timeout_result() {
        let result = with_deadline(
            ProbeKind::Throughput,
            Some("eth0".to_string()),
            Duration::from_millis(20),
            std::future::pending(),
        )
        .await;
        assert!(!result.succeeded);
        assert!(result.is_timeout());
        assert_eq!(result.probe_name, ProbeKind::Throughput);
        assert_eq!(result.target.as_deref(), Some("eth0"));
        assert!(result.duration_ms >= 20);
    }

    #[tokio::test]
    async fn run_set_preserves_requested_order() {
        let kinds = [ProbeKind::PacketAnalysis, ProbeKind::PacketAnalysis];
        let results = registry().run_set(&kinds).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.probe_name == ProbeKind::PacketAnalysis));
    }

    #[test]
    fn failed_result_serializes_with_null_value() {
        let result = ProbeResult::timed_out(ProbeKind::DnsLatency, None);
        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["probe_name"], "dns_latency");
        assert!(json["numeric_value"].is_null());
        assert_eq!(json["detail"]["kind"], "none");
        assert_eq!(json["error_message"], "timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn packet_analysis_uses_configured_timeout() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let decoder = dir.path().join("fake-tshark");
        std::fs::write(&decoder, "#!/bin/sh\nsleep 1\nprintf '1\\tok\\n'\n").expect("write stub");
        std::fs::set_permissions(&decoder, std::fs::Permissions::from_mode(0o755))
            .expect("chmod stub");
        let capture = dir.path().join("capture_00001_20260301120000.pcapng");
        std::fs::write(&capture, b"pcap").expect("write capture");

        let mut cfg = Config::default();
        cfg.probes.decoder_binary = decoder.to_string_lossy().into_owned();
        cfg.timeouts.packet_analysis_secs = 4;
        let registry = ProbeRegistry::new(&cfg);
        assert_eq!(registry.timeout_for(ProbeKind::PacketAnalysis), Duration::from_secs(4));

        let params = ProbeParams {
            target: None,
            file: Some(capture),
        };
        let result = registry.run_default(ProbeKind::PacketAnalysis, &params).await;
        assert!(result.succeeded, "{:?}", result.error_message);
        assert_eq!(result.numeric_value, Some(0.0));
    }
}
