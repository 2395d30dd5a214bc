use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::probes::reachability::ping_budget;
use crate::probes::trace::trace_budget;
use crate::probes::ProbeKind;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub probes: ProbesConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetsConfig {
    /// Local gateway. Detected from the default route when unset.
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default = "default_public_resolvers")]
    pub resolvers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_hostname")]
    pub hostname: String,
    #[serde(default = "default_public_resolvers")]
    pub resolvers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbesConfig {
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,
    #[serde(default = "default_ping_wait_secs")]
    pub ping_wait_secs: u64,
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default = "default_hop_wait_secs")]
    pub hop_wait_secs: u64,
    #[serde(default = "default_throughput_sample_secs")]
    pub throughput_sample_secs: u64,
    #[serde(default = "default_dns_query_timeout_ms")]
    pub dns_query_timeout_ms: u64,
    #[serde(default = "default_decoder_binary")]
    pub decoder_binary: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_reachability_timeout_secs")]
    pub reachability_secs: u64,
    #[serde(default = "default_path_trace_timeout_secs")]
    pub path_trace_secs: u64,
    #[serde(default = "default_spectrum_scan_timeout_secs")]
    pub spectrum_scan_secs: u64,
    #[serde(default = "default_dns_latency_timeout_secs")]
    pub dns_latency_secs: u64,
    #[serde(default = "default_throughput_timeout_secs")]
    pub throughput_secs: u64,
    #[serde(default = "default_neighbor_scan_timeout_secs")]
    pub neighbor_scan_secs: u64,
    #[serde(default = "default_packet_analysis_timeout_secs")]
    pub packet_analysis_secs: u64,
}

/// Classification and detection thresholds shared by the aggregator and
/// both analyzers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Thresholds {
    #[serde(default = "default_latency_fast_ms")]
    pub latency_fast_ms: f64,
    #[serde(default = "default_latency_slow_ms")]
    pub latency_slow_ms: f64,
    #[serde(default = "default_signal_good_dbm")]
    pub signal_good_dbm: f64,
    #[serde(default = "default_signal_poor_dbm")]
    pub signal_poor_dbm: f64,
    #[serde(default = "default_loss_fair_max_percent")]
    pub loss_fair_max_percent: f64,
    #[serde(default = "default_congestion_threshold")]
    pub congestion_threshold: u32,
    #[serde(default = "default_delay_threshold_ms")]
    pub delay_threshold_ms: f64,
    #[serde(default = "default_delay_ratio")]
    pub delay_ratio: f64,
    #[serde(default = "default_retransmission_warn_percent")]
    pub retransmission_warn_percent: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_binary")]
    pub binary: String,
    /// Falls back to the top-level `interface` when unset.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_capture_output_directory")]
    pub output_directory: PathBuf,
    #[serde(default = "default_capture_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_rotation_interval_seconds")]
    pub rotation_interval_seconds: u64,
    #[serde(default = "default_retained_file_count")]
    pub retained_file_count: u32,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_startup_check_ms")]
    pub startup_check_ms: u64,
    #[serde(default)]
    pub autostart: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_monitor_symptom")]
    pub symptom: String,
    #[serde(default = "default_escalate_on_warning")]
    pub escalate_on_warning: bool,
    /// Consecutive degraded cycles before a full cycle is triggered.
    #[serde(default = "default_escalate_after")]
    pub escalate_after: u32,
    #[serde(default = "default_escalation_cooldown_secs")]
    pub escalation_cooldown_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReasoningConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_reasoning_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interface: default_interface(),
            targets: TargetsConfig::default(),
            dns: DnsConfig::default(),
            probes: ProbesConfig::default(),
            timeouts: TimeoutsConfig::default(),
            thresholds: Thresholds::default(),
            capture: CaptureConfig::default(),
            monitor: MonitorConfig::default(),
            reasoning: ReasoningConfig::default(),
        }
    }
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            gateway: None,
            upstream: None,
            resolvers: default_public_resolvers(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            hostname: default_dns_hostname(),
            resolvers: default_public_resolvers(),
        }
    }
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            ping_count: default_ping_count(),
            ping_wait_secs: default_ping_wait_secs(),
            max_hops: default_max_hops(),
            hop_wait_secs: default_hop_wait_secs(),
            throughput_sample_secs: default_throughput_sample_secs(),
            dns_query_timeout_ms: default_dns_query_timeout_ms(),
            decoder_binary: default_decoder_binary(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            reachability_secs: default_reachability_timeout_secs(),
            path_trace_secs: default_path_trace_timeout_secs(),
            spectrum_scan_secs: default_spectrum_scan_timeout_secs(),
            dns_latency_secs: default_dns_latency_timeout_secs(),
            throughput_secs: default_throughput_timeout_secs(),
            neighbor_scan_secs: default_neighbor_scan_timeout_secs(),
            packet_analysis_secs: default_packet_analysis_timeout_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn for_probe(&self, kind: ProbeKind) -> Duration {
        let secs = match kind {
            ProbeKind::Reachability => self.reachability_secs,
            ProbeKind::PathTrace => self.path_trace_secs,
            ProbeKind::SpectrumScan => self.spectrum_scan_secs,
            ProbeKind::DnsLatency => self.dns_latency_secs,
            ProbeKind::Throughput => self.throughput_secs,
            ProbeKind::NeighborScan => self.neighbor_scan_secs,
            ProbeKind::PacketAnalysis => self.packet_analysis_secs,
        };
        Duration::from_secs(secs)
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            latency_fast_ms: default_latency_fast_ms(),
            latency_slow_ms: default_latency_slow_ms(),
            signal_good_dbm: default_signal_good_dbm(),
            signal_poor_dbm: default_signal_poor_dbm(),
            loss_fair_max_percent: default_loss_fair_max_percent(),
            congestion_threshold: default_congestion_threshold(),
            delay_threshold_ms: default_delay_threshold_ms(),
            delay_ratio: default_delay_ratio(),
            retransmission_warn_percent: default_retransmission_warn_percent(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            binary: default_capture_binary(),
            interface: None,
            output_directory: default_capture_output_directory(),
            file_prefix: default_capture_file_prefix(),
            rotation_interval_seconds: default_rotation_interval_seconds(),
            retained_file_count: default_retained_file_count(),
            stop_grace_secs: default_stop_grace_secs(),
            startup_check_ms: default_startup_check_ms(),
            autostart: false,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_monitor_interval_secs(),
            symptom: default_monitor_symptom(),
            escalate_on_warning: default_escalate_on_warning(),
            escalate_after: default_escalate_after(),
            escalation_cooldown_secs: default_escalation_cooldown_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.interface.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле interface не должно быть пустым".to_string(),
            ));
        }

        validate_targets(&self.targets)?;
        validate_dns(&self.dns)?;
        validate_probes(&self.probes)?;
        validate_timeouts(&self.timeouts)?;
        validate_command_budgets(&self.probes, &self.timeouts)?;
        self.thresholds.validate()?;
        validate_capture(&self.capture)?;
        validate_monitor(&self.monitor)?;

        if self.reasoning.endpoint.is_some() && self.reasoning.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "reasoning.timeout_secs должно быть > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn capture_interface(&self) -> &str {
        self.capture
            .interface
            .as_deref()
            .unwrap_or(self.interface.as_str())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.latency_fast_ms <= 0.0 || self.latency_slow_ms <= 0.0 {
            return Err(ConfigError::Validation(
                "thresholds.latency_*_ms должны быть > 0".to_string(),
            ));
        }
        if self.latency_fast_ms >= self.latency_slow_ms {
            return Err(ConfigError::Validation(
                "thresholds.latency_fast_ms должно быть меньше latency_slow_ms".to_string(),
            ));
        }
        if self.signal_poor_dbm >= self.signal_good_dbm {
            return Err(ConfigError::Validation(
                "thresholds.signal_poor_dbm должно быть меньше signal_good_dbm".to_string(),
            ));
        }
        if self.signal_good_dbm > 0.0 {
            return Err(ConfigError::Validation(
                "thresholds.signal_good_dbm должно быть <= 0".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.loss_fair_max_percent) {
            return Err(ConfigError::Validation(
                "thresholds.loss_fair_max_percent должно быть в диапазоне 0..100".to_string(),
            ));
        }
        if self.congestion_threshold < 1 {
            return Err(ConfigError::Validation(
                "thresholds.congestion_threshold должно быть >= 1".to_string(),
            ));
        }
        if self.delay_threshold_ms <= 0.0 {
            return Err(ConfigError::Validation(
                "thresholds.delay_threshold_ms должно быть > 0".to_string(),
            ));
        }
        if self.delay_ratio < 1.0 {
            return Err(ConfigError::Validation(
                "thresholds.delay_ratio должно быть >= 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.retransmission_warn_percent) {
            return Err(ConfigError::Validation(
                "thresholds.retransmission_warn_percent должно быть в диапазоне 0..100"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_targets(cfg: &TargetsConfig) -> Result<(), ConfigError> {
    if let Some(gateway) = &cfg.gateway {
        if gateway.trim().is_empty() {
            return Err(ConfigError::Validation(
                "targets.gateway не должен быть пустым".to_string(),
            ));
        }
    }
    if let Some(upstream) = &cfg.upstream {
        if upstream.trim().is_empty() {
            return Err(ConfigError::Validation(
                "targets.upstream не должен быть пустым".to_string(),
            ));
        }
    }
    if cfg.resolvers.is_empty() {
        return Err(ConfigError::Validation(
            "targets.resolvers должен содержать хотя бы один адрес".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for target in &cfg.resolvers {
        if target.trim().is_empty() {
            return Err(ConfigError::Validation(
                "targets.resolvers[*] не должен быть пустым".to_string(),
            ));
        }
        if !seen.insert(target.as_str()) {
            return Err(ConfigError::Validation(format!(
                "адрес '{target}' в targets.resolvers должен быть уникальным"
            )));
        }
    }
    Ok(())
}

fn validate_dns(cfg: &DnsConfig) -> Result<(), ConfigError> {
    if cfg.hostname.trim().is_empty() || cfg.hostname.split('.').any(|l| l.len() > 63) {
        return Err(ConfigError::Validation(
            "dns.hostname должен быть корректным именем хоста".to_string(),
        ));
    }
    if cfg.resolvers.is_empty() {
        return Err(ConfigError::Validation(
            "dns.resolvers должен содержать хотя бы один адрес".to_string(),
        ));
    }
    for resolver in &cfg.resolvers {
        if IpAddr::from_str(resolver).is_err() {
            return Err(ConfigError::Validation(format!(
                "dns.resolvers: '{resolver}' не является IP-адресом"
            )));
        }
    }
    Ok(())
}

fn validate_probes(cfg: &ProbesConfig) -> Result<(), ConfigError> {
    if cfg.ping_count < 1 {
        return Err(ConfigError::Validation(
            "probes.ping_count должно быть >= 1".to_string(),
        ));
    }
    if cfg.ping_wait_secs < 1 || cfg.hop_wait_secs < 1 {
        return Err(ConfigError::Validation(
            "probes.ping_wait_secs и probes.hop_wait_secs должны быть >= 1".to_string(),
        ));
    }
    if !(1..=64).contains(&cfg.max_hops) {
        return Err(ConfigError::Validation(
            "probes.max_hops должно быть в диапазоне 1..64".to_string(),
        ));
    }
    if cfg.dns_query_timeout_ms < 100 {
        return Err(ConfigError::Validation(
            "probes.dns_query_timeout_ms должно быть >= 100".to_string(),
        ));
    }
    if cfg.throughput_sample_secs < 1 {
        return Err(ConfigError::Validation(
            "probes.throughput_sample_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.decoder_binary.trim().is_empty() {
        return Err(ConfigError::Validation(
            "probes.decoder_binary не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

fn validate_timeouts(cfg: &TimeoutsConfig) -> Result<(), ConfigError> {
    for kind in ProbeKind::ALL {
        if cfg.for_probe(kind).is_zero() {
            return Err(ConfigError::Validation(format!(
                "timeouts.{}_secs должно быть > 0",
                kind.as_str()
            )));
        }
    }
    Ok(())
}

// A command bound above its probe timeout loses every partial result.
fn validate_command_budgets(
    probes: &ProbesConfig,
    timeouts: &TimeoutsConfig,
) -> Result<(), ConfigError> {
    let ping = ping_budget(probes.ping_count, probes.ping_wait_secs);
    if ping > timeouts.for_probe(ProbeKind::Reachability) {
        return Err(ConfigError::Validation(format!(
            "timeouts.reachability_secs должно быть >= {} (ping_count * ping_wait_secs + 2)",
            ping.as_secs()
        )));
    }
    let trace = trace_budget(probes.max_hops, probes.hop_wait_secs);
    if trace > timeouts.for_probe(ProbeKind::PathTrace) {
        return Err(ConfigError::Validation(format!(
            "timeouts.path_trace_secs должно быть >= {} (max_hops * hop_wait_secs + 5)",
            trace.as_secs()
        )));
    }
    Ok(())
}

fn validate_capture(cfg: &CaptureConfig) -> Result<(), ConfigError> {
    if cfg.binary.trim().is_empty() {
        return Err(ConfigError::Validation(
            "capture.binary не должен быть пустым".to_string(),
        ));
    }
    if cfg.file_prefix.trim().is_empty() || cfg.file_prefix.contains('/') {
        return Err(ConfigError::Validation(
            "capture.file_prefix должен быть непустым именем без '/'".to_string(),
        ));
    }
    if cfg.output_directory.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "capture.output_directory не должен быть пустым".to_string(),
        ));
    }
    if cfg.rotation_interval_seconds < 1 {
        return Err(ConfigError::Validation(
            "capture.rotation_interval_seconds должно быть >= 1".to_string(),
        ));
    }
    if cfg.retained_file_count < 1 {
        return Err(ConfigError::Validation(
            "capture.retained_file_count должно быть >= 1".to_string(),
        ));
    }
    if cfg.stop_grace_secs < 1 {
        return Err(ConfigError::Validation(
            "capture.stop_grace_secs должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_monitor(cfg: &MonitorConfig) -> Result<(), ConfigError> {
    if cfg.interval_secs < 5 {
        return Err(ConfigError::Validation(
            "monitor.interval_secs должно быть >= 5".to_string(),
        ));
    }
    if cfg.escalate_after < 1 {
        return Err(ConfigError::Validation(
            "monitor.escalate_after должно быть >= 1".to_string(),
        ));
    }
    if cfg.symptom.parse::<crate::orchestrator::SymptomHint>().is_err() {
        return Err(ConfigError::Validation(format!(
            "monitor.symptom '{}' не распознан",
            cfg.symptom
        )));
    }
    Ok(())
}

fn default_listen() -> String {
    "127.0.0.1:9120".to_string()
}

fn default_interface() -> String {
    "wlan0".to_string()
}

fn default_public_resolvers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
}

fn default_dns_hostname() -> String {
    "google.com".to_string()
}

const fn default_ping_count() -> u32 {
    5
}

const fn default_ping_wait_secs() -> u64 {
    2
}

const fn default_max_hops() -> u32 {
    15
}

const fn default_hop_wait_secs() -> u64 {
    2
}

const fn default_throughput_sample_secs() -> u64 {
    2
}

const fn default_dns_query_timeout_ms() -> u64 {
    2000
}

fn default_decoder_binary() -> String {
    "tshark".to_string()
}

const fn default_reachability_timeout_secs() -> u64 {
    20
}

const fn default_path_trace_timeout_secs() -> u64 {
    40
}

const fn default_spectrum_scan_timeout_secs() -> u64 {
    15
}

const fn default_dns_latency_timeout_secs() -> u64 {
    5
}

const fn default_throughput_timeout_secs() -> u64 {
    10
}

const fn default_neighbor_scan_timeout_secs() -> u64 {
    5
}

const fn default_packet_analysis_timeout_secs() -> u64 {
    30
}

const fn default_latency_fast_ms() -> f64 {
    50.0
}

const fn default_latency_slow_ms() -> f64 {
    200.0
}

const fn default_signal_good_dbm() -> f64 {
    -50.0
}

const fn default_signal_poor_dbm() -> f64 {
    -70.0
}

const fn default_loss_fair_max_percent() -> f64 {
    5.0
}

const fn default_congestion_threshold() -> u32 {
    5
}

const fn default_delay_threshold_ms() -> f64 {
    100.0
}

const fn default_delay_ratio() -> f64 {
    2.0
}

const fn default_retransmission_warn_percent() -> f64 {
    2.0
}

fn default_capture_binary() -> String {
    "dumpcap".to_string()
}

fn default_capture_output_directory() -> PathBuf {
    PathBuf::from("/tmp/netsleuth/captures")
}

fn default_capture_file_prefix() -> String {
    "capture".to_string()
}

const fn default_rotation_interval_seconds() -> u64 {
    300
}

const fn default_retained_file_count() -> u32 {
    12
}

const fn default_stop_grace_secs() -> u64 {
    5
}

const fn default_startup_check_ms() -> u64 {
    500
}

const fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_monitor_symptom() -> String {
    "health".to_string()
}

const fn default_escalate_on_warning() -> bool {
    true
}

const fn default_escalate_after() -> u32 {
    2
}

const fn default_escalation_cooldown_secs() -> u64 {
    300
}

const fn default_reasoning_timeout_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default()
            .validate()
            .expect("конфигурация по умолчанию должна проходить валидацию");
    }

    #[test]
    fn example_yaml_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("разбор примера");
        cfg.validate().expect("пример должен проходить валидацию");
        assert_eq!(cfg.capture.retained_file_count, 12);
    }

    #[test]
    fn empty_yaml_falls_back_to_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").expect("разбор пустого YAML");
        assert_eq!(cfg.thresholds.latency_fast_ms, 50.0);
        assert_eq!(cfg.thresholds.congestion_threshold, 5);
        assert_eq!(cfg.targets.resolvers, vec!["8.8.8.8", "1.1.1.1"]);
        assert_eq!(cfg.capture_interface(), "wlan0");
    }

    #[test]
    fn zero_rotation_interval_is_rejected_not_clamped() {
        let mut cfg = Config::default();
        cfg.capture.rotation_interval_seconds = 0;
        let err = cfg.validate().expect_err("нулевой интервал ротации недопустим");
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("rotation_interval")));
    }

    #[test]
    fn inverted_latency_thresholds_are_rejected() {
        let mut cfg = Config::default();
        cfg.thresholds.latency_fast_ms = 300.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dns_resolvers_must_be_ip_addresses() {
        let mut cfg = Config::default();
        cfg.dns.resolvers = vec!["dns.google".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_monitor_symptom_is_rejected() {
        let mut cfg = Config::default();
        cfg.monitor.symptom = "sunspots".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn capture_interface_override_wins() {
        let mut cfg = Config::default();
        cfg.capture.interface = Some("eth0".to_string());
        assert_eq!(cfg.capture_interface(), "eth0");
    }

    #[test]
    fn ping_budget_above_reachability_timeout_is_rejected() {
        let mut cfg = Config::default();
        cfg.probes.ping_count = 10;
        cfg.probes.ping_wait_secs = 3;
        cfg.timeouts.reachability_secs = 20;
        let err = cfg.validate().expect_err("ping не укладывается в таймаут");
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("reachability_secs")));

        cfg.timeouts.reachability_secs = 32;
        cfg.validate().expect("32 секунды достаточно");
    }

    #[test]
    fn trace_budget_above_path_trace_timeout_is_rejected() {
        let mut cfg = Config::default();
        cfg.probes.max_hops = 30;
        cfg.probes.hop_wait_secs = 2;
        let err = cfg.validate().expect_err("traceroute не укладывается в таймаут");
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("path_trace_secs")));

        cfg.timeouts.path_trace_secs = 65;
        cfg.validate().expect("65 секунд достаточно");
    }
}
