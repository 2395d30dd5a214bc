use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::probes::{ProbeKind, ProbeParams, ProbeRegistry, ProbeResult};

const CAPTURE_EXTENSIONS: [&str; 2] = [".pcapng", ".pcap"];

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid capture settings: {0}")]
    InvalidSpec(String),
    #[error("cannot start {binary}: {reason}; {hint}")]
    Spawn {
        binary: String,
        reason: String,
        hint: String,
    },
    #[error("{binary} exited during startup ({status}): {stderr}; {hint}")]
    ExitedEarly {
        binary: String,
        status: String,
        stderr: String,
        hint: String,
    },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl CaptureError {
    pub fn hint(&self) -> Option<&str> {
        match self {
            CaptureError::Spawn { hint, .. } | CaptureError::ExitedEarly { hint, .. } => {
                Some(hint)
            }
            _ => None,
        }
    }
}

/// Parameters of one capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSpec {
    pub interface: String,
    pub rotation_interval_seconds: u64,
    pub retained_file_count: u32,
    pub output_directory: PathBuf,
}

impl CaptureSpec {
    pub fn from_config(cfg: &CaptureConfig, interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            rotation_interval_seconds: cfg.rotation_interval_seconds,
            retained_file_count: cfg.retained_file_count,
            output_directory: cfg.output_directory.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.interface.trim().is_empty() {
            return Err(CaptureError::InvalidSpec("interface is empty".into()));
        }
        if self.rotation_interval_seconds == 0 {
            return Err(CaptureError::InvalidSpec(
                "rotation_interval_seconds must be positive".into(),
            ));
        }
        if self.retained_file_count == 0 {
            return Err(CaptureError::InvalidSpec(
                "retained_file_count must be positive".into(),
            ));
        }
        if self.output_directory.as_os_str().is_empty() {
            return Err(CaptureError::InvalidSpec("output_directory is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub pid: Option<u32>,
    pub started_at: String,
    #[serde(flatten)]
    pub spec: CaptureSpec,
    #[serde(skip)]
    started: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub already_running: bool,
    pub session: SessionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    NotRunning,
    Stopped {
        session_id: u64,
        graceful: bool,
        exit_status: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub state: SessionState,
    pub session: Option<SessionInfo>,
    pub elapsed_secs: Option<u64>,
    pub file_count: usize,
    pub last_exit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureFile {
    pub path: PathBuf,
    pub file_name: String,
    pub sequence_index: u64,
    pub created_at: String,
    pub size_bytes: u64,
    #[serde(skip)]
    created: SystemTime,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnalyzeOutcome {
    NothingToAnalyze { reason: String },
    Analyzed { file: CaptureFile, result: ProbeResult },
}

#[derive(Debug)]
struct Slot {
    state: SessionState,
    child: Option<Child>,
    session: Option<SessionInfo>,
    last_spec: Option<CaptureSpec>,
    last_exit: Option<String>,
}

impl Slot {
    /// Moves a dead `Running` session back to `Idle`.
    fn poll_exit(&mut self) {
        if self.state != SessionState::Running {
            return;
        }
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                let session_id = self.session.as_ref().map(|s| s.session_id);
                warn!(session_id, status = %status, "capture process exited unexpectedly");
                self.child = None;
                self.session = None;
                self.state = SessionState::Idle;
                self.last_exit = Some(format!("exited unexpectedly: {status}"));
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "capture liveness check failed"),
        }
    }
}

/// Owns the background capture process. Start and stop are serialized;
/// status and listing only take the slot lock briefly.
#[derive(Debug)]
pub struct CaptureManager {
    binary: String,
    file_prefix: String,
    stop_grace: Duration,
    startup_check: Duration,
    defaults: CaptureSpec,
    transitions: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
    next_session: AtomicU64,
}

impl CaptureManager {
    /// Never touches the filesystem or the capture binary.
    pub fn new(cfg: &CaptureConfig, interface: &str) -> Self {
        Self {
            binary: cfg.binary.clone(),
            file_prefix: cfg.file_prefix.clone(),
            stop_grace: Duration::from_secs(cfg.stop_grace_secs),
            startup_check: Duration::from_millis(cfg.startup_check_ms),
            defaults: CaptureSpec::from_config(cfg, interface),
            transitions: tokio::sync::Mutex::new(()),
            slot: Mutex::new(Slot {
                state: SessionState::Idle,
                child: None,
                session: None,
                last_spec: None,
                last_exit: None,
            }),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn default_spec(&self) -> &CaptureSpec {
        &self.defaults
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a session. While one is running this returns the existing
    /// session instead of spawning a second process.
    pub async fn start(&self, spec: CaptureSpec) -> Result<StartOutcome, CaptureError> {
        let _transition = self.transitions.lock().await;
        {
            let mut slot = self.lock_slot();
            slot.poll_exit();
            if let (SessionState::Running, Some(session)) = (slot.state, slot.session.as_ref()) {
                debug!(session_id = session.session_id, "capture already running");
                return Ok(StartOutcome {
                    already_running: true,
                    session: session.clone(),
                });
            }
        }

        spec.validate()?;
        fs::create_dir_all(&spec.output_directory).map_err(|source| CaptureError::Io {
            context: "cannot create capture directory",
            source,
        })?;
        let log_path = spec
            .output_directory
            .join(format!("{}.log", self.file_prefix));
        let log = File::create(&log_path).map_err(|source| CaptureError::Io {
            context: "cannot create capture log",
            source,
        })?;

        let output = spec
            .output_directory
            .join(format!("{}.pcapng", self.file_prefix));
        let output_arg = output.to_string_lossy().into_owned();
        let duration_arg = format!("duration:{}", spec.rotation_interval_seconds);
        let files_arg = format!("files:{}", spec.retained_file_count);

        let mut child = Command::new(&self.binary)
            .args([
                "-i",
                spec.interface.as_str(),
                "-q",
                "-b",
                duration_arg.as_str(),
                "-b",
                files_arg.as_str(),
                "-w",
                output_arg.as_str(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| spawn_error(&self.binary, &err))?;

        // Privilege and interface errors surface as an immediate exit.
        time::sleep(self.startup_check).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                let stderr = read_log_tail(&log_path);
                warn!(binary = %self.binary, status = %status, stderr = %stderr, "capture exited during startup");
                return Err(CaptureError::ExitedEarly {
                    binary: self.binary.clone(),
                    status: status.to_string(),
                    hint: exit_hint(&self.binary, &stderr),
                    stderr,
                });
            }
            Ok(None) => {}
            Err(source) => {
                return Err(CaptureError::Io {
                    context: "capture liveness check failed",
                    source,
                })
            }
        }

        let session = SessionInfo {
            session_id: self.next_session.fetch_add(1, Ordering::Relaxed),
            pid: child.id(),
            started_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            spec: spec.clone(),
            started: Instant::now(),
        };
        info!(
            session_id = session.session_id,
            pid = ?session.pid,
            interface = %spec.interface,
            directory = %spec.output_directory.display(),
            "захват трафика запущен"
        );

        let mut slot = self.lock_slot();
        slot.state = SessionState::Running;
        slot.child = Some(child);
        slot.session = Some(session.clone());
        slot.last_spec = Some(spec);
        Ok(StartOutcome {
            already_running: false,
            session,
        })
    }

    /// Asks the process to terminate, escalating to a kill after the grace
    /// period. Stopping an idle manager is not an error.
    pub async fn stop(&self) -> StopOutcome {
        let _transition = self.transitions.lock().await;
        let (mut child, session_id) = {
            let mut slot = self.lock_slot();
            slot.poll_exit();
            let Some(child) = slot.child.take() else {
                return StopOutcome::NotRunning;
            };
            slot.state = SessionState::Stopping;
            let session_id = slot.session.as_ref().map(|s| s.session_id).unwrap_or(0);
            (child, session_id)
        };

        if let Err(err) = request_termination(&mut child) {
            warn!(session_id, error = %err, "capture terminate signal failed");
        }

        let (graceful, exit_status) = match time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => (true, Some(status.to_string())),
            Ok(Err(err)) => {
                warn!(session_id, error = %err, "capture wait failed");
                (false, None)
            }
            Err(_elapsed) => {
                warn!(session_id, grace = ?self.stop_grace, "capture ignored terminate, killing");
                if let Err(err) = child.kill().await {
                    warn!(session_id, error = %err, "capture kill failed");
                }
                let status = child.try_wait().ok().flatten().map(|s| s.to_string());
                (false, status)
            }
        };

        let mut slot = self.lock_slot();
        slot.state = SessionState::Idle;
        slot.session = None;
        slot.last_exit = Some(match (&exit_status, graceful) {
            (Some(status), true) => format!("stopped: {status}"),
            (Some(status), false) => format!("killed: {status}"),
            (None, _) => "killed".to_string(),
        });
        info!(session_id, graceful, "захват трафика остановлен");
        StopOutcome::Stopped {
            session_id,
            graceful,
            exit_status,
        }
    }

    pub fn status(&self) -> CaptureStatus {
        let (state, session, last_exit, directory) = {
            let mut slot = self.lock_slot();
            slot.poll_exit();
            (
                slot.state,
                slot.session.clone(),
                slot.last_exit.clone(),
                self.current_directory(&slot),
            )
        };
        CaptureStatus {
            state,
            elapsed_secs: session.as_ref().map(|s| s.started.elapsed().as_secs()),
            session,
            file_count: scan_capture_dir(&directory, &self.file_prefix).len(),
            last_exit,
        }
    }

    pub fn is_running(&self) -> bool {
        let mut slot = self.lock_slot();
        slot.poll_exit();
        slot.state == SessionState::Running
    }

    /// Capture files, newest first, capped at the retention count.
    pub fn list_files(&self) -> Vec<CaptureFile> {
        let (directory, retained) = {
            let slot = self.lock_slot();
            let retained = slot
                .last_spec
                .as_ref()
                .map(|s| s.retained_file_count)
                .unwrap_or(self.defaults.retained_file_count);
            (self.current_directory(&slot), retained)
        };
        let mut files = scan_capture_dir(&directory, &self.file_prefix);
        files.truncate(retained as usize);
        files
    }

    pub fn latest_file(&self) -> Option<CaptureFile> {
        self.list_files().into_iter().next()
    }

    /// Runs packet analysis on the newest capture. Lists again once if the
    /// file was rotated away in between.
    pub async fn analyze_latest(&self, registry: &ProbeRegistry) -> AnalyzeOutcome {
        for _ in 0..2 {
            let Some(file) = self.latest_file() else {
                break;
            };
            if !file.path.exists() {
                debug!(file = %file.path.display(), "latest capture evicted, listing again");
                continue;
            }
            let result = registry
                .run_default(ProbeKind::PacketAnalysis, &ProbeParams::for_file(&file.path))
                .await;
            return AnalyzeOutcome::Analyzed { file, result };
        }
        AnalyzeOutcome::NothingToAnalyze {
            reason: "no capture files yet".to_string(),
        }
    }

    fn current_directory(&self, slot: &Slot) -> PathBuf {
        slot.last_spec
            .as_ref()
            .map(|s| s.output_directory.clone())
            .unwrap_or_else(|| self.defaults.output_directory.clone())
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    // SAFETY: `pid` is our own child and has not been reaped yet.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

fn spawn_error(binary: &str, err: &io::Error) -> CaptureError {
    let hint = match err.kind() {
        io::ErrorKind::NotFound => format!(
            "install the package that provides {binary} (wireshark-common or tshark) or set capture.binary"
        ),
        io::ErrorKind::PermissionDenied => privilege_hint(binary),
        _ => "check capture.binary and capture.output_directory".to_string(),
    };
    CaptureError::Spawn {
        binary: binary.to_string(),
        reason: err.to_string(),
        hint,
    }
}

fn exit_hint(binary: &str, stderr: &str) -> String {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("not permitted") {
        privilege_hint(binary)
    } else if lower.contains("no such device") || lower.contains("no interface") {
        "check capture.interface names an existing interface".to_string()
    } else {
        format!("see {binary} output above")
    }
}

fn privilege_hint(binary: &str) -> String {
    format!("run as root or grant {binary} cap_net_raw,cap_net_admin (setcap)")
}

fn read_log_tail(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .take(3)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | "),
        Err(err) => format!("log unavailable: {err}"),
    }
}

/// Reads the sequence number out of `<prefix>_<seq>_<YYYYMMDDhhmmss>.pcapng`
/// names. The stamp is local time without an offset, so it is not used for
/// ordering. Hand-made files without a stamp are accepted.
pub fn parse_capture_name(name: &str, prefix: &str) -> Option<u64> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
    let stem = CAPTURE_EXTENSIONS
        .iter()
        .find_map(|ext| rest.strip_suffix(ext))?;
    let seq = match stem.split_once('_') {
        Some((seq, stamp)) if stamp.bytes().all(|b| b.is_ascii_digit()) => seq,
        Some(_) => return None,
        None => stem,
    };
    seq.parse::<u64>().ok()
}

/// Lists capture files sorted newest first by sequence number, with
/// modification time breaking ties. Entries that vanish while scanning are
/// skipped.
fn scan_capture_dir(directory: &Path, prefix: &str) -> Vec<CaptureFile> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(directory = %directory.display(), error = %err, "capture directory unreadable");
            }
            return Vec::new();
        }
    };

    let mut files: Vec<CaptureFile> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let sequence_index = parse_capture_name(&file_name, prefix)?;
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let created = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some(CaptureFile {
                path: entry.path(),
                file_name,
                sequence_index,
                created_at: humantime::format_rfc3339_seconds(created).to_string(),
                size_bytes: meta.len(),
                created,
            })
        })
        .collect();

    files.sort_by(|a, b| {
        b.sequence_index
            .cmp(&a.sequence_index)
            .then(b.created.cmp(&a.created))
    });
    files
}
