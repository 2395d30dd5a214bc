use crate::capture::{CaptureError, CaptureManager, CaptureSpec, CaptureStatus};
use crate::evidence::EvidenceRecord;
use crate::metrics::Metrics;
use crate::orchestrator::{Diagnostician, SymptomHint};
use crate::probes::{ProbeError, ProbeParams};
use crate::state::{now_unix, EscalationTrack, State as DaemonState};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<DaemonState>>,
    pub diagnostician: Arc<Diagnostician>,
    pub capture: Arc<CaptureManager>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiState {
    pub started_at_unix: i64,
    pub last_cycle_unix: i64,
    pub cycles_total: u64,
    pub last_symptom: Option<String>,
    pub escalation: EscalationTrack,
    pub last_evidence: Option<EvidenceRecord>,
    pub capture: CaptureStatus,
}

impl ApiState {
    fn new(value: &DaemonState, capture: CaptureStatus) -> Self {
        Self {
            started_at_unix: value.started_at_unix,
            last_cycle_unix: value.last_cycle_unix,
            cycles_total: value.cycles_total,
            last_symptom: value.last_symptom.clone(),
            escalation: value.escalation.clone(),
            last_evidence: value.last_evidence.clone(),
            capture,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DiagnoseQuery {
    pub symptom: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProbeQuery {
    pub target: Option<String>,
    pub file: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
}

/// Overrides for one capture session. Missing fields keep the configured
/// defaults.
#[derive(Debug, Default, Deserialize)]
pub struct CaptureStartRequest {
    pub interface: Option<String>,
    pub rotation_interval_seconds: Option<u64>,
    pub retained_file_count: Option<u32>,
    pub output_directory: Option<PathBuf>,
}

impl CaptureStartRequest {
    fn merge_over(self, defaults: &CaptureSpec) -> CaptureSpec {
        CaptureSpec {
            interface: self.interface.unwrap_or_else(|| defaults.interface.clone()),
            rotation_interval_seconds: self
                .rotation_interval_seconds
                .unwrap_or(defaults.rotation_interval_seconds),
            retained_file_count: self
                .retained_file_count
                .unwrap_or(defaults.retained_file_count),
            output_directory: self
                .output_directory
                .unwrap_or_else(|| defaults.output_directory.clone()),
        }
    }
}

pub fn build_router(
    metrics: Arc<Metrics>,
    state: Arc<RwLock<DaemonState>>,
    diagnostician: Arc<Diagnostician>,
    capture: Arc<CaptureManager>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/api/diagnose", post(diagnose_handler))
        .route("/api/probes", get(probe_list_handler))
        .route("/api/probes/:name", get(probe_handler))
        .route("/api/capture/start", post(capture_start_handler))
        .route("/api/capture/stop", post(capture_stop_handler))
        .route("/api/capture/status", get(capture_status_handler))
        .route("/api/capture/files", get(capture_files_handler))
        .route("/api/capture/analyze", post(capture_analyze_handler))
        .with_state(HttpAppState {
            metrics,
            state,
            diagnostician,
            capture,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    {
        let guard = state.state.read().await;
        state.metrics.update_from_state(&guard);
    }
    state.metrics.update_capture(&state.capture.status());
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let capture = state.capture.status();
    let guard = state.state.read().await;
    Json(ApiState::new(&guard, capture))
}

async fn diagnose_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<DiagnoseQuery>,
) -> Response {
    let symptom = match query.symptom.as_deref().map(str::parse::<SymptomHint>) {
        None => SymptomHint::Full,
        Some(Ok(symptom)) => symptom,
        Some(Err(err)) => return error_response(StatusCode::BAD_REQUEST, err.to_string(), None),
    };

    let diagnosis = state.diagnostician.diagnose(symptom).await;
    state.metrics.observe_evidence(&diagnosis.evidence);
    state
        .state
        .write()
        .await
        .record_cycle(now_unix(), diagnosis.evidence.clone());
    Json(diagnosis).into_response()
}

async fn probe_list_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(state.diagnostician.registry().names())
}

async fn probe_handler(
    State(state): State<HttpAppState>,
    Path(name): Path<String>,
    Query(query): Query<ProbeQuery>,
) -> Response {
    let params = ProbeParams {
        target: query.target,
        file: query.file,
    };
    let timeout = query.timeout_ms.map(Duration::from_millis);
    match state.diagnostician.registry().run(&name, &params, timeout).await {
        Ok(result) => Json(result).into_response(),
        Err(err @ ProbeError::UnknownProbe(_)) => {
            error_response(StatusCode::NOT_FOUND, err.to_string(), None)
        }
    }
}

async fn capture_start_handler(
    State(state): State<HttpAppState>,
    body: Bytes,
) -> Response {
    // An empty body means "configured defaults"; anything else must parse.
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CaptureStartRequest::default()
    } else {
        match serde_json::from_slice::<CaptureStartRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("некорректное тело запроса: {err}"),
                    None,
                )
            }
        }
    };
    let spec = request.merge_over(state.capture.default_spec());
    match state.capture.start(spec).await {
        Ok(outcome) => {
            state.metrics.update_capture(&state.capture.status());
            Json(outcome).into_response()
        }
        Err(err) => capture_error_response(&err),
    }
}

async fn capture_stop_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let outcome = state.capture.stop().await;
    state.metrics.update_capture(&state.capture.status());
    Json(outcome)
}

async fn capture_status_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let status = state.capture.status();
    state.metrics.update_capture(&status);
    Json(status)
}

async fn capture_files_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(state.capture.list_files())
}

async fn capture_analyze_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(
        state
            .capture
            .analyze_latest(state.diagnostician.registry())
            .await,
    )
}

fn capture_error_response(err: &CaptureError) -> Response {
    let status = match err {
        CaptureError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
        CaptureError::Spawn { .. } | CaptureError::ExitedEarly { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CaptureError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string(), err.hint())
}

fn error_response(status: StatusCode, message: String, hint: Option<&str>) -> Response {
    let body = match hint {
        Some(hint) => json!({ "error": message, "hint": hint }),
        None => json!({ "error": message }),
    };
    (status, Json(body)).into_response()
}
