mod analysis;
mod capture;
mod config;
mod evidence;
mod http;
mod metrics;
mod orchestrator;
mod probes;
mod reasoning;
mod state;

use axum::serve;
use capture::{CaptureManager, StopOutcome};
use clap::Parser;
use config::Config;
use metrics::Metrics;
use orchestrator::{escalation_for, Diagnostician, SymptomHint};
use probes::ProbeRegistry;
use reasoning::ReasoningClient;
use state::{now_unix, EscalationEvent, State};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netsleuth")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Run one diagnostic cycle for the given symptom, print the result as
    /// JSON and exit.
    #[arg(long, value_name = "SYMPTOM")]
    once: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let reasoning = match ReasoningClient::from_config(&cfg.reasoning) {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "клиент сервиса гипотез не создан, продолжаем без него");
            None
        }
    };
    let registry = Arc::new(ProbeRegistry::new(&cfg));
    let diagnostician = Arc::new(Diagnostician::new(
        registry,
        cfg.thresholds.clone(),
        reasoning,
    ));

    if let Some(symptom) = cli.once {
        std::process::exit(run_once(&diagnostician, &symptom).await);
    }

    info!(
        listen = %cfg.listen,
        interface = %cfg.interface,
        monitor = cfg.monitor.enabled,
        "запуск netsleuth"
    );

    let shared_state = Arc::new(RwLock::new(State::new(now_unix())));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };
    let capture = Arc::new(CaptureManager::new(&cfg.capture, cfg.capture_interface()));

    if cfg.capture.autostart {
        match capture.start(capture.default_spec().clone()).await {
            Ok(outcome) => {
                info!(session_id = outcome.session.session_id, "захват запущен автоматически");
                metrics.update_capture(&capture.status());
            }
            Err(err) => {
                error!(error = %err, hint = err.hint().unwrap_or(""), "автозапуск захвата не удался");
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let diagnostician = diagnostician.clone();
        let capture = capture.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, http_state, diagnostician, capture);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let monitor_task = if cfg.monitor.enabled {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let shared_state = shared_state.clone();
        let diagnostician = diagnostician.clone();
        let mut shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let symptom = cfg
                .monitor
                .symptom
                .parse::<SymptomHint>()
                .unwrap_or(SymptomHint::Health);
            let mut ticker = tokio::time::interval(Duration::from_secs(cfg.monitor.interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки цикла мониторинга");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor_tick(&cfg, &metrics, &shared_state, &diagnostician, symptom).await;
                    }
                }
            }
        }))
    } else {
        None
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    if let Some(task) = monitor_task {
        let _ = task.await;
    }
    if let StopOutcome::Stopped { session_id, graceful, .. } = capture.stop().await {
        info!(session_id, graceful, "захват остановлен при завершении");
    }
    let _ = http_task.await;
}

/// One routine cycle, plus a follow-up cycle when the escalation tracker
/// says one is due.
async fn monitor_tick(
    cfg: &Config,
    metrics: &Metrics,
    shared_state: &RwLock<State>,
    diagnostician: &Diagnostician,
    symptom: SymptomHint,
) {
    let record = diagnostician.run_diagnostic_cycle(symptom).await;
    metrics.observe_evidence(&record);

    let follow_up = escalation_for(&record);
    let event = {
        let mut guard = shared_state.write().await;
        guard.record_cycle(now_unix(), record);
        let event = if cfg.monitor.escalate_on_warning {
            guard.apply_escalation_rules(&cfg.monitor, now_unix())
        } else {
            None
        };
        metrics.update_from_state(&guard);
        event
    };

    let kind = match event {
        None => return,
        Some(EscalationEvent::Recovered) => {
            metrics.inc_escalation("recovered");
            info!(symptom = %symptom, "деградация сети прошла");
            return;
        }
        Some(EscalationEvent::Escalate) => "escalate",
        Some(EscalationEvent::Repeat) => "repeat",
    };
    metrics.inc_escalation(kind);
    warn!(symptom = %symptom, follow_up = %follow_up, kind, "деградация сети, запускается углублённая диагностика");

    let diagnosis = diagnostician.diagnose(follow_up).await;
    metrics.observe_evidence(&diagnosis.evidence);
    if let Some(hypotheses) = &diagnosis.hypotheses {
        info!(follow_up = %follow_up, hypotheses = %hypotheses, "получены гипотезы");
    }
    let mut guard = shared_state.write().await;
    guard.record_cycle(now_unix(), diagnosis.evidence);
    metrics.update_from_state(&guard);
}

async fn run_once(diagnostician: &Diagnostician, symptom: &str) -> i32 {
    let symptom = match symptom.parse::<SymptomHint>() {
        Ok(symptom) => symptom,
        Err(err) => {
            error!(error = %err, "неизвестный симптом");
            return 2;
        }
    };
    let diagnosis = diagnostician.diagnose(symptom).await;
    match serde_json::to_string_pretty(&diagnosis) {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(err) => {
            error!(error = %err, "не удалось сериализовать результат");
            1
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
