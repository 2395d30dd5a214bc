use crate::config::MonitorConfig;
use crate::evidence::EvidenceRecord;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct State {
    pub started_at_unix: i64,
    pub last_cycle_unix: i64,
    pub cycles_total: u64,
    pub last_symptom: Option<String>,
    pub last_evidence: Option<EvidenceRecord>,
    pub escalation: EscalationTrack,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EscalationTrack {
    pub consecutive_degraded: u32,
    pub is_degraded: bool,
    pub last_escalation_at: Option<i64>,
    pub last_state_change_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationEvent {
    /// Degradation crossed the threshold for the first time.
    Escalate,
    /// Still degraded and the cooldown has elapsed.
    Repeat,
    Recovered,
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn record_cycle(&mut self, now_unix: i64, record: EvidenceRecord) {
        self.last_cycle_unix = now_unix;
        self.cycles_total = self.cycles_total.saturating_add(1);
        self.last_symptom = record.symptom.clone();
        self.last_evidence = Some(record);
    }

    /// Feeds the latest routine record into the escalation tracker. Returns
    /// an event when a follow-up cycle is due.
    pub fn apply_escalation_rules(
        &mut self,
        cfg: &MonitorConfig,
        now_unix: i64,
    ) -> Option<EscalationEvent> {
        let degraded = self
            .last_evidence
            .as_ref()
            .is_some_and(EvidenceRecord::has_warnings);
        update_escalation(&mut self.escalation, degraded, cfg, now_unix)
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn update_escalation(
    track: &mut EscalationTrack,
    degraded: bool,
    cfg: &MonitorConfig,
    now_unix: i64,
) -> Option<EscalationEvent> {
    if !degraded {
        let was_degraded = track.is_degraded;
        track.consecutive_degraded = 0;
        track.is_degraded = false;
        if was_degraded {
            track.last_state_change_at = Some(now_unix);
            return Some(EscalationEvent::Recovered);
        }
        return None;
    }

    track.consecutive_degraded = track.consecutive_degraded.saturating_add(1);

    if !track.is_degraded && track.consecutive_degraded >= cfg.escalate_after {
        track.is_degraded = true;
        track.last_state_change_at = Some(now_unix);
        track.last_escalation_at = Some(now_unix);
        return Some(EscalationEvent::Escalate);
    }

    if track.is_degraded {
        match track.last_escalation_at {
            Some(last) if (now_unix - last) >= cfg.escalation_cooldown_secs as i64 => {
                track.last_escalation_at = Some(now_unix);
                return Some(EscalationEvent::Repeat);
            }
            None => {
                track.last_escalation_at = Some(now_unix);
                return Some(EscalationEvent::Repeat);
            }
            _ => {}
        }
    }
    None
}
