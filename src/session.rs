//! Per-session counters and the report cap.

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Active,
    /// Cap reached. Frames still feed the stats but create no reports.
    Capped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub total_detections: u64,
    pub reports_created: u64,
    pub reports_deduplicated: u64,
    pub reports_failed: u64,
    pub session_report_count: u64,
    pub frame_buffer_size: usize,
}

#[derive(Clone, Debug)]
pub struct SessionState {
    phase: SessionPhase,
    counters: SessionCounters,
    max_reports: u64,
    epoch: u64,
}

impl SessionState {
    pub fn new(max_reports_per_session: u32) -> Self {
        Self {
            phase: SessionPhase::Idle,
            counters: SessionCounters::default(),
            max_reports: u64::from(max_reports_per_session),
            epoch: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Idle -> Active. No-op for a session already running or capped.
    pub fn start(&mut self) {
        if self.phase == SessionPhase::Idle {
            self.phase = SessionPhase::Active;
            log::debug!("session started (cap {})", self.max_reports);
        }
        self.update_phase();
    }

    /// Back to Idle with zeroed counters.
    pub fn reset(&mut self) {
        self.counters = SessionCounters::default();
        self.phase = SessionPhase::Idle;
        self.epoch += 1;
    }

    /// Bumped by every `reset`, so late results from an older session can be told apart.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn can_accept_report(&self) -> bool {
        self.counters.session_report_count < self.max_reports
    }

    /// Reports still allowed this session.
    pub fn remaining(&self) -> u64 {
        self.max_reports
            .saturating_sub(self.counters.session_report_count)
    }

    pub fn record_reports(&mut self, n: usize) {
        self.counters.reports_created += n as u64;
        self.counters.session_report_count += n as u64;
        self.update_phase();
    }

    pub fn record_detections(&mut self, n: usize) {
        self.counters.total_detections += n as u64;
    }

    pub fn record_deduplicated(&mut self, n: usize) {
        self.counters.reports_deduplicated += n as u64;
    }

    pub fn record_failures(&mut self, n: usize) {
        self.counters.reports_failed += n as u64;
    }

    pub fn set_frame_buffer_size(&mut self, size: usize) {
        self.counters.frame_buffer_size = size;
    }

    pub fn snapshot(&self) -> SessionCounters {
        self.counters
    }

    fn update_phase(&mut self) {
        if self.phase == SessionPhase::Active && !self.can_accept_report() {
            log::info!(
                "session cap reached after {} reports",
                self.counters.session_report_count
            );
            self.phase = SessionPhase::Capped;
        }
    }
}
