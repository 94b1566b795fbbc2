//! The reporter context: one object per session owner, shared by reference.
//!
//! `process_frame` runs one pass: cap check, location, stabilization, dedup,
//! report assembly (store then upload), counter update. It never returns an error;
//! every failure comes back classified inside `FrameOutcome`.
//!
//! Pipeline state sits behind one mutex that is only held for in-memory work.
//! The location read, snapshot encoding, store writes and uploads all run with it
//! released, so `stats()` and the mutators stay responsive during a slow pass.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{
    validate_confidence, InMemoryPreferenceStore, PipelineConfig, PreferenceStore, Preferences,
};
use crate::dedup::BurstDeduplicator;
use crate::detect::RawDetection;
use crate::error::PipelineError;
use crate::frame::FrameImage;
use crate::geo::{Location, LocationSource};
use crate::report::{submit_all, Report, ReportFactory};
use crate::session::{SessionCounters, SessionPhase, SessionState};
use crate::stabilizer::{FrameStabilizer, StabilizedDetection};
use crate::storage::{InMemoryOfflineStore, OfflineStore, SharedStore};
use crate::sync::OfflineFirstSink;
use crate::transport::Uploader;

/// Why a frame was not processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    SessionLimitReached,
    AlreadyProcessing,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::SessionLimitReached => "session_limit_reached",
            SkipReason::AlreadyProcessing => "already_processing",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FrameOutcome {
    pub processed: bool,
    pub reason: Option<SkipReason>,
    pub reports_created: usize,
    pub reports: Vec<Report>,
    pub failures: Vec<PipelineError>,
}

impl FrameOutcome {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            processed: false,
            reason: Some(reason),
            ..Self::default()
        }
    }
}

/// Read-only view for dashboards and telemetry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub counters: SessionCounters,
    pub phase: SessionPhase,
    pub enabled: bool,
    pub history_size: usize,
    pub skipped_detections: u64,
    pub config: PipelineConfig,
}

struct ReporterState {
    config: PipelineConfig,
    enabled: bool,
    stabilizer: FrameStabilizer,
    dedup: BurstDeduplicator,
    session: SessionState,
    preferences: Box<dyn PreferenceStore>,
    last_location: Option<Location>,
}

impl ReporterState {
    fn persist_preferences(&mut self) -> Result<()> {
        let prefs = Preferences {
            enabled: self.enabled,
            min_confidence: self.config.min_confidence,
        };
        self.preferences.save(&prefs)
    }

    /// Swap in new thresholds. Buffered sightings and dedup history are kept.
    fn reconfigure(&mut self, config: PipelineConfig) {
        self.stabilizer.reconfigure(&config);
        self.dedup.reconfigure(&config);
        self.config = config;
    }

    /// Judge a fix read from the location source, falling back to the last good one.
    fn resolve_location(&mut self, fix: Option<Location>) -> (Option<Location>, Option<PipelineError>) {
        let timeout_ms = self.config.location_timeout.as_millis();
        match fix {
            Some(fix) if fix.is_valid() => {
                self.last_location = Some(fix);
                (Some(fix), None)
            }
            Some(fix) => (
                self.last_location,
                Some(PipelineError::LocationUnavailable(format!(
                    "invalid fix {:.6},{:.6}",
                    fix.lat, fix.lng
                ))),
            ),
            None => {
                log::warn!(
                    "no location within {} ms, using {}",
                    timeout_ms,
                    if self.last_location.is_some() { "last known fix" } else { "none" }
                );
                (
                    self.last_location,
                    Some(PipelineError::LocationUnavailable(format!(
                        "no fix within {} ms",
                        timeout_ms
                    ))),
                )
            }
        }
    }
}

/// Clears the in-flight flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AutoReporter {
    state: Mutex<ReporterState>,
    store: SharedStore,
    uploader: Option<Box<dyn Uploader>>,
    factory: ReportFactory,
    processing: AtomicBool,
    location: Option<Arc<dyn LocationSource>>,
}

impl AutoReporter {
    pub fn builder(config: PipelineConfig) -> AutoReporterBuilder {
        AutoReporterBuilder::new(config)
    }

    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one pipeline pass over a frame's raw detections.
    pub fn process_frame(
        &self,
        raw: &[RawDetection],
        frame: &FrameImage,
        now_ms: u64,
    ) -> FrameOutcome {
        let Some(_pass) = PassGuard::try_acquire(&self.processing) else {
            log::debug!("frame dropped: pass already in flight");
            return FrameOutcome::skipped(SkipReason::AlreadyProcessing);
        };

        let location_timeout = {
            let mut state = self.lock();
            if !state.enabled {
                return FrameOutcome::skipped(SkipReason::Disabled);
            }
            state.session.start();

            let valid = raw.iter().filter(|d| d.validate().is_ok()).count();
            state.session.record_detections(valid);

            if !state.session.can_accept_report() {
                log::debug!("frame skipped: session cap reached");
                return FrameOutcome::skipped(SkipReason::SessionLimitReached);
            }
            state.config.location_timeout
        };

        let fix = self
            .location
            .as_deref()
            .map(|source| source.current_location(location_timeout));

        let mut outcome = FrameOutcome {
            processed: true,
            ..FrameOutcome::default()
        };

        let (accepted, location, epoch) = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let location = match fix {
                Some(fix) => {
                    let (location, error) = state.resolve_location(fix);
                    outcome.failures.extend(error);
                    location
                }
                None => None,
            };

            let stabilized = state.stabilizer.stabilize(raw, location, now_ms);
            state.session.set_frame_buffer_size(state.stabilizer.len());
            if stabilized.is_empty() {
                return outcome;
            }

            let candidates = stabilized.len();
            let accepted = state.dedup.filter_duplicates(stabilized, location, now_ms);
            state
                .session
                .record_deduplicated(candidates - accepted.len());
            if accepted.is_empty() {
                log::debug!("all {} stabilized detections were duplicates", candidates);
                return outcome;
            }

            let accepted = limit_classes(accepted, state.session.remaining());
            (accepted, location, state.session.epoch())
        };

        let drafts = self.factory.drafts(&accepted, Some(frame), location, now_ms);
        let mut sink = OfflineFirstSink::new(&self.store, self.uploader.as_deref());
        let batch = submit_all(drafts, &mut sink);

        {
            let mut state = self.lock();
            if state.session.epoch() == epoch {
                state.session.record_reports(batch.stored());
                state.session.record_failures(batch.lost());
            } else {
                log::info!(
                    "session reset during pass, {} stored reports not counted",
                    batch.stored()
                );
            }
        }

        outcome.reports_created = batch.stored();
        outcome.reports = batch.reports;
        outcome.failures.extend(batch.failures);
        outcome
    }

    pub fn stats(&self) -> StatsSnapshot {
        let state = self.lock();
        StatsSnapshot {
            counters: state.session.snapshot(),
            phase: state.session.phase(),
            enabled: state.enabled,
            history_size: state.dedup.len(),
            skipped_detections: state.stabilizer.skipped(),
            config: state.config.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Turn reporting on or off and persist the choice.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        let mut state = self.lock();
        state.enabled = enabled;
        log::info!("auto reporting {}", if enabled { "enabled" } else { "disabled" });
        state.persist_preferences()
    }

    /// Change the confidence floor and persist it. Buffered sightings are kept.
    pub fn set_confidence_threshold(&self, threshold: f32) -> Result<()> {
        validate_confidence(threshold)?;
        let mut state = self.lock();
        let config = PipelineConfig {
            min_confidence: threshold,
            ..state.config.clone()
        };
        state.reconfigure(config);
        state.persist_preferences()
    }

    /// Apply new stabilization and dedup thresholds to the running session.
    ///
    /// Labels, model input size and the session cap are fixed when the reporter
    /// is built and must not differ from the current config.
    pub fn reconfigure(&self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.lock();
        if config.labels != state.config.labels
            || config.model_input_size != state.config.model_input_size
            || config.max_reports_per_session != state.config.max_reports_per_session
        {
            return Err(anyhow!(
                "labels, model_input_size and max_reports_per_session cannot change at runtime"
            ));
        }
        state.reconfigure(config);
        log::info!("pipeline thresholds updated");
        state.persist_preferences()
    }

    /// Drop all session state and start a fresh session.
    pub fn reset_session(&self) {
        let mut state = self.lock();
        state.stabilizer.clear();
        state.dedup.clear();
        state.session.reset();
        state.session.start();
        log::info!("session reset");
    }

    /// Run `f` against the offline store. Waits only for an in-progress store call.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut dyn OfflineStore) -> R) -> R {
        let mut store = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(store.as_mut())
    }
}

/// Keep at most `remaining` hazard classes, lowest class ids first.
fn limit_classes(accepted: Vec<StabilizedDetection>, remaining: u64) -> Vec<StabilizedDetection> {
    let classes: BTreeSet<u32> = accepted.iter().map(|d| d.class_id()).collect();
    if classes.len() as u64 <= remaining {
        return accepted;
    }
    let allowed: BTreeSet<u32> = classes.into_iter().take(remaining as usize).collect();
    log::info!("session cap allows only {} more reports", remaining);
    accepted
        .into_iter()
        .filter(|d| allowed.contains(&d.class_id()))
        .collect()
}

pub struct AutoReporterBuilder {
    config: PipelineConfig,
    store: Option<Box<dyn OfflineStore>>,
    uploader: Option<Box<dyn Uploader>>,
    location: Option<Arc<dyn LocationSource>>,
    preferences: Option<Box<dyn PreferenceStore>>,
}

impl AutoReporterBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            store: None,
            uploader: None,
            location: None,
            preferences: None,
        }
    }

    pub fn store(mut self, store: impl OfflineStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn uploader(mut self, uploader: impl Uploader + 'static) -> Self {
        self.uploader = Some(Box::new(uploader));
        self
    }

    pub fn location_source(mut self, source: Arc<dyn LocationSource>) -> Self {
        self.location = Some(source);
        self
    }

    pub fn preferences(mut self, preferences: impl PreferenceStore + 'static) -> Self {
        self.preferences = Some(Box::new(preferences));
        self
    }

    /// Validate the config, apply persisted preferences and build the reporter.
    pub fn build(self) -> Result<AutoReporter> {
        let mut config = self.config;
        config.validate()?;

        let mut preferences = self
            .preferences
            .unwrap_or_else(|| Box::new(InMemoryPreferenceStore::default()));
        let mut enabled = true;
        match preferences.load() {
            Ok(Some(prefs)) => {
                enabled = prefs.enabled;
                if validate_confidence(prefs.min_confidence).is_ok() {
                    config.min_confidence = prefs.min_confidence;
                } else {
                    log::warn!(
                        "ignoring stored confidence threshold {}",
                        prefs.min_confidence
                    );
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("failed to load preferences, using defaults: {}", e),
        }

        let factory = ReportFactory::new(config.labels.clone(), config.model_input_size);
        let state = ReporterState {
            stabilizer: FrameStabilizer::new(&config),
            dedup: BurstDeduplicator::new(&config),
            session: SessionState::new(config.max_reports_per_session),
            preferences,
            enabled,
            last_location: None,
            config,
        };
        let store = self
            .store
            .unwrap_or_else(|| Box::new(InMemoryOfflineStore::new()));
        Ok(AutoReporter {
            state: Mutex::new(state),
            store: Mutex::new(store),
            uploader: self.uploader,
            factory,
            processing: AtomicBool::new(false),
            location: self.location,
        })
    }
}
