//! Consecutive-frame stabilization.
//!
//! Raw detections are bucketed by `Signature`. A bucket is promoted to a
//! `StabilizedDetection` once it has collected `consecutive_frames` sightings inside the
//! stabilization window, and is deleted at the same moment so the next sighting starts a
//! fresh episode.
//!
//! The buffer is bounded two ways:
//! - entries whose newest sighting left the window are swept on every pass
//! - a hard entry cap evicts the stalest entries under sustained noise

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::detect::{BBox, RawDetection};
use crate::geo::Location;

/// Structured bucket key: class, quantized box center, optional quantized location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    pub class_id: u32,
    pub cell_x: i32,
    pub cell_y: i32,
    pub geo_cell: Option<(i32, i32)>,
}

impl Signature {
    pub fn of(
        detection: &RawDetection,
        location: Option<&Location>,
        spatial_bucket_px: f32,
        location_bucket_deg: f64,
    ) -> Self {
        let (cx, cy) = detection.center();
        Self {
            class_id: detection.class_id,
            cell_x: (cx / spatial_bucket_px).floor() as i32,
            cell_y: (cy / spatial_bucket_px).floor() as i32,
            geo_cell: location.map(|loc| loc.cell(location_bucket_deg)),
        }
    }
}

#[derive(Clone, Debug)]
struct Sighting {
    detection: RawDetection,
    timestamp_ms: u64,
    location: Option<Location>,
}

/// Sightings collected for one signature during the current episode.
#[derive(Clone, Debug)]
pub struct FrameBufferEntry {
    sightings: VecDeque<Sighting>,
    average_confidence: f32,
    latest_box: BBox,
}

impl FrameBufferEntry {
    fn new() -> Self {
        Self {
            sightings: VecDeque::new(),
            average_confidence: 0.0,
            latest_box: BBox::default(),
        }
    }

    fn record(&mut self, sighting: Sighting, input_size: u32) {
        // A second hit on the same signature within one frame replaces that frame's sighting.
        if self
            .sightings
            .back()
            .is_some_and(|last| last.timestamp_ms == sighting.timestamp_ms)
        {
            self.sightings.pop_back();
        }
        self.latest_box = sighting.detection.normalized(input_size);
        self.sightings.push_back(sighting);
    }

    fn trim_before(&mut self, cutoff_ms: u64) {
        while self
            .sightings
            .front()
            .is_some_and(|s| s.timestamp_ms < cutoff_ms)
        {
            self.sightings.pop_front();
        }
        self.recompute_average();
    }

    fn recompute_average(&mut self) {
        if self.sightings.is_empty() {
            self.average_confidence = 0.0;
            return;
        }
        let sum: f32 = self.sightings.iter().map(|s| s.detection.score).sum();
        self.average_confidence = sum / self.sightings.len() as f32;
    }

    pub fn len(&self) -> usize {
        self.sightings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sightings.is_empty()
    }

    pub fn average_confidence(&self) -> f32 {
        self.average_confidence
    }

    /// Box of the most recent sighting.
    pub fn latest_box(&self) -> BBox {
        self.latest_box
    }

    fn newest_ms(&self) -> u64 {
        self.sightings.back().map(|s| s.timestamp_ms).unwrap_or(0)
    }

    fn promote(self) -> Option<StabilizedDetection> {
        let first = self.sightings.front()?;
        let last = self.sightings.back()?;
        Some(StabilizedDetection {
            detection: last.detection,
            consecutive_frames: self.sightings.len(),
            average_confidence: self.average_confidence,
            time_span_ms: last.timestamp_ms.saturating_sub(first.timestamp_ms),
            bbox: self.latest_box,
            location: last.location,
            timestamp_ms: last.timestamp_ms,
        })
    }
}

/// A detection that held for enough consecutive frames to be trusted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StabilizedDetection {
    /// Most recent contributing raw detection.
    pub detection: RawDetection,
    pub consecutive_frames: usize,
    pub average_confidence: f32,
    /// Milliseconds between first and last contributing frame.
    pub time_span_ms: u64,
    /// Normalized box of the most recent sighting.
    pub bbox: BBox,
    pub location: Option<Location>,
    pub timestamp_ms: u64,
}

impl StabilizedDetection {
    pub fn class_id(&self) -> u32 {
        self.detection.class_id
    }
}

pub struct FrameStabilizer {
    entries: HashMap<Signature, FrameBufferEntry>,
    min_confidence: f32,
    required_frames: usize,
    window: Duration,
    spatial_bucket_px: f32,
    location_bucket_deg: f64,
    max_entries: usize,
    input_size: u32,
    skipped: u64,
}

impl FrameStabilizer {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            entries: HashMap::new(),
            min_confidence: cfg.min_confidence,
            required_frames: cfg.consecutive_frames.max(1),
            window: cfg.stabilization_window,
            spatial_bucket_px: cfg.spatial_bucket_px,
            location_bucket_deg: cfg.location_bucket_deg,
            max_entries: cfg.max_frame_buffer_entries.max(1),
            input_size: cfg.model_input_size,
            skipped: 0,
        }
    }

    /// Pick up changed thresholds. Buffered sightings are kept.
    pub fn reconfigure(&mut self, cfg: &PipelineConfig) {
        let entries = std::mem::take(&mut self.entries);
        let skipped = self.skipped;
        *self = Self::new(cfg);
        self.entries = entries;
        self.skipped = skipped;
    }

    /// Feed one frame's detections. Returns detections that completed an episode.
    pub fn stabilize(
        &mut self,
        raw: &[RawDetection],
        location: Option<Location>,
        now_ms: u64,
    ) -> Vec<StabilizedDetection> {
        let cutoff = now_ms.saturating_sub(self.window.as_millis() as u64);
        self.sweep(cutoff);

        let mut out = Vec::new();
        for detection in raw {
            if let Err(e) = detection.validate() {
                self.skipped += 1;
                log::debug!("stabilizer skipped detection: {}", e);
                continue;
            }
            if detection.score < self.min_confidence {
                continue;
            }

            let signature = Signature::of(
                detection,
                location.as_ref(),
                self.spatial_bucket_px,
                self.location_bucket_deg,
            );
            let entry = self
                .entries
                .entry(signature)
                .or_insert_with(FrameBufferEntry::new);
            entry.record(
                Sighting {
                    detection: *detection,
                    timestamp_ms: now_ms,
                    location,
                },
                self.input_size,
            );
            entry.trim_before(cutoff);

            if entry.len() >= self.required_frames {
                if let Some(entry) = self.entries.remove(&signature) {
                    if let Some(stable) = entry.promote() {
                        log::debug!(
                            "stabilized class={} frames={} avg_conf={:.2} span={}ms",
                            stable.class_id(),
                            stable.consecutive_frames,
                            stable.average_confidence,
                            stable.time_span_ms
                        );
                        out.push(stable);
                    }
                }
            }
        }

        self.enforce_capacity();
        out
    }

    fn sweep(&mut self, cutoff_ms: u64) {
        self.entries
            .retain(|_, entry| !entry.is_empty() && entry.newest_ms() >= cutoff_ms);
    }

    fn enforce_capacity(&mut self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let mut by_age: Vec<(Signature, u64)> = self
            .entries
            .iter()
            .map(|(sig, entry)| (*sig, entry.newest_ms()))
            .collect();
        by_age.sort_by_key(|(_, newest)| *newest);
        let excess = self.entries.len() - self.max_entries;
        for (sig, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&sig);
        }
    }

    pub fn entry(&self, signature: &Signature) -> Option<&FrameBufferEntry> {
        self.entries.get(signature)
    }

    /// Number of live buffer entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Malformed detections dropped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(frames: usize) -> PipelineConfig {
        PipelineConfig {
            consecutive_frames: frames,
            stabilization_window: Duration::from_millis(1_000),
            ..PipelineConfig::default()
        }
    }

    fn pothole(bbox: [f32; 4]) -> RawDetection {
        RawDetection::new(2, 0.9, bbox)
    }

    #[test]
    fn emits_once_on_nth_frame_then_starts_fresh_episode() {
        let mut stabilizer = FrameStabilizer::new(&config(3));
        let det = pothole([100.0, 100.0, 200.0, 200.0]);

        assert!(stabilizer.stabilize(&[det], None, 0).is_empty());
        assert!(stabilizer.stabilize(&[det], None, 100).is_empty());
        let out = stabilizer.stabilize(&[det], None, 200);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].consecutive_frames, 3);
        assert_eq!(out[0].time_span_ms, 200);
        assert!((out[0].average_confidence - 0.9).abs() < 1e-6);

        let sig = Signature::of(&det, None, 50.0, 1e-4);
        assert!(stabilizer.entry(&sig).is_none());

        // The (N+1)th frame starts a new episode instead of re-emitting.
        assert!(stabilizer.stabilize(&[det], None, 300).is_empty());
        assert_eq!(stabilizer.entry(&sig).map(|e| e.len()), Some(1));
    }

    #[test]
    fn sightings_outside_window_do_not_count() {
        let mut stabilizer = FrameStabilizer::new(&config(3));
        let det = pothole([100.0, 100.0, 200.0, 200.0]);

        stabilizer.stabilize(&[det], None, 0);
        stabilizer.stabilize(&[det], None, 600);
        // First sighting is now older than the 1s window.
        assert!(stabilizer.stabilize(&[det], None, 1_200).is_empty());
        assert_eq!(stabilizer.stabilize(&[det], None, 1_300).len(), 1);
    }

    #[test]
    fn duplicate_hits_in_one_frame_count_once() {
        let mut stabilizer = FrameStabilizer::new(&config(2));
        let det = pothole([100.0, 100.0, 200.0, 200.0]);
        let jitter = pothole([102.0, 101.0, 201.0, 199.0]);

        assert!(stabilizer.stabilize(&[det, jitter], None, 0).is_empty());
        assert_eq!(stabilizer.stabilize(&[det], None, 50).len(), 1);
    }

    #[test]
    fn skips_low_confidence_and_malformed_input() {
        let mut stabilizer = FrameStabilizer::new(&config(1));
        let weak = RawDetection::new(2, 0.1, [0.0, 0.0, 10.0, 10.0]);
        let broken = RawDetection::new(2, 0.9, [f32::NAN, 0.0, 10.0, 10.0]);
        assert!(stabilizer.stabilize(&[weak, broken], None, 0).is_empty());
        assert!(stabilizer.is_empty());
        assert_eq!(stabilizer.skipped(), 1);
    }

    #[test]
    fn stale_entries_are_swept() {
        let mut stabilizer = FrameStabilizer::new(&config(3));
        stabilizer.stabilize(&[pothole([0.0, 0.0, 40.0, 40.0])], None, 0);
        stabilizer.stabilize(&[pothole([300.0, 300.0, 340.0, 340.0])], None, 10);
        assert_eq!(stabilizer.len(), 2);
        stabilizer.stabilize(&[], None, 5_000);
        assert!(stabilizer.is_empty());
    }

    #[test]
    fn capacity_evicts_stalest_entries() {
        let cfg = PipelineConfig {
            max_frame_buffer_entries: 2,
            ..config(3)
        };
        let mut stabilizer = FrameStabilizer::new(&cfg);
        for (i, x) in [0.0f32, 100.0, 200.0].iter().enumerate() {
            stabilizer.stabilize(&[pothole([*x, 0.0, x + 40.0, 40.0])], None, i as u64 * 10);
        }
        assert_eq!(stabilizer.len(), 2);
        let oldest = Signature::of(&pothole([0.0, 0.0, 40.0, 40.0]), None, 50.0, 1e-4);
        assert!(stabilizer.entry(&oldest).is_none());
    }

    #[test]
    fn location_splits_signatures() {
        let mut stabilizer = FrameStabilizer::new(&config(2));
        let det = pothole([100.0, 100.0, 200.0, 200.0]);
        let here = Location::new(32.0, 34.0);
        let there = Location::new(32.01, 34.0);

        assert!(stabilizer.stabilize(&[det], Some(here), 0).is_empty());
        assert!(stabilizer.stabilize(&[det], Some(there), 100).is_empty());
        assert_eq!(stabilizer.len(), 2);
        let out = stabilizer.stabilize(&[det], Some(there), 200);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].location, Some(there));
    }

    #[test]
    fn latest_box_tracks_most_recent_sighting() {
        let mut stabilizer = FrameStabilizer::new(&config(3));
        let first = pothole([100.0, 100.0, 200.0, 200.0]);
        let second = pothole([110.0, 105.0, 195.0, 199.0]);
        stabilizer.stabilize(&[first], None, 0);
        stabilizer.stabilize(&[second], None, 100);
        let sig = Signature::of(&first, None, 50.0, 1e-4);
        let entry = stabilizer.entry(&sig).expect("entry");
        assert_eq!(entry.latest_box(), second.normalized(640));
    }
}
