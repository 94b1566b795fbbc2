//! Burst deduplication against a rolling history of accepted detections.
//!
//! A stabilized detection is a duplicate when, against any live history entry of the
//! same class:
//! - the boxes overlap above the IoU threshold (framing jitter on the same object)
//! - both positions are known and within the geo radius (same hazard, new angle)
//! - position cannot discriminate and the entry is younger than the burst window
//!
//! Candidates are judged against history as it stood when the pass began, so distinct
//! same-class hazards that stabilize in one frame reach the report factory together.
//! History is expired on read and capped by count, oldest first.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::detect::BBox;
use crate::geo::Location;
use crate::stabilizer::StabilizedDetection;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReportHistoryEntry {
    pub class_id: u32,
    pub location: Option<Location>,
    pub timestamp_ms: u64,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Which rule rejected a candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicateReason {
    Overlap,
    Proximity,
    Burst,
}

pub struct BurstDeduplicator {
    history: VecDeque<ReportHistoryEntry>,
    iou_threshold: f32,
    geo_radius_m: f64,
    horizon: Duration,
    burst_window: Duration,
    max_history: usize,
}

impl BurstDeduplicator {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(cfg.max_history.min(1024)),
            iou_threshold: cfg.iou_threshold,
            geo_radius_m: cfg.geo_radius_m,
            horizon: cfg.dedup_horizon,
            burst_window: cfg.burst_window,
            max_history: cfg.max_history.max(1),
        }
    }

    /// Pick up changed thresholds. History is kept.
    pub fn reconfigure(&mut self, cfg: &PipelineConfig) {
        self.iou_threshold = cfg.iou_threshold;
        self.geo_radius_m = cfg.geo_radius_m;
        self.horizon = cfg.dedup_horizon;
        self.burst_window = cfg.burst_window;
        self.max_history = cfg.max_history.max(1);
        self.enforce_capacity();
    }

    /// Keep the candidates that do not repeat a recent accepted detection.
    ///
    /// `location` stands in for candidates that carry no position of their own.
    pub fn filter_duplicates(
        &mut self,
        stabilized: Vec<StabilizedDetection>,
        location: Option<Location>,
        now_ms: u64,
    ) -> Vec<StabilizedDetection> {
        self.expire(now_ms);

        let mut accepted = Vec::with_capacity(stabilized.len());
        let mut admitted = Vec::with_capacity(stabilized.len());
        for candidate in stabilized {
            let candidate_location = candidate.location.or(location);
            if let Some(reason) = self.find_duplicate(&candidate, candidate_location.as_ref(), now_ms)
            {
                log::debug!(
                    "dedup rejected class={} reason={:?}",
                    candidate.class_id(),
                    reason
                );
                continue;
            }

            admitted.push(ReportHistoryEntry {
                class_id: candidate.class_id(),
                location: candidate_location,
                timestamp_ms: now_ms,
                confidence: candidate.average_confidence,
                bbox: candidate.bbox,
            });
            accepted.push(candidate);
        }
        self.history.extend(admitted);
        self.enforce_capacity();
        accepted
    }

    /// First rule a candidate trips against live history, if any.
    pub fn find_duplicate(
        &self,
        candidate: &StabilizedDetection,
        location: Option<&Location>,
        now_ms: u64,
    ) -> Option<DuplicateReason> {
        let horizon_ms = self.horizon.as_millis() as u64;
        let burst_ms = self.burst_window.as_millis() as u64;

        self.history
            .iter()
            .filter(|entry| entry.class_id == candidate.class_id())
            .filter(|entry| now_ms.saturating_sub(entry.timestamp_ms) <= horizon_ms)
            .find_map(|entry| {
                if candidate.bbox.iou(&entry.bbox) > self.iou_threshold {
                    return Some(DuplicateReason::Overlap);
                }
                match (location, entry.location.as_ref()) {
                    (Some(here), Some(there)) => {
                        if here.distance_m(there) <= self.geo_radius_m {
                            return Some(DuplicateReason::Proximity);
                        }
                        None
                    }
                    _ => {
                        if now_ms.saturating_sub(entry.timestamp_ms) < burst_ms {
                            return Some(DuplicateReason::Burst);
                        }
                        None
                    }
                }
            })
    }

    fn expire(&mut self, now_ms: u64) {
        let horizon_ms = self.horizon.as_millis() as u64;
        self.history
            .retain(|entry| now_ms.saturating_sub(entry.timestamp_ms) <= horizon_ms);
    }

    fn enforce_capacity(&mut self) {
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &ReportHistoryEntry> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::RawDetection;

    fn config() -> PipelineConfig {
        PipelineConfig {
            iou_threshold: 0.3,
            geo_radius_m: 10.0,
            burst_window: Duration::from_secs(2),
            dedup_horizon: Duration::from_secs(30),
            ..PipelineConfig::default()
        }
    }

    fn stable(bbox: [f32; 4], location: Option<Location>, at: u64) -> StabilizedDetection {
        let detection = RawDetection::new(2, 0.9, bbox);
        StabilizedDetection {
            detection,
            consecutive_frames: 3,
            average_confidence: 0.9,
            time_span_ms: 200,
            bbox: detection.normalized(640),
            location,
            timestamp_ms: at,
        }
    }

    /// Point `meters` north of `origin`.
    fn north_of(origin: Location, meters: f64) -> Location {
        let dlat = (meters / crate::geo::EARTH_RADIUS_M).to_degrees();
        Location::new(origin.lat + dlat, origin.lng)
    }

    #[test]
    fn overlap_above_threshold_is_duplicate() {
        let mut dedup = BurstDeduplicator::new(&config());
        let first = stable([100.0, 100.0, 200.0, 200.0], None, 0);
        assert_eq!(dedup.filter_duplicates(vec![first], None, 0).len(), 1);

        // IoU 0.5, outside the burst window.
        let second = stable([100.0, 100.0, 200.0, 150.0], None, 5_000);
        assert!(dedup.filter_duplicates(vec![second], None, 5_000).is_empty());
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn overlap_below_threshold_is_accepted() {
        let mut dedup = BurstDeduplicator::new(&config());
        dedup.filter_duplicates(vec![stable([100.0, 100.0, 200.0, 200.0], None, 0)], None, 0);

        // IoU 0.1.
        let second = stable([100.0, 100.0, 200.0, 110.0], None, 5_000);
        assert_eq!(dedup.filter_duplicates(vec![second], None, 5_000).len(), 1);
    }

    #[test]
    fn nearby_position_is_duplicate() {
        let mut dedup = BurstDeduplicator::new(&config());
        let origin = Location::new(32.0853, 34.7818);
        dedup.filter_duplicates(
            vec![stable([0.0, 0.0, 50.0, 50.0], Some(origin), 0)],
            None,
            0,
        );

        let near = stable([300.0, 300.0, 350.0, 350.0], Some(north_of(origin, 5.0)), 500);
        assert!(dedup.filter_duplicates(vec![near], None, 500).is_empty());
    }

    #[test]
    fn distant_position_is_not_rejected_on_geo_grounds() {
        let mut dedup = BurstDeduplicator::new(&config());
        let origin = Location::new(32.0853, 34.7818);
        dedup.filter_duplicates(
            vec![stable([0.0, 0.0, 50.0, 50.0], Some(origin), 0)],
            None,
            0,
        );

        let far = stable([300.0, 300.0, 350.0, 350.0], Some(north_of(origin, 50.0)), 500);
        assert_eq!(dedup.filter_duplicates(vec![far], None, 500).len(), 1);
    }

    #[test]
    fn burst_window_applies_without_location() {
        let mut dedup = BurstDeduplicator::new(&config());
        dedup.filter_duplicates(vec![stable([0.0, 0.0, 50.0, 50.0], None, 0)], None, 0);

        let soon = stable([300.0, 300.0, 350.0, 350.0], None, 1_000);
        assert!(dedup.filter_duplicates(vec![soon], None, 1_000).is_empty());

        let later = stable([300.0, 300.0, 350.0, 350.0], None, 10_000);
        assert_eq!(dedup.filter_duplicates(vec![later], None, 10_000).len(), 1);
    }

    #[test]
    fn other_classes_never_collide() {
        let mut dedup = BurstDeduplicator::new(&config());
        dedup.filter_duplicates(vec![stable([0.0, 0.0, 50.0, 50.0], None, 0)], None, 0);

        let mut crack = stable([0.0, 0.0, 50.0, 50.0], None, 0);
        crack.detection.class_id = 0;
        assert_eq!(dedup.filter_duplicates(vec![crack], None, 0).len(), 1);
    }

    #[test]
    fn same_pass_candidates_do_not_suppress_each_other() {
        let mut dedup = BurstDeduplicator::new(&config());
        let here = Some(Location::new(32.0853, 34.7818));
        let batch = vec![
            stable([0.0, 0.0, 80.0, 80.0], here, 0),
            stable([400.0, 400.0, 500.0, 500.0], here, 0),
        ];
        assert_eq!(dedup.filter_duplicates(batch, here, 0).len(), 2);
        assert_eq!(dedup.len(), 2);

        // Both now suppress a repeat in the next pass.
        let repeat = stable([400.0, 400.0, 500.0, 500.0], here, 500);
        assert!(dedup.filter_duplicates(vec![repeat], here, 500).is_empty());
    }

    #[test]
    fn reconfigure_applies_new_radius_and_cap() {
        let mut dedup = BurstDeduplicator::new(&config());
        let origin = Location::new(32.0853, 34.7818);
        for (i, x) in [0.0f32, 200.0, 400.0].into_iter().enumerate() {
            let at = i as u64 * 3_000;
            let far = north_of(origin, 100.0 * i as f64);
            dedup.filter_duplicates(vec![stable([x, 0.0, x + 50.0, 50.0], Some(far), at)], None, at);
        }
        assert_eq!(dedup.len(), 3);

        dedup.reconfigure(&PipelineConfig {
            geo_radius_m: 60.0,
            max_history: 2,
            ..config()
        });
        assert_eq!(dedup.len(), 2);

        // 50 m from the newest entry: outside the old 10 m radius, inside the new one.
        let near = stable(
            [600.0, 600.0, 650.0, 650.0],
            Some(north_of(origin, 250.0)),
            9_000,
        );
        assert!(dedup.filter_duplicates(vec![near], None, 9_000).is_empty());
    }

    #[test]
    fn history_expires_and_is_capped() {
        let cfg = PipelineConfig {
            max_history: 2,
            ..config()
        };
        let mut dedup = BurstDeduplicator::new(&cfg);
        for i in 0..3u64 {
            let x = i as f32 * 200.0;
            let at = i * 3_000;
            dedup.filter_duplicates(vec![stable([x, 0.0, x + 50.0, 50.0], None, at)], None, at);
        }
        assert_eq!(dedup.len(), 2);
        assert_eq!(dedup.history().next().map(|e| e.timestamp_ms), Some(3_000));

        dedup.filter_duplicates(Vec::new(), None, 60_000);
        assert!(dedup.is_empty());
    }
}
