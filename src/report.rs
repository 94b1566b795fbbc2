//! Report assembly.
//!
//! Accepted detections are grouped by hazard class and each group becomes one report
//! with one annotated snapshot, so a burst of same-class detections in a single frame
//! yields one report instead of many.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::detect::{BBox, HazardLabels, RawDetection};
use crate::error::PipelineError;
use crate::frame::{AnnotatedImage, FrameImage};
use crate::geo::Location;
use crate::stabilizer::StabilizedDetection;
use crate::transport::UploadReceipt;

pub type ReportId = i64;

/// Everything the offline store needs to persist a report.
#[derive(Clone, Debug)]
pub struct ReportDraft {
    pub class_id: u32,
    pub hazard_type: String,
    pub detection_count: usize,
    pub avg_confidence: f32,
    pub location: Option<Location>,
    pub boxes: Vec<BBox>,
    pub image: Option<AnnotatedImage>,
    pub created_at_ms: u64,
}

/// A report that reached durable storage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    pub id: ReportId,
    pub hazard_type: String,
    pub class_id: u32,
    pub detection_count: usize,
    pub avg_confidence: f32,
    pub location: Option<Location>,
    pub server_result: Option<UploadReceipt>,
    pub stored_offline: bool,
}

impl Report {
    pub fn from_draft(id: ReportId, draft: &ReportDraft) -> Self {
        Self {
            id,
            hazard_type: draft.hazard_type.clone(),
            class_id: draft.class_id,
            detection_count: draft.detection_count,
            avg_confidence: draft.avg_confidence,
            location: draft.location,
            server_result: None,
            stored_offline: true,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.server_result.is_some()
    }
}

/// Result of handing one draft to a sink.
#[derive(Clone, Debug)]
pub struct Submitted {
    pub report: Report,
    /// Set when the report was stored but the upload did not go through.
    pub upload_error: Option<PipelineError>,
}

/// Where drafts go once assembled.
pub trait ReportSink {
    /// Persist `draft`. An `Err` means nothing durable was written.
    fn submit(&mut self, draft: ReportDraft) -> Result<Submitted, PipelineError>;
}

/// Reports and failures from one batch of hazard-class groups.
#[derive(Clone, Debug, Default)]
pub struct BatchOutcome {
    pub reports: Vec<Report>,
    pub failures: Vec<PipelineError>,
}

impl BatchOutcome {
    pub fn stored(&self) -> usize {
        self.reports.len()
    }

    /// Failures that cost a report.
    pub fn lost(&self) -> usize {
        self.failures.iter().filter(|f| f.loses_report()).count()
    }
}

pub struct ReportFactory {
    labels: HazardLabels,
    model_input_size: u32,
}

impl ReportFactory {
    pub fn new(labels: HazardLabels, model_input_size: u32) -> Self {
        Self {
            labels,
            model_input_size,
        }
    }

    /// One draft per hazard class, in ascending class order.
    pub fn drafts(
        &self,
        accepted: &[StabilizedDetection],
        frame: Option<&FrameImage>,
        location: Option<Location>,
        now_ms: u64,
    ) -> Vec<ReportDraft> {
        let mut groups: BTreeMap<u32, Vec<&StabilizedDetection>> = BTreeMap::new();
        for detection in accepted {
            groups.entry(detection.class_id()).or_default().push(detection);
        }

        groups
            .into_iter()
            .map(|(class_id, group)| {
                let raw: Vec<RawDetection> = group.iter().map(|d| d.detection).collect();
                let image = frame.and_then(|frame| {
                    match frame.annotate(&raw, self.model_input_size) {
                        Ok(image) => Some(image),
                        Err(e) => {
                            log::warn!("snapshot for class {} failed: {}", class_id, e);
                            None
                        }
                    }
                });
                let avg_confidence =
                    group.iter().map(|d| d.average_confidence).sum::<f32>() / group.len() as f32;
                ReportDraft {
                    class_id,
                    hazard_type: self.labels.hazard_type(class_id),
                    detection_count: group.len(),
                    avg_confidence,
                    location: group.iter().find_map(|d| d.location).or(location),
                    boxes: group.iter().map(|d| d.bbox).collect(),
                    image,
                    created_at_ms: now_ms,
                }
            })
            .collect()
    }

    /// Build and submit one report per hazard class. A failed group never stops its siblings.
    pub fn build_reports(
        &self,
        accepted: &[StabilizedDetection],
        frame: Option<&FrameImage>,
        location: Option<Location>,
        now_ms: u64,
        sink: &mut dyn ReportSink,
    ) -> BatchOutcome {
        submit_all(self.drafts(accepted, frame, location, now_ms), sink)
    }
}

/// Hand each draft to `sink` in order, collecting reports and failures.
pub fn submit_all(drafts: Vec<ReportDraft>, sink: &mut dyn ReportSink) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for draft in drafts {
        let hazard_type = draft.hazard_type.clone();
        match sink.submit(draft) {
            Ok(submitted) => {
                log::info!(
                    "report #{} {} x{} conf={:.2} synced={}",
                    submitted.report.id,
                    submitted.report.hazard_type,
                    submitted.report.detection_count,
                    submitted.report.avg_confidence,
                    submitted.report.is_synced()
                );
                if let Some(err) = submitted.upload_error {
                    outcome.failures.push(err);
                }
                outcome.reports.push(submitted.report);
            }
            Err(e) => {
                log::warn!("report for {} not created: {}", hazard_type, e);
                outcome.failures.push(e);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stable(class_id: u32, bbox: [f32; 4], conf: f32) -> StabilizedDetection {
        let detection = RawDetection::new(class_id, conf, bbox);
        StabilizedDetection {
            detection,
            consecutive_frames: 3,
            average_confidence: conf,
            time_span_ms: 100,
            bbox: detection.normalized(640),
            location: None,
            timestamp_ms: 1_000,
        }
    }

    struct FailingFor(u32);

    impl ReportSink for FailingFor {
        fn submit(&mut self, draft: ReportDraft) -> Result<Submitted, PipelineError> {
            if draft.class_id == self.0 {
                return Err(PipelineError::storage("quota exceeded"));
            }
            Ok(Submitted {
                report: Report::from_draft(draft.class_id as ReportId + 100, &draft),
                upload_error: None,
            })
        }
    }

    #[test]
    fn groups_by_class() {
        let factory = ReportFactory::new(HazardLabels::default(), 640);
        let accepted = vec![
            stable(2, [0.0, 0.0, 50.0, 50.0], 0.8),
            stable(0, [100.0, 0.0, 150.0, 50.0], 0.7),
            stable(2, [300.0, 300.0, 350.0, 350.0], 0.6),
        ];
        let frame = FrameImage::blank(64, 64);
        let drafts = factory.drafts(&accepted, Some(&frame), Some(Location::new(1.0, 2.0)), 5);

        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].hazard_type, "crack");
        assert_eq!(drafts[0].detection_count, 1);
        assert_eq!(drafts[1].hazard_type, "pothole");
        assert_eq!(drafts[1].detection_count, 2);
        assert!((drafts[1].avg_confidence - 0.7).abs() < 1e-6);
        assert_eq!(drafts[1].boxes.len(), 2);
        assert!(drafts.iter().all(|d| d.image.is_some()));
        assert_eq!(drafts[1].location, Some(Location::new(1.0, 2.0)));
    }

    #[test]
    fn failed_group_does_not_abort_batch() {
        let factory = ReportFactory::new(HazardLabels::default(), 640);
        let accepted = vec![
            stable(0, [0.0, 0.0, 50.0, 50.0], 0.8),
            stable(2, [100.0, 0.0, 150.0, 50.0], 0.9),
        ];
        let outcome = factory.build_reports(&accepted, None, None, 0, &mut FailingFor(0));
        assert_eq!(outcome.stored(), 1);
        assert_eq!(outcome.lost(), 1);
        assert_eq!(outcome.reports[0].hazard_type, "pothole");
        assert!(outcome.reports[0].stored_offline);
    }
}
