//! Failure taxonomy for the reporting pipeline.
//!
//! Nothing here is allowed to escape `AutoReporter::process_frame`. Each failure is
//! classified, counted and handed back inside the frame outcome.

use std::fmt;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineError {
    /// Malformed input. Dropped silently and never counted as a failure.
    ValidationSkip(String),
    /// No position fix in time. The pass continues without a location.
    LocationUnavailable(String),
    /// Durable write failed. Fatal for one report only.
    Storage(String),
    /// Remote submission failed. The report stays stored offline.
    Upload(String),
    /// Remote submission did not finish in time.
    UploadTimeout(Duration),
}

impl PipelineError {
    pub fn storage(err: impl fmt::Display) -> Self {
        PipelineError::Storage(err.to_string())
    }

    pub fn upload(err: impl fmt::Display) -> Self {
        PipelineError::Upload(err.to_string())
    }

    /// Stable identifier used in logs and stats.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::ValidationSkip(_) => "VALIDATION_SKIP",
            PipelineError::LocationUnavailable(_) => "LOCATION_UNAVAILABLE",
            PipelineError::Storage(_) => "STORAGE_ERROR",
            PipelineError::Upload(_) => "UPLOAD_ERROR",
            PipelineError::UploadTimeout(_) => "UPLOAD_TIMEOUT",
        }
    }

    /// True when the failure cost us a report (counted in `reports_failed`).
    pub fn loses_report(&self) -> bool {
        matches!(self, PipelineError::Storage(_))
    }

    pub fn is_upload_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::Upload(_) | PipelineError::UploadTimeout(_)
        )
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::ValidationSkip(msg)
            | PipelineError::LocationUnavailable(msg)
            | PipelineError::Storage(msg)
            | PipelineError::Upload(msg) => write!(f, "{}: {}", self.code(), msg),
            PipelineError::UploadTimeout(after) => {
                write!(f, "{}: no response after {} ms", self.code(), after.as_millis())
            }
        }
    }
}

impl std::error::Error for PipelineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_failures_lose_reports() {
        assert!(PipelineError::storage("disk full").loses_report());
        assert!(!PipelineError::upload("502").loses_report());
        assert!(!PipelineError::UploadTimeout(Duration::from_secs(1)).loses_report());
        assert!(PipelineError::UploadTimeout(Duration::from_secs(1)).is_upload_failure());
    }

    #[test]
    fn display_carries_code() {
        let err = PipelineError::UploadTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "UPLOAD_TIMEOUT: no response after 1500 ms");
        assert_eq!(
            PipelineError::storage("quota").to_string(),
            "STORAGE_ERROR: quota"
        );
    }
}
