//! Upload of stored reports to the remote reporting service.
//!
//! The wire body is camelCase JSON with the snapshot inlined as base64. Uploads run
//! after the report is already durable, so every failure here is recoverable.

#[cfg(feature = "sync-http")]
mod http;

#[cfg(feature = "sync-http")]
pub use http::{HttpUploader, UPLOAD_PATH};

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::detect::BBox;
use crate::error::PipelineError;
use crate::geo::Location;
use crate::report::{ReportDraft, ReportId};

/// What the server returned for an accepted upload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    #[serde(default, alias = "reportId", deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Servers key reports by string or integer ids. Both are kept as text.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(Value::Number(id)) => Ok(Some(id.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "report id must be a string or number, got {}",
            other
        ))),
    }
}

impl UploadReceipt {
    /// Receipt from a 2xx response body.
    ///
    /// The server already accepted the report, so an empty or unreadable body
    /// yields an empty receipt instead of an upload failure.
    pub fn from_response_body(body: &str) -> Self {
        if body.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str(body) {
            Ok(receipt) => receipt,
            Err(e) => {
                log::warn!("upload accepted but receipt unreadable: {}", e);
                Self::default()
            }
        }
    }

    /// Reference persisted alongside the local report: the URL when present, else the id.
    pub fn remote_ref(&self) -> Option<&str> {
        self.url.as_deref().or(self.id.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPayload {
    pub report_id: ReportId,
    pub hazard_type: String,
    pub class_id: u32,
    pub detection_count: usize,
    pub avg_confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub boxes: Vec<BBox>,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_jpeg_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_sha256: Option<String>,
}

impl UploadPayload {
    pub fn from_draft(id: ReportId, draft: &ReportDraft) -> Self {
        Self {
            report_id: id,
            hazard_type: draft.hazard_type.clone(),
            class_id: draft.class_id,
            detection_count: draft.detection_count,
            avg_confidence: draft.avg_confidence,
            location: draft.location,
            boxes: draft.boxes.clone(),
            created_at_ms: draft.created_at_ms,
            image_jpeg_base64: draft
                .image
                .as_ref()
                .map(|img| base64::engine::general_purpose::STANDARD.encode(&img.jpeg)),
            image_sha256: draft.image.as_ref().map(|img| img.sha256.clone()),
        }
    }
}

/// Remote delivery of a stored report.
pub trait Uploader: Send + Sync {
    fn upload(&self, payload: &UploadPayload) -> Result<UploadReceipt, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::AnnotatedImage;

    #[test]
    fn payload_is_camel_case_with_inline_image() {
        let draft = ReportDraft {
            class_id: 2,
            hazard_type: "pothole".to_string(),
            detection_count: 1,
            avg_confidence: 0.5,
            location: Some(Location::new(1.5, 2.5)),
            boxes: Vec::new(),
            image: Some(AnnotatedImage::new(vec![1, 2, 3], 1, 1)),
            created_at_ms: 42,
        };
        let json = serde_json::to_value(UploadPayload::from_draft(7, &draft)).unwrap();
        assert_eq!(json["reportId"], 7);
        assert_eq!(json["hazardType"], "pothole");
        assert_eq!(json["detectionCount"], 1);
        assert_eq!(json["createdAtMs"], 42);
        assert_eq!(json["imageJpegBase64"], "AQID");
        assert_eq!(json["location"]["lat"], 1.5);
    }

    #[test]
    fn receipt_prefers_url() {
        let receipt: UploadReceipt =
            serde_json::from_str(r#"{"reportId":"abc","url":"https://x/r/abc"}"#).unwrap();
        assert_eq!(receipt.remote_ref(), Some("https://x/r/abc"));
        let bare = UploadReceipt {
            id: Some("abc".into()),
            url: None,
        };
        assert_eq!(bare.remote_ref(), Some("abc"));
        assert_eq!(UploadReceipt::default().remote_ref(), None);
    }

    #[test]
    fn receipt_accepts_numeric_id() {
        let receipt: UploadReceipt = serde_json::from_str(r#"{"id":4711}"#).unwrap();
        assert_eq!(receipt.remote_ref(), Some("4711"));
        let receipt: UploadReceipt = serde_json::from_str(r#"{"reportId":12,"url":null}"#).unwrap();
        assert_eq!(receipt.id.as_deref(), Some("12"));
        assert_eq!(receipt.url, None);
    }

    #[test]
    fn unreadable_success_body_gives_empty_receipt() {
        assert_eq!(
            UploadReceipt::from_response_body("<html>OK</html>"),
            UploadReceipt::default()
        );
        assert_eq!(UploadReceipt::from_response_body("  "), UploadReceipt::default());
        assert_eq!(
            UploadReceipt::from_response_body(r#"{"id":7}"#).remote_ref(),
            Some("7")
        );
    }
}
