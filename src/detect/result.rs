use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// One candidate object from one inference pass, in model-input pixel space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDetection {
    pub class_id: u32,
    pub score: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl RawDetection {
    pub fn new(class_id: u32, score: f32, bbox: [f32; 4]) -> Self {
        Self {
            class_id,
            score,
            x1: bbox[0],
            y1: bbox[1],
            x2: bbox[2],
            y2: bbox[3],
        }
    }

    /// Boundary check for detections coming off the inference loop.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let coords = [self.x1, self.y1, self.x2, self.y2];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(PipelineError::ValidationSkip(
                "non-finite box coordinate".to_string(),
            ));
        }
        if !(self.score.is_finite() && (0.0..=1.0).contains(&self.score)) {
            return Err(PipelineError::ValidationSkip(format!(
                "score {} outside [0, 1]",
                self.score
            )));
        }
        if self.x2 <= self.x1 || self.y2 <= self.y1 {
            return Err(PipelineError::ValidationSkip(
                "degenerate box".to_string(),
            ));
        }
        Ok(())
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Normalized box relative to a square model input of `input_size` pixels.
    pub fn normalized(&self, input_size: u32) -> BBox {
        let size = input_size.max(1) as f32;
        BBox {
            x: self.x1 / size,
            y: self.y1 / size,
            width: (self.x2 - self.x1) / size,
            height: (self.y2 - self.y1) / size,
        }
    }
}

/// Normalized box used for overlap math.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union. Zero when either box is empty.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x.max(other.x);
        let iy1 = self.y.max(other.y);
        let ix2 = (self.x + self.width).min(other.x + other.width);
        let iy2 = (self.y + self.height).min(other.y + other.height);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_detections() {
        assert!(RawDetection::new(0, 0.9, [f32::NAN, 0.0, 10.0, 10.0])
            .validate()
            .is_err());
        assert!(RawDetection::new(0, 1.2, [0.0, 0.0, 10.0, 10.0])
            .validate()
            .is_err());
        assert!(RawDetection::new(0, 0.9, [10.0, 0.0, 10.0, 10.0])
            .validate()
            .is_err());
        assert!(RawDetection::new(0, 0.9, [0.0, 0.0, 10.0, 10.0])
            .validate()
            .is_ok());
    }

    #[test]
    fn iou_of_shifted_boxes() {
        let a = RawDetection::new(2, 0.9, [100.0, 100.0, 200.0, 200.0]).normalized(640);
        let b = RawDetection::new(2, 0.9, [105.0, 105.0, 205.0, 205.0]).normalized(640);
        let iou = a.iou(&b);
        assert!((iou - 9025.0 / 10975.0).abs() < 1e-3, "iou was {}", iou);

        let half = RawDetection::new(2, 0.9, [100.0, 100.0, 200.0, 150.0]).normalized(640);
        assert!((a.iou(&half) - 0.5).abs() < 1e-4);

        let far = RawDetection::new(2, 0.9, [400.0, 400.0, 500.0, 500.0]).normalized(640);
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn deserializes_camel_case() {
        let det: RawDetection = serde_json::from_str(
            r#"{"classId":2,"score":0.9,"x1":100,"y1":100,"x2":200,"y2":200}"#,
        )
        .expect("parse detection");
        assert_eq!(det.class_id, 2);
        assert_eq!(det.center(), (150.0, 150.0));
    }
}
