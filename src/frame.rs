//! Camera frames handed to the pipeline and the annotated evidence captured from them.
//!
//! - `FrameImage`: the current frame, owned by the caller for the duration of a pass.
//! - `AnnotatedImage`: JPEG snapshot with one outlined box and label tab per detection.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use crate::detect::RawDetection;

/// JPEG quality used for report snapshots.
pub const SNAPSHOT_JPEG_QUALITY: u8 = 85;

const OUTLINE_PX: u32 = 3;
const LABEL_TAB_HEIGHT_PX: u32 = 12;
const LABEL_TAB_WIDTH_PX: u32 = 48;

/// Per-class overlay colors, cycled by class id.
const CLASS_COLORS: [[u8; 3]; 6] = [
    [255, 196, 0],
    [0, 160, 255],
    [255, 48, 48],
    [64, 220, 96],
    [200, 80, 255],
    [255, 128, 32],
];

/// The frame an inference pass ran on.
pub struct FrameImage {
    image: RgbImage,
}

impl FrameImage {
    /// Wrap packed RGB8 pixels.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let image = ImageBuffer::from_raw(width, height, pixels).ok_or_else(|| {
            anyhow!(
                "pixel buffer does not match {}x{} rgb frame",
                width,
                height
            )
        })?;
        Ok(Self { image })
    }

    /// Uniform gray frame. Used when replaying detections without video.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            image: ImageBuffer::from_pixel(width.max(1), height.max(1), Rgb([114, 114, 114])),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| anyhow!("failed to decode frame: {}", e))?
            .to_rgb8();
        Ok(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Draw `detections` (model-input coordinates) over a copy of the frame and encode it.
    pub fn annotate(&self, detections: &[RawDetection], model_input_size: u32) -> Result<AnnotatedImage> {
        let mut canvas = self.image.clone();
        let sx = canvas.width() as f32 / model_input_size.max(1) as f32;
        let sy = canvas.height() as f32 / model_input_size.max(1) as f32;

        for det in detections {
            if det.validate().is_err() {
                continue;
            }
            let color = Rgb(CLASS_COLORS[det.class_id as usize % CLASS_COLORS.len()]);
            let x1 = clamp_px(det.x1 * sx, canvas.width());
            let y1 = clamp_px(det.y1 * sy, canvas.height());
            let x2 = clamp_px(det.x2 * sx, canvas.width());
            let y2 = clamp_px(det.y2 * sy, canvas.height());
            draw_outline(&mut canvas, x1, y1, x2, y2, color);
            let tab_y = y1.saturating_sub(LABEL_TAB_HEIGHT_PX);
            fill_rect(
                &mut canvas,
                x1,
                tab_y,
                x1 + LABEL_TAB_WIDTH_PX,
                tab_y + LABEL_TAB_HEIGHT_PX,
                color,
            );
        }

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, SNAPSHOT_JPEG_QUALITY)
            .encode_image(&canvas)
            .map_err(|e| anyhow!("failed to encode snapshot: {}", e))?;
        Ok(AnnotatedImage::new(jpeg, canvas.width(), canvas.height()))
    }
}

/// Encoded snapshot attached to a report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotatedImage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Hex SHA-256 of `jpeg`.
    pub sha256: String,
}

impl AnnotatedImage {
    pub fn new(jpeg: Vec<u8>, width: u32, height: u32) -> Self {
        let sha256 = hex::encode(Sha256::digest(&jpeg));
        Self {
            jpeg,
            width,
            height,
            sha256,
        }
    }
}

fn clamp_px(value: f32, limit: u32) -> u32 {
    if limit == 0 {
        return 0;
    }
    (value.max(0.0) as u32).min(limit - 1)
}

fn draw_outline(canvas: &mut RgbImage, x1: u32, y1: u32, x2: u32, y2: u32, color: Rgb<u8>) {
    let t = OUTLINE_PX.saturating_sub(1);
    fill_rect(canvas, x1, y1, x2, y1 + t, color);
    fill_rect(canvas, x1, y2.saturating_sub(t), x2, y2, color);
    fill_rect(canvas, x1, y1, x1 + t, y2, color);
    fill_rect(canvas, x2.saturating_sub(t), y1, x2, y2, color);
}

/// Fill the inclusive rectangle, clipped to the canvas.
fn fill_rect(canvas: &mut RgbImage, x1: u32, y1: u32, x2: u32, y2: u32, color: Rgb<u8>) {
    let (w, h) = canvas.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    for y in y1.min(h - 1)..=y2.min(h - 1) {
        for x in x1.min(w - 1)..=x2.min(w - 1) {
            canvas.put_pixel(x, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotate_draws_scaled_outline() {
        let frame = FrameImage::blank(1280, 720);
        let det = RawDetection::new(2, 0.9, [100.0, 100.0, 200.0, 200.0]);
        let snapshot = frame.annotate(&[det], 640).expect("annotate");
        assert_eq!((snapshot.width, snapshot.height), (1280, 720));
        assert_eq!(snapshot.sha256.len(), 64);

        let decoded = image::load_from_memory(&snapshot.jpeg)
            .expect("decode snapshot")
            .to_rgb8();
        // Left edge of the box lands at x = 200 after scaling 640 -> 1280.
        let edge = decoded.get_pixel(201, 170);
        let inside = decoded.get_pixel(300, 170);
        let red = |p: &Rgb<u8>| p.0[0] as i32 - p.0[2] as i32;
        assert!(red(edge) > 80, "edge pixel {:?}", edge);
        assert!(red(inside).abs() < 30, "inside pixel {:?}", inside);
    }

    #[test]
    fn from_rgb_checks_buffer_size() {
        assert!(FrameImage::from_rgb(4, 4, vec![0u8; 4 * 4 * 3]).is_ok());
        assert!(FrameImage::from_rgb(4, 4, vec![0u8; 10]).is_err());
    }

    #[test]
    fn boxes_outside_frame_are_clipped() {
        let frame = FrameImage::blank(64, 64);
        let det = RawDetection::new(5, 0.9, [600.0, 600.0, 900.0, 900.0]);
        assert!(frame.annotate(&[det], 640).is_ok());
    }
}
