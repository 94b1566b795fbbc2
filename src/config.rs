use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::detect::HazardLabels;

const DEFAULT_DB_PATH: &str = "hazard_reports.db";
const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
const DEFAULT_CONSECUTIVE_FRAMES: usize = 3;
const DEFAULT_STABILIZATION_WINDOW_MS: u64 = 3_000;
const DEFAULT_SPATIAL_BUCKET_PX: f32 = 50.0;
const DEFAULT_LOCATION_BUCKET_DEG: f64 = 0.0001;
const DEFAULT_MAX_FRAME_BUFFER_ENTRIES: usize = 256;
const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_GEO_RADIUS_M: f64 = 10.0;
const DEFAULT_DEDUP_HORIZON_MS: u64 = 30_000;
const DEFAULT_BURST_WINDOW_MS: u64 = 2_000;
const DEFAULT_MAX_HISTORY: usize = 100;
const DEFAULT_MAX_REPORTS_PER_SESSION: u32 = 50;
const DEFAULT_MODEL_INPUT_SIZE: u32 = 640;
const DEFAULT_LOCATION_TIMEOUT_MS: u64 = 1_500;
const DEFAULT_UPLOAD_TIMEOUT_MS: u64 = 10_000;

// -------------------- Pipeline thresholds --------------------

/// Thresholds for one reporter. Read-only while a frame is being processed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineConfig {
    /// Detections scoring below this never enter the frame buffer.
    pub min_confidence: f32,
    /// Sightings required before a detection is trusted.
    pub consecutive_frames: usize,
    /// Sliding window the sightings must fall in.
    #[serde(rename = "stabilization_window_ms", serialize_with = "as_millis")]
    pub stabilization_window: Duration,
    /// Box-center quantization step in model-input pixels.
    pub spatial_bucket_px: f32,
    /// Location quantization step in degrees (~11 m at 1e-4).
    pub location_bucket_deg: f64,
    pub max_frame_buffer_entries: usize,
    pub iou_threshold: f32,
    pub geo_radius_m: f64,
    /// History entries older than this no longer suppress anything.
    #[serde(rename = "dedup_horizon_ms", serialize_with = "as_millis")]
    pub dedup_horizon: Duration,
    /// Recency fallback when geolocation cannot discriminate.
    #[serde(rename = "burst_window_ms", serialize_with = "as_millis")]
    pub burst_window: Duration,
    pub max_history: usize,
    pub max_reports_per_session: u32,
    /// Side of the square model input the raw boxes are expressed in.
    pub model_input_size: u32,
    #[serde(rename = "location_timeout_ms", serialize_with = "as_millis")]
    pub location_timeout: Duration,
    #[serde(rename = "upload_timeout_ms", serialize_with = "as_millis")]
    pub upload_timeout: Duration,
    pub labels: HazardLabels,
}

fn as_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            consecutive_frames: DEFAULT_CONSECUTIVE_FRAMES,
            stabilization_window: Duration::from_millis(DEFAULT_STABILIZATION_WINDOW_MS),
            spatial_bucket_px: DEFAULT_SPATIAL_BUCKET_PX,
            location_bucket_deg: DEFAULT_LOCATION_BUCKET_DEG,
            max_frame_buffer_entries: DEFAULT_MAX_FRAME_BUFFER_ENTRIES,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            geo_radius_m: DEFAULT_GEO_RADIUS_M,
            dedup_horizon: Duration::from_millis(DEFAULT_DEDUP_HORIZON_MS),
            burst_window: Duration::from_millis(DEFAULT_BURST_WINDOW_MS),
            max_history: DEFAULT_MAX_HISTORY,
            max_reports_per_session: DEFAULT_MAX_REPORTS_PER_SESSION,
            model_input_size: DEFAULT_MODEL_INPUT_SIZE,
            location_timeout: Duration::from_millis(DEFAULT_LOCATION_TIMEOUT_MS),
            upload_timeout: Duration::from_millis(DEFAULT_UPLOAD_TIMEOUT_MS),
            labels: HazardLabels::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        validate_confidence(self.min_confidence)?;
        if self.consecutive_frames == 0 {
            return Err(anyhow!("consecutive_frames must be at least 1"));
        }
        if self.stabilization_window.is_zero() {
            return Err(anyhow!("stabilization window must be greater than zero"));
        }
        if !(self.spatial_bucket_px.is_finite() && self.spatial_bucket_px > 0.0) {
            return Err(anyhow!("spatial_bucket_px must be positive"));
        }
        if !(self.location_bucket_deg.is_finite() && self.location_bucket_deg > 0.0) {
            return Err(anyhow!("location_bucket_deg must be positive"));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(anyhow!("iou_threshold must be within [0, 1]"));
        }
        if !(self.geo_radius_m.is_finite() && self.geo_radius_m >= 0.0) {
            return Err(anyhow!("geo_radius_m must be non-negative"));
        }
        if self.dedup_horizon < self.burst_window {
            return Err(anyhow!("dedup horizon must not be shorter than the burst window"));
        }
        if self.max_frame_buffer_entries == 0 || self.max_history == 0 {
            return Err(anyhow!("buffer and history caps must be greater than zero"));
        }
        if self.model_input_size == 0 {
            return Err(anyhow!("model_input_size must be greater than zero"));
        }
        if self.labels.is_empty() {
            return Err(anyhow!("at least one hazard label is required"));
        }
        Ok(())
    }
}

pub fn validate_confidence(value: f32) -> Result<()> {
    if !(value.is_finite() && (0.0..=1.0).contains(&value)) {
        return Err(anyhow!("confidence threshold {} outside [0, 1]", value));
    }
    Ok(())
}

// -------------------- Daemon configuration --------------------

#[derive(Debug, Deserialize, Default)]
struct ReporterConfigFile {
    db_path: Option<String>,
    upload: Option<UploadConfigFile>,
    thresholds: Option<ThresholdsConfigFile>,
    labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadConfigFile {
    url: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ThresholdsConfigFile {
    min_confidence: Option<f32>,
    consecutive_frames: Option<usize>,
    stabilization_window_ms: Option<u64>,
    spatial_bucket_px: Option<f32>,
    location_bucket_deg: Option<f64>,
    max_frame_buffer_entries: Option<usize>,
    iou_threshold: Option<f32>,
    geo_radius_m: Option<f64>,
    dedup_horizon_ms: Option<u64>,
    burst_window_ms: Option<u64>,
    max_history: Option<usize>,
    max_reports_per_session: Option<u32>,
    model_input_size: Option<u32>,
    location_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub db_path: String,
    pub upload_url: Option<String>,
    pub pipeline: PipelineConfig,
}

impl ReporterConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("HAZARD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ReporterConfigFile) -> Self {
        let defaults = PipelineConfig::default();
        let t = file.thresholds.unwrap_or_default();
        let ms = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };
        let pipeline = PipelineConfig {
            min_confidence: t.min_confidence.unwrap_or(defaults.min_confidence),
            consecutive_frames: t.consecutive_frames.unwrap_or(defaults.consecutive_frames),
            stabilization_window: ms(t.stabilization_window_ms, defaults.stabilization_window),
            spatial_bucket_px: t.spatial_bucket_px.unwrap_or(defaults.spatial_bucket_px),
            location_bucket_deg: t.location_bucket_deg.unwrap_or(defaults.location_bucket_deg),
            max_frame_buffer_entries: t
                .max_frame_buffer_entries
                .unwrap_or(defaults.max_frame_buffer_entries),
            iou_threshold: t.iou_threshold.unwrap_or(defaults.iou_threshold),
            geo_radius_m: t.geo_radius_m.unwrap_or(defaults.geo_radius_m),
            dedup_horizon: ms(t.dedup_horizon_ms, defaults.dedup_horizon),
            burst_window: ms(t.burst_window_ms, defaults.burst_window),
            max_history: t.max_history.unwrap_or(defaults.max_history),
            max_reports_per_session: t
                .max_reports_per_session
                .unwrap_or(defaults.max_reports_per_session),
            model_input_size: t.model_input_size.unwrap_or(defaults.model_input_size),
            location_timeout: ms(t.location_timeout_ms, defaults.location_timeout),
            upload_timeout: ms(
                file.upload.as_ref().and_then(|upload| upload.timeout_ms),
                defaults.upload_timeout,
            ),
            labels: file
                .labels
                .map(HazardLabels::new)
                .unwrap_or(defaults.labels),
        };
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            upload_url: file.upload.and_then(|upload| upload.url),
            pipeline,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("HAZARD_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(url) = std::env::var("HAZARD_UPLOAD_URL") {
            if !url.trim().is_empty() {
                self.upload_url = Some(url);
            }
        }
        if let Ok(value) = std::env::var("HAZARD_MIN_CONFIDENCE") {
            self.pipeline.min_confidence = value
                .parse()
                .map_err(|_| anyhow!("HAZARD_MIN_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Ok(value) = std::env::var("HAZARD_MAX_REPORTS_PER_SESSION") {
            self.pipeline.max_reports_per_session = value
                .parse()
                .map_err(|_| anyhow!("HAZARD_MAX_REPORTS_PER_SESSION must be an integer"))?;
        }
        if let Ok(value) = std::env::var("HAZARD_CONSECUTIVE_FRAMES") {
            self.pipeline.consecutive_frames = value
                .parse()
                .map_err(|_| anyhow!("HAZARD_CONSECUTIVE_FRAMES must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        self.pipeline.validate()
    }
}

fn read_config_file(path: &Path) -> Result<ReporterConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

// -------------------- User preferences --------------------

/// Preferences that survive restarts: `{"enabled": bool, "minConfidence": number}`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub enabled: bool,
    pub min_confidence: f32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

/// Key/value backed store for `Preferences`.
pub trait PreferenceStore: Send {
    fn load(&mut self) -> Result<Option<Preferences>>;
    fn save(&mut self, prefs: &Preferences) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryPreferenceStore {
    value: Option<String>,
}

impl InMemoryPreferenceStore {
    /// Raw persisted JSON, as a key/value backend would hold it.
    pub fn raw(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl PreferenceStore for InMemoryPreferenceStore {
    fn load(&mut self) -> Result<Option<Preferences>> {
        match self.value.as_deref() {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    fn save(&mut self, prefs: &Preferences) -> Result<()> {
        self.value = Some(serde_json::to_string(prefs)?);
        Ok(())
    }
}
