//! hazard_replay - feed a recorded detection log through the auto-reporter
//!
//! Input is JSON lines, one frame per line:
//! `{"timestampMs": 1700000000000, "detections": [{"classId": 2, "score": 0.9,
//!   "x1": 100, "y1": 100, "x2": 200, "y2": 200}], "location": {"lat": 32.08, "lng": 34.78}}`
//! `timestampMs`, `location` and `framePath` (JPEG/PNG of the frame) are optional.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hazard_autoreport::{
    now_ms, AutoReporter, FixedLocation, FrameImage, Location, RawDetection, ReporterConfig,
    SqliteOfflineStore, SqlitePreferenceStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON-lines detection log; stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Report database (overrides config and HAZARD_DB_PATH).
    #[arg(long)]
    db_path: Option<String>,
    /// Base URL of the reporting service (overrides config and HAZARD_UPLOAD_URL).
    #[arg(long)]
    upload_url: Option<String>,
    /// Store reports locally only.
    #[arg(long)]
    no_upload: bool,
    /// Size of the blank frame used when a line has no framePath.
    #[arg(long, default_value_t = 1280)]
    frame_width: u32,
    #[arg(long, default_value_t = 720)]
    frame_height: u32,
    /// Start a fresh session before replaying.
    #[arg(long)]
    reset_session: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplayFrame {
    timestamp_ms: Option<u64>,
    #[serde(default)]
    detections: Vec<RawDetection>,
    location: Option<Location>,
    frame_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = ReporterConfig::load()?;
    if let Some(db_path) = args.db_path {
        cfg.db_path = db_path;
    }
    if let Some(url) = args.upload_url {
        cfg.upload_url = Some(url);
    }
    if args.no_upload {
        cfg.upload_url = None;
    }

    let location = Arc::new(FixedLocation::new(None));
    let mut builder = AutoReporter::builder(cfg.pipeline.clone())
        .store(SqliteOfflineStore::open(&cfg.db_path)?)
        .preferences(SqlitePreferenceStore::open(&cfg.db_path)?)
        .location_source(location.clone());
    if let Some(url) = cfg.upload_url.as_deref() {
        builder = builder.uploader(upload_client(url, &cfg)?);
        log::info!("uploading reports to {}", url);
    } else {
        log::info!("upload disabled; reports stay offline in {}", cfg.db_path);
    }
    let reporter = builder.build()?;
    if args.reset_session {
        reporter.reset_session();
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let blank = FrameImage::blank(args.frame_width, args.frame_height);
    let mut frames = 0u64;
    for (line_no, line) in reader.lines().enumerate() {
        if stop.load(Ordering::SeqCst) {
            log::info!("interrupted after {} frames", frames);
            break;
        }
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let replay: ReplayFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("line {}: skipped malformed frame: {}", line_no + 1, e);
                continue;
            }
        };

        location.set(replay.location);
        let decoded = match replay.frame_path.as_ref() {
            Some(path) => Some(
                std::fs::read(path)
                    .map_err(anyhow::Error::from)
                    .and_then(|bytes| FrameImage::decode(&bytes))
                    .with_context(|| format!("line {}: frame {}", line_no + 1, path.display()))?,
            ),
            None => None,
        };
        let frame = decoded.as_ref().unwrap_or(&blank);
        log::debug!(
            "line {}: {} detections on {}x{} frame",
            line_no + 1,
            replay.detections.len(),
            frame.width(),
            frame.height()
        );
        let now = match replay.timestamp_ms {
            Some(ts) => ts,
            None => now_ms()?,
        };

        let outcome = reporter.process_frame(&replay.detections, frame, now);
        frames += 1;
        if let Some(reason) = outcome.reason {
            log::debug!("line {}: not processed ({})", line_no + 1, reason.as_str());
        }
        for failure in &outcome.failures {
            log::warn!("line {}: {}", line_no + 1, failure);
        }
    }

    let stats = reporter.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

#[cfg(feature = "sync-http")]
fn upload_client(url: &str, cfg: &ReporterConfig) -> Result<hazard_autoreport::HttpUploader> {
    hazard_autoreport::HttpUploader::new(url, cfg.pipeline.upload_timeout)
}

#[cfg(not(feature = "sync-http"))]
fn upload_client(_url: &str, _cfg: &ReporterConfig) -> Result<NoUpload> {
    Err(anyhow!("built without the sync-http feature; use --no-upload"))
}

#[cfg(not(feature = "sync-http"))]
struct NoUpload;

#[cfg(not(feature = "sync-http"))]
impl hazard_autoreport::Uploader for NoUpload {
    fn upload(
        &self,
        _payload: &hazard_autoreport::UploadPayload,
    ) -> Result<hazard_autoreport::UploadReceipt, hazard_autoreport::PipelineError> {
        Err(hazard_autoreport::PipelineError::upload("upload not available"))
    }
}
