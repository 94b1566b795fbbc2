//! Hazard auto-reporting engine
//!
//! Turns a stream of per-frame object detections into durable, deduplicated hazard
//! reports (potholes, cracks, surface damage) that are synced to a reporting service
//! when the network allows.
//!
//! # Pipeline
//!
//! Each frame handed to [`AutoReporter::process_frame`] goes through:
//!
//! 1. **Session cap**: a capped session short-circuits before any work.
//! 2. **Stabilization**: a detection must be seen in `consecutive_frames` frames
//!    inside the stabilization window before it is trusted.
//! 3. **Burst dedup**: a stabilized detection that repeats a recently accepted one of
//!    the same class (by box overlap or position) is dropped.
//! 4. **Report assembly**: one report per hazard class with one annotated snapshot.
//! 5. **Offline first**: every report is stored locally before upload is attempted.
//!
//! # Module Structure
//!
//! - `stabilizer`, `dedup`: the two filtering stages
//! - `report`, `sync`, `storage`, `transport`: report assembly and delivery
//! - `session`, `pipeline`: counters, caps and the reporter context
//! - `config`, `geo`, `frame`, `detect`: inputs and configuration

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod dedup;
pub mod detect;
pub mod error;
pub mod frame;
pub mod geo;
pub mod pipeline;
pub mod report;
pub mod session;
pub mod stabilizer;
pub mod storage;
pub mod sync;
pub mod transport;

pub use config::{PipelineConfig, PreferenceStore, Preferences, ReporterConfig};
pub use dedup::BurstDeduplicator;
pub use detect::{BBox, HazardLabels, RawDetection};
pub use error::PipelineError;
pub use frame::{AnnotatedImage, FrameImage};
pub use geo::{FixedLocation, Location, LocationSource, LocationWatch, NoLocation};
pub use pipeline::{AutoReporter, AutoReporterBuilder, FrameOutcome, SkipReason, StatsSnapshot};
pub use report::{Report, ReportFactory};
pub use session::{SessionCounters, SessionPhase, SessionState};
pub use stabilizer::{FrameStabilizer, StabilizedDetection};
pub use storage::{
    InMemoryOfflineStore, OfflineStore, SharedStore, SqliteOfflineStore, SqlitePreferenceStore,
};
#[cfg(feature = "sync-http")]
pub use transport::HttpUploader;
pub use transport::{UploadPayload, UploadReceipt, Uploader};

/// URI for a private shared-cache in-memory database, unique per call.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:hazard_reports_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}
