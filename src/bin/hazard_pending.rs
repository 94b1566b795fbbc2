//! hazard_pending - list reports stored offline and not yet synced

use anyhow::Result;
use clap::Parser;
use serde::Serialize;

use hazard_autoreport::storage::{OfflineStore, SqliteOfflineStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Report database.
    #[arg(long, env = "HAZARD_DB_PATH", default_value = "hazard_reports.db")]
    db_path: String,
    /// Maximum reports to list.
    #[arg(long, default_value_t = 100)]
    limit: usize,
    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PendingRow {
    id: i64,
    created_at_ms: u64,
    hazard_type: String,
    detection_count: usize,
    avg_confidence: f32,
    lat: Option<f64>,
    lng: Option<f64>,
    has_image: bool,
    sync_attempts: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut store = SqliteOfflineStore::open(&args.db_path)?;
    let total = store.count()?;
    let rows: Vec<PendingRow> = store
        .list_unsynced(args.limit)?
        .into_iter()
        .map(|r| PendingRow {
            id: r.id,
            created_at_ms: r.created_at_ms,
            hazard_type: r.hazard_type,
            detection_count: r.detection_count,
            avg_confidence: r.avg_confidence,
            lat: r.location.map(|loc| loc.lat),
            lng: r.location.map(|loc| loc.lng),
            has_image: r.image_jpeg.is_some(),
            sync_attempts: r.sync_attempts,
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{} unsynced of {} stored in {}", rows.len(), total, args.db_path);
    for row in &rows {
        let position = match (row.lat, row.lng) {
            (Some(lat), Some(lng)) => format!("{:.6},{:.6}", lat, lng),
            _ => "-".to_string(),
        };
        println!(
            "#{:<6} {:<16} x{:<3} conf={:.2} at={} pos={} image={} attempts={}",
            row.id,
            row.hazard_type,
            row.detection_count,
            row.avg_confidence,
            row.created_at_ms,
            position,
            if row.has_image { "yes" } else { "no" },
            row.sync_attempts
        );
    }
    Ok(())
}
