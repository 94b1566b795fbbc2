use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::config::{PreferenceStore, Preferences};
use crate::detect::BBox;
use crate::error::PipelineError;
use crate::geo::Location;
use crate::report::{ReportDraft, ReportId};
use crate::{now_ms, open_db_connection};

const PREFERENCES_KEY: &str = "auto_reporting";

/// Durable local persistence for reports. Writes here precede any upload.
pub trait OfflineStore: Send {
    /// Persist a draft and assign its id.
    fn store(&mut self, draft: &ReportDraft) -> Result<ReportId, PipelineError>;

    /// Record the outcome of an upload attempt. Idempotent.
    fn mark_synced(&mut self, id: ReportId, synced: bool, remote_ref: Option<&str>) -> Result<()>;

    fn get(&mut self, id: ReportId) -> Result<Option<StoredReport>>;

    /// Oldest unsynced reports first.
    fn list_unsynced(&mut self, limit: usize) -> Result<Vec<StoredReport>>;

    fn count(&mut self) -> Result<usize>;
}

/// A store shared between the pipeline pass and its callers. Locked per call.
pub type SharedStore = Mutex<Box<dyn OfflineStore>>;

#[derive(Clone, Debug, PartialEq)]
pub struct StoredReport {
    pub id: ReportId,
    pub created_at_ms: u64,
    pub class_id: u32,
    pub hazard_type: String,
    pub detection_count: usize,
    pub avg_confidence: f32,
    pub location: Option<Location>,
    pub boxes: Vec<BBox>,
    pub image_jpeg: Option<Vec<u8>>,
    pub image_sha256: Option<String>,
    pub synced: bool,
    pub remote_ref: Option<String>,
    pub sync_attempts: u32,
}

impl StoredReport {
    fn from_draft(id: ReportId, draft: &ReportDraft) -> Self {
        Self {
            id,
            created_at_ms: draft.created_at_ms,
            class_id: draft.class_id,
            hazard_type: draft.hazard_type.clone(),
            detection_count: draft.detection_count,
            avg_confidence: draft.avg_confidence,
            location: draft.location,
            boxes: draft.boxes.clone(),
            image_jpeg: draft.image.as_ref().map(|img| img.jpeg.clone()),
            image_sha256: draft.image.as_ref().map(|img| img.sha256.clone()),
            synced: false,
            remote_ref: None,
            sync_attempts: 0,
        }
    }

    fn apply_sync(&mut self, synced: bool, remote_ref: Option<&str>) {
        self.sync_attempts += 1;
        if synced {
            self.synced = true;
            if let Some(remote_ref) = remote_ref {
                self.remote_ref = Some(remote_ref.to_string());
            }
        }
    }
}

/// Add missing columns to an existing table.
pub fn ensure_columns(conn: &Connection, table: &str, columns: &[(&str, &str)]) -> Result<()> {
    let mut existing = Vec::new();
    {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            existing.push(name);
        }
    }
    for (name, decl) in columns {
        if existing.iter().any(|col| col == name) {
            continue;
        }
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN {} {}", table, name, decl),
            [],
        )?;
    }
    Ok(())
}

pub struct SqliteOfflineStore {
    conn: Connection,
}

impl SqliteOfflineStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS hazard_reports (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at_ms INTEGER NOT NULL,
              class_id INTEGER NOT NULL,
              hazard_type TEXT NOT NULL,
              detection_count INTEGER NOT NULL,
              avg_confidence REAL NOT NULL,
              lat REAL,
              lng REAL,
              boxes_json TEXT NOT NULL,
              image_jpeg BLOB,
              image_sha256 TEXT,
              synced INTEGER NOT NULL DEFAULT 0,
              remote_ref TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_reports_unsynced ON hazard_reports(synced, id);
            "#,
        )?;
        ensure_columns(
            &self.conn,
            "hazard_reports",
            &[
                ("sync_attempts", "INTEGER NOT NULL DEFAULT 0"),
                ("last_sync_at_ms", "INTEGER"),
            ],
        )?;
        Ok(())
    }

    fn insert(&mut self, draft: &ReportDraft) -> Result<ReportId> {
        let created_at = i64::try_from(draft.created_at_ms)
            .map_err(|_| anyhow!("report timestamp exceeds i64 range"))?;
        let boxes_json = serde_json::to_string(&draft.boxes)?;
        self.conn.execute(
            r#"
            INSERT INTO hazard_reports(
              created_at_ms, class_id, hazard_type, detection_count, avg_confidence,
              lat, lng, boxes_json, image_jpeg, image_sha256
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                created_at,
                draft.class_id,
                draft.hazard_type,
                draft.detection_count as i64,
                draft.avg_confidence as f64,
                draft.location.map(|loc| loc.lat),
                draft.location.map(|loc| loc.lng),
                boxes_json,
                draft.image.as_ref().map(|img| img.jpeg.as_slice()),
                draft.image.as_ref().map(|img| img.sha256.as_str()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn select(&self, where_clause: &str, param: i64) -> Result<Vec<StoredReport>> {
        let sql = format!(
            r#"
            SELECT id, created_at_ms, class_id, hazard_type, detection_count, avg_confidence,
                   lat, lng, boxes_json, image_jpeg, image_sha256, synced, remote_ref,
                   sync_attempts
            FROM hazard_reports
            {}
            "#,
            where_clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![param])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(stored_report_from_row(row)?);
        }
        Ok(out)
    }
}

fn stored_report_from_row(row: &Row<'_>) -> Result<StoredReport> {
    let lat: Option<f64> = row.get(6)?;
    let lng: Option<f64> = row.get(7)?;
    let boxes_json: String = row.get(8)?;
    let created_at: i64 = row.get(1)?;
    let detection_count: i64 = row.get(4)?;
    let avg_confidence: f64 = row.get(5)?;
    let synced: i64 = row.get(11)?;
    let sync_attempts: i64 = row.get(13)?;
    Ok(StoredReport {
        id: row.get(0)?,
        created_at_ms: u64::try_from(created_at)
            .map_err(|_| anyhow!("corrupt report: negative created_at_ms"))?,
        class_id: row.get(2)?,
        hazard_type: row.get(3)?,
        detection_count: detection_count.max(0) as usize,
        avg_confidence: avg_confidence as f32,
        location: match (lat, lng) {
            (Some(lat), Some(lng)) => Some(Location::new(lat, lng)),
            _ => None,
        },
        boxes: serde_json::from_str(&boxes_json)
            .map_err(|e| anyhow!("corrupt report: boxes_json: {}", e))?,
        image_jpeg: row.get(9)?,
        image_sha256: row.get(10)?,
        synced: synced != 0,
        remote_ref: row.get(12)?,
        sync_attempts: sync_attempts.max(0) as u32,
    })
}

impl OfflineStore for SqliteOfflineStore {
    fn store(&mut self, draft: &ReportDraft) -> Result<ReportId, PipelineError> {
        self.insert(draft).map_err(PipelineError::storage)
    }

    fn mark_synced(&mut self, id: ReportId, synced: bool, remote_ref: Option<&str>) -> Result<()> {
        let now = i64::try_from(now_ms()?).map_err(|_| anyhow!("clock exceeds i64 range"))?;
        let changed = if synced {
            self.conn.execute(
                r#"
                UPDATE hazard_reports
                SET synced = 1,
                    remote_ref = COALESCE(?2, remote_ref),
                    sync_attempts = sync_attempts + 1,
                    last_sync_at_ms = ?3
                WHERE id = ?1
                "#,
                params![id, remote_ref, now],
            )?
        } else {
            self.conn.execute(
                r#"
                UPDATE hazard_reports
                SET sync_attempts = sync_attempts + 1,
                    last_sync_at_ms = ?2
                WHERE id = ?1
                "#,
                params![id, now],
            )?
        };
        if changed == 0 {
            return Err(anyhow!("report {} not found", id));
        }
        Ok(())
    }

    fn get(&mut self, id: ReportId) -> Result<Option<StoredReport>> {
        Ok(self.select("WHERE id = ?1", id)?.into_iter().next())
    }

    fn list_unsynced(&mut self, limit: usize) -> Result<Vec<StoredReport>> {
        self.select("WHERE synced = 0 ORDER BY id ASC LIMIT ?1", limit as i64)
    }

    fn count(&mut self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM hazard_reports", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryOfflineStore {
    reports: BTreeMap<ReportId, StoredReport>,
    next_id: ReportId,
}

impl InMemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OfflineStore for InMemoryOfflineStore {
    fn store(&mut self, draft: &ReportDraft) -> Result<ReportId, PipelineError> {
        self.next_id += 1;
        let id = self.next_id;
        self.reports.insert(id, StoredReport::from_draft(id, draft));
        Ok(id)
    }

    fn mark_synced(&mut self, id: ReportId, synced: bool, remote_ref: Option<&str>) -> Result<()> {
        let report = self
            .reports
            .get_mut(&id)
            .ok_or_else(|| anyhow!("report {} not found", id))?;
        report.apply_sync(synced, remote_ref);
        Ok(())
    }

    fn get(&mut self, id: ReportId) -> Result<Option<StoredReport>> {
        Ok(self.reports.get(&id).cloned())
    }

    fn list_unsynced(&mut self, limit: usize) -> Result<Vec<StoredReport>> {
        Ok(self
            .reports
            .values()
            .filter(|r| !r.synced)
            .take(limit)
            .cloned()
            .collect())
    }

    fn count(&mut self) -> Result<usize> {
        Ok(self.reports.len())
    }
}

// -------------------- Preferences --------------------

/// Preferences kept as JSON in a key/value table next to the reports.
pub struct SqlitePreferenceStore {
    conn: Connection,
}

impl SqlitePreferenceStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }
}

impl PreferenceStore for SqlitePreferenceStore {
    fn load(&mut self) -> Result<Option<Preferences>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                params![PREFERENCES_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).map_err(|e| anyhow!("corrupt preferences: {}", e))?,
            )),
            None => Ok(None),
        }
    }

    fn save(&mut self, prefs: &Preferences) -> Result<()> {
        let json = serde_json::to_string(prefs)?;
        self.conn.execute(
            r#"
            INSERT INTO preferences(key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![PREFERENCES_KEY, json],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::AnnotatedImage;
    use crate::shared_memory_uri;

    fn draft(class_id: u32, location: Option<Location>) -> ReportDraft {
        ReportDraft {
            class_id,
            hazard_type: "pothole".to_string(),
            detection_count: 1,
            avg_confidence: 0.9,
            location,
            boxes: vec![BBox {
                x: 0.1,
                y: 0.1,
                width: 0.2,
                height: 0.2,
            }],
            image: Some(AnnotatedImage::new(vec![0xff, 0xd8, 0xff, 0xd9], 2, 2)),
            created_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn sqlite_store_round_trips_and_tracks_sync() {
        let uri = shared_memory_uri();
        let mut store = SqliteOfflineStore::open(&uri).expect("open store");

        let id = store
            .store(&draft(2, Some(Location::new(32.1, 34.8))))
            .expect("store");
        let second = store.store(&draft(0, None)).expect("store");
        assert!(second > id);
        assert_eq!(store.count().unwrap(), 2);

        let loaded = store.get(id).unwrap().expect("stored report");
        assert_eq!(loaded.class_id, 2);
        assert_eq!(loaded.location, Some(Location::new(32.1, 34.8)));
        assert_eq!(loaded.boxes.len(), 1);
        assert_eq!(loaded.image_jpeg.as_deref(), Some(&[0xff, 0xd8, 0xff, 0xd9][..]));
        assert!(!loaded.synced);

        store.mark_synced(id, false, None).unwrap();
        store.mark_synced(id, true, Some("https://reports.example/r/1")).unwrap();
        store.mark_synced(id, true, None).unwrap();
        let loaded = store.get(id).unwrap().unwrap();
        assert!(loaded.synced);
        assert_eq!(loaded.remote_ref.as_deref(), Some("https://reports.example/r/1"));
        assert_eq!(loaded.sync_attempts, 3);

        let pending = store.list_unsynced(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);

        assert!(store.mark_synced(9_999, true, None).is_err());
    }

    #[test]
    fn ensure_columns_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY);")
            .unwrap();
        ensure_columns(&conn, "t", &[("extra", "TEXT")]).unwrap();
        ensure_columns(&conn, "t", &[("extra", "TEXT")]).unwrap();
        conn.execute("INSERT INTO t(extra) VALUES ('x')", []).unwrap();
    }

    #[test]
    fn in_memory_store_matches_sqlite_semantics() {
        let mut store = InMemoryOfflineStore::new();
        let id = store.store(&draft(2, None)).unwrap();
        store.mark_synced(id, true, Some("r-1")).unwrap();
        assert!(store.list_unsynced(10).unwrap().is_empty());
        assert_eq!(store.get(id).unwrap().unwrap().remote_ref.as_deref(), Some("r-1"));
        assert!(store.mark_synced(id + 1, true, None).is_err());
    }

    #[test]
    fn preferences_persist_across_connections() {
        let uri = shared_memory_uri();
        let mut first = SqlitePreferenceStore::open(&uri).unwrap();
        assert_eq!(first.load().unwrap(), None);
        first
            .save(&Preferences {
                enabled: false,
                min_confidence: 0.65,
            })
            .unwrap();

        let mut second = SqlitePreferenceStore::open(&uri).unwrap();
        let prefs = second.load().unwrap().expect("saved prefs");
        assert!(!prefs.enabled);
        assert_eq!(prefs.min_confidence, 0.65);
    }
}
