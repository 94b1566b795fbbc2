//! Offline-first submission: store locally, then try the network.

use std::sync::MutexGuard;

use crate::error::PipelineError;
use crate::report::{Report, ReportDraft, ReportId, ReportSink, Submitted};
use crate::storage::{OfflineStore, SharedStore};
use crate::transport::{UploadPayload, Uploader};

/// `ReportSink` that makes every report durable before attempting upload.
///
/// A failed store aborts the report. A failed upload leaves it stored with
/// `stored_offline = true` for a later sync. The store lock is never held while
/// an upload is in flight.
pub struct OfflineFirstSink<'a> {
    store: &'a SharedStore,
    uploader: Option<&'a dyn Uploader>,
}

impl<'a> OfflineFirstSink<'a> {
    pub fn new(store: &'a SharedStore, uploader: Option<&'a dyn Uploader>) -> Self {
        Self { store, uploader }
    }

    fn lock(&self) -> MutexGuard<'a, Box<dyn OfflineStore>> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_sync(&self, id: ReportId, synced: bool, remote_ref: Option<&str>) {
        if let Err(e) = self.lock().mark_synced(id, synced, remote_ref) {
            log::warn!("report #{} sync state not recorded: {}", id, e);
        }
    }
}

impl ReportSink for OfflineFirstSink<'_> {
    fn submit(&mut self, draft: ReportDraft) -> Result<Submitted, PipelineError> {
        let id = self.lock().store(&draft)?;
        let mut report = Report::from_draft(id, &draft);

        let Some(uploader) = self.uploader else {
            return Ok(Submitted {
                report,
                upload_error: None,
            });
        };

        let payload = UploadPayload::from_draft(id, &draft);
        match uploader.upload(&payload) {
            Ok(receipt) => {
                self.record_sync(id, true, receipt.remote_ref());
                report.stored_offline = false;
                report.server_result = Some(receipt);
                Ok(Submitted {
                    report,
                    upload_error: None,
                })
            }
            Err(err) => {
                log::warn!("report #{} kept offline: {}", id, err);
                self.record_sync(id, false, None);
                Ok(Submitted {
                    report,
                    upload_error: Some(err),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryOfflineStore;
    use crate::transport::UploadReceipt;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Flaky {
        fail: bool,
    }

    impl Uploader for Flaky {
        fn upload(&self, payload: &UploadPayload) -> Result<UploadReceipt, PipelineError> {
            if self.fail {
                return Err(PipelineError::UploadTimeout(Duration::from_millis(10)));
            }
            Ok(UploadReceipt {
                id: Some(format!("srv-{}", payload.report_id)),
                url: None,
            })
        }
    }

    fn shared() -> SharedStore {
        Mutex::new(Box::new(InMemoryOfflineStore::new()))
    }

    /// Asserts the store lock is free while the upload runs.
    struct UnlockedStoreCheck<'a>(&'a SharedStore);

    impl Uploader for UnlockedStoreCheck<'_> {
        fn upload(&self, _payload: &UploadPayload) -> Result<UploadReceipt, PipelineError> {
            assert!(self.0.try_lock().is_ok(), "store locked during upload");
            Ok(UploadReceipt::default())
        }
    }

    fn draft() -> ReportDraft {
        ReportDraft {
            class_id: 2,
            hazard_type: "pothole".to_string(),
            detection_count: 1,
            avg_confidence: 0.8,
            location: None,
            boxes: Vec::new(),
            image: None,
            created_at_ms: 0,
        }
    }

    #[test]
    fn uploaded_report_is_marked_synced() {
        let store = shared();
        let uploader = Flaky { fail: false };
        let submitted = OfflineFirstSink::new(&store, Some(&uploader))
            .submit(draft())
            .unwrap();
        assert!(!submitted.report.stored_offline);
        assert_eq!(
            submitted.report.server_result.as_ref().and_then(|r| r.remote_ref()),
            Some("srv-1")
        );
        assert!(store.lock().unwrap().list_unsynced(10).unwrap().is_empty());
    }

    #[test]
    fn failed_upload_keeps_report_offline() {
        let store = shared();
        let uploader = Flaky { fail: true };
        let submitted = OfflineFirstSink::new(&store, Some(&uploader))
            .submit(draft())
            .unwrap();
        assert!(submitted.report.stored_offline);
        assert_eq!(
            submitted.upload_error.map(|e| e.code()),
            Some("UPLOAD_TIMEOUT")
        );
        let pending = store.lock().unwrap().list_unsynced(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sync_attempts, 1);
    }

    #[test]
    fn without_uploader_report_stays_offline() {
        let store = shared();
        let submitted = OfflineFirstSink::new(&store, None)
            .submit(draft())
            .unwrap();
        assert!(submitted.report.stored_offline);
        assert!(submitted.upload_error.is_none());
        assert_eq!(store.lock().unwrap().count().unwrap(), 1);
    }

    #[test]
    fn store_lock_is_released_during_upload() {
        let store = shared();
        let uploader = UnlockedStoreCheck(&store);
        let submitted = OfflineFirstSink::new(&store, Some(&uploader))
            .submit(draft())
            .unwrap();
        assert!(!submitted.report.stored_offline);
    }
}
