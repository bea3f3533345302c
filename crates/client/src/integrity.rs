use crate::error::Result;
use crate::store::TaskStore;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result of one integrity sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub checked: usize,
    pub missing: usize,
}

/// Background check that files the store believes are downloaded still
/// exist on disk. Existence checks only, no content access.
///
/// At most one sweep runs at a time; a trigger arriving while one is in
/// flight is dropped, not queued.
pub struct IntegrityChecker {
    store: Arc<TaskStore>,
    in_flight: AtomicBool,
}

impl IntegrityChecker {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self {
            store,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Sweep all downloaded records. Returns `None` when another sweep is
    /// already active.
    pub fn sweep(&self) -> Result<Option<SweepReport>> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("Integrity sweep already in flight, dropping trigger");
            return Ok(None);
        }
        let outcome = self.run_sweep();
        self.in_flight.store(false, Ordering::SeqCst);
        outcome.map(Some)
    }

    fn run_sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for record in self.store.list_all()? {
            if !record.is_downloaded {
                continue;
            }
            report.checked += 1;

            let missing = match &record.local_output_path {
                Some(path) => !path.exists(),
                // Marked downloaded with no path recorded: treat as missing.
                None => true,
            };

            if missing {
                report.missing += 1;
                warn!(
                    "Task {}: downloaded file missing on disk, clearing download state",
                    record.local_id
                );
                if let Err(e) = self.store.clear_download_state(&record.current_task_id) {
                    warn!(
                        "Task {}: failed to clear download state: {}",
                        record.local_id, e
                    );
                }
            }
        }

        info!(
            "Integrity sweep complete: {} checked, {} missing",
            report.checked, report.missing
        );
        Ok(report)
    }
}
