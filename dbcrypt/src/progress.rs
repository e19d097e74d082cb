//! Progress reporting for batch jobs.

use crate::error::ErrorKind;
use crate::record::RecordId;

/// Observer notified while a batch job runs.
///
/// All methods default to no-ops; a CLI implements them to draw progress.
pub trait Progress {
    /// The job found `total` records to visit.
    fn start(&mut self, _total: u64) {}

    /// `count` more records were visited.
    fn advance(&mut self, _count: u64) {}

    /// One record failed with the given kind.
    fn record_failed(&mut self, _record_id: RecordId, _kind: ErrorKind) {}

    /// The job finished.
    fn finish(&mut self) {}
}

/// Progress observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl Progress for Silent {}
