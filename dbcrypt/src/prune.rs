//! Removal of attribute records whose host row no longer exists.
//!
//! Records are grouped by `object_type`. Each group's host collection is
//! checked row by row; a group whose lookup fails (typically a dropped table)
//! is skipped whole rather than deleted.

use crate::error::{ErrorKind, Result};
use crate::model::RowLookup;
use crate::progress::Progress;
use crate::record::{ObjectId, RecordId};
use crate::store::{AttributeStore, Scan, ScanFilter, DEFAULT_BATCH_SIZE};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What happened to one `object_type` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupStatus {
    /// Every record was checked.
    Checked,
    /// The host collection could not be checked; nothing was deleted.
    Skipped(String),
    /// Orphans were found but deleting them failed.
    DeleteFailed(ErrorKind),
}

/// Outcome for one `object_type` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    /// Host collection name.
    pub object_type: String,
    /// Records in the group.
    pub scanned: usize,
    /// Records whose host row is missing.
    pub orphans: Vec<RecordId>,
    /// Records actually deleted.
    pub deleted: usize,
    /// Group status.
    pub status: GroupStatus,
}

/// Outcome of a prune run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Per-group results, ordered by `object_type`.
    pub groups: Vec<GroupReport>,
    /// Whether the run was a dry run.
    pub dry_run: bool,
}

impl PruneReport {
    /// Total orphans found.
    #[must_use]
    pub fn orphans(&self) -> usize {
        self.groups.iter().map(|g| g.orphans.len()).sum()
    }

    /// Total records deleted.
    #[must_use]
    pub fn deleted(&self) -> usize {
        self.groups.iter().map(|g| g.deleted).sum()
    }

    /// Names of skipped groups.
    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .filter(|g| matches!(g.status, GroupStatus::Skipped(_)))
            .map(|g| g.object_type.as_str())
    }

    /// Returns true if no delete failed. Skipped groups are not failures.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.groups.iter().any(|g| matches!(g.status, GroupStatus::DeleteFailed(_)))
    }
}

/// Orphan pruning job.
#[derive(Debug, Clone)]
pub struct OrphanPruner {
    filter: ScanFilter,
    batch_size: usize,
    dry_run: bool,
}

impl Default for OrphanPruner {
    fn default() -> Self {
        Self::new()
    }
}

impl OrphanPruner {
    /// Creates a pruner over every record.
    #[must_use]
    pub fn new() -> Self {
        Self { filter: ScanFilter::all(), batch_size: DEFAULT_BATCH_SIZE, dry_run: false }
    }

    /// Restricts the pruner to one host collection.
    #[must_use]
    pub fn object_type(mut self, object_type: impl Into<String>) -> Self {
        self.filter = self.filter.object_type(object_type);
        self
    }

    /// Sets the number of records loaded per batch.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Reports orphans without deleting them.
    #[must_use]
    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Runs the pruner.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if reading the side table fails. Lookup and
    /// delete failures are reported per group instead.
    pub fn run<S, P>(
        &self,
        store: &S,
        rows: &P,
        progress: &mut dyn Progress,
    ) -> Result<PruneReport>
    where
        S: AttributeStore + ?Sized,
        P: RowLookup + ?Sized,
    {
        let mut groups: BTreeMap<String, Vec<(RecordId, ObjectId)>> = BTreeMap::new();
        for batch in Scan::new(store, self.filter.clone(), self.batch_size) {
            for record in batch? {
                groups.entry(record.object_type).or_default().push((record.id, record.object_id));
            }
        }

        let mut report =
            PruneReport { groups: Vec::with_capacity(groups.len()), dry_run: self.dry_run };
        if groups.is_empty() {
            info!(filter = ?self.filter, "no encrypted attributes to prune");
            return Ok(report);
        }
        progress.start(groups.values().map(|g| g.len() as u64).sum());

        for (object_type, records) in groups {
            let group = self.prune_group(store, rows, object_type, &records);
            if let GroupStatus::DeleteFailed(kind) = group.status {
                for id in &group.orphans {
                    progress.record_failed(*id, kind);
                }
            }
            progress.advance(records.len() as u64);
            report.groups.push(group);
        }

        progress.finish();
        info!(
            orphans = report.orphans(),
            deleted = report.deleted(),
            dry_run = self.dry_run,
            "prune finished"
        );
        Ok(report)
    }

    fn prune_group<S, P>(
        &self,
        store: &S,
        rows: &P,
        object_type: String,
        records: &[(RecordId, ObjectId)],
    ) -> GroupReport
    where
        S: AttributeStore + ?Sized,
        P: RowLookup + ?Sized,
    {
        let mut group = GroupReport {
            object_type,
            scanned: records.len(),
            orphans: Vec::new(),
            deleted: 0,
            status: GroupStatus::Checked,
        };

        for (record_id, object_id) in records {
            match rows.row_exists(&group.object_type, object_id) {
                Ok(true) => {}
                Ok(false) => group.orphans.push(*record_id),
                Err(err) => {
                    warn!(
                        object_type = %group.object_type,
                        error = %err,
                        "skipping group, host collection not readable"
                    );
                    group.orphans.clear();
                    group.status = GroupStatus::Skipped(err.to_string());
                    return group;
                }
            }
        }
        debug!(object_type = %group.object_type, orphans = group.orphans.len(), "group checked");

        if self.dry_run || group.orphans.is_empty() {
            return group;
        }
        match store.delete_ids(&group.orphans) {
            Ok(deleted) => group.deleted = deleted,
            Err(err) => {
                warn!(object_type = %group.object_type, error = %err, "deleting orphans failed");
                group.status = GroupStatus::DeleteFailed(ErrorKind::Store);
            }
        }
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::progress::Silent;
    use crate::record::{AttributeKey, PrimaryKeyFormat};
    use crate::store::MemoryStore;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct Rows {
        tables: BTreeMap<&'static str, BTreeSet<u64>>,
    }

    impl Rows {
        fn table(mut self, name: &'static str, ids: &[u64]) -> Self {
            self.tables.insert(name, ids.iter().copied().collect());
            self
        }
    }

    impl RowLookup for Rows {
        fn row_exists(&self, table: &str, id: &ObjectId) -> std::result::Result<bool, StoreError> {
            let rows = self
                .tables
                .get(table)
                .ok_or_else(|| StoreError::Backend(format!("no such table: {table}")))?;
            Ok(matches!(id, ObjectId::Int(n) if rows.contains(n)))
        }
    }

    fn slot(table: &str, id: u64) -> AttributeKey {
        AttributeKey::new(table, ObjectId::Int(id), "ssn")
    }

    fn store_with(entries: &[(&str, u64)]) -> MemoryStore {
        let store = MemoryStore::new(PrimaryKeyFormat::Int);
        for &(table, id) in entries {
            store
                .upsert(&slot(table, id), &"a".repeat(64), "AAAA")
                .unwrap();
        }
        store
    }

    #[test]
    fn test_prune_deletes_only_orphans() {
        let store = store_with(&[("users", 1), ("users", 2), ("users", 3), ("orders", 7)]);
        let rows = Rows::default().table("users", &[1, 3]).table("orders", &[7]);

        let report = OrphanPruner::new().run(&store, &rows, &mut Silent).unwrap();

        assert!(report.is_success());
        assert_eq!(report.orphans(), 1);
        assert_eq!(report.deleted(), 1);
        assert_eq!(store.len().unwrap(), 3);
        assert!(store.find(&slot("users", 2)).unwrap().is_none());
        assert_eq!(
            report.groups.iter().map(|g| g.object_type.as_str()).collect::<Vec<_>>(),
            vec!["orders", "users"]
        );
    }

    #[test]
    fn test_unreadable_group_is_skipped() {
        let store = store_with(&[("ghosts", 1), ("users", 1), ("users", 2)]);
        let rows = Rows::default().table("users", &[1]);

        let report = OrphanPruner::new().run(&store, &rows, &mut Silent).unwrap();

        assert_eq!(report.skipped().collect::<Vec<_>>(), vec!["ghosts"]);
        assert_eq!(report.deleted(), 1);
        assert!(report.is_success());
        assert!(store.find(&slot("ghosts", 1)).unwrap().is_some());
    }

    #[test]
    fn test_dry_run_deletes_nothing() {
        let store = store_with(&[("users", 1), ("users", 2)]);
        let rows = Rows::default().table("users", &[]);

        let report = OrphanPruner::new().dry_run(true).run(&store, &rows, &mut Silent).unwrap();

        assert!(report.dry_run);
        assert_eq!(report.orphans(), 2);
        assert_eq!(report.deleted(), 0);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_object_type_filter() {
        let store = store_with(&[("users", 1), ("orders", 1)]);
        let rows = Rows::default().table("users", &[]).table("orders", &[]);

        let report =
            OrphanPruner::new().object_type("orders").run(&store, &rows, &mut Silent).unwrap();

        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.deleted(), 1);
        assert!(store.find(&slot("users", 1)).unwrap().is_some());
    }

    #[test]
    fn test_empty_store() {
        let store = MemoryStore::new(PrimaryKeyFormat::Int);
        let report = OrphanPruner::new().run(&store, &Rows::default(), &mut Silent).unwrap();
        assert_eq!(report, PruneReport::default());
    }
}
