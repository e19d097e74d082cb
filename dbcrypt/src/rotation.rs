//! Re-encryption of stored attribute records.
//!
//! Every matching record is decrypted with a source engine and re-encrypted
//! with a target engine, which refreshes both the IV and the hash index.
//! Passing the same engine twice re-encrypts under the current key; passing
//! an engine built from the previous key as source moves records to a new
//! key.
//!
//! Each record is rotated independently. A failure is counted and the run
//! moves on, so an interrupted run can simply be started again over the full
//! set. With distinct keys, a record the source key cannot open (or opens to
//! a value that disagrees with its hash index) is tried with the target key;
//! if that succeeds it was rotated by an earlier run and is refreshed in
//! place instead of failing.

use crate::cipher::CipherEngine;
use crate::error::{Error, ErrorKind, Result};
use crate::progress::Progress;
use crate::record::{AttributeRecord, RecordId};
use crate::store::{AttributeStore, Scan, ScanFilter, DEFAULT_BATCH_SIZE};
use secrecy::ExposeSecret;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// A record that could not be rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFailure {
    /// Surrogate id of the record.
    pub record_id: RecordId,
    /// What went wrong.
    pub kind: ErrorKind,
}

/// Outcome of a rotation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Records matching the filter when the run started.
    pub total: u64,
    /// Records rotated (or, in a dry run, that would have been).
    pub processed: u64,
    /// Processed records that were already under the target key.
    pub already_rotated: u64,
    /// Records that failed.
    pub failures: Vec<RecordFailure>,
    /// Whether the run was a dry run.
    pub dry_run: bool,
}

impl RotationReport {
    /// Returns the number of failed records.
    #[must_use]
    pub fn errors(&self) -> usize {
        self.failures.len()
    }

    /// Returns true if no record failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Key rotation job.
///
/// # Example
///
/// ```
/// use dbcrypt::cipher::CipherEngine;
/// use dbcrypt::progress::Silent;
/// use dbcrypt::record::PrimaryKeyFormat;
/// use dbcrypt::rotation::KeyRotation;
/// use dbcrypt::store::MemoryStore;
///
/// let old_key = CipherEngine::new("old-key");
/// let new_key = CipherEngine::new("new-key");
/// let store = MemoryStore::new(PrimaryKeyFormat::Int);
///
/// let report = KeyRotation::new()
///     .batch_size(50)
///     .run(&old_key, &new_key, &store, &mut Silent)
///     .unwrap();
/// assert!(report.is_success());
/// ```
#[derive(Debug, Clone)]
pub struct KeyRotation {
    filter: ScanFilter,
    batch_size: usize,
    dry_run: bool,
}

impl Default for KeyRotation {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRotation {
    /// Creates a job over every record with the default batch size.
    #[must_use]
    pub fn new() -> Self {
        Self { filter: ScanFilter::all(), batch_size: DEFAULT_BATCH_SIZE, dry_run: false }
    }

    /// Restricts the job to matching records.
    #[must_use]
    pub fn filter(mut self, filter: ScanFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the number of records loaded per batch.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Decrypts every record but writes nothing.
    #[must_use]
    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Runs the job.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingKey` before touching the store if either engine
    /// has no key, and `Error::Store` if counting or paging fails. Per-record
    /// failures are reported in [`RotationReport::failures`] instead.
    pub fn run<S: AttributeStore + ?Sized>(
        &self,
        source: &CipherEngine,
        target: &CipherEngine,
        store: &S,
        progress: &mut dyn Progress,
    ) -> Result<RotationReport> {
        let distinct = {
            let source_key = source.derive_key(None)?;
            let target_key = target.derive_key(None)?;
            !bool::from(
                source_key.expose_secret().as_bytes().ct_eq(target_key.expose_secret().as_bytes()),
            )
        };

        let mut report = RotationReport { dry_run: self.dry_run, ..RotationReport::default() };
        report.total = store.count(&self.filter)?;

        if report.total == 0 {
            info!(filter = ?self.filter, "no encrypted attributes to re-encrypt");
            return Ok(report);
        }
        info!(total = report.total, dry_run = self.dry_run, "re-encryption started");
        progress.start(report.total);

        for batch in Scan::new(store, self.filter.clone(), self.batch_size) {
            let batch = batch?;
            for record in &batch {
                match self.rotate(source, target, distinct, store, record) {
                    Ok(Origin::Source) => report.processed += 1,
                    Ok(Origin::Target) => {
                        report.processed += 1;
                        report.already_rotated += 1;
                    }
                    Err(err) => {
                        warn!(record_id = record.id, kind = %err.kind(), "re-encryption failed");
                        progress.record_failed(record.id, err.kind());
                        report
                            .failures
                            .push(RecordFailure { record_id: record.id, kind: err.kind() });
                    }
                }
            }
            progress.advance(batch.len() as u64);
        }

        progress.finish();
        info!(
            processed = report.processed,
            already_rotated = report.already_rotated,
            errors = report.errors(),
            dry_run = self.dry_run,
            "re-encryption finished"
        );
        Ok(report)
    }

    fn rotate<S: AttributeStore + ?Sized>(
        &self,
        source: &CipherEngine,
        target: &CipherEngine,
        distinct: bool,
        store: &S,
        record: &AttributeRecord,
    ) -> Result<Origin> {
        let (plaintext, origin) = open(source, target, distinct, record)?;
        if self.dry_run {
            return Ok(origin);
        }
        let envelope = target.encrypt(Some(plaintext.as_str()), None)?;
        let hash = CipherEngine::hash(&plaintext);
        store.update_payload(record.id, &hash, &envelope)?;
        Ok(origin)
    }
}

/// Key a record's envelope was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Source,
    Target,
}

/// Decrypts a record with the source key, falling back to the target key
/// when the keys differ.
fn open(
    source: &CipherEngine,
    target: &CipherEngine,
    distinct: bool,
    record: &AttributeRecord,
) -> Result<(Zeroizing<String>, Origin)> {
    let envelope = record.encrypted_value.as_deref();
    let first = source.decrypt(envelope, None).map(Zeroizing::new);
    if !distinct {
        return first.map(|plaintext| (plaintext, Origin::Source));
    }

    match first {
        Ok(plaintext) if matches_index(record, &plaintext) => Ok((plaintext, Origin::Source)),
        Ok(_) | Err(Error::CipherFailure(_)) => {
            let plaintext = Zeroizing::new(target.decrypt(envelope, None)?);
            if !matches_index(record, &plaintext) {
                return Err(Error::CipherFailure("plaintext does not match the hash index"));
            }
            debug!(record_id = record.id, "record already under the target key");
            Ok((plaintext, Origin::Target))
        }
        Err(err) => Err(err),
    }
}

/// A record without a hash index accepts any plaintext.
fn matches_index(record: &AttributeRecord, plaintext: &str) -> bool {
    record.hash_index.as_deref().map_or(true, |hash| {
        bool::from(hash.as_bytes().ct_eq(CipherEngine::hash(plaintext).as_bytes()))
    })
}
