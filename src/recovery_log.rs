use log::{debug, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::errors::{MontageError, Result};
use crate::types::{Decision, NodeId, ParticipantResources, ResourceId, TransactionId};

const RECORD_EXTENSION: &str = "rec";
const TEMP_EXTENSION: &str = "rec.tmp";

/// A record kept in a [`RecoveryLog`], one per in-flight transaction.
pub trait LogRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn transaction(&self) -> &TransactionId;
}

/// Durable "last known state" of in-flight transactions.
///
/// Every transaction owns at most one record, and persisting a record fully
/// replaces the previous one for the same transaction. There is no history.
/// The log is only read back when a node restarts.
///
/// Implementations must be `Send` and `Sync`; engines share one log across
/// all of their transaction threads.
pub trait RecoveryLog<R: LogRecord>: Send + Sync {
    /// Stores `record`, replacing any previous record for the same transaction.
    ///
    /// Returns only once the record is on stable storage. Callers rely on this
    /// to order "log, then act".
    fn persist(&self, record: &R) -> Result<()>;

    fn load(&self, transaction: &TransactionId) -> Result<Option<R>>;

    /// Every stored record, ordered by transaction id.
    fn load_all(&self) -> Result<Vec<R>>;

    /// Drops the record for `transaction`. Removing a missing record is not an error.
    fn remove(&self, transaction: &TransactionId) -> Result<()>;
}

/// Coordinator-side snapshot of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorRecord {
    pub transaction: TransactionId,
    /// Before votes are counted this holds the presumed outcome, `Abort`.
    pub decision: Decision,
    pub participants: ParticipantResources,
    pub ack_set: BTreeSet<NodeId>,
    pub payload: Vec<u8>,
}

impl LogRecord for CoordinatorRecord {
    fn transaction(&self) -> &TransactionId {
        &self.transaction
    }
}

/// Last protocol step a participant recorded for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantPhase {
    /// Voted commit; outcome not yet known.
    Prepared,
    /// Outcome known; finalize/unlock and ack may not have completed.
    Decided,
}

/// Participant-side intent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub transaction: TransactionId,
    /// The vote while `Prepared`, the final decision once `Decided`.
    pub decision: Decision,
    pub resources: Vec<ResourceId>,
    pub phase: ParticipantPhase,
}

impl LogRecord for ParticipantRecord {
    fn transaction(&self) -> &TransactionId {
        &self.transaction
    }
}

/// A [`RecoveryLog`] that keeps one file per transaction in a directory.
///
/// Records are written to a temporary file, synced, and renamed over the
/// previous record, so a crash mid-write leaves either the old or the new
/// record, never a torn one.
pub struct FileLog<R> {
    dir: PathBuf,
    _record: PhantomData<fn() -> R>,
}

impl<R: LogRecord> FileLog<R> {
    /// Opens (and creates if needed) a log in `dir`. Leftover temporary files
    /// from an interrupted write are discarded.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if has_suffix(&path, TEMP_EXTENSION) {
                debug!("Discarding interrupted log write {}", path.display());
                let _ = fs::remove_file(&path);
            }
        }
        Ok(Self {
            dir,
            _record: PhantomData,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, transaction: &TransactionId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", encode_name(transaction), RECORD_EXTENSION))
    }

    fn temp_path(&self, transaction: &TransactionId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", encode_name(transaction), TEMP_EXTENSION))
    }

    fn read_record(path: &Path) -> Result<R> {
        let bytes = fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn sync_dir(&self) -> Result<()> {
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

impl<R: LogRecord> RecoveryLog<R> for FileLog<R> {
    fn persist(&self, record: &R) -> Result<()> {
        let bytes = bincode::serialize(record)?;
        let temp = self.temp_path(record.transaction());
        {
            let mut file = File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.record_path(record.transaction()))?;
        self.sync_dir()
    }

    fn load(&self, transaction: &TransactionId) -> Result<Option<R>> {
        let path = self.record_path(transaction);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    fn load_all(&self) -> Result<Vec<R>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !has_suffix(&path, RECORD_EXTENSION) || has_suffix(&path, TEMP_EXTENSION) {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable log record {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.transaction().cmp(b.transaction()));
        Ok(records)
    }

    fn remove(&self, transaction: &TransactionId) -> Result<()> {
        match fs::remove_file(self.record_path(transaction)) {
            Ok(()) => self.sync_dir(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(&format!(".{}", suffix)))
}

// Transaction ids are arbitrary strings; hex keeps them filesystem-safe.
fn encode_name(transaction: &TransactionId) -> String {
    transaction
        .as_str()
        .bytes()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// An in-memory [`RecoveryLog`].
///
/// Clones share the same records, so a node rebuilt from a clone observes
/// exactly what its predecessor persisted, the way a restarted process would
/// observe its disk. Persists can be made to fail to inject crashes at the
/// logging step.
pub struct MemoryLog<R> {
    records: Arc<Mutex<BTreeMap<TransactionId, R>>>,
    fail_persists: Arc<AtomicBool>,
    persists: Arc<AtomicU64>,
}

impl<R> Clone for MemoryLog<R> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            fail_persists: Arc::clone(&self.fail_persists),
            persists: Arc::clone(&self.persists),
        }
    }
}

impl<R> Default for MemoryLog<R> {
    fn default() -> Self {
        Self {
            records: Arc::new(Mutex::new(BTreeMap::new())),
            fail_persists: Arc::new(AtomicBool::new(false)),
            persists: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<R: LogRecord> MemoryLog<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `persist` fail until switched back.
    pub fn fail_persists(&self, fail: bool) {
        self.fail_persists.store(fail, Ordering::SeqCst);
    }

    /// Number of successful persists so far.
    pub fn persist_count(&self) -> u64 {
        self.persists.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl<R: LogRecord> RecoveryLog<R> for MemoryLog<R> {
    fn persist(&self, record: &R) -> Result<()> {
        if self.fail_persists.load(Ordering::SeqCst) {
            return Err(MontageError::Storage(format!(
                "injected persist failure for {}",
                record.transaction()
            )));
        }
        self.records
            .lock()
            .insert(record.transaction().clone(), record.clone());
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, transaction: &TransactionId) -> Result<Option<R>> {
        Ok(self.records.lock().get(transaction).cloned())
    }

    fn load_all(&self) -> Result<Vec<R>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn remove(&self, transaction: &TransactionId) -> Result<()> {
        self.records.lock().remove(transaction);
        Ok(())
    }
}
