//! File-backed stores.
//!
//! - [`FileLedgerStore`]: the whole ledger as one JSON array, rewritten through a
//!   temp file and rename on every `put`
//! - [`FileTransactionStore`]: append-only JSONL log, one line per transaction
//!   document. A retried batch appends the same document ids again; readers keep
//!   the last line per id.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use folio::{
    Fingerprint, LedgerStore, RebalanceRequestRecord, RebalanceTransaction, RequestStatus,
    StoreError, TransactionBatch, TransactionStore,
};
use log::{debug, warn};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::excerpt;

/// Map an I/O failure to a store error. Permission and path problems will not
/// fix themselves; everything else (disk full, interrupted) may.
fn io_error(path: &Path, e: io::Error) -> StoreError {
    let msg = format!("{}: {e}", path.display());
    match e.kind() {
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::NotFound
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::InvalidData => StoreError::Fatal(msg),
        _ => StoreError::Transient(msg),
    }
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            fs::create_dir_all(dir).map_err(|e| io_error(dir, e))
        }
        _ => Ok(()),
    }
}

/// True when the file is empty or its last byte is `\n`.
fn ends_with_newline(file: &mut fs::File, len: u64) -> io::Result<bool> {
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

// ============================================================================
// Ledger
// ============================================================================

/// Ledger kept in memory and mirrored to a JSON file.
#[derive(Debug)]
pub struct FileLedgerStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, RebalanceRequestRecord>>,
}

impl FileLedgerStore {
    /// Load the ledger at `path`, or start empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        ensure_parent(&path)?;

        let records = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => {
                let list: Vec<RebalanceRequestRecord> =
                    serde_json::from_str(&text).map_err(|e| {
                        StoreError::Fatal(format!("corrupt ledger {}: {e}", path.display()))
                    })?;
                list.into_iter().map(|r| (r.user_id.clone(), r)).collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(io_error(&path, e)),
        };

        debug!("ledger {} opened with {} records", path.display(), records.len());
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(
        &self,
        records: &BTreeMap<String, RebalanceRequestRecord>,
    ) -> Result<(), StoreError> {
        let list: Vec<&RebalanceRequestRecord> = records.values().collect();
        let json = serde_json::to_string_pretty(&list)
            .map_err(|e| StoreError::Fatal(format!("ledger encode: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))
    }
}

impl LedgerStore for FileLedgerStore {
    fn get(&self, user_id: &str) -> Result<Option<RebalanceRequestRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned())
    }

    fn put(&self, record: &RebalanceRequestRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = records.insert(record.user_id.clone(), record.clone());

        if let Err(e) = self.persist(&records) {
            // keep memory consistent with disk
            match previous {
                Some(prev) => records.insert(record.user_id.clone(), prev),
                None => records.remove(&record.user_id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<RebalanceRequestRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// One line of the transaction log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredTransaction {
    #[serde(rename = "_id")]
    pub id: String,
    pub request: Fingerprint,
    #[serde(flatten)]
    pub transaction: RebalanceTransaction,
}

/// Append-only JSONL transaction log.
#[derive(Debug)]
pub struct FileTransactionStore {
    path: PathBuf,
    // serializes appends from concurrent workers
    write_lock: Mutex<()>,
}

impl FileTransactionStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        ensure_parent(&path)?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every line in the log, in append order. Unparseable lines are skipped.
    pub fn entries(&self) -> Result<Vec<StoredTransaction>, StoreError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.path, e)),
        };

        let mut out = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| io_error(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredTransaction>(&line) {
                Ok(entry) => out.push(entry),
                Err(e) => warn!(
                    "{}:{}: skipping unreadable entry: {e} ({})",
                    self.path.display(),
                    n + 1,
                    excerpt(&line)
                ),
            }
        }
        Ok(out)
    }

    /// Distinct documents (last write per id wins), sorted by id.
    pub fn documents(&self) -> Result<Vec<StoredTransaction>, StoreError> {
        let mut latest: FxHashMap<String, StoredTransaction> = FxHashMap::default();
        for entry in self.entries()? {
            latest.insert(entry.id.clone(), entry);
        }
        let mut docs: Vec<StoredTransaction> = latest.into_values().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }
}

impl TransactionStore for FileTransactionStore {
    fn bulk_save(&self, batch: &TransactionBatch) -> Result<(), StoreError> {
        let mut buf = String::new();
        for tx in &batch.transactions {
            let entry = StoredTransaction {
                id: batch.document_id(tx),
                request: batch.request.clone(),
                transaction: tx.clone(),
            };
            let line = serde_json::to_string(&entry)
                .map_err(|e| StoreError::Fatal(format!("transaction encode: {e}")))?;
            buf.push_str(&line);
            buf.push('\n');
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_error(&self.path, e))?;
        let prev_len = file.metadata().map_err(|e| io_error(&self.path, e))?.len();

        // a torn tail from an earlier crash must not swallow our first line
        if !ends_with_newline(&mut file, prev_len).map_err(|e| io_error(&self.path, e))? {
            warn!("{}: last line is incomplete, starting a new one", self.path.display());
            buf.insert(0, '\n');
        }

        if let Err(e) = file.write_all(buf.as_bytes()).and_then(|()| file.sync_data()) {
            // drop whatever part of the batch made it to disk
            if let Err(trunc) = file.set_len(prev_len) {
                warn!(
                    "{}: could not roll back partial append: {trunc}",
                    self.path.display()
                );
            }
            return Err(io_error(&self.path, e));
        }

        debug!(
            "appended {} transactions for {} to {}",
            batch.len(),
            batch.user_id,
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio::{Allocation, diff, fingerprint};

    fn record(user: &str, status: RequestStatus) -> RebalanceRequestRecord {
        RebalanceRequestRecord {
            user_id: user.into(),
            fingerprint: fingerprint(&Allocation::from([("stocks", 60.0)])),
            status,
        }
    }

    fn batch() -> TransactionBatch {
        let target = Allocation::from([("stocks", 60.0), ("bonds", 40.0)]);
        let current = Allocation::from([("stocks", 50.0), ("bonds", 50.0)]);
        TransactionBatch {
            user_id: "u1".into(),
            request: fingerprint(&target),
            transactions: diff(&target, &current, "u1"),
        }
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let store = FileLedgerStore::open(&path).unwrap();
        assert!(store.get("u1").unwrap().is_none());
        store.put(&record("u1", RequestStatus::Pending)).unwrap();
        store.put(&record("u2", RequestStatus::Failed)).unwrap();
        drop(store);

        let reopened = FileLedgerStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("u1").unwrap(),
            Some(record("u1", RequestStatus::Pending))
        );
        let failed = reopened.list_by_status(RequestStatus::Failed).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].user_id, "u2");
    }

    #[test]
    fn ledger_file_uses_allocation_hash_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        FileLedgerStore::open(&path)
            .unwrap()
            .put(&record("u1", RequestStatus::Completed))
            .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"allocation_hash\""));
        assert!(text.contains("\"COMPLETED\""));
    }

    #[test]
    fn corrupt_ledger_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        fs::write(&path, "{not json").unwrap();

        let err = FileLedgerStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_)));
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/ledger.json");
        let store = FileLedgerStore::open(&path).unwrap();
        store.put(&record("u1", RequestStatus::Pending)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn retried_batch_appends_but_does_not_duplicate_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTransactionStore::open(dir.path().join("tx.jsonl")).unwrap();

        store.bulk_save(&batch()).unwrap();
        store.bulk_save(&batch()).unwrap();

        assert_eq!(store.entries().unwrap().len(), 4);
        let docs = store.documents().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].transaction.asset, "bonds");
        assert_eq!(docs[1].transaction.asset, "stocks");
        assert_eq!(docs[0].request, batch().request);
    }

    #[test]
    fn log_lines_carry_rebalance_percent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.jsonl");
        FileTransactionStore::open(&path)
            .unwrap()
            .bulk_save(&batch())
            .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["asset"], "bonds");
        assert_eq!(first["action"], "SELL");
        assert_eq!(first["rebalance_percent"], 10.0);
        assert_eq!(first["user_id"], "u1");
    }

    #[test]
    fn unreadable_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.jsonl");
        let store = FileTransactionStore::open(&path).unwrap();
        store.bulk_save(&batch()).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "garbage").unwrap();

        assert_eq!(store.entries().unwrap().len(), 2);
    }

    #[test]
    fn torn_final_line_does_not_swallow_next_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.jsonl");
        fs::write(&path, r#"{"_id":"u1-abc","request":"#).unwrap();

        let store = FileTransactionStore::open(&path).unwrap();
        store.bulk_save(&batch()).unwrap();

        let docs = store.documents().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].transaction.asset, "bonds");
        assert_eq!(docs[1].transaction.asset, "stocks");
        assert!(fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn complete_log_gets_no_extra_blank_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.jsonl");
        let store = FileTransactionStore::open(&path).unwrap();
        store.bulk_save(&batch()).unwrap();
        store.bulk_save(&batch()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(text.lines().all(|l| !l.trim().is_empty()));
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTransactionStore::open(dir.path().join("none.jsonl")).unwrap();
        assert!(store.entries().unwrap().is_empty());
    }
}
