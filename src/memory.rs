//! In-memory stores with failure injection and call recording.
//!
//! Backs the `memory` storage backend and the pipeline tests.
//!
//! ```
//! use folio::memory::MemoryTransactionStore;
//! use folio::StoreError;
//!
//! let store = MemoryTransactionStore::new();
//! store.fail_next(4, StoreError::Transient("es_rejected_execution_exception".into()));
//! assert_eq!(store.calls(), 0);
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use rustc_hash::FxHashMap;

use crate::diff::RebalanceTransaction;
use crate::error::StoreError;
use crate::ledger::{LedgerStore, RebalanceRequestRecord, RequestStatus};
use crate::store::{TransactionBatch, TransactionStore};

/// Ledger records keyed by user id.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    records: Mutex<FxHashMap<String, RebalanceRequestRecord>>,
    put_failure: Mutex<Option<StoreError>>,
    get_failure: Mutex<Option<StoreError>>,
    puts: Mutex<usize>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` fail with `err` until cleared.
    pub fn fail_puts(&self, err: Option<StoreError>) {
        *self.put_failure.lock().unwrap_or_else(PoisonError::into_inner) = err;
    }

    /// Make every `get` fail with `err` until cleared.
    pub fn fail_gets(&self, err: Option<StoreError>) {
        *self.get_failure.lock().unwrap_or_else(PoisonError::into_inner) = err;
    }

    /// Number of successful `put` calls.
    pub fn puts(&self) -> usize {
        *self.puts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn get(&self, user_id: &str) -> Result<Option<RebalanceRequestRecord>, StoreError> {
        if let Some(err) = self
            .get_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(err);
        }
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned())
    }

    fn put(&self, record: &RebalanceRequestRecord) -> Result<(), StoreError> {
        if let Some(err) = self
            .put_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(err);
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.user_id.clone(), record.clone());
        *self.puts.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<RebalanceRequestRecord>, StoreError> {
        let mut out: Vec<RebalanceRequestRecord> = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(out)
    }
}

/// Scripted outcome for upcoming `bulk_save` calls.
#[derive(Debug, Default)]
struct Script {
    queued: VecDeque<StoreError>,
    always: Option<StoreError>,
}

/// Transaction documents keyed by [`TransactionBatch::document_id`].
#[derive(Debug, Default)]
pub struct MemoryTransactionStore {
    documents: Mutex<FxHashMap<String, RebalanceTransaction>>,
    batches: Mutex<Vec<TransactionBatch>>,
    script: Mutex<Script>,
    calls: Mutex<usize>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with `err`, then behave normally.
    pub fn fail_next(&self, n: usize, err: StoreError) {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        script.queued.extend(std::iter::repeat_n(err, n));
    }

    /// Fail every call with `err` (after any queued failures) until cleared.
    pub fn fail_always(&self, err: Option<StoreError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .always = err;
    }

    /// Total `bulk_save` invocations, failed ones included.
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Batches that were accepted, in order.
    pub fn batches(&self) -> Vec<TransactionBatch> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Distinct stored documents, sorted by document id.
    pub fn documents(&self) -> Vec<(String, RebalanceTransaction)> {
        let mut docs: Vec<_> = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        docs
    }
}

impl TransactionStore for MemoryTransactionStore {
    fn bulk_save(&self, batch: &TransactionBatch) -> Result<(), StoreError> {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;

        {
            let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = script.queued.pop_front() {
                return Err(err);
            }
            if let Some(err) = script.always.clone() {
                return Err(err);
            }
        }

        let mut docs = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        for tx in &batch.transactions {
            docs.insert(batch.document_id(tx), tx.clone());
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::Allocation;
    use crate::diff::diff;
    use crate::fingerprint::fingerprint;

    fn batch() -> TransactionBatch {
        let target = Allocation::from([("stocks", 70.0), ("bonds", 30.0)]);
        let current = Allocation::from([("stocks", 60.0), ("bonds", 40.0)]);
        TransactionBatch {
            user_id: "u1".into(),
            request: fingerprint(&target),
            transactions: diff(&target, &current, "u1"),
        }
    }

    #[test]
    fn scripted_failures_then_success() {
        let store = MemoryTransactionStore::new();
        store.fail_next(2, StoreError::Transient("timeout".into()));

        assert!(store.bulk_save(&batch()).is_err());
        assert!(store.bulk_save(&batch()).is_err());
        assert!(store.bulk_save(&batch()).is_ok());
        assert_eq!(store.calls(), 3);
        assert_eq!(store.batches().len(), 1);
    }

    #[test]
    fn rewriting_a_batch_does_not_duplicate_documents() {
        let store = MemoryTransactionStore::new();
        store.bulk_save(&batch()).unwrap();
        store.bulk_save(&batch()).unwrap();
        assert_eq!(store.batches().len(), 2);
        assert_eq!(store.documents().len(), 2);
    }

    #[test]
    fn fail_always_until_cleared() {
        let store = MemoryTransactionStore::new();
        store.fail_always(Some(StoreError::Fatal("read-only index".into())));
        assert!(store.bulk_save(&batch()).is_err());
        store.fail_always(None);
        assert!(store.bulk_save(&batch()).is_ok());
    }

    #[test]
    fn ledger_put_failure() {
        let store = MemoryLedgerStore::new();
        store.fail_puts(Some(StoreError::Fatal("down".into())));
        let record = RebalanceRequestRecord {
            user_id: "u1".into(),
            fingerprint: batch().request,
            status: RequestStatus::Pending,
        };
        assert!(store.put(&record).is_err());
        assert!(store.is_empty());
        assert_eq!(store.puts(), 0);
    }
}
