//! Transaction storage collaborator.

use std::sync::Arc;

use serde::Serialize;

use crate::diff::RebalanceTransaction;
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

/// All transactions computed for one accepted request, written as one bulk call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransactionBatch {
    pub user_id: String,
    /// Fingerprint of the target allocation that produced this batch.
    pub request: Fingerprint,
    pub transactions: Vec<RebalanceTransaction>,
}

impl TransactionBatch {
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Stable id for a transaction within this batch: `<user>-<request short>-<asset>`.
    ///
    /// Stores that honour it turn a retried batch into an overwrite.
    pub fn document_id(&self, tx: &RebalanceTransaction) -> String {
        format!("{}-{}-{}", self.user_id, self.request.short(), tx.asset)
    }
}

/// Durable sink for computed transactions.
pub trait TransactionStore: Send + Sync {
    /// Persist the whole batch. Any rejected document fails the call
    /// (`StoreError::Partial`); the caller never sees per-document results.
    fn bulk_save(&self, batch: &TransactionBatch) -> Result<(), StoreError>;
}

impl<T: TransactionStore + ?Sized> TransactionStore for Arc<T> {
    fn bulk_save(&self, batch: &TransactionBatch) -> Result<(), StoreError> {
        (**self).bulk_save(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::Allocation;
    use crate::diff::diff;
    use crate::fingerprint::fingerprint;

    #[test]
    fn document_ids_are_stable_and_distinct() {
        let target = Allocation::from([("stocks", 60.0), ("bonds", 40.0)]);
        let current = Allocation::from([("stocks", 50.0), ("bonds", 50.0)]);
        let batch = TransactionBatch {
            user_id: "u1".into(),
            request: fingerprint(&target),
            transactions: diff(&target, &current, "u1"),
        };

        let ids: Vec<String> = batch
            .transactions
            .iter()
            .map(|t| batch.document_id(t))
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(ids[0].starts_with("u1-"));
        assert!(ids[0].ends_with("-bonds"));
        assert_eq!(ids[0], batch.document_id(&batch.transactions[0]));
    }
}
