//! Per-user record of the last allocation change accepted for processing.
//!
//! The ledger is the idempotency gate of the pipeline: an event whose
//! fingerprint equals the recorded one has already been accepted and is skipped.
//! It only guards against byte-identical redelivery, not against two different
//! in-flight events for one user racing (the pipeline's user locks cover that).

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

/// Processing state of the last accepted request.
///
/// Reads leniently: records written without a status (`""` or absent) and any
/// unrecognized value come back as `Pending`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    /// Accepted; transactions not yet confirmed stored.
    #[default]
    Pending,
    /// Transactions stored (or there were none to store).
    Completed,
    /// The transaction write gave up. Needs manual reconciliation.
    Failed,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "PENDING"),
            RequestStatus::Completed => write!(f, "COMPLETED"),
            RequestStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl<'de> Deserialize<'de> for RequestStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(match raw.as_str() {
            "COMPLETED" => RequestStatus::Completed,
            "FAILED" => RequestStatus::Failed,
            "PENDING" | "" => RequestStatus::Pending,
            other => {
                warn!("unrecognized request status {other:?}, reading as PENDING");
                RequestStatus::Pending
            }
        })
    }
}

/// One logical record per user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceRequestRecord {
    pub user_id: String,
    #[serde(rename = "allocation_hash")]
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub status: RequestStatus,
}

/// Storage collaborator backing the ledger.
pub trait LedgerStore: Send + Sync {
    /// Fetch the record for `user_id`. `Ok(None)` means no request seen yet.
    fn get(&self, user_id: &str) -> Result<Option<RebalanceRequestRecord>, StoreError>;

    /// Insert or replace the record for `record.user_id`.
    fn put(&self, record: &RebalanceRequestRecord) -> Result<(), StoreError>;

    /// All records currently in `status`, sorted by user id.
    fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<RebalanceRequestRecord>, StoreError>;
}

impl<T: LedgerStore + ?Sized> LedgerStore for Arc<T> {
    fn get(&self, user_id: &str) -> Result<Option<RebalanceRequestRecord>, StoreError> {
        (**self).get(user_id)
    }

    fn put(&self, record: &RebalanceRequestRecord) -> Result<(), StoreError> {
        (**self).put(record)
    }

    fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<RebalanceRequestRecord>, StoreError> {
        (**self).list_by_status(status)
    }
}

/// Ledger operations on top of a [`LedgerStore`].
pub struct RebalanceRequestLedger<L> {
    store: L,
}

impl<L: LedgerStore> RebalanceRequestLedger<L> {
    pub fn new(store: L) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &L {
        &self.store
    }

    /// Fingerprint of the last accepted request, `None` for a first-time user.
    pub fn last_fingerprint(&self, user_id: &str) -> Result<Option<Fingerprint>, StoreError> {
        Ok(self.store.get(user_id)?.map(|r| r.fingerprint))
    }

    /// Record `fingerprint` as the latest accepted request (status `PENDING`).
    pub fn record_fingerprint(
        &self,
        user_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<(), StoreError> {
        self.store.put(&RebalanceRequestRecord {
            user_id: user_id.to_string(),
            fingerprint: fingerprint.clone(),
            status: RequestStatus::Pending,
        })
    }

    /// Set the outcome of the request identified by `fingerprint`.
    ///
    /// A no-op when the user's record has since moved on to another fingerprint.
    pub fn mark(
        &self,
        user_id: &str,
        fingerprint: &Fingerprint,
        status: RequestStatus,
    ) -> Result<(), StoreError> {
        match self.store.get(user_id)? {
            Some(record) if record.fingerprint == *fingerprint => {
                if record.status == status {
                    return Ok(());
                }
                self.store.put(&RebalanceRequestRecord { status, ..record })
            }
            Some(record) => {
                debug!(
                    "ledger for {user_id} moved to {}, not marking {} as {status}",
                    record.fingerprint.short(),
                    fingerprint.short()
                );
                Ok(())
            }
            None => Err(StoreError::Fatal(format!(
                "no ledger record for {user_id} while marking {status}"
            ))),
        }
    }

    /// Requests whose transaction write gave up.
    pub fn failed_requests(&self) -> Result<Vec<RebalanceRequestRecord>, StoreError> {
        self.store.list_by_status(RequestStatus::Failed)
    }
}
