//! Rebalance intake pipeline: fingerprint → ledger gate → diff → persist.
//!
//! One call to [`RebalanceIntakePipeline::process`] per delivered event. Delivery
//! is at-least-once, so the pipeline makes redelivery harmless on its own:
//!
//! 1. fingerprint the new allocation
//! 2. look up the user's ledger record
//! 3. same fingerprint → `Skipped(Duplicate)`
//! 4. upsert the ledger (`PENDING`); a failure here aborts before any write
//! 5. diff new vs current allocation
//! 6. no transactions → `Applied(0)`, no storage call
//! 7. bulk-write the batch with bounded retry, then mark `COMPLETED` or `FAILED`
//!
//! Steps 2–7 run under a per-user lock.
//!
//! The ledger advances in step 4, before the write. If every attempt fails, a
//! redelivered copy of the event is skipped as a duplicate: those transactions are
//! lost until an operator replays the event ([`RebalanceIntakePipeline::replay`]).
//! The ledger status `FAILED` marks such requests.

use std::fmt;

use log::{debug, error, info, warn};

use crate::allocation::RebalanceEvent;
use crate::diff::diff;
use crate::error::PipelineError;
use crate::fingerprint::{Fingerprint, fingerprint};
use crate::ledger::{LedgerStore, RebalanceRequestLedger, RequestStatus};
use crate::locks::UserLocks;
use crate::retry::{CancelToken, RetryPolicy, Sleeper, ThreadSleeper, retry_store_write};
use crate::store::{TransactionBatch, TransactionStore};

/// Why an event was not applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The ledger already holds this exact allocation for the user.
    Duplicate,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Duplicate => write!(f, "duplicate"),
        }
    }
}

/// Result of processing one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Skipped(SkipReason),
    /// Number of transactions stored (0 when the allocations already matched).
    Applied(usize),
    Failed(PipelineError),
}

impl ProcessingOutcome {
    /// Short label for logs and audit records.
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingOutcome::Skipped(_) => "skipped",
            ProcessingOutcome::Applied(_) => "applied",
            ProcessingOutcome::Failed(_) => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ProcessingOutcome::Failed(_))
    }
}

impl fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingOutcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            ProcessingOutcome::Applied(n) => write!(f, "applied ({n} transactions)"),
            ProcessingOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// The idempotent intake pipeline over injected ledger and transaction stores.
pub struct RebalanceIntakePipeline<L, T> {
    ledger: RebalanceRequestLedger<L>,
    transactions: T,
    policy: RetryPolicy,
    sleeper: Box<dyn Sleeper>,
    cancel: CancelToken,
    locks: UserLocks,
}

impl<L: LedgerStore, T: TransactionStore> RebalanceIntakePipeline<L, T> {
    /// Pipeline with the default retry policy, thread sleeps and a fresh cancel token.
    pub fn new(ledger_store: L, transaction_store: T) -> Self {
        Self {
            ledger: RebalanceRequestLedger::new(ledger_store),
            transactions: transaction_store,
            policy: RetryPolicy::default(),
            sleeper: Box::new(ThreadSleeper),
            cancel: CancelToken::new(),
            locks: UserLocks::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    /// Share a shutdown signal with the rest of the process.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn ledger(&self) -> &RebalanceRequestLedger<L> {
        &self.ledger
    }

    pub fn transaction_store(&self) -> &T {
        &self.transactions
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Process one delivered event.
    pub fn process(&self, event: &RebalanceEvent) -> ProcessingOutcome {
        let request = fingerprint(&event.new_allocation);
        self.locks
            .with_lock(&event.user_id, || self.process_locked(event, request))
    }

    /// Operator replay: apply `event` even if the ledger already holds its
    /// fingerprint. Used to recover requests left `FAILED` by retry exhaustion.
    pub fn replay(&self, event: &RebalanceEvent) -> ProcessingOutcome {
        let request = fingerprint(&event.new_allocation);
        self.locks.with_lock(&event.user_id, || {
            warn!(
                "replaying request {} for {} without duplicate suppression",
                request.short(),
                event.user_id
            );
            if let Err(e) = self.ledger.record_fingerprint(&event.user_id, &request) {
                error!("ledger write failed for {}: {e}", event.user_id);
                return ProcessingOutcome::Failed(PipelineError::Ledger(e));
            }
            self.apply(event, request)
        })
    }

    fn process_locked(&self, event: &RebalanceEvent, request: Fingerprint) -> ProcessingOutcome {
        let user = event.user_id.as_str();

        match self.ledger.last_fingerprint(user) {
            Ok(Some(last)) if last == request => {
                info!(
                    "no allocation change for {user} (request {}), skipping",
                    request.short()
                );
                return ProcessingOutcome::Skipped(SkipReason::Duplicate);
            }
            Ok(Some(last)) => {
                debug!("{user}: ledger {} -> {}", last.short(), request.short());
            }
            Ok(None) => {
                debug!("{user}: first rebalance request {}", request.short());
            }
            Err(e) => {
                error!("ledger read failed for {user}: {e}");
                return ProcessingOutcome::Failed(PipelineError::Ledger(e));
            }
        }

        if let Err(e) = self.ledger.record_fingerprint(user, &request) {
            error!("ledger write failed for {user}, dropping request {}: {e}", request.short());
            return ProcessingOutcome::Failed(PipelineError::Ledger(e));
        }

        self.apply(event, request)
    }

    /// Steps 5–7. The ledger already records `request`.
    fn apply(&self, event: &RebalanceEvent, request: Fingerprint) -> ProcessingOutcome {
        let user = event.user_id.as_str();
        if event.is_noop() {
            info!("target allocation equals current for {user}, nothing to rebalance");
            self.settle(user, &request, RequestStatus::Completed);
            return ProcessingOutcome::Applied(0);
        }

        let transactions = diff(&event.new_allocation, &event.current_allocation, user);
        if transactions.is_empty() {
            info!("no transactions to save for {user}");
            self.settle(user, &request, RequestStatus::Completed);
            return ProcessingOutcome::Applied(0);
        }

        let batch = TransactionBatch {
            user_id: user.to_string(),
            request,
            transactions,
        };
        let count = batch.len();
        info!("saving {count} transactions for {user}");

        let written = retry_store_write(
            &self.policy,
            self.sleeper.as_ref(),
            &self.cancel,
            |attempt| {
                debug!("bulk write attempt {attempt} for {user} ({count} docs)");
                self.transactions.bulk_save(&batch)
            },
        );

        match written {
            Ok(attempts) => {
                info!("saved {count} transactions for {user} after {attempts} attempt(s)");
                self.settle(user, &batch.request, RequestStatus::Completed);
                ProcessingOutcome::Applied(count)
            }
            Err(e) => {
                error!(
                    "CRITICAL: {count} transactions for {user} (request {}) not stored: {e}. \
                     Possible data loss; redelivery will be skipped as duplicate, \
                     manual reconciliation required",
                    batch.request
                );
                self.settle(user, &batch.request, RequestStatus::Failed);
                ProcessingOutcome::Failed(e)
            }
        }
    }

    /// Best-effort status update; the outcome stands regardless.
    fn settle(&self, user: &str, request: &Fingerprint, status: RequestStatus) {
        if let Err(e) = self.ledger.mark(user, request, status) {
            warn!("could not mark request {} for {user} as {status}: {e}", request.short());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::Allocation;
    use crate::error::StoreError;
    use crate::memory::{MemoryLedgerStore, MemoryTransactionStore};
    use std::sync::Arc;
    use std::time::Duration;

    type Pipeline = RebalanceIntakePipeline<Arc<MemoryLedgerStore>, Arc<MemoryTransactionStore>>;

    fn pipeline() -> (Pipeline, Arc<MemoryLedgerStore>, Arc<MemoryTransactionStore>) {
        let ledger = Arc::new(MemoryLedgerStore::new());
        let txs = Arc::new(MemoryTransactionStore::new());
        let p = RebalanceIntakePipeline::new(Arc::clone(&ledger), Arc::clone(&txs))
            .with_retry_policy(RetryPolicy::new(5, Duration::ZERO));
        (p, ledger, txs)
    }

    fn event() -> RebalanceEvent {
        RebalanceEvent::new(
            "u1",
            Allocation::from([("stocks", 70.0), ("bonds", 30.0)]),
            Allocation::from([("stocks", 60.0), ("bonds", 40.0)]),
        )
    }

    #[test]
    fn first_event_applies() {
        let (p, ledger, txs) = pipeline();
        assert_eq!(p.process(&event()), ProcessingOutcome::Applied(2));
        assert_eq!(txs.calls(), 1);
        let record = ledger.get("u1").unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
    }

    #[test]
    fn no_change_applies_zero_without_write() {
        let (p, _, txs) = pipeline();
        let alloc = Allocation::from([("cash", 100.0)]);
        let e = RebalanceEvent::new("u1", alloc.clone(), alloc);
        assert_eq!(p.process(&e), ProcessingOutcome::Applied(0));
        assert_eq!(txs.calls(), 0);
    }

    #[test]
    fn ledger_read_failure_aborts() {
        let (p, ledger, txs) = pipeline();
        ledger.fail_gets(Some(StoreError::Transient("timeout".into())));
        assert!(matches!(
            p.process(&event()),
            ProcessingOutcome::Failed(PipelineError::Ledger(_))
        ));
        assert_eq!(txs.calls(), 0);
    }

    #[test]
    fn replay_bypasses_duplicate_gate() {
        let (p, _, txs) = pipeline();
        p.process(&event());
        assert_eq!(
            p.process(&event()),
            ProcessingOutcome::Skipped(SkipReason::Duplicate)
        );
        assert_eq!(p.replay(&event()), ProcessingOutcome::Applied(2));
        assert_eq!(txs.calls(), 2);
        assert_eq!(txs.documents().len(), 2);
    }

    #[test]
    fn outcome_display() {
        assert_eq!(
            ProcessingOutcome::Skipped(SkipReason::Duplicate).to_string(),
            "skipped (duplicate)"
        );
        assert_eq!(ProcessingOutcome::Applied(3).label(), "applied");
    }
}
