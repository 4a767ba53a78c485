//! End-to-end pipeline behaviour against in-memory stores: duplicate
//! suppression, bounded retry with backoff, and the ledger-advances-first
//! trade-off on retry exhaustion.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use folio::memory::{MemoryLedgerStore, MemoryTransactionStore};
use folio::{
    Action, Allocation, CancelToken, LedgerStore, PipelineError, ProcessingOutcome,
    RebalanceEvent, RebalanceIntakePipeline, RequestStatus, RetryPolicy, SkipReason, Sleeper,
    StoreError,
};

/// Records every requested backoff instead of sleeping.
#[derive(Default)]
struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration, cancel: &CancelToken) -> bool {
        self.delays.lock().unwrap().push(delay);
        !cancel.is_cancelled()
    }
}

struct Harness {
    pipeline: RebalanceIntakePipeline<Arc<MemoryLedgerStore>, Arc<MemoryTransactionStore>>,
    ledger: Arc<MemoryLedgerStore>,
    txs: Arc<MemoryTransactionStore>,
    sleeper: Arc<RecordingSleeper>,
}

fn harness() -> Harness {
    let ledger = Arc::new(MemoryLedgerStore::new());
    let txs = Arc::new(MemoryTransactionStore::new());
    let sleeper = Arc::new(RecordingSleeper::default());
    let pipeline = RebalanceIntakePipeline::new(Arc::clone(&ledger), Arc::clone(&txs))
        .with_retry_policy(RetryPolicy::new(5, Duration::from_secs(1)))
        .with_sleeper(Arc::clone(&sleeper));
    Harness {
        pipeline,
        ledger,
        txs,
        sleeper,
    }
}

fn event(user: &str) -> RebalanceEvent {
    RebalanceEvent::new(
        user,
        Allocation::from([("stocks", 60.0), ("bonds", 40.0)]),
        Allocation::from([("stocks", 50.0), ("bonds", 50.0)]),
    )
}

fn secs(v: &[u64]) -> Vec<Duration> {
    v.iter().copied().map(Duration::from_secs).collect()
}

fn transient() -> StoreError {
    StoreError::Transient("es_rejected_execution_exception".into())
}

// ============================================================================
// Duplicate suppression
// ============================================================================

#[test]
fn same_event_twice_applies_then_skips_with_one_write() {
    let h = harness();

    assert_eq!(h.pipeline.process(&event("u1")), ProcessingOutcome::Applied(2));
    assert_eq!(
        h.pipeline.process(&event("u1")),
        ProcessingOutcome::Skipped(SkipReason::Duplicate)
    );

    assert_eq!(h.txs.calls(), 1);
    let batch = &h.txs.batches()[0];
    assert_eq!(batch.transactions.len(), 2);
    assert_eq!(batch.transactions[0].asset, "bonds");
    assert_eq!(batch.transactions[0].action, Action::Sell);
    assert_eq!(batch.transactions[1].asset, "stocks");
    assert_eq!(batch.transactions[1].action, Action::Buy);
}

#[test]
fn duplicate_detected_regardless_of_key_order() {
    let h = harness();
    h.pipeline.process(&event("u1"));

    let mut reordered = Allocation::new();
    reordered.insert("bonds", 40.0);
    reordered.insert("stocks", 60.0);
    let again = RebalanceEvent::new(
        "u1",
        reordered,
        Allocation::from([("stocks", 50.0), ("bonds", 50.0)]),
    );

    assert_eq!(
        h.pipeline.process(&again),
        ProcessingOutcome::Skipped(SkipReason::Duplicate)
    );
    assert_eq!(h.txs.calls(), 1);
}

#[test]
fn distinct_event_replaces_ledger_fingerprint() {
    let h = harness();
    h.pipeline.process(&event("u1"));
    let first = h.ledger.get("u1").unwrap().unwrap().fingerprint;

    let next = RebalanceEvent::new(
        "u1",
        Allocation::from([("stocks", 80.0), ("bonds", 20.0)]),
        Allocation::from([("stocks", 60.0), ("bonds", 40.0)]),
    );
    assert_eq!(h.pipeline.process(&next), ProcessingOutcome::Applied(2));

    let record = h.ledger.get("u1").unwrap().unwrap();
    assert_ne!(record.fingerprint, first);
    assert_eq!(record.status, RequestStatus::Completed);
    assert_eq!(h.txs.calls(), 2);
}

#[test]
fn duplicates_are_per_user() {
    let h = harness();
    assert_eq!(h.pipeline.process(&event("u1")), ProcessingOutcome::Applied(2));
    assert_eq!(h.pipeline.process(&event("u2")), ProcessingOutcome::Applied(2));
    assert_eq!(h.txs.calls(), 2);
}

// ============================================================================
// Ledger failures
// ============================================================================

#[test]
fn ledger_write_failure_aborts_before_diff_and_persist() {
    let h = harness();
    h.ledger.fail_puts(Some(StoreError::Fatal("cluster_block_exception".into())));

    let outcome = h.pipeline.process(&event("u1"));
    assert!(matches!(
        outcome,
        ProcessingOutcome::Failed(PipelineError::Ledger(StoreError::Fatal(_)))
    ));
    assert_eq!(h.txs.calls(), 0);

    // Nothing was recorded, so redelivery is processed normally.
    h.ledger.fail_puts(None);
    assert_eq!(h.pipeline.process(&event("u1")), ProcessingOutcome::Applied(2));
}

// ============================================================================
// Retry
// ============================================================================

#[test]
fn four_transient_failures_then_success_uses_five_attempts() {
    let h = harness();
    h.txs.fail_next(4, transient());

    assert_eq!(h.pipeline.process(&event("u1")), ProcessingOutcome::Applied(2));
    assert_eq!(h.txs.calls(), 5);
    assert_eq!(h.sleeper.delays(), secs(&[1, 2, 4, 8]));
    assert_eq!(
        h.ledger.get("u1").unwrap().unwrap().status,
        RequestStatus::Completed
    );
}

#[test]
fn partial_bulk_failure_is_retried_as_a_whole() {
    let h = harness();
    h.txs.fail_next(
        1,
        StoreError::Partial {
            failed: 1,
            total: 2,
            reason: "version_conflict_engine_exception".into(),
        },
    );

    assert_eq!(h.pipeline.process(&event("u1")), ProcessingOutcome::Applied(2));
    assert_eq!(h.txs.calls(), 2);
    assert_eq!(h.txs.documents().len(), 2);
}

#[test]
fn fatal_write_error_is_not_retried() {
    let h = harness();
    h.txs.fail_next(1, StoreError::Fatal("mapper_parsing_exception".into()));

    let outcome = h.pipeline.process(&event("u1"));
    assert!(matches!(
        outcome,
        ProcessingOutcome::Failed(PipelineError::Rejected(_))
    ));
    assert_eq!(h.txs.calls(), 1);
    assert!(h.sleeper.delays().is_empty());
}

#[test]
fn exhausted_retries_lose_transactions_because_ledger_already_advanced() {
    let h = harness();
    h.txs.fail_always(Some(transient()));

    let outcome = h.pipeline.process(&event("u1"));
    assert_eq!(
        outcome,
        ProcessingOutcome::Failed(PipelineError::RetriesExhausted {
            attempts: 5,
            last: transient(),
        })
    );
    assert_eq!(h.txs.calls(), 5);
    assert_eq!(h.sleeper.delays(), secs(&[1, 2, 4, 8]));

    // Storage recovers, but the redelivered event is now a "duplicate":
    // accepted data-loss trade-off, visible only through the FAILED status.
    h.txs.fail_always(None);
    assert_eq!(
        h.pipeline.process(&event("u1")),
        ProcessingOutcome::Skipped(SkipReason::Duplicate)
    );
    assert_eq!(h.txs.calls(), 5);
    assert!(h.txs.batches().is_empty());

    let failed = h.pipeline.ledger().failed_requests().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].user_id, "u1");
}

#[test]
fn operator_replay_recovers_lost_transactions() {
    let h = harness();
    h.txs.fail_always(Some(transient()));
    assert!(h.pipeline.process(&event("u1")).is_failed());

    h.txs.fail_always(None);
    assert_eq!(h.pipeline.replay(&event("u1")), ProcessingOutcome::Applied(2));
    assert!(h.pipeline.ledger().failed_requests().unwrap().is_empty());
    assert_eq!(h.txs.documents().len(), 2);
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn cancellation_during_backoff_reports_cancelled() {
    let ledger = Arc::new(MemoryLedgerStore::new());
    let txs = Arc::new(MemoryTransactionStore::new());
    txs.fail_always(Some(transient()));
    let cancel = CancelToken::new();

    let pipeline = Arc::new(
        RebalanceIntakePipeline::new(Arc::clone(&ledger), Arc::clone(&txs))
            .with_retry_policy(RetryPolicy::new(5, Duration::from_secs(60)))
            .with_cancel_token(cancel.clone()),
    );

    let worker = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || pipeline.process(&event("u1")))
    };
    thread::sleep(Duration::from_millis(50));
    cancel.cancel();

    let outcome = worker.join().unwrap();
    assert_eq!(outcome, ProcessingOutcome::Failed(PipelineError::Cancelled));
    assert_eq!(txs.calls(), 1);
    assert_eq!(
        ledger.get("u1").unwrap().unwrap().status,
        RequestStatus::Failed
    );
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn concurrent_duplicates_for_one_user_write_once() {
    let h = harness();
    let pipeline = Arc::new(h.pipeline);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || pipeline.process(&event("u1")))
        })
        .collect();
    let outcomes: Vec<ProcessingOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, ProcessingOutcome::Applied(_)))
        .count();
    assert_eq!(applied, 1);
    assert_eq!(h.txs.calls(), 1);
}
