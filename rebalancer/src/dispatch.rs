//! Partitioned worker pool.
//!
//! Events are routed to one of N worker threads by a hash of the user id, over
//! bounded channels. All events for one user land on the same worker in input
//! order, so per-user processing stays sequential while different users run in
//! parallel. A full queue blocks the reader.
//!
//! Once the pipeline's cancel token fires the reader stops, and workers drain
//! their queues without processing. Drained events are counted as abandoned.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use folio::{
    LedgerStore, ProcessingOutcome, RebalanceEvent, RebalanceIntakePipeline, TransactionStore,
    fingerprint,
};
use log::{error, info, warn};
use rustc_hash::FxHasher;
use serde::Serialize;

use crate::audit::{self, AuditLog};
use crate::error::{Error, Result};
use crate::events::SourceLine;

/// Worker pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    pub workers: usize,
    pub queue_depth: usize,
}

/// Counters for one consumer run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Non-blank input lines read.
    pub received: usize,
    /// Lines that failed to decode or validate.
    pub rejected: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Failures where computed transactions were never stored.
    pub data_loss: usize,
    /// Transactions stored across all applied events.
    pub transactions: usize,
    /// Events dequeued after shutdown and not processed.
    pub abandoned: usize,
}

impl RunSummary {
    fn merge(&mut self, other: &RunSummary) {
        self.received += other.received;
        self.rejected += other.rejected;
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.data_loss += other.data_loss;
        self.transactions += other.transactions;
        self.abandoned += other.abandoned;
    }

    fn record(&mut self, outcome: &ProcessingOutcome) {
        match outcome {
            ProcessingOutcome::Applied(n) => {
                self.applied += 1;
                self.transactions += n;
            }
            ProcessingOutcome::Skipped(_) => self.skipped += 1,
            ProcessingOutcome::Failed(e) => {
                self.failed += 1;
                if e.is_data_loss() {
                    self.data_loss += 1;
                }
            }
        }
    }
}

/// Worker index for `user_id` among `workers` partitions.
pub fn partition(user_id: &str, workers: usize) -> usize {
    let mut hasher = FxHasher::default();
    user_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

fn worker_loop<L, T>(
    idx: usize,
    pipeline: &RebalanceIntakePipeline<L, T>,
    rx: Receiver<RebalanceEvent>,
    audit: Option<&AuditLog>,
) -> RunSummary
where
    L: LedgerStore,
    T: TransactionStore,
{
    let mut stats = RunSummary::default();
    for event in rx {
        if pipeline.cancel_token().is_cancelled() {
            stats.abandoned += 1;
            continue;
        }

        let request = fingerprint(&event.new_allocation);
        let outcome = pipeline.process(&event);
        info!("worker {idx}: {} {}", event.user_id, outcome);
        stats.record(&outcome);

        if let Some(audit) = audit {
            if let Err(e) = audit::log_outcome(audit, &event, &request, &outcome) {
                warn!("worker {idx}: audit write failed: {e}");
            }
        }
    }
    if stats.abandoned > 0 {
        warn!(
            "worker {idx}: {} queued events not processed due to shutdown",
            stats.abandoned
        );
    }
    stats
}

/// Feed `source` through `pipeline` on a partitioned worker pool until the
/// source is exhausted or the pipeline's cancel token fires.
///
/// An input read error stops reading; events already queued are still
/// processed before the error is returned.
pub fn run<L, T, I>(
    pipeline: Arc<RebalanceIntakePipeline<L, T>>,
    source: I,
    opts: &DispatchOptions,
    audit: Option<Arc<AuditLog>>,
) -> Result<RunSummary>
where
    L: LedgerStore + 'static,
    T: TransactionStore + 'static,
    I: IntoIterator<Item = Result<SourceLine>>,
{
    let n = opts.workers.max(1);
    let mut senders: Vec<SyncSender<RebalanceEvent>> = Vec::with_capacity(n);
    let mut handles: Vec<JoinHandle<RunSummary>> = Vec::with_capacity(n);

    for idx in 0..n {
        let (tx, rx) = mpsc::sync_channel(opts.queue_depth.max(1));
        let pipeline = Arc::clone(&pipeline);
        let audit = audit.clone();
        let handle = thread::Builder::new()
            .name(format!("rebalance-worker-{idx}"))
            .spawn(move || worker_loop(idx, &pipeline, rx, audit.as_deref()))?;
        senders.push(tx);
        handles.push(handle);
    }
    info!("dispatching to {n} workers (queue depth {})", opts.queue_depth);

    let cancel = pipeline.cancel_token().clone();
    let mut summary = RunSummary::default();
    let mut read_error: Option<Error> = None;

    for item in source {
        if cancel.is_cancelled() {
            info!("shutdown requested, no longer reading input");
            break;
        }
        let SourceLine { line, event } = match item {
            Ok(line) => line,
            Err(e) => {
                error!("input read failed: {e}");
                read_error = Some(e);
                break;
            }
        };
        summary.received += 1;

        match event {
            Err(reason) => {
                summary.rejected += 1;
                warn!("line {line}: rejected event: {reason}");
                if let Some(audit) = &audit {
                    if let Err(e) = audit::log_event_rejected(audit, line, &reason) {
                        warn!("audit write failed: {e}");
                    }
                }
            }
            Ok(event) => {
                let idx = partition(&event.user_id, n);
                if senders[idx].send(event).is_err() {
                    error!("worker {idx} exited early, stopping input");
                    break;
                }
            }
        }
    }

    drop(senders);
    for (idx, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(stats) => summary.merge(&stats),
            Err(_) => error!("worker {idx} panicked"),
        }
    }

    match read_error {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}
