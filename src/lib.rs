//! # folio
//!
//! Idempotent intake for portfolio-rebalance instructions.
//!
//! A provider sends "move user U to allocation X" events over an at-least-once
//! channel. This crate turns that stream into non-duplicated transaction records:
//!
//! - **Fingerprint**: a canonical SHA-256 of an allocation, independent of map order
//! - **Diff engine**: per-asset BUY/SELL percentages between two allocations
//! - **Request ledger**: per-user fingerprint of the last accepted request
//! - **Pipeline**: duplicate suppression, diff, bounded-retry bulk write
//!
//! ## Quick Start
//!
//! ```
//! use folio::memory::{MemoryLedgerStore, MemoryTransactionStore};
//! use folio::{Allocation, ProcessingOutcome, RebalanceEvent, RebalanceIntakePipeline, SkipReason};
//!
//! let pipeline = RebalanceIntakePipeline::new(
//!     MemoryLedgerStore::new(),
//!     MemoryTransactionStore::new(),
//! );
//!
//! let event = RebalanceEvent::new(
//!     "user-1",
//!     Allocation::from([("stocks", 70.0), ("bonds", 20.0), ("gold", 10.0)]),
//!     Allocation::from([("stocks", 60.0), ("bonds", 30.0), ("gold", 10.0)]),
//! );
//!
//! assert_eq!(pipeline.process(&event), ProcessingOutcome::Applied(2));
//! // Redelivery of the same event is a no-op.
//! assert_eq!(pipeline.process(&event), ProcessingOutcome::Skipped(SkipReason::Duplicate));
//! ```
//!
//! ## Action convention
//!
//! | target vs current | action |
//! |-------------------|--------|
//! | target > current  | BUY `target - current` |
//! | target < current  | SELL `current - target` |
//! | equal             | nothing |

pub mod allocation;
pub mod diff;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod locks;
pub mod memory;
pub mod pipeline;
pub mod retry;
pub mod store;

pub use allocation::{Allocation, RebalanceEvent};
pub use diff::{Action, RebalanceTransaction, diff};
pub use error::{PipelineError, StoreError, ValidationError};
pub use fingerprint::{Fingerprint, fingerprint};
pub use ledger::{LedgerStore, RebalanceRequestLedger, RebalanceRequestRecord, RequestStatus};
pub use pipeline::{ProcessingOutcome, RebalanceIntakePipeline, SkipReason};
pub use retry::{CancelToken, RetryPolicy, Sleeper, ThreadSleeper};
pub use store::{TransactionBatch, TransactionStore};
