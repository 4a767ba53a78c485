//! folio-rebalancer: rebalance intake service.
//!
//! Reads allocation-change events from a JSONL stream, runs each through the
//! idempotent folio pipeline on a partitioned worker pool, and keeps an audit
//! trail. Also ships operator tools: replay of a lost request, listing of
//! failed requests, and offline fingerprint/diff of allocation files.

pub mod audit;
pub mod backend;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
