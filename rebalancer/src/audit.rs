//! JSONL audit trail.
//!
//! Every consumer run, rejected input line and processing outcome is appended to
//! `audit.jsonl`, one JSON object per line. Workers share one log.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use folio::{
    Fingerprint, ProcessingOutcome, RebalanceEvent, RebalanceRequestRecord, ValidationError,
};
use serde::Serialize;

use crate::dispatch::RunSummary;
use crate::error::Result;

/// An audit event written to the JSONL trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event: &'static str,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub data: serde_json::Value,
}

/// Append-only audit logger, safe to share between worker threads.
pub struct AuditLog {
    writer: Mutex<BufWriter<std::fs::File>>,
}

impl AuditLog {
    /// Open (or create) the audit log file for appending.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Log an event with arbitrary JSON data.
    pub fn log(&self, event: &'static str, data: serde_json::Value) -> Result<()> {
        let entry = AuditEvent {
            event,
            ts: Utc::now(),
            data,
        };
        let json = serde_json::to_string(&entry)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{json}")?;
        writer.flush()?;
        Ok(())
    }
}

pub fn log_consumer_started(audit: &AuditLog, input: &str, workers: usize) -> Result<()> {
    audit.log(
        "consumer_started",
        serde_json::json!({
            "input": input,
            "workers": workers,
        }),
    )
}

/// An input line that never reached the pipeline.
pub fn log_event_rejected(audit: &AuditLog, line: usize, reason: &ValidationError) -> Result<()> {
    audit.log(
        "event_rejected",
        serde_json::json!({
            "line": line,
            "reason": reason.to_string(),
        }),
    )
}

/// Outcome of one pipeline invocation. Failures that lost computed
/// transactions are logged as `data_loss_suspected`.
pub fn log_outcome(
    audit: &AuditLog,
    event: &RebalanceEvent,
    request: &Fingerprint,
    outcome: &ProcessingOutcome,
) -> Result<()> {
    let user = event.user_id.as_str();
    let request = request.as_str();
    match outcome {
        ProcessingOutcome::Applied(n) => audit.log(
            "rebalance_applied",
            serde_json::json!({ "user_id": user, "request": request, "transactions": n }),
        ),
        ProcessingOutcome::Skipped(reason) => audit.log(
            "rebalance_skipped",
            serde_json::json!({
                "user_id": user,
                "request": request,
                "reason": reason.to_string(),
            }),
        ),
        ProcessingOutcome::Failed(e) if e.is_data_loss() => audit.log(
            "data_loss_suspected",
            serde_json::json!({ "user_id": user, "request": request, "error": e.to_string() }),
        ),
        ProcessingOutcome::Failed(e) => audit.log(
            "rebalance_failed",
            serde_json::json!({ "user_id": user, "request": request, "error": e.to_string() }),
        ),
    }
}

pub fn log_replay_confirmed(
    audit: &AuditLog,
    record: Option<&RebalanceRequestRecord>,
    approved: bool,
) -> Result<()> {
    audit.log(
        "replay_confirmed",
        serde_json::json!({
            "approved": approved,
            "ledger": record,
        }),
    )
}

pub fn log_consumer_stopped(audit: &AuditLog, summary: &RunSummary) -> Result<()> {
    audit.log("consumer_stopped", serde_json::to_value(summary)?)
}
