//! Command orchestration: consume, replay, failed-request listing and the
//! offline fingerprint/diff tools.

use std::path::Path;
use std::sync::Arc;

use folio::diff::net_flow;
use folio::fingerprint::canonical_encoding;
use folio::{
    CancelToken, Fingerprint, LedgerStore, ProcessingOutcome, RebalanceRequestRecord,
    RebalanceTransaction, diff, fingerprint,
};
use log::{info, warn};

use crate::audit::{self, AuditLog};
use crate::backend;
use crate::config::Config;
use crate::dispatch::{self, DispatchOptions, RunSummary};
use crate::error::{Error, Result};
use crate::events;

/// Consume a JSONL event stream (`input`, or stdin) until it ends or `cancel` fires.
pub fn consume(config: &Config, input: Option<&Path>, cancel: CancelToken) -> Result<RunSummary> {
    let pipeline = Arc::new(backend::build_pipeline(config, cancel)?);
    let audit = Arc::new(AuditLog::open(&config.audit_path())?);
    let source = events::open_input(input)?;

    info!("consuming events from {}", source.name());
    audit::log_consumer_started(&audit, source.name(), config.workers.count)?;

    let opts = DispatchOptions {
        workers: config.workers.count,
        queue_depth: config.workers.queue_depth,
    };
    let summary = dispatch::run(pipeline, source, &opts, Some(Arc::clone(&audit)))?;

    audit::log_consumer_stopped(&audit, &summary)?;
    display_summary(&summary);
    if summary.data_loss > 0 {
        warn!(
            "{} requests may have lost transactions; run `rebalancer failed` to list them",
            summary.data_loss
        );
    }
    Ok(summary)
}

/// Options for an operator replay.
pub struct ReplayOptions {
    /// Skip the confirmation prompt.
    pub force: bool,
}

/// Re-apply one event without duplicate suppression, after confirmation.
pub fn replay(
    config: &Config,
    event_path: &Path,
    opts: &ReplayOptions,
) -> Result<ProcessingOutcome> {
    let event = events::load_event(event_path)?;
    let pipeline = backend::build_pipeline(config, CancelToken::new())?;
    let audit = AuditLog::open(&config.audit_path())?;

    let request = fingerprint(&event.new_allocation);
    let record = pipeline.ledger().store().get(&event.user_id)?;

    println!("Replay for {} (request {})", event.user_id, request.short());
    match &record {
        Some(r) => println!(
            "Ledger: {} {}{}",
            r.fingerprint.short(),
            r.status,
            if r.fingerprint == request { " (same request)" } else { "" }
        ),
        None => println!("Ledger: no record"),
    }
    let plan = diff(&event.new_allocation, &event.current_allocation, &event.user_id);
    display_plan(&plan);
    println!();

    if !opts.force {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt("Replay and write these transactions?")
            .default(false)
            .interact()
            .map_err(|e| Error::Aborted(format!("confirmation prompt failed: {e}")))?;

        audit::log_replay_confirmed(&audit, record.as_ref(), confirmed)?;
        if !confirmed {
            return Err(Error::Aborted("replay not confirmed".into()));
        }
    } else {
        audit::log_replay_confirmed(&audit, record.as_ref(), true)?;
    }

    let outcome = pipeline.replay(&event);
    audit::log_outcome(&audit, &event, &request, &outcome)?;
    println!("{outcome}");
    Ok(outcome)
}

/// Ledger records left `FAILED` by retry exhaustion.
pub fn failed_requests(config: &Config) -> Result<Vec<RebalanceRequestRecord>> {
    let (ledger, _) = backend::open_stores(&config.storage)?;
    Ok(ledger.list_by_status(folio::RequestStatus::Failed)?)
}

pub fn show_failed(config: &Config) -> Result<()> {
    let records = failed_requests(config)?;
    if records.is_empty() {
        println!("No failed requests.");
        return Ok(());
    }
    println!("FAILED REQUESTS:");
    println!("  {:<24} {:<64}", "User", "Request");
    for r in &records {
        println!("  {:<24} {}", r.user_id, r.fingerprint);
    }
    println!("\n{} request(s) need manual reconciliation.", records.len());
    Ok(())
}

/// Fingerprint of an allocation file, with the canonical text it covers.
pub fn fingerprint_file(path: &Path) -> Result<(String, Fingerprint)> {
    let allocation = events::load_allocation(path)?;
    Ok((canonical_encoding(&allocation), fingerprint(&allocation)))
}

pub fn show_fingerprint(path: &Path) -> Result<()> {
    let (canonical, fp) = fingerprint_file(path)?;
    println!("{canonical}");
    println!("{fp}");
    Ok(())
}

/// Transactions moving the allocation in `current` to the one in `new`.
pub fn diff_files(new: &Path, current: &Path, user_id: &str) -> Result<Vec<RebalanceTransaction>> {
    let target = events::load_allocation(new)?;
    let current = events::load_allocation(current)?;
    Ok(diff(&target, &current, user_id))
}

pub fn show_diff(new: &Path, current: &Path, user_id: &str) -> Result<()> {
    let plan = diff_files(new, current, user_id)?;
    if plan.is_empty() {
        println!("No rebalancing needed: allocations match.");
        return Ok(());
    }
    display_plan(&plan);
    Ok(())
}

fn display_plan(plan: &[RebalanceTransaction]) {
    if plan.is_empty() {
        println!("REBALANCE TRANSACTIONS: none");
        return;
    }
    println!("REBALANCE TRANSACTIONS:");
    println!("  {:<6} {:<16} {:>9}", "Action", "Asset", "Percent");
    for tx in plan {
        println!("  {:<6} {:<16} {:>8.2}%", tx.action, tx.asset, tx.percent);
    }
    println!("  net flow: {:+.2}%", net_flow(plan));
}

fn display_summary(summary: &RunSummary) {
    println!(
        "\nreceived {}  rejected {}  applied {}  skipped {}  failed {}  transactions {}",
        summary.received,
        summary.rejected,
        summary.applied,
        summary.skipped,
        summary.failed,
        summary.transactions,
    );
    if summary.abandoned > 0 {
        println!("{} queued events abandoned at shutdown", summary.abandoned);
    }
}
