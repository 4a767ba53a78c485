//! Elasticsearch request/response shapes and error classification.

use std::collections::BTreeMap;

use folio::{Fingerprint, RebalanceTransaction, StoreError, TransactionBatch};
use serde::{Deserialize, Serialize};

use crate::excerpt;

/// `GET /{index}/_doc/{id}` response.
#[derive(Debug, Deserialize)]
pub struct GetResponse<T> {
    pub found: bool,
    #[serde(rename = "_source")]
    pub source: Option<T>,
}

/// `POST /{index}/_search` response.
#[derive(Debug, Deserialize)]
pub struct SearchResponse<T> {
    pub hits: SearchHits<T>,
}

#[derive(Debug, Deserialize)]
pub struct SearchHits<T> {
    pub hits: Vec<SearchHit<T>>,
}

#[derive(Debug, Deserialize)]
pub struct SearchHit<T> {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source")]
    pub source: T,
}

/// `POST /_bulk` response.
#[derive(Debug, Deserialize)]
pub struct BulkResponse {
    pub errors: bool,
    /// One entry per action, keyed by the operation (`index`, `create`, ...).
    #[serde(default)]
    pub items: Vec<BTreeMap<String, BulkItem>>,
}

/// Per-document result inside a bulk response.
#[derive(Debug, Deserialize)]
pub struct BulkItem {
    #[serde(rename = "_id")]
    pub id: Option<String>,
    pub status: u16,
    #[serde(default)]
    pub error: Option<ErrorCause>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorCause {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl BulkItem {
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.status >= 300
    }

    fn describe(&self) -> String {
        let id = self.id.as_deref().unwrap_or("?");
        match &self.error {
            Some(cause) => match &cause.reason {
                Some(reason) => format!("{id}: {} ({reason})", cause.kind),
                None => format!("{id}: {}", cause.kind),
            },
            None => format!("{id}: HTTP {}", self.status),
        }
    }
}

impl BulkResponse {
    /// Failed per-document results, in request order.
    pub fn failures(&self) -> impl Iterator<Item = &BulkItem> {
        self.items
            .iter()
            .flat_map(|item| item.values())
            .filter(|item| item.is_failure())
    }

    /// Collapse per-document results into one outcome for a batch of `total`
    /// documents. Any failure makes the whole batch `Partial`.
    pub fn into_result(self, total: usize) -> Result<(), StoreError> {
        let failures: Vec<&BulkItem> = self.failures().collect();
        if !self.errors && failures.is_empty() {
            return Ok(());
        }
        let reason = failures
            .first()
            .map(|item| item.describe())
            .unwrap_or_else(|| "bulk response reported errors".to_string());
        Err(StoreError::Partial {
            failed: failures.len(),
            total,
            reason,
        })
    }
}

/// Document body stored in the transactions index.
#[derive(Debug, Serialize)]
struct TransactionDocument<'a> {
    #[serde(flatten)]
    transaction: &'a RebalanceTransaction,
    allocation_hash: &'a Fingerprint,
}

/// NDJSON body for `POST /_bulk`, one `index` action per transaction with the
/// batch's deterministic document id.
pub fn bulk_body(batch: &TransactionBatch, index: &str) -> Result<String, StoreError> {
    let mut body = String::new();
    for tx in &batch.transactions {
        let action = serde_json::json!({
            "index": { "_index": index, "_id": batch.document_id(tx) }
        });
        let doc = TransactionDocument {
            transaction: tx,
            allocation_hash: &batch.request,
        };
        let doc = serde_json::to_string(&doc)
            .map_err(|e| StoreError::Fatal(format!("bulk encode: {e}")))?;
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&doc);
        body.push('\n');
    }
    Ok(body)
}

/// Map a non-success HTTP status to a store error. Throttling and server-side
/// failures are transient; other client errors are not.
pub fn classify_status(status: u16, body: &str) -> StoreError {
    let msg = format!("HTTP {status}: {}", excerpt(body));
    match status {
        408 | 429 | 500..=599 => StoreError::Transient(msg),
        _ => StoreError::Fatal(msg),
    }
}
