//! Storage backends for the folio intake pipeline.
//!
//! Implementations of [`folio::LedgerStore`] and [`folio::TransactionStore`]:
//!
//! - **File** (feature `file`, default): JSON ledger file + JSONL transaction log
//! - **Elasticsearch** (feature `elasticsearch`): REST adapter over `_doc` and `_bulk`
//!
//! In-memory stores live in `folio::memory`.

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "elasticsearch")]
pub mod elastic;

#[cfg(feature = "file")]
pub use file::{FileLedgerStore, FileTransactionStore, StoredTransaction};

#[cfg(feature = "elasticsearch")]
pub use elastic::{ElasticConfig, ElasticLedgerStore, ElasticTransactionStore};

/// Truncate a response body or error text for inclusion in a [`folio::StoreError`].
pub(crate) fn excerpt(text: &str) -> String {
    const MAX: usize = 512;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
