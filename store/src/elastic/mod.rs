//! Elasticsearch-backed ledger and transaction stores.
//!
//! Ledger records live in one index keyed by user id. Transactions are written
//! with `_bulk` into a second index using [`folio::TransactionBatch::document_id`],
//! so a retried batch overwrites its earlier documents instead of adding copies.

pub mod client;
pub mod types;

use std::time::Duration;

use folio::{
    LedgerStore, RebalanceRequestRecord, RequestStatus, StoreError, TransactionBatch,
    TransactionStore,
};
use log::debug;

use client::ElasticClient;

/// Maximum ledger records returned by a status query.
const MAX_LIST: usize = 10_000;

/// Connection and index settings.
#[derive(Clone, Debug)]
pub struct ElasticConfig {
    pub url: String,
    pub requests_index: String,
    pub transactions_index: String,
    pub timeout: Duration,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".into(),
            requests_index: "rebalance_requests".into(),
            transactions_index: "rebalance_transactions".into(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Ledger over the requests index.
pub struct ElasticLedgerStore {
    client: ElasticClient,
    index: String,
}

impl ElasticLedgerStore {
    pub fn new(config: &ElasticConfig) -> Result<Self, StoreError> {
        Ok(Self {
            client: ElasticClient::new(&config.url, config.timeout)?,
            index: config.requests_index.clone(),
        })
    }

    pub fn client(&self) -> &ElasticClient {
        &self.client
    }
}

impl LedgerStore for ElasticLedgerStore {
    fn get(&self, user_id: &str) -> Result<Option<RebalanceRequestRecord>, StoreError> {
        self.client.get_source(&self.index, user_id)
    }

    fn put(&self, record: &RebalanceRequestRecord) -> Result<(), StoreError> {
        self.client.put_doc(&self.index, &record.user_id, record)
    }

    fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<RebalanceRequestRecord>, StoreError> {
        let query = serde_json::json!({
            "size": MAX_LIST,
            "query": { "match": { "status": status.to_string() } }
        });
        let mut records: Vec<RebalanceRequestRecord> = self
            .client
            .search(&self.index, &query)?
            .into_iter()
            .filter(|r: &RebalanceRequestRecord| r.status == status)
            .collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(records)
    }
}

/// Transaction sink over the transactions index.
pub struct ElasticTransactionStore {
    client: ElasticClient,
    index: String,
}

impl ElasticTransactionStore {
    pub fn new(config: &ElasticConfig) -> Result<Self, StoreError> {
        Ok(Self {
            client: ElasticClient::new(&config.url, config.timeout)?,
            index: config.transactions_index.clone(),
        })
    }
}

impl TransactionStore for ElasticTransactionStore {
    fn bulk_save(&self, batch: &TransactionBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = types::bulk_body(batch, &self.index)?;
        let response = self.client.bulk(body)?;
        response.into_result(batch.len())?;
        debug!(
            "bulk indexed {} transactions for {} into {}",
            batch.len(),
            batch.user_id,
            self.index
        );
        Ok(())
    }
}
