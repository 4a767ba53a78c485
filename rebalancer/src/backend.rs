//! Store selection and pipeline assembly from configuration.

use std::sync::Arc;

use folio::memory::{MemoryLedgerStore, MemoryTransactionStore};
use folio::{CancelToken, LedgerStore, RebalanceIntakePipeline, TransactionStore};
use folio_store::{FileLedgerStore, FileTransactionStore};
use log::info;

use crate::config::{Config, StorageBackend, StorageConfig};
use crate::error::Result;

pub type SharedLedger = Arc<dyn LedgerStore>;
pub type SharedTransactions = Arc<dyn TransactionStore>;

/// Pipeline over the configured backend.
pub type Pipeline = RebalanceIntakePipeline<SharedLedger, SharedTransactions>;

/// Open the ledger and transaction stores named by `storage.backend`.
pub fn open_stores(storage: &StorageConfig) -> Result<(SharedLedger, SharedTransactions)> {
    match storage.backend {
        StorageBackend::Memory => {
            info!("using in-memory stores; state is lost on exit");
            let ledger: SharedLedger = Arc::new(MemoryLedgerStore::new());
            let transactions: SharedTransactions = Arc::new(MemoryTransactionStore::new());
            Ok((ledger, transactions))
        }
        StorageBackend::File => {
            let ledger = FileLedgerStore::open(storage.ledger_path())?;
            let transactions = FileTransactionStore::open(storage.transactions_path())?;
            info!(
                "using file stores: ledger {}, transactions {}",
                ledger.path().display(),
                transactions.path().display()
            );
            let ledger: SharedLedger = Arc::new(ledger);
            let transactions: SharedTransactions = Arc::new(transactions);
            Ok((ledger, transactions))
        }
        StorageBackend::Elasticsearch => open_elastic(storage),
    }
}

#[cfg(feature = "elasticsearch")]
fn open_elastic(storage: &StorageConfig) -> Result<(SharedLedger, SharedTransactions)> {
    use folio_store::{ElasticConfig, ElasticLedgerStore, ElasticTransactionStore};

    let config = ElasticConfig {
        url: storage.url.clone(),
        requests_index: storage.requests_index.clone(),
        transactions_index: storage.transactions_index.clone(),
        timeout: std::time::Duration::from_secs(storage.timeout_secs),
    };
    let ledger = ElasticLedgerStore::new(&config)?;
    ledger.client().ping()?;
    let transactions = ElasticTransactionStore::new(&config)?;
    info!(
        "using elasticsearch at {} (indexes {}, {})",
        config.url, config.requests_index, config.transactions_index
    );
    let ledger: SharedLedger = Arc::new(ledger);
    let transactions: SharedTransactions = Arc::new(transactions);
    Ok((ledger, transactions))
}

#[cfg(not(feature = "elasticsearch"))]
fn open_elastic(_storage: &StorageConfig) -> Result<(SharedLedger, SharedTransactions)> {
    Err(crate::error::Error::Config(
        "elasticsearch backend requires building with the `elasticsearch` feature".into(),
    ))
}

/// Pipeline over the configured stores, retry policy and shutdown signal.
pub fn build_pipeline(config: &Config, cancel: CancelToken) -> Result<Pipeline> {
    let (ledger, transactions) = open_stores(&config.storage)?;
    Ok(RebalanceIntakePipeline::new(ledger, transactions)
        .with_retry_policy(config.retry_policy())
        .with_cancel_token(cancel))
}
