//! Persistence contract for ingest runs and its backends.
//!
//! The tracker calls [`RunStore::upsert`] for every accepted mutation and only
//! acknowledges the caller once the store returns `Ok`. Upserts are keyed by
//! run id and must be idempotent.

mod jsonl;
mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chess_core::{Config, StoreBackend};
use tracing::info;

use crate::error::StoreError;
use crate::model::IngestRun;

pub use jsonl::JsonlRunStore;
pub use memory::MemoryRunStore;
pub use postgres::{IngestRunRow, PgRunStore};

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace the stored version of `run`.
    async fn upsert(&self, run: &IngestRun) -> Result<(), StoreError>;

    /// Every stored run, oldest first.
    async fn load_all(&self) -> Result<Vec<IngestRun>, StoreError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Open the backend selected by `INGEST_STORE`.
pub async fn open(config: &Config) -> Result<Arc<dyn RunStore>, StoreError> {
    let store: Arc<dyn RunStore> = match config.ingest.store {
        StoreBackend::Memory => Arc::new(MemoryRunStore::new()),
        StoreBackend::Jsonl => Arc::new(JsonlRunStore::open(&config.storage.data_dir)?),
        StoreBackend::Postgres => Arc::new(PgRunStore::connect(&config.postgres).await?),
    };
    info!(backend = store.backend(), "ingest run store opened");
    Ok(store)
}
