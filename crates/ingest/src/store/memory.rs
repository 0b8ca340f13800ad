use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use indexmap::IndexMap;
use uuid::Uuid;

use super::RunStore;
use crate::error::StoreError;
use crate::model::IngestRun;

/// In-process store. Nothing survives a restart.
///
/// `IndexMap` keeps first-insert order, so `load_all` returns runs in the
/// order they were created.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<IndexMap<Uuid, IngestRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<IngestRun> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn upsert(&self, run: &IngestRun) -> Result<(), StoreError> {
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run.id, run.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<IngestRun>, StoreError> {
        Ok(self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
