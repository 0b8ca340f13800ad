//! Authoritative view of ingest runs.
//!
//! [`IngestRunTracker`] owns the run table, enforces the forward-only status
//! machine and writes every accepted mutation through to its [`RunStore`]
//! before committing it in memory.
//!
//! Locking:
//! - the table (`RwLock<IndexMap<..>>`) is held only for lookups and inserts,
//!   never across a store call;
//! - each run has an async `gate` held for its whole check → persist → commit
//!   sequence, so transitions on one id are linearized while different ids
//!   proceed in parallel;
//! - readers only touch the committed snapshot and never wait on a gate.

use std::slice;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, IdGenerator, RandomIds, SystemClock};
use crate::dto::CreateIngestRequest;
use crate::error::IngestRunError;
use crate::model::{IngestRun, RunStatus};
use crate::store::RunStore;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ── Run slot ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct RunSlot {
    gate: Mutex<()>,
    /// `None` while the creating call has not yet persisted the run.
    committed: RwLock<Option<Arc<IngestRun>>>,
}

impl RunSlot {
    fn reserved() -> Self {
        Self {
            gate: Mutex::new(()),
            committed: RwLock::new(None),
        }
    }

    fn committed(run: IngestRun) -> Self {
        Self {
            gate: Mutex::new(()),
            committed: RwLock::new(Some(Arc::new(run))),
        }
    }

    fn snapshot(&self) -> Option<Arc<IngestRun>> {
        read(&self.committed).clone()
    }

    fn commit(&self, run: IngestRun) {
        *write(&self.committed) = Some(Arc::new(run));
    }
}

// ── Listing ──────────────────────────────────────────────────────────

/// Point-in-time listing of runs.
///
/// Holds shared pointers to the committed runs; the status filter is applied
/// while iterating. [`RunList::iter`] can be called any number of times and
/// always yields the same sequence.
#[derive(Debug, Clone)]
pub struct RunList {
    runs: Arc<[Arc<IngestRun>]>,
    filter: Option<RunStatus>,
}

impl RunList {
    fn new(runs: Vec<Arc<IngestRun>>, filter: Option<RunStatus>) -> Self {
        Self {
            runs: runs.into(),
            filter,
        }
    }

    pub fn iter(&self) -> RunIter<'_> {
        RunIter {
            inner: self.runs.iter(),
            filter: self.filter,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Owned copies of every run in the listing.
    pub fn to_vec(&self) -> Vec<IngestRun> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a RunList {
    type Item = &'a IngestRun;
    type IntoIter = RunIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct RunIter<'a> {
    inner: slice::Iter<'a, Arc<IngestRun>>,
    filter: Option<RunStatus>,
}

impl<'a> Iterator for RunIter<'a> {
    type Item = &'a IngestRun;

    fn next(&mut self) -> Option<Self::Item> {
        let filter = self.filter;
        self.inner
            .by_ref()
            .map(|run| &**run)
            .find(|run| filter.map_or(true, |status| run.status == status))
    }
}

// ── Tracker ──────────────────────────────────────────────────────────

pub struct IngestRunTracker {
    runs: RwLock<IndexMap<Uuid, Arc<RunSlot>>>,
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl std::fmt::Debug for IngestRunTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestRunTracker")
            .field("runs", &read(&self.runs).len())
            .field("store", &self.store.backend())
            .finish()
    }
}

impl IngestRunTracker {
    /// Empty tracker writing through to `store`.
    pub fn new(store: Arc<dyn RunStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            runs: RwLock::new(IndexMap::new()),
            store,
            clock,
            ids,
        }
    }

    /// Empty tracker with the system clock and random v4 ids.
    pub fn with_store(store: Arc<dyn RunStore>) -> Self {
        Self::new(store, Arc::new(SystemClock), Arc::new(RandomIds))
    }

    /// Rebuild the in-memory view from everything `store` holds.
    pub async fn restore(
        store: Arc<dyn RunStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, IngestRunError> {
        let mut loaded = store.load_all().await?;
        loaded.sort_by_key(|run| run.created_at);

        let mut runs = IndexMap::with_capacity(loaded.len());
        for run in loaded {
            runs.insert(run.id, Arc::new(RunSlot::committed(run)));
        }
        info!(backend = store.backend(), runs = runs.len(), "ingest runs restored");

        Ok(Self {
            runs: RwLock::new(runs),
            store,
            clock,
            ids,
        })
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Register a new `PENDING` run.
    pub async fn create(
        &self,
        requested_user: &str,
        months: Vec<String>,
        dataset_id: &str,
        note: &str,
    ) -> Result<IngestRun, IngestRunError> {
        validate_create(requested_user, &months)?;

        let id = self.ids.next_id();
        let slot = Arc::new(RunSlot::reserved());
        let _gate = slot.gate.lock().await;
        {
            let mut runs = write(&self.runs);
            if runs.contains_key(&id) {
                return Err(IngestRunError::IdCollision(id));
            }
            runs.insert(id, slot.clone());
        }

        let run = IngestRun::new(id, requested_user, months, dataset_id, note, self.clock.now());
        if let Err(e) = self.store.upsert(&run).await {
            write(&self.runs).shift_remove(&id);
            warn!(run_id = %id, error = %e, "ingest run create not persisted");
            return Err(e.into());
        }
        slot.commit(run.clone());

        info!(
            run_id = %id,
            user = %run.requested_user,
            dataset_id = %run.dataset_id,
            months = run.months.len(),
            "ingest run created"
        );
        Ok(run)
    }

    /// Map an inbound request onto [`IngestRunTracker::create`].
    pub async fn create_from_request(
        &self,
        request: CreateIngestRequest,
    ) -> Result<IngestRun, IngestRunError> {
        self.create(&request.user, request.months, &request.dataset_id, &request.note)
            .await
    }

    /// Move run `id` to `target` along an allowed edge.
    pub async fn transition(&self, id: Uuid, target: RunStatus) -> Result<IngestRun, IngestRunError> {
        self.apply(id, target, None, None).await
    }

    /// `RUNNING → SUCCEEDED`, recording where the ingest report was written.
    pub async fn complete(
        &self,
        id: Uuid,
        report_uri: Option<String>,
    ) -> Result<IngestRun, IngestRunError> {
        self.apply(id, RunStatus::Succeeded, report_uri, None).await
    }

    /// `RUNNING → FAILED`, recording why.
    pub async fn fail(&self, id: Uuid, message: impl Into<String>) -> Result<IngestRun, IngestRunError> {
        self.apply(id, RunStatus::Failed, None, Some(message.into())).await
    }

    async fn apply(
        &self,
        id: Uuid,
        target: RunStatus,
        report_uri: Option<String>,
        error: Option<String>,
    ) -> Result<IngestRun, IngestRunError> {
        let slot = self.slot(id).ok_or(IngestRunError::NotFound(id))?;
        let _gate = slot.gate.lock().await;

        // A create that failed to persist leaves an empty slot behind.
        let current = slot.snapshot().ok_or(IngestRunError::NotFound(id))?;
        if !current.status.can_transition_to(target) {
            debug!(run_id = %id, from = %current.status, to = %target, "transition rejected");
            return Err(IngestRunError::InvalidTransition {
                id,
                from: current.status,
                to: target,
            });
        }

        let next = current.advance(target, self.clock.now(), report_uri, error);
        if let Err(e) = self.store.upsert(&next).await {
            warn!(run_id = %id, to = %target, error = %e, "ingest run transition not persisted");
            return Err(e.into());
        }
        slot.commit(next.clone());

        info!(run_id = %id, from = %current.status, to = %target, "ingest run transitioned");
        Ok(next)
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, id: Uuid) -> Result<IngestRun, IngestRunError> {
        self.slot(id)
            .and_then(|slot| slot.snapshot())
            .map(|run| (*run).clone())
            .ok_or(IngestRunError::NotFound(id))
    }

    /// Runs ordered by `created_at` ascending, optionally only those in `filter`.
    pub fn list(&self, filter: Option<RunStatus>) -> RunList {
        let mut runs = self.committed_runs(|_| true);
        runs.sort_by_key(|run| run.created_at);
        RunList::new(runs, filter)
    }

    /// Runs targeting `dataset_id`, newest first.
    pub fn list_by_dataset(&self, dataset_id: &str) -> RunList {
        let mut runs = self.committed_runs(|run| run.dataset_id == dataset_id);
        runs.sort_by_key(|run| run.created_at);
        runs.reverse();
        RunList::new(runs, None)
    }

    /// Number of committed runs.
    pub fn len(&self) -> usize {
        self.committed_runs(|_| true).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: Uuid) -> Option<Arc<RunSlot>> {
        read(&self.runs).get(&id).cloned()
    }

    fn committed_runs(&self, keep: impl Fn(&IngestRun) -> bool) -> Vec<Arc<IngestRun>> {
        read(&self.runs)
            .values()
            .filter_map(|slot| slot.snapshot())
            .filter(|run| keep(&**run))
            .collect()
    }
}

fn validate_create(requested_user: &str, months: &[String]) -> Result<(), IngestRunError> {
    if requested_user.trim().is_empty() {
        return Err(IngestRunError::Validation(
            "requested user must not be empty".to_string(),
        ));
    }
    if months.is_empty() {
        return Err(IngestRunError::Validation(
            "months must contain at least one period".to_string(),
        ));
    }
    if let Some(idx) = months.iter().position(|m| m.trim().is_empty()) {
        return Err(IngestRunError::Validation(format!(
            "months[{}] must not be empty",
            idx
        )));
    }
    Ok(())
}
