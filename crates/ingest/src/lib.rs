//! Ingest run lifecycle: creation, forward-only status transitions,
//! write-through persistence and background execution.
//!
//! - [`IngestRunTracker`]: authoritative view of runs, enforces the state machine
//! - [`RunStore`]: persistence contract (memory, JSONL file, PostgreSQL)
//! - [`IngestRunner`]: drives a run from `PENDING` to a terminal state

pub mod clock;
pub mod dto;
pub mod error;
pub mod model;
pub mod runner;
pub mod store;
pub mod tracker;

pub use clock::{Clock, IdGenerator, RandomIds, SystemClock};
pub use dto::{CreateIngestRequest, IngestRunView};
pub use error::{IngestRunError, StoreError};
pub use model::{IngestRun, ParseStatusError, RunStatus};
pub use runner::{
    DelaySupplier, IngestExecutor, IngestReport, IngestRunner, RunnerStats, SimulatedExecutor,
    Submission,
};
pub use store::{JsonlRunStore, MemoryRunStore, PgRunStore, RunStore};
pub use tracker::{IngestRunTracker, RunIter, RunList};
