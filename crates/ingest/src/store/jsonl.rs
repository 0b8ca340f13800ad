use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::RunStore;
use crate::error::StoreError;
use crate::model::IngestRun;

/// Append-only JSONL log at `{DATA_DIR}/ingest/runs.jsonl`.
///
/// Every upsert appends the full run as one newline-terminated line and syncs
/// the file before returning. A failed append is cut back off the file, and a
/// torn final line left by a crash is dropped before the next append and
/// skipped on replay. Replay keeps the last line seen for each id.
#[derive(Debug)]
pub struct JsonlRunStore {
    path: PathBuf,
    append: Mutex<()>,
}

impl JsonlRunStore {
    /// Create `{data_dir}/ingest/` if needed and use `runs.jsonl` inside it.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("ingest");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join("runs.jsonl"),
            append: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate anything after the last newline. Returns the resulting length.
    fn drop_torn_tail(&self, file: &mut File) -> Result<u64, StoreError> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(0);
        }

        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] == b'\n' {
            return Ok(len);
        }

        let mut contents = Vec::with_capacity(len as usize);
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut contents)?;
        let keep = contents
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |idx| idx as u64 + 1);
        file.set_len(keep)?;
        warn!(
            path = %self.path.display(),
            dropped_bytes = len - keep,
            "torn line at end of run log truncated"
        );
        Ok(keep)
    }
}

#[async_trait]
impl RunStore for JsonlRunStore {
    async fn upsert(&self, run: &IngestRun) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(run)?;
        line.push(b'\n');

        // Lines must never interleave.
        let _guard = self.append.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)?;
        let end = self.drop_torn_tail(&mut file)?;
        file.seek(SeekFrom::Start(end))?;

        if let Err(e) = file.write_all(&line).and_then(|()| file.sync_data()) {
            if let Err(undo) = file.set_len(end) {
                warn!(path = %self.path.display(), error = %undo, "failed append not rolled back");
            }
            return Err(e.into());
        }
        debug!(run_id = %run.id, status = %run.status, path = %self.path.display(), "run appended");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<IngestRun>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let _guard = self.append.lock().unwrap_or_else(PoisonError::into_inner);
        let contents = fs::read(&self.path)?;
        let (complete, tail) = match contents.iter().rposition(|b| *b == b'\n') {
            Some(idx) => contents.split_at(idx + 1),
            None => contents.split_at(0),
        };

        let mut runs: IndexMap<Uuid, IngestRun> = IndexMap::new();
        for (idx, line) in complete.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let run: IngestRun = serde_json::from_slice(line).map_err(|e| StoreError::Corrupt {
                location: format!("{}:{}", self.path.display(), idx + 1),
                reason: e.to_string(),
            })?;
            runs.insert(run.id, run);
        }

        if !tail.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<IngestRun>(tail) {
                Ok(run) => {
                    runs.insert(run.id, run);
                }
                Err(e) => warn!(
                    path = %self.path.display(),
                    bytes = tail.len(),
                    error = %e,
                    "skipping torn line at end of run log"
                ),
            }
        }

        if runs.is_empty() {
            warn!(path = %self.path.display(), "run log exists but holds no runs");
        }
        Ok(runs.into_values().collect())
    }

    fn backend(&self) -> &'static str {
        "jsonl"
    }
}
