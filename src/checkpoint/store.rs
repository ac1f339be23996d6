use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::types::{Checkpoint, CheckpointStats, ItemStatus};
use crate::error::{PipelineError, Result};

/// Owner of the checkpoint file and its in-memory copy.
///
/// Every mutation goes through [`update_item`](Self::update_item) (or
/// [`update_all`](Self::update_all)), which holds the store lock across the
/// change and the write, so concurrent workers never interleave saves.
#[derive(Debug)]
pub struct CheckpointStore {
    /// `None` for detached stores, which never touch the disk.
    path: Option<PathBuf>,
    cache: Mutex<Checkpoint>,
}

impl CheckpointStore {
    /// Opens the checkpoint at `path`, starting empty if the file is absent.
    ///
    /// Fails with a configuration error when the containing directory does not
    /// exist, and with [`PipelineError::CorruptCheckpoint`] when the file exists
    /// but cannot be parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let dir = parent_dir(&path);
        if !dir.is_dir() {
            return Err(PipelineError::config(format!(
                "checkpoint directory {} does not exist",
                dir.display()
            )));
        }
        let checkpoint = Self::read(&path)?;
        info!(
            path = %path.display(),
            items = checkpoint.items.len(),
            run_id = %checkpoint.run_id,
            "checkpoint loaded"
        );
        Ok(Self {
            path: Some(path),
            cache: Mutex::new(checkpoint),
        })
    }

    /// An in-memory store seeded with `checkpoint`. Saves are no-ops.
    pub fn in_memory(checkpoint: Checkpoint) -> Self {
        Self {
            path: None,
            cache: Mutex::new(checkpoint),
        }
    }

    /// An in-memory copy of this store's current state.
    pub fn detached(&self) -> Self {
        Self::in_memory(self.snapshot())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Checkpoint> {
        // Every save rewrites the whole file, so a poisoned cache is still usable.
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reads the checkpoint file at `path`.
    pub fn read(path: &Path) -> Result<Checkpoint> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Checkpoint::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map_err(|e| PipelineError::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Re-reads the durable file, replacing the in-memory copy.
    pub fn load(&self) -> Result<Checkpoint> {
        let checkpoint = match &self.path {
            Some(path) => Self::read(path)?,
            None => return Ok(self.snapshot()),
        };
        *self.lock() = checkpoint.clone();
        Ok(checkpoint)
    }

    /// Replaces the whole checkpoint and persists it.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut cache = self.lock();
        *cache = checkpoint.clone();
        self.persist(&cache)
    }

    fn persist(&self, checkpoint: &Checkpoint) -> Result<()> {
        match &self.path {
            Some(path) => write_atomic(path, checkpoint),
            None => Ok(()),
        }
    }

    /// A copy of the current in-memory checkpoint.
    pub fn snapshot(&self) -> Checkpoint {
        self.lock().clone()
    }

    pub fn item(&self, id: &str) -> Option<ItemStatus> {
        self.lock().items.get(id).cloned()
    }

    /// Applies `mutate` to one item (creating it on first sight) and persists.
    ///
    /// Returns the item's status after the change. If the write fails, the
    /// in-memory copy is rolled back so memory never runs ahead of disk.
    pub fn update_item<F>(&self, id: &str, mutate: F) -> Result<ItemStatus>
    where
        F: FnOnce(&mut ItemStatus),
    {
        let mut cache = self.lock();
        let previous = cache.items.get(id).cloned();

        let status = cache.items.entry(id.to_string()).or_default();
        mutate(status);
        let updated = status.clone();
        let previous_stamp = cache.updated_at.replace(Utc::now());

        if let Err(e) = self.persist(&cache) {
            match previous {
                Some(prev) => cache.items.insert(id.to_string(), prev),
                None => cache.items.remove(id),
            };
            cache.updated_at = previous_stamp;
            return Err(e);
        }
        debug!(item = id, outcome = ?updated.outcome, "checkpoint updated");
        Ok(updated)
    }

    /// [`update_item`](Self::update_item) on the blocking pool, so the fsync
    /// and rename never stall a runtime worker.
    pub async fn update_item_async<F>(
        self: &Arc<Self>,
        id: String,
        mutate: F,
    ) -> Result<ItemStatus>
    where
        F: FnOnce(&mut ItemStatus) + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.update_item(&id, mutate))
            .await
            .map_err(|e| PipelineError::Worker(format!("checkpoint write task failed: {e}")))?
    }

    /// Applies `mutate` to several items in one write.
    pub fn update_all<'a, I, F>(&self, ids: I, mut mutate: F) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
        F: FnMut(&mut ItemStatus),
    {
        let mut cache = self.lock();
        let before = cache.clone();
        for id in ids {
            mutate(cache.items.entry(id.to_string()).or_default());
        }
        cache.updated_at = Some(Utc::now());
        if let Err(e) = self.persist(&cache) {
            *cache = before;
            return Err(e);
        }
        Ok(())
    }

    /// Ids from `all_ids` whose outcome is not Completed, in input order.
    pub fn incomplete_items<'a, I>(&self, all_ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let cache = self.lock();
        let mut seen = std::collections::HashSet::new();
        all_ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .filter(|id| !cache.is_completed(id))
            .map(str::to_string)
            .collect()
    }

    pub fn stats(&self) -> CheckpointStats {
        self.lock().stats()
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Writes to a temporary file beside `path`, then renames it into place.
fn write_atomic(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(checkpoint)?;
    let mut tmp = NamedTempFile::new_in(parent_dir(path))?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
