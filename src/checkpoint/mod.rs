//! Durable, crash-safe record of per-item progress.
//!
//! The file is JSON, replaced atomically on every write: a reader sees either
//! the previous complete version or the new one, never a partial file.

mod store;
mod types;

pub use store::CheckpointStore;
pub use types::{
    Checkpoint, CheckpointStats, ItemOutcome, ItemStatus, MAX_ERROR_CHARS, SCHEMA_VERSION,
    truncate_error,
};
