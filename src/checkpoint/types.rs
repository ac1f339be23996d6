use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current on-disk layout. Readers accept older files; missing fields default.
pub const SCHEMA_VERSION: u32 = 1;

/// Longest `last_error` kept in a checkpoint, in characters.
pub const MAX_ERROR_CHARS: usize = 500;

/// Where an item stands in the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    #[default]
    InProgress,
    Completed,
    Failed,
}

/// Progress of a single work item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemStatus {
    /// Stage awaiting or undergoing execution.
    pub current_stage: Option<String>,
    /// Finished stages, in execution order.
    pub stages_completed: Vec<String>,
    /// Attempts made in `current_stage`. Resets when a new stage starts.
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub outcome: ItemOutcome,
}

impl ItemStatus {
    pub fn is_completed(&self) -> bool {
        self.outcome == ItemOutcome::Completed
    }

    pub fn has_completed_stage(&self, stage: &str) -> bool {
        self.stages_completed.iter().any(|s| s == stage)
    }

    /// Records `error`, truncated to [`MAX_ERROR_CHARS`].
    pub fn set_error(&mut self, error: &str) {
        self.last_error = Some(truncate_error(error));
    }
}

/// Truncates on a character boundary so multi-byte text never splits.
pub fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_CHARS) {
        Some((idx, _)) => error[..idx].to_string(),
        None => error.to_string(),
    }
}

/// The full durable record of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default = "Uuid::new_v4")]
    pub run_id: Uuid,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: BTreeMap<String, ItemStatus>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: None,
            items: BTreeMap::new(),
        }
    }
}

/// Aggregate counters over every item in a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointStats {
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub total_retries: u64,
}

impl Checkpoint {
    pub fn item(&self, id: &str) -> Option<&ItemStatus> {
        self.items.get(id)
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.items.get(id).is_some_and(ItemStatus::is_completed)
    }

    pub fn stats(&self) -> CheckpointStats {
        let mut stats = CheckpointStats::default();
        for status in self.items.values() {
            match status.outcome {
                ItemOutcome::Completed => stats.completed += 1,
                ItemOutcome::Failed => stats.failed += 1,
                ItemOutcome::InProgress => stats.in_progress += 1,
            }
            // The first attempt of a stage is not a retry.
            stats.total_retries += u64::from(status.retry_count.saturating_sub(1));
        }
        stats
    }

    /// Items whose last recorded outcome is Failed, with their last error.
    pub fn failed_items(&self) -> Vec<(&str, &ItemStatus)> {
        self.items
            .iter()
            .filter(|(_, s)| s.outcome == ItemOutcome::Failed)
            .map(|(id, s)| (id.as_str(), s))
            .collect()
    }
}
