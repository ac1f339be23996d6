//! Loading a batch of work items from disk.
//!
//! `.toml` files hold an `[[items]]` array; anything else is read as a JSON
//! array of `{ "id": ..., "payload": ... }` objects.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::stage::WorkItem;

#[derive(Deserialize)]
struct TomlBatch {
    #[serde(default)]
    items: Vec<WorkItem>,
}

pub fn load_items(path: &Path) -> Result<Vec<WorkItem>> {
    let contents = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let items = if is_toml {
        toml::from_str::<TomlBatch>(&contents)?.items
    } else {
        serde_json::from_str::<Vec<WorkItem>>(&contents)?
    };
    check_ids(&items)?;
    Ok(items)
}

/// True when `id` can be used as a single file name inside an output directory.
pub fn is_path_safe(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && !id.contains("..")
        && !id.contains(['/', '\\', '\0'])
}

/// Ids key the checkpoint and name output files, so they must be non-empty,
/// unique and free of path components.
pub fn check_ids(items: &[WorkItem]) -> Result<()> {
    let mut seen = HashSet::new();
    for item in items {
        if item.id.trim().is_empty() {
            return Err(PipelineError::config("work item ids must not be empty"));
        }
        if !is_path_safe(&item.id) {
            return Err(PipelineError::config(format!(
                "work item id {:?} must not contain path separators or '..'",
                item.id
            )));
        }
        if !seen.insert(item.id.as_str()) {
            return Err(PipelineError::config(format!(
                "duplicate work item id: {}",
                item.id
            )));
        }
    }
    Ok(())
}
