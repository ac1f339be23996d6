//! Work items and the stage callback contract.
//!
//! A stage is any [`StageHandler`]: it receives one [`WorkItem`] and returns a
//! [`StageResult`]. The engine never looks inside the payload or the output;
//! it only reads the [`StageFailure`] to decide whether another attempt is
//! worthwhile.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::retry::ErrorClass;

/// One unit of batch work (e.g. a paper).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier, unique within a batch.
    pub id: String,
    /// Caller-owned data handed to every stage unchanged.
    #[serde(default)]
    pub payload: Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// A failed stage attempt, as reported by the stage itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StageFailure {
    pub message: String,
    /// HTTP status code of the failing external call, when there was one.
    pub status: Option<u16>,
    /// Minimum wait requested by the external system (e.g. `Retry-After`).
    pub retry_after: Option<Duration>,
    /// Fixed classification that bypasses status and message matching.
    pub class: Option<ErrorClass>,
}

impl StageFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
            class: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = Some(class);
        self
    }
}

/// Outcome of one stage attempt. The success value is opaque to the engine.
pub type StageResult = Result<Option<Value>, StageFailure>;

/// A processing step applied to one work item at a time.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, item: &WorkItem) -> StageResult;
}

/// Adapts an async closure into a [`StageHandler`].
pub struct FnStage<F>(F);

impl<F> FnStage<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> StageHandler for FnStage<F>
where
    F: Fn(WorkItem) -> Fut + Send + Sync,
    Fut: Future<Output = StageResult> + Send,
{
    async fn run(&self, item: &WorkItem) -> StageResult {
        (self.0)(item.clone()).await
    }
}

/// A stage handler together with the name it is checkpointed under.
#[derive(Clone)]
pub struct NamedStage {
    pub name: String,
    pub handler: Arc<dyn StageHandler>,
}

impl NamedStage {
    pub fn new(name: impl Into<String>, handler: Arc<dyn StageHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StageResult> + Send + 'static,
    {
        Self::new(name, Arc::new(FnStage::new(f)))
    }
}

impl fmt::Debug for NamedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedStage").field("name", &self.name).finish()
    }
}
