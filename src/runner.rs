//! Drives a single work item through a single stage.
//!
//! Both the sequential path and every parallel worker go through
//! [`StageRunner::process`], so skip rules, quota, retries and checkpoint
//! bookkeeping are identical regardless of how items are scheduled.

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, ItemOutcome, truncate_error};
use crate::error::{PipelineError, Result};
use crate::quota::QuotaController;
use crate::retry::{ErrorClass, RetryExecutor};
use crate::stage::{StageFailure, StageHandler, WorkItem};

/// Cooperative cancellation shared by every worker of a run.
///
/// Checked before each item starts; attempts already in flight finish.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A stage name together with the stage that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePosition {
    pub name: String,
    /// `None` for the last stage: success there completes the item.
    pub next: Option<String>,
}

/// What happened to one item in one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemResult {
    Completed { attempts: u32 },
    Failed {
        attempts: u32,
        class: Option<ErrorClass>,
        error: String,
    },
    /// Already completed in an earlier run.
    Skipped,
    /// Dry run: would have been executed.
    Planned,
    /// The run was cancelled before this item started.
    Cancelled,
}

/// A failed item as shown to the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedItem {
    pub id: String,
    pub stage: String,
    pub class: Option<ErrorClass>,
    pub error: String,
}

/// Per-stage counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Items that needed more than one attempt.
    pub retried: usize,
    pub planned: usize,
    pub cancelled: usize,
    pub failures: Vec<FailedItem>,
}

impl RunSummary {
    pub fn record(&mut self, id: &str, stage: &str, result: ItemResult) {
        match result {
            ItemResult::Completed { attempts } => {
                self.completed += 1;
                if attempts > 1 {
                    self.retried += 1;
                }
            }
            ItemResult::Failed {
                attempts,
                class,
                error,
            } => {
                self.failed += 1;
                if attempts > 1 {
                    self.retried += 1;
                }
                self.failures.push(FailedItem {
                    id: id.to_string(),
                    stage: stage.to_string(),
                    class,
                    error,
                });
            }
            ItemResult::Skipped => self.skipped += 1,
            ItemResult::Planned => self.planned += 1,
            ItemResult::Cancelled => self.cancelled += 1,
        }
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.retried += other.retried;
        self.planned += other.planned;
        self.cancelled += other.cancelled;
        self.failures.extend(other.failures);
    }

    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }
}

/// Shared machinery for running one item through one stage.
#[derive(Debug, Clone)]
pub struct StageRunner {
    retry: RetryExecutor,
    quota: Option<Arc<QuotaController>>,
    checkpoint: Arc<CheckpointStore>,
    cancel: CancelFlag,
    dry_run: bool,
}

impl StageRunner {
    pub fn new(retry: RetryExecutor, checkpoint: Arc<CheckpointStore>) -> Self {
        Self {
            retry,
            quota: None,
            checkpoint,
            cancel: CancelFlag::new(),
            dry_run: false,
        }
    }

    pub fn with_quota(mut self, quota: Option<Arc<QuotaController>>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Runs `item` through `stage` and records the result.
    ///
    /// Per-item failures are returned as [`ItemResult::Failed`]; only a
    /// checkpoint write failure is an `Err`, since progress can no longer be
    /// recorded.
    pub async fn process(
        &self,
        stage: &StagePosition,
        handler: &Arc<dyn StageHandler>,
        item: &WorkItem,
    ) -> Result<ItemResult> {
        if self.cancel.is_cancelled() {
            return Ok(ItemResult::Cancelled);
        }

        let status = self.checkpoint.item(&item.id).unwrap_or_default();
        if status.is_completed() || status.has_completed_stage(&stage.name) {
            debug!(item = %item.id, stage = %stage.name, "already done, skipping");
            return Ok(ItemResult::Skipped);
        }

        if self.dry_run {
            info!(item = %item.id, stage = %stage.name, "dry run: would execute");
            return Ok(ItemResult::Planned);
        }

        // An interrupted run resumes its attempt count; a failed one starts over.
        let prior_attempts = match (&status.current_stage, status.outcome) {
            (Some(current), ItemOutcome::InProgress) if *current == stage.name => {
                status.retry_count
            }
            _ => 0,
        };

        let write_error: OnceLock<PipelineError> = OnceLock::new();
        let outcome = self
            .retry
            .run_from(prior_attempts, |attempt| {
                let write_error = &write_error;
                let checkpoint = Arc::clone(&self.checkpoint);
                let stage_name = stage.name.clone();
                let quota = self.quota.clone();
                let handler = Arc::clone(handler);
                let item = item.clone();
                async move {
                    let recorded = checkpoint
                        .update_item_async(item.id.clone(), move |s| {
                            s.current_stage = Some(stage_name);
                            s.outcome = ItemOutcome::InProgress;
                            s.retry_count = attempt;
                            s.started_at.get_or_insert_with(Utc::now);
                        })
                        .await;
                    if let Err(e) = recorded {
                        let _ = write_error.set(e);
                        let failure = StageFailure::new("checkpoint write failed");
                        return Err(failure.with_class(ErrorClass::Permanent));
                    }
                    if let Some(quota) = quota {
                        quota.acquire().await;
                    }
                    invoke(handler, item).await
                }
            })
            .await;

        if let Some(e) = write_error.into_inner() {
            return Err(e);
        }

        match outcome.result {
            Ok(_) => {
                let next = stage.next.clone();
                let stage_name = stage.name.clone();
                self.checkpoint
                    .update_item_async(item.id.clone(), move |s| {
                        if !s.has_completed_stage(&stage_name) {
                            s.stages_completed.push(stage_name);
                        }
                        s.last_error = None;
                        match next {
                            Some(next) => {
                                s.current_stage = Some(next);
                                s.outcome = ItemOutcome::InProgress;
                                s.retry_count = 0;
                            }
                            None => {
                                s.outcome = ItemOutcome::Completed;
                                s.completed_at = Some(Utc::now());
                            }
                        }
                    })
                    .await?;
                info!(
                    item = %item.id,
                    stage = %stage.name,
                    attempts = outcome.attempts,
                    "stage completed"
                );
                Ok(ItemResult::Completed {
                    attempts: outcome.attempts,
                })
            }
            Err(failure) => {
                let error = truncate_error(&failure.to_string());
                let attempts = outcome.attempts;
                let recorded = error.clone();
                self.checkpoint
                    .update_item_async(item.id.clone(), move |s| {
                        s.outcome = ItemOutcome::Failed;
                        s.retry_count = attempts;
                        s.last_error = Some(recorded);
                    })
                    .await?;
                let class = outcome.class;
                warn!(
                    item = %item.id,
                    stage = %stage.name,
                    attempts = outcome.attempts,
                    class = %class.map_or_else(|| "none".to_string(), |c| c.to_string()),
                    error = %error,
                    "stage failed"
                );
                Ok(ItemResult::Failed {
                    attempts: outcome.attempts,
                    class,
                    error,
                })
            }
        }
    }
}

/// Calls the handler on its own task so a panic becomes an ordinary failure.
async fn invoke(handler: Arc<dyn StageHandler>, item: WorkItem) -> crate::stage::StageResult {
    let task = tokio::spawn(async move { handler.run(&item).await });
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            let failure = StageFailure::new(format!("stage panicked: {message}"));
            Err(failure.with_class(ErrorClass::Unknown))
        }
        Err(e) => {
            let failure = StageFailure::new(format!("stage task aborted: {e}"));
            Err(failure.with_class(ErrorClass::Unknown))
        }
    }
}
