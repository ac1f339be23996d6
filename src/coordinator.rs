//! Bounded worker pool for running one stage over many items.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::{PipelineError, Result};
use crate::runner::{RunSummary, StagePosition, StageRunner};
use crate::stage::{StageHandler, WorkItem};

/// Spreads items over at most `max_workers` concurrent workers.
///
/// Workers pull from a shared queue, so a slow item only occupies its own
/// worker. Item failures are recorded and never stop sibling items; a
/// checkpoint write failure cancels the remaining work and is returned.
#[derive(Debug, Clone)]
pub struct ParallelCoordinator {
    max_workers: usize,
    runner: Arc<StageRunner>,
}

impl ParallelCoordinator {
    pub fn new(max_workers: usize, runner: Arc<StageRunner>) -> Result<Self> {
        if max_workers == 0 {
            return Err(PipelineError::config("max_workers must be at least 1"));
        }
        Ok(Self {
            max_workers,
            runner,
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub async fn run(
        &self,
        stage: &StagePosition,
        handler: Arc<dyn StageHandler>,
        items: Vec<WorkItem>,
    ) -> Result<RunSummary> {
        if items.is_empty() {
            return Ok(RunSummary::default());
        }

        let workers = self.max_workers.min(items.len());
        info!(stage = %stage.name, items = items.len(), workers, "starting parallel stage");
        let queue = Arc::new(Mutex::new(VecDeque::from(items)));

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let runner = Arc::clone(&self.runner);
            let handler = Arc::clone(&handler);
            let stage = stage.clone();
            tasks.spawn(async move {
                let mut summary = RunSummary::default();
                loop {
                    let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                    let Some(item) = next else { break };
                    let result = runner.process(&stage, &handler, &item).await?;
                    summary.record(&item.id, &stage.name, result);
                }
                debug!(worker, processed = summary.processed(), "worker drained");
                Ok::<_, PipelineError>(summary)
            });
        }

        let mut summary = RunSummary::default();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| PipelineError::Worker(e.to_string()));
            match outcome.and_then(|r| r) {
                Ok(part) => summary.merge(part),
                Err(e) => {
                    error!(stage = %stage.name, error = %e, "worker stopped, cancelling run");
                    self.runner.cancel_flag().cancel();
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}
