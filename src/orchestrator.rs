use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, ItemOutcome, ItemStatus};
use crate::config::PipelineConfig;
use crate::coordinator::ParallelCoordinator;
use crate::error::{PipelineError, Result};
use crate::quota::{QuotaController, QuotaStats};
use crate::retry::{ErrorClass, RetryExecutor};
use crate::runner::{CancelFlag, FailedItem, RunSummary, StagePosition, StageRunner};
use crate::stage::{NamedStage, WorkItem};

/// Counters for one stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub summary: RunSummary,
}

/// Everything an operator needs after a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub cancelled: bool,
    pub stages: Vec<StageReport>,
    /// Items of this batch by final checkpoint outcome.
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    /// Items that needed more than one attempt in some stage.
    pub retried: usize,
    pub failures: Vec<FailedItem>,
    pub quota: Option<QuotaStats>,
}

impl RunReport {
    pub fn planned(&self) -> usize {
        self.stages.iter().map(|s| s.summary.planned).sum()
    }

    /// True when every item ended Completed or Failed.
    pub fn is_settled(&self) -> bool {
        self.in_progress == 0
    }
}

/// Drives a batch through a fixed, ordered list of named stages.
///
/// Stages run one after another; within a stage, items run either one at a
/// time or through a [`ParallelCoordinator`]. An item only enters a stage after
/// its previous stage's result has been written to the checkpoint.
pub struct PipelineOrchestrator {
    stages: Vec<NamedStage>,
    checkpoint: Arc<CheckpointStore>,
    retry: RetryExecutor,
    quota: Option<Arc<QuotaController>>,
    /// `Some(n)` runs each stage on `n` concurrent workers.
    parallel_workers: Option<usize>,
    dry_run: bool,
    cancel: CancelFlag,
}

impl PipelineOrchestrator {
    /// Creates a sequential orchestrator over `stages`, in order.
    pub fn new(
        stages: Vec<NamedStage>,
        checkpoint: Arc<CheckpointStore>,
        retry: RetryExecutor,
    ) -> Result<Self> {
        if stages.is_empty() {
            return Err(PipelineError::config("at least one stage is required"));
        }
        let mut seen = HashSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(PipelineError::config("stage names must not be empty"));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineError::config(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
        }
        Ok(Self {
            stages,
            checkpoint,
            retry,
            quota: None,
            parallel_workers: None,
            dry_run: false,
            cancel: CancelFlag::new(),
        })
    }

    /// Builds an orchestrator from validated configuration.
    pub fn from_config(
        config: &PipelineConfig,
        stages: Vec<NamedStage>,
        checkpoint: Arc<CheckpointStore>,
    ) -> Result<Self> {
        config.validate()?;
        let retry = RetryExecutor::new(config.retry.to_policy()).with_mode(config.retry_mode());
        let quota = if config.enable_quota_management {
            Some(Arc::new(QuotaController::new(
                config.quota.rate,
                config.quota.period(),
            )?))
        } else {
            None
        };
        let orchestrator = Self::new(stages, checkpoint, retry)?
            .with_quota(quota)
            .with_dry_run(config.dry_run);
        if config.enable_parallel_processing {
            orchestrator.with_parallelism(config.max_workers)
        } else {
            Ok(orchestrator)
        }
    }

    pub fn with_quota(mut self, quota: Option<Arc<QuotaController>>) -> Self {
        self.quota = quota;
        self
    }

    /// Switches to parallel execution with `max_workers` workers per stage.
    pub fn with_parallelism(mut self, max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Err(PipelineError::config("max_workers must be at least 1"));
        }
        self.parallel_workers = Some(max_workers);
        Ok(self)
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Index of the stage an item is waiting on; `stages.len()` once completed.
    fn position_of(&self, id: &str, status: Option<&ItemStatus>) -> usize {
        let Some(status) = status else { return 0 };
        if status.is_completed() {
            return self.stages.len();
        }
        match status.current_stage.as_deref() {
            None => 0,
            Some(name) => self.stage_index(name).unwrap_or_else(|| {
                warn!(
                    item = id,
                    stage = name,
                    "checkpoint names an unknown stage, restarting item"
                );
                0
            }),
        }
    }

    /// Runs every stage over `items`, skipping work the checkpoint already records.
    pub async fn run(&self, items: &[WorkItem]) -> Result<RunReport> {
        let store = self.working_store();
        self.execute(store, items).await
    }

    /// Re-reads the checkpoint file and continues where each item left off.
    pub async fn resume(&self, items: &[WorkItem]) -> Result<RunReport> {
        self.checkpoint.load()?;
        info!(items = items.len(), "resuming from checkpoint");
        self.run(items).await
    }

    /// Rewinds every item that reached `stage` back to it, then resumes.
    pub async fn resume_from_stage(&self, stage: &str, items: &[WorkItem]) -> Result<RunReport> {
        let index = self
            .stage_index(stage)
            .ok_or_else(|| PipelineError::UnknownStage(stage.to_string()))?;
        self.checkpoint.load()?;
        let store = self.working_store();

        let snapshot = store.snapshot();
        let rewind: Vec<&str> = items
            .iter()
            .map(|i| i.id.as_str())
            .filter(|id| {
                let status = snapshot.item(id);
                status.is_some() && self.position_of(id, status) >= index
            })
            .collect();
        let dropped: HashSet<&str> = self.stages[index..].iter().map(|s| s.name.as_str()).collect();

        info!(stage, items = rewind.len(), "rewinding items");
        store.update_all(rewind.iter().copied(), |s| {
            s.stages_completed.retain(|name| !dropped.contains(name.as_str()));
            s.current_stage = Some(stage.to_string());
            s.outcome = ItemOutcome::InProgress;
            s.retry_count = 0;
            s.last_error = None;
            s.completed_at = None;
        })?;

        self.execute(store, items).await
    }

    // Dry runs work on a detached copy so nothing reaches the disk.
    fn working_store(&self) -> Arc<CheckpointStore> {
        if self.dry_run {
            Arc::new(self.checkpoint.detached())
        } else {
            Arc::clone(&self.checkpoint)
        }
    }

    async fn execute(&self, store: Arc<CheckpointStore>, items: &[WorkItem]) -> Result<RunReport> {
        let runner = Arc::new(
            StageRunner::new(self.retry.clone(), Arc::clone(&store))
                .with_quota(self.quota.clone())
                .with_cancel(self.cancel.clone())
                .with_dry_run(self.dry_run),
        );
        let coordinator = match self.parallel_workers {
            Some(workers) => Some(ParallelCoordinator::new(workers, Arc::clone(&runner))?),
            None => None,
        };

        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        let by_id: HashMap<&str, &WorkItem> = items.iter().map(|i| (i.id.as_str(), i)).collect();
        let mut halted: HashSet<String> = HashSet::new();
        let mut reports = Vec::with_capacity(self.stages.len());

        for (index, stage) in self.stages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let position = StagePosition {
                name: stage.name.clone(),
                next: self.stages.get(index + 1).map(|s| s.name.clone()),
            };

            let snapshot = store.snapshot();
            let work: Vec<WorkItem> = store
                .incomplete_items(ids.iter().copied())
                .into_iter()
                .filter(|id| !halted.contains(id))
                .filter(|id| self.position_of(id, snapshot.item(id)) <= index)
                .filter_map(|id| by_id.get(id.as_str()).map(|item| (*item).clone()))
                .collect();

            info!(
                stage = %stage.name,
                items = work.len(),
                parallel = coordinator.is_some(),
                dry_run = self.dry_run,
                "stage starting"
            );

            let summary = match &coordinator {
                Some(coordinator) => {
                    coordinator
                        .run(&position, Arc::clone(&stage.handler), work)
                        .await?
                }
                None => {
                    let mut summary = RunSummary::default();
                    for item in &work {
                        let result = runner.process(&position, &stage.handler, item).await?;
                        summary.record(&item.id, &stage.name, result);
                    }
                    summary
                }
            };

            for failure in &summary.failures {
                halted.insert(failure.id.clone());
            }
            info!(
                stage = %stage.name,
                completed = summary.completed,
                failed = summary.failed,
                skipped = summary.skipped,
                planned = summary.planned,
                "stage finished"
            );
            reports.push(StageReport {
                stage: stage.name.clone(),
                summary,
            });
        }

        Ok(self.report(&store, &ids, reports))
    }

    fn report(&self, store: &CheckpointStore, ids: &[&str], stages: Vec<StageReport>) -> RunReport {
        let snapshot = store.snapshot();
        let classes: HashMap<String, Option<ErrorClass>> = stages
            .iter()
            .flat_map(|s| s.summary.failures.iter())
            .map(|f| (f.id.clone(), f.class))
            .collect();

        let mut report = RunReport {
            run_id: snapshot.run_id,
            dry_run: self.dry_run,
            cancelled: self.cancel.is_cancelled(),
            completed: 0,
            failed: 0,
            in_progress: 0,
            retried: stages.iter().map(|s| s.summary.retried).sum(),
            failures: Vec::new(),
            quota: self.quota.as_ref().map(|q| q.stats()),
            stages,
        };

        let mut seen = HashSet::new();
        for id in ids.iter().copied().filter(|id| seen.insert(*id)) {
            match snapshot.item(id).map(|s| (s.outcome, s)) {
                Some((ItemOutcome::Completed, _)) => report.completed += 1,
                Some((ItemOutcome::Failed, status)) => {
                    report.failed += 1;
                    report.failures.push(FailedItem {
                        id: id.to_string(),
                        stage: status.current_stage.clone().unwrap_or_default(),
                        class: classes.get(id).copied().flatten(),
                        error: status.last_error.clone().unwrap_or_default(),
                    });
                }
                _ => report.in_progress += 1,
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::retry::RetryPolicy;
    use crate::stage::StageFailure;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }

    fn memory_store() -> Arc<CheckpointStore> {
        Arc::new(CheckpointStore::in_memory(Checkpoint::default()))
    }

    fn batch(ids: &[&str]) -> Vec<WorkItem> {
        ids.iter()
            .map(|id| WorkItem::new(*id, json!({ "title": format!("paper {id}") })))
            .collect()
    }

    /// A stage that records which items it saw.
    fn recording_stage(name: &str, log: Arc<Mutex<Vec<String>>>) -> NamedStage {
        let stage = name.to_string();
        NamedStage::from_fn(name, move |item: WorkItem| {
            let log = Arc::clone(&log);
            let stage = stage.clone();
            async move {
                log.lock().unwrap().push(format!("{stage}:{}", item.id));
                Ok(None)
            }
        })
    }

    #[test]
    fn rejects_bad_stage_lists() {
        let ok = || NamedStage::from_fn("a", |_| async { Ok(None) });
        let retry = || RetryExecutor::new(policy(1));

        assert!(PipelineOrchestrator::new(vec![], memory_store(), retry()).is_err());
        assert!(PipelineOrchestrator::new(vec![ok(), ok()], memory_store(), retry()).is_err());
        let blank = NamedStage::from_fn("  ", |_| async { Ok(None) });
        assert!(PipelineOrchestrator::new(vec![blank], memory_store(), retry()).is_err());
        let orch = PipelineOrchestrator::new(vec![ok()], memory_store(), retry()).unwrap();
        assert!(orch.with_parallelism(0).is_err());
    }

    #[tokio::test]
    async fn scenario_a_all_items_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = Arc::new(CheckpointStore::open(&path).unwrap());
        let stage = NamedStage::from_fn("judge", |_| async { Ok(Some(json!("ok"))) });
        let orch =
            PipelineOrchestrator::new(vec![stage], store, RetryExecutor::new(policy(3))).unwrap();

        let report = orch.run(&batch(&["p1", "p2", "p3"])).await.unwrap();
        assert_eq!(report.completed, 3);
        assert_eq!(report.failed, 0);
        assert!(report.is_settled());

        let on_disk = CheckpointStore::read(&path).unwrap();
        assert_eq!(on_disk.items.len(), 3);
        assert!(on_disk.items.values().all(|s| s.outcome == ItemOutcome::Completed));
    }

    #[tokio::test]
    async fn scenario_b_completed_items_are_skipped_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        {
            let seed = CheckpointStore::open(&path).unwrap();
            seed.update_item("p1", |s| {
                s.current_stage = Some("judge".into());
                s.stages_completed = vec!["judge".into()];
                s.outcome = ItemOutcome::Completed;
            })
            .unwrap();
        }

        let store = Arc::new(CheckpointStore::open(&path).unwrap());
        let stage = NamedStage::from_fn("judge", |item: WorkItem| async move {
            if item.id == "p1" {
                panic!("p1 must not be processed again");
            }
            Ok(None)
        });
        let orch =
            PipelineOrchestrator::new(vec![stage], store, RetryExecutor::new(policy(3))).unwrap();

        let report = orch.resume(&batch(&["p1", "p2"])).await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.stages[0].summary.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_c_transient_then_success() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let stage = NamedStage::from_fn("judge", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                let mut n = counter.lock().unwrap();
                *n += 1;
                if *n < 3 {
                    Err(StageFailure::new("request timed out"))
                } else {
                    Ok(None)
                }
            }
        });
        let store = memory_store();
        let orch = PipelineOrchestrator::new(
            vec![stage],
            Arc::clone(&store),
            RetryExecutor::new(policy(3)),
        )
        .unwrap();

        let start = Instant::now();
        let report = orch.run(&batch(&["p1"])).await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.retried, 1);
        let status = store.item("p1").unwrap();
        assert_eq!(status.outcome, ItemOutcome::Completed);
        assert_eq!(status.retry_count, 3);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_makes_exactly_one_attempt() {
        let stage = NamedStage::from_fn("judge", |_| async {
            Err(StageFailure::new("Forbidden").with_status(403))
        });
        let store = memory_store();
        let orch = PipelineOrchestrator::new(
            vec![stage],
            Arc::clone(&store),
            RetryExecutor::new(policy(5)),
        )
        .unwrap();

        let report = orch.run(&batch(&["p1"])).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].class, Some(ErrorClass::Permanent));
        assert_eq!(report.failures[0].stage, "judge");
        assert_eq!(store.item("p1").unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stages_run_in_order_and_failed_items_stop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let extract = recording_stage("extract", Arc::clone(&log));
        let judge_log = Arc::clone(&log);
        let judge = NamedStage::from_fn("judge", move |item: WorkItem| {
            let log = Arc::clone(&judge_log);
            async move {
                log.lock().unwrap().push(format!("judge:{}", item.id));
                if item.id == "p2" {
                    Err(StageFailure::new("malformed request").with_status(400))
                } else {
                    Ok(None)
                }
            }
        });
        let sync = recording_stage("sync", Arc::clone(&log));

        let store = memory_store();
        let orch = PipelineOrchestrator::new(
            vec![extract, judge, sync],
            Arc::clone(&store),
            RetryExecutor::new(policy(3)),
        )
        .unwrap();

        let report = orch.run(&batch(&["p1", "p2"])).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["extract:p1", "extract:p2", "judge:p1", "judge:p2", "sync:p1"]
        );

        let p1 = store.item("p1").unwrap();
        assert_eq!(p1.stages_completed, vec!["extract", "judge", "sync"]);
        let p2 = store.item("p2").unwrap();
        assert_eq!(p2.outcome, ItemOutcome::Failed);
        assert_eq!(p2.current_stage.as_deref(), Some("judge"));
        assert_eq!(p2.stages_completed, vec!["extract"]);
    }

    #[tokio::test(start_paused = true)]
    async fn each_stage_gets_its_own_attempt_budget() {
        let calls = Arc::new(Mutex::new(HashMap::<String, u32>::new()));
        let flaky = |name: &str, failures: u32| {
            let calls = Arc::clone(&calls);
            let stage = name.to_string();
            NamedStage::from_fn(name, move |_| {
                let calls = Arc::clone(&calls);
                let stage = stage.clone();
                async move {
                    let mut calls = calls.lock().unwrap();
                    let n = calls.entry(stage).or_default();
                    *n += 1;
                    if *n <= failures {
                        Err(StageFailure::new("connection reset by peer"))
                    } else {
                        Ok(None)
                    }
                }
            })
        };
        let store = memory_store();
        let orch = PipelineOrchestrator::new(
            vec![flaky("extract", 2), flaky("judge", 2)],
            Arc::clone(&store),
            RetryExecutor::new(policy(3)),
        )
        .unwrap();

        let report = orch.run(&batch(&["p1"])).await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(calls.lock().unwrap().get("judge"), Some(&3));
        let p1 = store.item("p1").unwrap();
        assert_eq!(p1.stages_completed, vec!["extract", "judge"]);
        assert_eq!(p1.retry_count, 3);
    }

    #[tokio::test]
    async fn resume_continues_from_current_stage() {
        let store = memory_store();
        store
            .update_item("p1", |s| {
                s.current_stage = Some("judge".into());
                s.stages_completed = vec!["extract".into()];
            })
            .unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let orch = PipelineOrchestrator::new(
            vec![
                recording_stage("extract", Arc::clone(&log)),
                recording_stage("judge", Arc::clone(&log)),
            ],
            Arc::clone(&store),
            RetryExecutor::new(policy(3)),
        )
        .unwrap();

        let report = orch.resume(&batch(&["p1", "p2"])).await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["extract:p2", "judge:p1", "judge:p2"]
        );
    }

    #[tokio::test]
    async fn resume_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = Arc::new(CheckpointStore::open(&path).unwrap());
        let log = Arc::new(Mutex::new(Vec::new()));
        let orch = PipelineOrchestrator::new(
            vec![recording_stage("judge", Arc::clone(&log))],
            store,
            RetryExecutor::new(policy(3)),
        )
        .unwrap();
        let items = batch(&["p1", "p2", "p3"]);

        orch.resume(&items).await.unwrap();
        let first = CheckpointStore::read(&path).unwrap();
        let calls_after_first = log.lock().unwrap().len();

        orch.resume(&items).await.unwrap();
        let second = CheckpointStore::read(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(log.lock().unwrap().len(), calls_after_first);
    }

    #[tokio::test]
    async fn resume_from_stage_rewinds_later_stages() {
        let store = memory_store();
        store
            .update_item("p1", |s| {
                s.current_stage = Some("sync".into());
                s.stages_completed = vec!["extract".into(), "judge".into(), "sync".into()];
                s.outcome = ItemOutcome::Completed;
                s.retry_count = 2;
            })
            .unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let orch = PipelineOrchestrator::new(
            vec![
                recording_stage("extract", Arc::clone(&log)),
                recording_stage("judge", Arc::clone(&log)),
                recording_stage("sync", Arc::clone(&log)),
            ],
            Arc::clone(&store),
            RetryExecutor::new(policy(3)),
        )
        .unwrap();

        let report = orch.resume_from_stage("judge", &batch(&["p1"])).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(*log.lock().unwrap(), vec!["judge:p1", "sync:p1"]);
        let p1 = store.item("p1").unwrap();
        assert_eq!(p1.stages_completed, vec!["extract", "judge", "sync"]);
        assert_eq!(p1.retry_count, 1);
    }

    #[tokio::test]
    async fn resume_from_unknown_stage_is_an_error() {
        let orch = PipelineOrchestrator::new(
            vec![NamedStage::from_fn("judge", |_| async { Ok(None) })],
            memory_store(),
            RetryExecutor::new(policy(3)),
        )
        .unwrap();
        let err = orch.resume_from_stage("nope", &batch(&["p1"])).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStage(_)));
    }

    #[tokio::test]
    async fn dry_run_plans_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = Arc::new(CheckpointStore::open(&path).unwrap());
        let stage = |name: &str| {
            NamedStage::from_fn(name, |_: WorkItem| async {
                panic!("dry run must not call stages")
            })
        };
        let orch = PipelineOrchestrator::new(
            vec![stage("extract"), stage("judge")],
            store,
            RetryExecutor::new(policy(3)),
        )
        .unwrap()
        .with_dry_run(true);

        let report = orch.run(&batch(&["p1", "p2"])).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.planned(), 4);
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_run_isolates_failures() {
        let stage = NamedStage::from_fn("judge", |item: WorkItem| async move {
            if item.id == "p7" {
                Err(StageFailure::new("authentication failed"))
            } else {
                Ok(Some(Value::Bool(true)))
            }
        });
        let ids: Vec<String> = (0..20).map(|i| format!("p{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let store = memory_store();
        let orch = PipelineOrchestrator::new(
            vec![stage],
            Arc::clone(&store),
            RetryExecutor::new(policy(3)),
        )
        .unwrap()
        .with_parallelism(4)
        .unwrap();

        let report = orch.run(&batch(&refs)).await.unwrap();
        assert_eq!(report.completed, 19);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].id, "p7");
        assert_eq!(report.failures[0].error, "authentication failed");
    }

    #[tokio::test]
    async fn cancelled_run_stops_between_items() {
        let orch = PipelineOrchestrator::new(
            vec![NamedStage::from_fn("judge", |_| async { Ok(None) })],
            memory_store(),
            RetryExecutor::new(policy(3)),
        )
        .unwrap();
        orch.cancel_flag().cancel();

        let report = orch.run(&batch(&["p1", "p2"])).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.in_progress, 2);
        assert!(!report.is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn quota_stats_are_reported() {
        let quota = Arc::new(QuotaController::new(2.0, Duration::from_secs(2)).unwrap());
        let orch = PipelineOrchestrator::new(
            vec![NamedStage::from_fn("judge", |_| async { Ok(None) })],
            memory_store(),
            RetryExecutor::new(policy(3)),
        )
        .unwrap()
        .with_quota(Some(quota));

        let start = Instant::now();
        let report = orch.run(&batch(&["p1", "p2", "p3", "p4"])).await.unwrap();
        assert_eq!(report.completed, 4);
        let stats = report.quota.unwrap();
        assert_eq!(stats.consumed, 4);
        assert!(stats.throttled >= 1);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
