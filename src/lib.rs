//! Batch pipeline engine for LLM-driven literature review.
//!
//! Work items flow through an ordered list of named stages. Every transition
//! is written to a crash-safe checkpoint, failures are classified and retried
//! with backoff, and external calls share a token-bucket quota.

pub mod anthropic;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod items;
pub mod llm_stage;
pub mod logging;
pub mod orchestrator;
pub mod quota;
pub mod retry;
pub mod runner;
pub mod stage;
pub mod ui;

pub use checkpoint::{Checkpoint, CheckpointStore, ItemOutcome, ItemStatus};
pub use config::PipelineConfig;
pub use coordinator::ParallelCoordinator;
pub use error::{PipelineError, Result};
pub use orchestrator::{PipelineOrchestrator, RunReport};
pub use quota::QuotaController;
pub use retry::{ErrorClass, RetryExecutor, RetryMode, RetryPolicy};
pub use runner::{CancelFlag, StageRunner};
pub use stage::{FnStage, NamedStage, StageFailure, StageHandler, StageResult, WorkItem};
