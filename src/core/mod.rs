//! Core execution logic.
//!
//! This module contains:
//! - Engine: entry point, legacy import then run
//! - Executor: lock, plan and apply a pipeline definition
//! - Plan: per-change action from the latest audit entry
//! - Retry: backoff for transient audit failures

pub mod engine;
pub mod error;
pub mod executor;
pub mod plan;
pub mod result;
pub mod retry;

// Re-export commonly used types
pub use engine::Engine;
pub use error::PipelineError;
pub use executor::{Executor, FailurePolicy, RunOptions, StopHandle};
pub use plan::{resolve_action, ChangeAction, ExecutionPlan, PlannedChange};
pub use result::{ChangeOutcome, ChangeReport, PipelineResult, RunStatus};
pub use retry::{append_with_retry, RetryPolicy};
