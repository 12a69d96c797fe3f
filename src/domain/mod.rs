//! Domain types for the changeflow engine.
//!
//! This module contains the core data structures:
//! - Change: Change units, stages and the pipeline definition
//! - Audit: Immutable records of change outcomes

pub mod audit;
pub mod change;

// Re-export commonly used types
pub use audit::{AuditEntry, AuditState, ImportMarker, ParseAuditStateError};
pub use change::{
    compute_checksum, ChangeUnit, DefinitionError, ExecutionMode, PipelineDefinition,
    RecoveryStrategy, Stage,
};
