//! changeflow - Audited change-as-code execution engine
//!
//! Applies ordered, versioned changes ("change units") to target systems
//! exactly once, recording every outcome in an append-only audit log.
//!
//! # Architecture
//!
//! The audit log is the source of truth:
//! - Every execution attempt is recorded as an immutable entry
//! - The latest entry per change decides whether it runs again
//! - A lease-based lock keeps concurrent instances from interleaving
//! - Transactional targets commit the change and its audit entry together
//!
//! # Modules
//!
//! - `adapters`: Target systems (in-memory, SQLite, shell)
//! - `audit`: Audit stores (in-memory, JSONL, SQLite) and manual fixes
//! - `core`: Planning, execution, retries and run results
//! - `domain`: Data structures (ChangeUnit, Stage, AuditEntry)
//! - `legacy`: One-shot import of a previous tool's history
//! - `lock`: Distributed lease lock with heartbeat
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Apply a pipeline definition
//! changeflow run pipeline.yaml
//!
//! # Inspect changes left Pending or Failed
//! changeflow audit issues
//!
//! # Mark an interrupted change as applied
//! changeflow audit fix <change-id> --resolution applied
//! ```

pub mod adapters;
pub mod audit;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod legacy;
pub mod lock;

// Re-export main types at crate root for convenience
pub use adapters::{TargetSystem, TargetSystemRegistry};
pub use audit::{AuditStore, InMemoryAuditStore, JsonlAuditStore, SqliteAuditStore};
pub use crate::core::{Engine, Executor, PipelineError, PipelineResult, RunOptions};
pub use domain::{AuditEntry, AuditState, ChangeUnit, PipelineDefinition, Stage};
pub use lock::{DistributedLock, LockConfig, LockStore};
