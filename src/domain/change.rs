//! Change units, stages and the pipeline definition artifact.
//!
//! Definitions are produced by a separate build step and loaded as data
//! (YAML or JSON). The engine never derives them from source markers; it
//! only parses, normalizes and validates them.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised while loading or validating a definition
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Failed to read definition file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse definition: {0}")]
    Parse(String),

    #[error("{0}")]
    Invalid(String),
}

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Version of the generated artifact
    #[serde(default = "default_version")]
    pub version: String,

    /// Stages, executed strictly in declared order
    pub stages: Vec<Stage>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineDefinition {
    /// Build a definition from stages already constructed in code
    pub fn new(stages: Vec<Stage>) -> Self {
        let mut definition = Self {
            version: default_version(),
            stages,
        };
        definition.normalize();
        definition
    }

    /// Load a definition from a YAML or JSON file (chosen by extension)
    pub fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path).map_err(|e| DefinitionError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse a definition from YAML content
    pub fn from_yaml(content: &str) -> Result<Self, DefinitionError> {
        let mut definition: Self =
            serde_yaml::from_str(content).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        definition.normalize();
        Ok(definition)
    }

    /// Parse a definition from JSON content
    pub fn from_json(content: &str) -> Result<Self, DefinitionError> {
        let mut definition: Self =
            serde_json::from_str(content).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        definition.normalize();
        Ok(definition)
    }

    /// Sort changes by order and derive missing checksums
    fn normalize(&mut self) {
        for stage in &mut self.stages {
            stage.changes.sort_by_key(|c| c.order);
            for change in &mut stage.changes {
                if change.checksum.is_empty() {
                    change.checksum = compute_checksum(&change.execute, change.rollback.as_deref());
                }
            }
        }
    }

    /// Validate the definition (ids, orders, concurrency limits)
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.stages.is_empty() {
            return Err(DefinitionError::Invalid(
                "Pipeline must have at least one stage".to_string(),
            ));
        }

        let mut stage_names = HashSet::new();
        let mut change_ids = HashSet::new();

        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                return Err(DefinitionError::Invalid(format!(
                    "Stage {} has an empty name",
                    i
                )));
            }
            if !stage_names.insert(stage.name.as_str()) {
                return Err(DefinitionError::Invalid(format!(
                    "Duplicate stage name '{}'",
                    stage.name
                )));
            }

            if stage.mode == ExecutionMode::BoundedParallel {
                match stage.max_concurrency {
                    Some(limit) if limit >= 1 => {}
                    _ => {
                        return Err(DefinitionError::Invalid(format!(
                            "Stage '{}' is bounded_parallel but declares no max_concurrency >= 1",
                            stage.name
                        )));
                    }
                }
            }

            let mut orders = HashSet::new();
            for change in &stage.changes {
                if change.id.is_empty() {
                    return Err(DefinitionError::Invalid(format!(
                        "Stage '{}' contains a change with an empty id",
                        stage.name
                    )));
                }
                if !change_ids.insert(change.id.as_str()) {
                    return Err(DefinitionError::Invalid(format!(
                        "Duplicate change id '{}'",
                        change.id
                    )));
                }
                if !orders.insert(change.order) {
                    return Err(DefinitionError::Invalid(format!(
                        "Change '{}' reuses order {} within stage '{}'",
                        change.id, change.order, stage.name
                    )));
                }
                if change.target_system.is_empty() {
                    return Err(DefinitionError::Invalid(format!(
                        "Change '{}' has no target_system",
                        change.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Iterate over every change with the stage that owns it, in run order
    pub fn changes(&self) -> impl Iterator<Item = (&Stage, &ChangeUnit)> {
        self.stages
            .iter()
            .flat_map(|stage| stage.changes.iter().map(move |change| (stage, change)))
    }

    /// Find a change and its stage by id
    pub fn find_change(&self, change_id: &str) -> Option<(&Stage, &ChangeUnit)> {
        self.changes().find(|(_, c)| c.id == change_id)
    }

    /// Get a stage by name
    pub fn get_stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Total number of change units
    pub fn change_count(&self) -> usize {
        self.stages.iter().map(|s| s.changes.len()).sum()
    }
}

/// An ordered group of change units sharing an execution mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name (unique within the definition)
    pub name: String,

    /// How the stage's changes are scheduled
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Concurrency limit for bounded_parallel stages
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Change units, kept sorted by order
    #[serde(default)]
    pub changes: Vec<ChangeUnit>,
}

impl Stage {
    /// Create a sequential stage
    pub fn sequential(name: impl Into<String>, mut changes: Vec<ChangeUnit>) -> Self {
        changes.sort_by_key(|c| c.order);
        Self {
            name: name.into(),
            mode: ExecutionMode::Sequential,
            max_concurrency: None,
            changes,
        }
    }

    /// Create a bounded parallel stage
    pub fn bounded_parallel(
        name: impl Into<String>,
        max_concurrency: usize,
        mut changes: Vec<ChangeUnit>,
    ) -> Self {
        changes.sort_by_key(|c| c.order);
        Self {
            name: name.into(),
            mode: ExecutionMode::BoundedParallel,
            max_concurrency: Some(max_concurrency),
            changes,
        }
    }

    /// Ordered change ids
    pub fn change_ids(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.id.as_str()).collect()
    }

    /// Effective number of changes that may run at once
    pub fn concurrency_limit(&self, override_limit: Option<usize>) -> usize {
        match self.mode {
            ExecutionMode::Sequential => 1,
            ExecutionMode::BoundedParallel => {
                let declared = self.max_concurrency.unwrap_or(1);
                override_limit.map_or(declared, |o| o.min(declared)).max(1)
            }
        }
    }
}

/// Stage scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One change at a time, ascending order
    Sequential,

    /// Up to `max_concurrency` changes at a time
    BoundedParallel,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Sequential
    }
}

/// What to do on the next run when a previous attempt left an uncertain state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Refuse to retry until an operator resolves the entry
    ManualIntervention,

    /// Retry regardless of the previous outcome
    AlwaysRetry,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self::ManualIntervention
    }
}

/// Smallest unit of an auditable change applied to a target system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeUnit {
    /// Globally unique id
    pub id: String,

    /// Position within the stage (unique per stage)
    pub order: u32,

    /// Registry id of the target system
    pub target_system: String,

    /// Whether the change should run inside a backend transaction
    #[serde(default)]
    pub transactional: bool,

    /// Content hash used for drift detection
    #[serde(default)]
    pub checksum: String,

    /// Operation reference interpreted by the target system
    pub execute: String,

    /// Optional compensating operation reference
    #[serde(default)]
    pub rollback: Option<String>,

    /// Author recorded in the audit trail
    #[serde(default = "default_author")]
    pub author: String,

    /// Recovery strategy for failed or interrupted attempts
    #[serde(default)]
    pub recovery: RecoveryStrategy,
}

fn default_author() -> String {
    "changeflow".to_string()
}

impl ChangeUnit {
    /// Create a non-transactional change with a derived checksum
    pub fn new(
        id: impl Into<String>,
        order: u32,
        target_system: impl Into<String>,
        execute: impl Into<String>,
    ) -> Self {
        let execute = execute.into();
        let checksum = compute_checksum(&execute, None);
        Self {
            id: id.into(),
            order,
            target_system: target_system.into(),
            transactional: false,
            checksum,
            execute,
            rollback: None,
            author: default_author(),
            recovery: RecoveryStrategy::default(),
        }
    }

    /// Mark the change as transactional
    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    /// Override the checksum
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = checksum.into();
        self
    }

    /// Attach a rollback operation
    pub fn with_rollback(mut self, rollback: impl Into<String>) -> Self {
        self.rollback = Some(rollback.into());
        self
    }

    /// Set the recovery strategy
    pub fn with_recovery(mut self, recovery: RecoveryStrategy) -> Self {
        self.recovery = recovery;
        self
    }

    /// Set the author
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }
}

/// Checksum of a change's operations (first 16 hex chars of SHA256)
pub fn compute_checksum(execute: &str, rollback: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(execute.as_bytes());
    if let Some(rollback) = rollback {
        hasher.update(b"\0");
        hasher.update(rollback.as_bytes());
    }
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DEFINITION_YAML: &str = r#"
version: "3"
stages:
  - name: init
    changes:
      - id: create-users
        order: 2
        target_system: main-db
        transactional: true
        execute: CREATE TABLE users (id INTEGER PRIMARY KEY)
        rollback: DROP TABLE users
      - id: create-schema
        order: 1
        target_system: main-db
        checksum: abc
        execute: CREATE TABLE meta (k TEXT)
  - name: backfill
    mode: bounded_parallel
    max_concurrency: 4
    changes:
      - id: seed-a
        order: 1
        target_system: kv
        execute: set a 1
        recovery: always_retry
"#;

    #[test]
    fn test_definition_parsing() {
        let definition = PipelineDefinition::from_yaml(TEST_DEFINITION_YAML).unwrap();

        assert_eq!(definition.version, "3");
        assert_eq!(definition.stages.len(), 2);
        assert_eq!(definition.change_count(), 3);

        // Sorted by order on load
        assert_eq!(
            definition.stages[0].change_ids(),
            vec!["create-schema", "create-users"]
        );
        assert_eq!(definition.stages[1].mode, ExecutionMode::BoundedParallel);
        assert_eq!(
            definition.stages[1].changes[0].recovery,
            RecoveryStrategy::AlwaysRetry
        );
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_checksum_derived_when_missing() {
        let definition = PipelineDefinition::from_yaml(TEST_DEFINITION_YAML).unwrap();
        let (_, explicit) = definition.find_change("create-schema").unwrap();
        let (_, derived) = definition.find_change("create-users").unwrap();

        assert_eq!(explicit.checksum, "abc");
        assert_eq!(
            derived.checksum,
            compute_checksum(
                "CREATE TABLE users (id INTEGER PRIMARY KEY)",
                Some("DROP TABLE users")
            )
        );
        assert_eq!(derived.checksum.len(), 16);
    }

    #[test]
    fn test_json_definition() {
        let json = r#"{"stages":[{"name":"only","changes":[
            {"id":"c1","order":1,"target_system":"kv","execute":"set x 1"}]}]}"#;
        let definition = PipelineDefinition::from_json(json).unwrap();
        assert_eq!(definition.version, "1");
        assert_eq!(definition.stages[0].changes[0].author, "changeflow");
    }

    #[test]
    fn test_duplicate_change_id_rejected() {
        let definition = PipelineDefinition::new(vec![
            Stage::sequential("a", vec![ChangeUnit::new("c1", 1, "kv", "set x 1")]),
            Stage::sequential("b", vec![ChangeUnit::new("c1", 1, "kv", "set y 1")]),
        ]);
        let err = definition.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate change id 'c1'"));
    }

    #[test]
    fn test_duplicate_order_rejected() {
        let definition = PipelineDefinition::new(vec![Stage::sequential(
            "a",
            vec![
                ChangeUnit::new("c1", 1, "kv", "set x 1"),
                ChangeUnit::new("c2", 1, "kv", "set y 1"),
            ],
        )]);
        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_parallel_stage_requires_limit() {
        let mut stage = Stage::bounded_parallel("p", 2, vec![]);
        stage.max_concurrency = Some(0);
        let definition = PipelineDefinition::new(vec![stage]);
        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_concurrency_limit_override() {
        let stage = Stage::bounded_parallel("p", 4, vec![]);
        assert_eq!(stage.concurrency_limit(None), 4);
        assert_eq!(stage.concurrency_limit(Some(2)), 2);
        assert_eq!(stage.concurrency_limit(Some(10)), 4);
        assert_eq!(Stage::sequential("s", vec![]).concurrency_limit(Some(8)), 1);
    }

    #[test]
    fn test_checksum_consistency() {
        assert_eq!(compute_checksum("a", None), compute_checksum("a", None));
        assert_ne!(compute_checksum("a", None), compute_checksum("a", Some("b")));
    }
}
