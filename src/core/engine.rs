//! Engine entry point: optional legacy import, then the pipeline run.

use std::sync::Arc;

use tracing::{error, info};
use uuid::Uuid;

use crate::domain::PipelineDefinition;
use crate::legacy::{ImportResult, LegacyAuditSource, LegacyImporter};

use super::error::PipelineError;
use super::executor::{Executor, RunOptions};
use super::result::{PipelineResult, RunRecorder};

/// Composition of an executor and an optional legacy history source
pub struct Engine {
    executor: Executor,
    legacy: Option<Arc<dyn LegacyAuditSource>>,
}

impl Engine {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            legacy: None,
        }
    }

    /// Legacy history imported before runs that ask for it
    pub fn with_legacy_source(mut self, source: Arc<dyn LegacyAuditSource>) -> Self {
        self.legacy = Some(source);
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Import the configured legacy source, if any
    pub async fn import_legacy(
        &self,
        definition: Option<&PipelineDefinition>,
    ) -> Result<Option<ImportResult>, PipelineError> {
        let Some(source) = &self.legacy else {
            return Ok(None);
        };

        let importer = LegacyImporter::new(Arc::clone(self.executor.audit()));
        let result = importer
            .import_if_needed(source.as_ref(), definition)
            .await?;
        Ok(Some(result))
    }

    /// Run a pipeline, importing legacy history first when requested
    pub async fn run_pipeline(
        &self,
        definition: &PipelineDefinition,
        options: &RunOptions,
    ) -> PipelineResult {
        if options.legacy_import {
            match self.import_legacy(Some(definition)).await {
                Ok(Some(result)) => info!(?result, "Legacy import finished"),
                Ok(None) => info!("Legacy import requested but no legacy source configured"),
                Err(e) => {
                    error!(error = %e, "Legacy import failed, run aborted");
                    return RunRecorder::new(Uuid::new_v4().to_string(), definition).finish(Some(e));
                }
            }
        }

        self.executor.run(definition, options).await
    }
}
