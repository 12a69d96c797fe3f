//! Where legacy records are read from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::record::LegacyRecord;
use super::ImportError;

/// Read-only access to a legacy audit history
#[async_trait]
pub trait LegacyAuditSource: Send + Sync {
    /// Name recorded in the import marker
    fn name(&self) -> &str;

    /// Every legacy record, in stored order
    async fn read_history(&self) -> Result<Vec<LegacyRecord>, ImportError>;
}

/// Legacy records exported as JSON lines
pub struct JsonlLegacySource {
    name: String,
    path: PathBuf,
}

impl JsonlLegacySource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_error(&self, message: impl Into<String>) -> ImportError {
        ImportError::Read {
            source_name: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl LegacyAuditSource for JsonlLegacySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_history(&self) -> Result<Vec<LegacyRecord>, ImportError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .map_err(|e| self.read_error(format!("{}: {}", self.path.display(), e)))?;
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        let mut line_no = 0usize;

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| self.read_error(e.to_string()))?
        {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .map_err(|e| self.read_error(format!("line {}: {}", line_no, e)))?;
            records.push(record);
        }

        Ok(records)
    }
}

/// Legacy records held in memory
pub struct InMemoryLegacySource {
    name: String,
    records: Vec<LegacyRecord>,
}

impl InMemoryLegacySource {
    pub fn new(name: impl Into<String>, records: Vec<LegacyRecord>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }
}

#[async_trait]
impl LegacyAuditSource for InMemoryLegacySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_history(&self) -> Result<Vec<LegacyRecord>, ImportError> {
        Ok(self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_empty_history() {
        let temp = TempDir::new().unwrap();
        let source = JsonlLegacySource::new("mongock", temp.path().join("none.jsonl"));
        assert!(source.read_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_line_reports_position() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("legacy.jsonl");
        std::fs::write(
            &path,
            "{\"changeId\":\"c1\",\"timestamp\":1,\"state\":\"EXECUTED\"}\n\nnot json\n",
        )
        .unwrap();

        let source = JsonlLegacySource::new("mongock", &path);
        let err = source.read_history().await.unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }
}
