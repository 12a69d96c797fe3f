//! Configuration for changeflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CHANGEFLOW_HOME)
//! 2. Config file (.changeflow/config.yaml)
//! 3. Defaults (~/.changeflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .changeflow/config.yaml
//! - `paths.home` is relative to the .changeflow/ directory; every other
//!   path is relative to the project root (the directory holding .changeflow/)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{SqliteTargetSystem, ShellTargetSystem, TargetSystemRegistry};
use crate::audit::{AuditStore, JsonlAuditStore, SqliteAuditStore};
use crate::core::{FailurePolicy, RunOptions};
use crate::legacy::JsonlLegacySource;
use crate::lock::{DistributedLock, FileLockStore, LockConfig, DEFAULT_LOCK_KEY};

const CONFIG_DIR: &str = ".changeflow";
const HOME_ENV: &str = "CHANGEFLOW_HOME";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub audit: Option<AuditConfig>,
    #[serde(default)]
    pub lock: Option<LockFileConfig>,
    #[serde(default)]
    pub run: Option<RunConfig>,
    #[serde(default)]
    pub target_systems: Vec<TargetSystemConfig>,
    #[serde(default)]
    pub legacy: Option<LegacyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .changeflow/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackend {
    #[default]
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub backend: AuditBackend,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockFileConfig {
    pub path: Option<String>,
    pub key: Option<String>,
    pub lease_seconds: Option<u64>,
    pub acquire_timeout_seconds: Option<u64>,
    pub retry_interval_ms: Option<u64>,
    pub renew_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub max_parallelism: Option<usize>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub legacy_import: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Sqlite,
    Shell,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSystemConfig {
    pub id: String,
    pub kind: TargetKind,
    /// Database file (sqlite) or working directory (shell)
    pub path: Option<String>,
    /// Command timeout (shell)
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyConfig {
    /// Name recorded in the import marker
    #[serde(default = "default_legacy_name")]
    pub name: String,
    pub path: String,
}

fn default_legacy_name() -> String {
    "legacy".to_string()
}

/// Target system with resolved paths
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSettings {
    pub id: String,
    pub kind: TargetKind,
    pub path: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub audit_backend: AuditBackend,
    pub audit_path: PathBuf,
    pub lock_path: PathBuf,
    pub lock: LockConfig,
    pub max_parallelism: Option<usize>,
    pub failure_policy: FailurePolicy,
    pub legacy_import: bool,
    pub target_systems: Vec<TargetSettings>,
    /// Legacy source name and file
    pub legacy: Option<(String, PathBuf)>,
}

impl ResolvedConfig {
    /// Open the configured audit store
    pub async fn open_audit_store(&self) -> Result<Arc<dyn AuditStore>> {
        let store: Arc<dyn AuditStore> = match self.audit_backend {
            AuditBackend::Jsonl => Arc::new(
                JsonlAuditStore::open(&self.audit_path)
                    .await
                    .with_context(|| {
                        format!("Failed to open audit log: {}", self.audit_path.display())
                    })?,
            ),
            AuditBackend::Sqlite => Arc::new(SqliteAuditStore::open(&self.audit_path).with_context(
                || format!("Failed to open audit database: {}", self.audit_path.display()),
            )?),
        };
        Ok(store)
    }

    /// Build the target system registry
    pub fn build_registry(&self) -> Result<TargetSystemRegistry> {
        let mut registry = TargetSystemRegistry::new();

        for target in &self.target_systems {
            match target.kind {
                TargetKind::Sqlite => {
                    let path = target.path.as_ref().with_context(|| {
                        format!("SQLite target system '{}' needs a path", target.id)
                    })?;
                    let system = SqliteTargetSystem::open(&target.id, path).with_context(|| {
                        format!("Failed to open target database: {}", path.display())
                    })?;
                    registry.register(Arc::new(system));
                }
                TargetKind::Shell => {
                    let mut system = ShellTargetSystem::new(&target.id);
                    if let Some(timeout) = target.timeout {
                        system = system.with_timeout(timeout);
                    }
                    if let Some(dir) = &target.path {
                        system = system.with_working_dir(dir);
                    }
                    registry.register(Arc::new(system));
                }
            }
        }

        Ok(registry)
    }

    /// Lock over the configured lease file
    pub fn build_lock(&self) -> DistributedLock {
        DistributedLock::new(
            Arc::new(FileLockStore::new(&self.lock_path)),
            self.lock.clone(),
        )
    }

    pub fn legacy_source(&self) -> Option<JsonlLegacySource> {
        self.legacy
            .as_ref()
            .map(|(name, path)| JsonlLegacySource::new(name.clone(), path.clone()))
    }

    /// Run options from the `run` section
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            lock_timeout: None,
            max_parallelism: self.max_parallelism,
            failure_policy: self.failure_policy,
            legacy_import: self.legacy_import,
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn lock_config(section: Option<&LockFileConfig>) -> LockConfig {
    let defaults = LockConfig::default();
    let Some(section) = section else {
        return defaults;
    };

    let lease_duration = section
        .lease_seconds
        .map(Duration::from_secs)
        .unwrap_or(defaults.lease_duration);

    LockConfig {
        key: section
            .key
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCK_KEY.to_string()),
        lease_duration,
        acquire_timeout: section
            .acquire_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.acquire_timeout),
        retry_interval: section
            .retry_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_interval),
        renew_interval: section
            .renew_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(lease_duration / 3),
    }
}

/// Combine config file, environment and defaults
fn resolve(
    config_file: Option<PathBuf>,
    env_home: Option<PathBuf>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let Some(config_path) = config_file else {
        let home = env_home.unwrap_or(default_home);
        return Ok(ResolvedConfig {
            audit_backend: AuditBackend::Jsonl,
            audit_path: home.join("audit.jsonl"),
            lock_path: home.join("pipeline.lock"),
            lock: LockConfig::default(),
            max_parallelism: None,
            failure_policy: FailurePolicy::default(),
            legacy_import: false,
            target_systems: Vec::new(),
            legacy: None,
            config_file: None,
            home,
        });
    };

    let config = load_config_file(&config_path)?;

    // .changeflow/ and the project root above it
    let config_dir = config_path.parent().unwrap_or(Path::new("."));
    let base_dir = config_dir.parent().unwrap_or(Path::new("."));

    let home = match (env_home, &config.paths.home) {
        (Some(env_home), _) => env_home,
        (None, Some(home_path)) => resolve_path(config_dir, home_path),
        (None, None) => default_home,
    };

    let audit_backend = config.audit.as_ref().map(|a| a.backend).unwrap_or_default();
    let audit_path = match config.audit.as_ref().and_then(|a| a.path.as_deref()) {
        Some(path) => resolve_path(base_dir, path),
        None => match audit_backend {
            AuditBackend::Jsonl => home.join("audit.jsonl"),
            AuditBackend::Sqlite => home.join("audit.db"),
        },
    };

    let lock_path = config
        .lock
        .as_ref()
        .and_then(|l| l.path.as_deref())
        .map(|p| resolve_path(base_dir, p))
        .unwrap_or_else(|| home.join("pipeline.lock"));

    let target_systems = config
        .target_systems
        .iter()
        .map(|t| TargetSettings {
            id: t.id.clone(),
            kind: t.kind,
            path: t.path.as_deref().map(|p| resolve_path(base_dir, p)),
            timeout: t.timeout_seconds.map(Duration::from_secs),
        })
        .collect();

    let legacy = config
        .legacy
        .as_ref()
        .map(|l| (l.name.clone(), resolve_path(base_dir, &l.path)));

    Ok(ResolvedConfig {
        lock: lock_config(config.lock.as_ref()),
        max_parallelism: config.run.as_ref().and_then(|r| r.max_parallelism),
        failure_policy: config
            .run
            .as_ref()
            .map(|r| r.failure_policy)
            .unwrap_or_default(),
        legacy_import: config.run.as_ref().is_some_and(|r| r.legacy_import),
        audit_backend,
        audit_path,
        lock_path,
        target_systems,
        legacy,
        config_file: Some(config_path),
        home,
    })
}

fn default_home() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR))
}

fn env_home() -> Option<PathBuf> {
    std::env::var(HOME_ENV).ok().map(PathBuf::from)
}

/// Load configuration, discovering the config file from `start`
pub fn load_config_from(start: &Path) -> Result<ResolvedConfig> {
    resolve(find_config_file(start), env_home(), default_home()?)
}

/// Load configuration from an explicit config file
pub fn load_config_at(config_path: &Path) -> Result<ResolvedConfig> {
    if !config_path.exists() {
        anyhow::bail!("Config file not found: {}", config_path.display());
    }
    resolve(Some(config_path.to_path_buf()), env_home(), default_home()?)
}

/// Load configuration from the current directory
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd)
}
