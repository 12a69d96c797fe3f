//! Command-line interface for changeflow.
//!
//! Provides commands for running pipeline definitions, inspecting and
//! fixing the audit log, rolling back single changes and importing
//! legacy history.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;

use crate::audit::{AuditSnapshot, FixOutcome, Resolution};
use crate::config::{self, ResolvedConfig};
use crate::core::{ChangeOutcome, Engine, Executor, FailurePolicy, PipelineResult, RunStatus};
use crate::domain::{AuditEntry, PipelineDefinition};
use crate::legacy::ImportResult;

/// Log filter variable checked before `RUST_LOG`
pub const LOG_ENV: &str = "CHANGEFLOW_LOG";

/// Filter directive: `CHANGEFLOW_LOG`, then `RUST_LOG`, then `info`
pub fn log_directive(changeflow_log: Option<String>, rust_log: Option<String>) -> String {
    changeflow_log
        .into_iter()
        .chain(rust_log)
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// changeflow - Audited change-as-code execution engine
#[derive(Parser, Debug)]
#[command(name = "changeflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (skips discovery of .changeflow/config.yaml)
    #[arg(long, global = true, env = "CHANGEFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline definition
    Run {
        /// Pipeline definition file (YAML or JSON)
        definition: PathBuf,

        /// Upper bound on concurrency inside bounded-parallel stages
        #[arg(short = 'j', long)]
        max_parallelism: Option<usize>,

        /// Seconds to wait for the pipeline lock
        #[arg(long)]
        lock_timeout: Option<u64>,

        /// Keep going after a non-transactional change fails
        #[arg(long)]
        continue_on_failure: bool,

        /// Import legacy history before running
        #[arg(long)]
        legacy_import: bool,
    },

    /// Inspect and fix the audit log
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },

    /// Roll back a single change using its declared rollback
    Rollback {
        /// Pipeline definition file declaring the change
        definition: PathBuf,

        /// Change ID
        change_id: String,
    },

    /// Import legacy audit history
    Import {
        /// Pipeline definition used to resolve stages
        #[arg(short, long)]
        definition: Option<PathBuf>,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum AuditCommands {
    /// List the latest entry of every change
    List,

    /// List changes left Pending or Failed
    Issues,

    /// Show every entry recorded for a change
    History {
        /// Change ID
        change_id: String,
    },

    /// Resolve an outstanding issue by hand
    Fix {
        /// Change ID
        change_id: String,

        /// How the change was resolved
        #[arg(short, long, value_enum)]
        resolution: FixResolution,

        /// Checksum to record (defaults to the last recorded one)
        #[arg(long)]
        checksum: Option<String>,
    },
}

/// Resolution for CLI (maps to Resolution)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FixResolution {
    /// The change is in effect
    Applied,

    /// The change left no trace
    RolledBack,
}

impl From<FixResolution> for Resolution {
    fn from(r: FixResolution) -> Self {
        match r {
            FixResolution::Applied => Resolution::Applied,
            FixResolution::RolledBack => Resolution::RolledBack,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = match &self.config {
            Some(path) => config::load_config_at(path)?,
            None => config::load_config()?,
        };

        match self.command {
            Commands::Run {
                definition,
                max_parallelism,
                lock_timeout,
                continue_on_failure,
                legacy_import,
            } => {
                let mut options = cfg.run_options();
                if let Some(limit) = max_parallelism {
                    options = options.with_max_parallelism(limit);
                }
                if let Some(seconds) = lock_timeout {
                    options = options.with_lock_timeout(Duration::from_secs(seconds));
                }
                if continue_on_failure {
                    options =
                        options.with_failure_policy(FailurePolicy::ContinueOnNonTransactionalFailure);
                }
                if legacy_import {
                    options = options.with_legacy_import(true);
                }
                run_definition(&cfg, &definition, options).await
            }
            Commands::Audit { command } => execute_audit(&cfg, command).await,
            Commands::Rollback {
                definition,
                change_id,
            } => rollback_change(&cfg, &definition, &change_id).await,
            Commands::Import { definition } => import_legacy(&cfg, definition.as_deref()).await,
            Commands::Config => show_config(&cfg),
        }
    }
}

/// Wire the configured stores, adapters and lock into an engine
async fn build_engine(cfg: &ResolvedConfig) -> Result<Engine> {
    let audit = cfg.open_audit_store().await?;
    let registry = cfg.build_registry()?;
    let executor = Executor::new(audit, registry, cfg.build_lock());

    let mut engine = Engine::new(executor);
    if let Some(source) = cfg.legacy_source() {
        engine = engine.with_legacy_source(Arc::new(source));
    }
    Ok(engine)
}

fn load_definition(path: &Path) -> Result<PipelineDefinition> {
    PipelineDefinition::from_file(path)
        .with_context(|| format!("Failed to load pipeline definition: {}", path.display()))
}

/// Run a pipeline definition
async fn run_definition(
    cfg: &ResolvedConfig,
    path: &Path,
    options: crate::core::RunOptions,
) -> Result<()> {
    let definition = load_definition(path)?;
    let engine = build_engine(cfg).await?;

    // Ctrl-C stops the run before the next change starts
    let stop = engine.executor().stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after in-flight changes");
            stop.stop();
        }
    });

    let result = engine.run_pipeline(&definition, &options).await;
    print_result(&result);

    match result.status {
        RunStatus::Completed => Ok(()),
        RunStatus::CompletedWithFailures => {
            eprintln!("\n[{}]", result.summary());
            std::process::exit(2);
        }
        RunStatus::Failed => {
            eprintln!("\n[{}]", result.summary());
            std::process::exit(1);
        }
    }
}

fn print_result(result: &PipelineResult) {
    println!("{:<30} {:<20} {:<12} {:>8}", "CHANGE", "STAGE", "OUTCOME", "MS");
    println!("{}", "-".repeat(73));

    for report in &result.changes {
        println!(
            "{:<30} {:<20} {:<12} {:>8}",
            report.change_id, report.stage, report.outcome, report.duration_ms
        );
        if let Some(error) = &report.error {
            if report.outcome != ChangeOutcome::Ignored {
                println!("    error: {}", error);
            }
        }
    }

    if result.is_success() {
        eprintln!("\n[{}]", result.summary());
    }
}

/// Execute audit subcommands
async fn execute_audit(cfg: &ResolvedConfig, command: AuditCommands) -> Result<()> {
    let store = cfg.open_audit_store().await?;

    match command {
        AuditCommands::List => {
            let entries = store.all_latest_entries().await?;
            if entries.is_empty() {
                println!("No audit entries found");
                return Ok(());
            }
            print_entries(&entries);
        }
        AuditCommands::Issues => {
            let snapshot = AuditSnapshot::load(store.as_ref()).await?;
            let issues = snapshot.issues();
            if issues.is_empty() {
                println!("No issues found");
                return Ok(());
            }
            let issues: Vec<AuditEntry> = issues.into_iter().cloned().collect();
            print_entries(&issues);
        }
        AuditCommands::History { change_id } => {
            let history = store.history(&change_id).await?;
            if history.is_empty() {
                anyhow::bail!("No audit entries for change '{}'", change_id);
            }
            print_entries(&history);
            if let Some(error) = history.last().and_then(|e| e.error.as_ref()) {
                println!("\nLast error: {}", error);
            }
        }
        AuditCommands::Fix {
            change_id,
            resolution,
            checksum,
        } => fix_issue(cfg, &change_id, resolution.into(), checksum).await?,
    }

    Ok(())
}

fn print_entries(entries: &[AuditEntry]) {
    println!(
        "{:<6} {:<30} {:<16} {:<12} {:<26}",
        "SEQ", "CHANGE", "STAGE", "STATE", "TIMESTAMP"
    );
    println!("{}", "-".repeat(94));

    for entry in entries {
        println!(
            "{:<6} {:<30} {:<16} {:<12} {:<26}",
            entry.sequence,
            entry.change_id,
            entry.stage,
            entry.state,
            entry.timestamp.to_rfc3339()
        );
    }
}

/// Resolve an issue while holding the pipeline lock
async fn fix_issue(
    cfg: &ResolvedConfig,
    change_id: &str,
    resolution: Resolution,
    checksum: Option<String>,
) -> Result<()> {
    let engine = build_engine(cfg).await?;
    let outcome = engine
        .executor()
        .fix_change(change_id, resolution, checksum)
        .await
        .with_context(|| format!("Failed to fix change '{}'", change_id))?;

    match outcome {
        FixOutcome::Fixed(entry) => {
            println!(
                "Change '{}' marked {} (sequence {})",
                entry.change_id, entry.state, entry.sequence
            );
        }
        FixOutcome::NoIssueFound => {
            println!("Change '{}' has no outstanding issue", change_id);
        }
    }
    Ok(())
}

/// Roll back a single change
async fn rollback_change(cfg: &ResolvedConfig, path: &Path, change_id: &str) -> Result<()> {
    let definition = load_definition(path)?;
    let engine = build_engine(cfg).await?;

    let report = engine
        .executor()
        .rollback_change(&definition, change_id)
        .await
        .with_context(|| format!("Failed to roll back change '{}'", change_id))?;

    println!(
        "Change '{}' in stage '{}' rolled back ({}ms)",
        report.change_id, report.stage, report.duration_ms
    );
    Ok(())
}

/// Import legacy history once
async fn import_legacy(cfg: &ResolvedConfig, definition: Option<&Path>) -> Result<()> {
    if cfg.legacy.is_none() {
        anyhow::bail!("No legacy source configured (add a `legacy` section to the config file)");
    }

    let definition = definition.map(load_definition).transpose()?;
    let engine = build_engine(cfg).await?;

    let result = engine
        .import_legacy(definition.as_ref())
        .await
        .context("Legacy import failed")?;

    match result {
        Some(ImportResult::AlreadyImported { marker }) => {
            println!(
                "Legacy source '{}' already imported at {} ({} entries)",
                marker.source, marker.imported_at, marker.imported_count
            );
        }
        Some(ImportResult::NoLegacyRecords) => println!("No legacy records found"),
        Some(ImportResult::Imported {
            imported,
            skipped_existing,
            skipped_ignored,
        }) => {
            println!(
                "Imported {} entries ({} already tracked, {} ignored)",
                imported, skipped_existing, skipped_ignored
            );
        }
        None => println!("No legacy source configured"),
    }
    Ok(())
}

/// Show resolved configuration
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Audit ({:?}):       {}", cfg.audit_backend, cfg.audit_path.display());
    println!("  Lock file:           {}", cfg.lock_path.display());
    println!();
    println!("Lock:");
    println!("  Key:             {}", cfg.lock.key);
    println!("  Lease:           {}s", cfg.lock.lease_duration.as_secs());
    println!("  Acquire timeout: {}s", cfg.lock.acquire_timeout.as_secs());
    println!("  Retry interval:  {}ms", cfg.lock.retry_interval.as_millis());
    println!("  Renew interval:  {}ms", cfg.lock.renew_interval.as_millis());
    println!();
    println!("Run:");
    match cfg.max_parallelism {
        Some(limit) => println!("  Max parallelism: {}", limit),
        None => println!("  Max parallelism: (per stage)"),
    }
    println!("  Failure policy:  {:?}", cfg.failure_policy);
    println!("  Legacy import:   {}", cfg.legacy_import);
    println!();
    println!("Target systems:");
    if cfg.target_systems.is_empty() {
        println!("  (none)");
    }
    for target in &cfg.target_systems {
        let path = target
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        println!("  {} ({:?}) {}", target.id, target.kind, path);
    }
    if let Some((name, path)) = &cfg.legacy {
        println!();
        println!("Legacy source: {} ({})", name, path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_log_directive_precedence() {
        assert_eq!(log_directive(None, None), "info");
        assert_eq!(log_directive(None, Some("warn".into())), "warn");
        assert_eq!(
            log_directive(Some("changeflow=debug".into()), Some("warn".into())),
            "changeflow=debug"
        );
        assert_eq!(log_directive(Some("  ".into()), Some("error".into())), "error");
    }

    #[test]
    fn test_parse_audit_fix() {
        let cli = Cli::try_parse_from([
            "changeflow",
            "audit",
            "fix",
            "c1",
            "--resolution",
            "rolled-back",
        ])
        .unwrap();

        match cli.command {
            Commands::Audit {
                command:
                    AuditCommands::Fix {
                        change_id,
                        resolution,
                        checksum,
                    },
            } => {
                assert_eq!(change_id, "c1");
                assert!(matches!(resolution, FixResolution::RolledBack));
                assert!(checksum.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "changeflow",
            "run",
            "pipeline.yaml",
            "-j",
            "4",
            "--continue-on-failure",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                definition,
                max_parallelism,
                continue_on_failure,
                legacy_import,
                ..
            } => {
                assert_eq!(definition, PathBuf::from("pipeline.yaml"));
                assert_eq!(max_parallelism, Some(4));
                assert!(continue_on_failure);
                assert!(!legacy_import);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
