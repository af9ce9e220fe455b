use crate::validator::{validate, ValidationReport};
use plan_core::format::trim_trailing_separators;
use plan_core::{NewTimelineEvent, PlanConfig, PlanFormat, TimelineQuery};
use plan_storage::{StorageError, StorageProvider};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

pub const DIRECTORY_TARGET_SUFFIX: &str = "_migrated";
const SQLITE_SIDE_FILES: [&str; 3] = ["-wal", "-shm", "-journal"];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Target plan already exists at {0}; use overwrite to replace it")]
    TargetExists(String),
    #[error("Source and target are the same store: {0}")]
    SameStore(String),
    #[error("Failed to read source metadata: {0}")]
    SourceMetadata(#[source] StorageError),
    #[error("Failed to initialize target: {0}")]
    TargetInit(#[source] StorageError),
    #[error("Failed to copy {collection}: {source}")]
    Copy {
        collection: &'static str,
        #[source]
        source: StorageError,
    },
    #[error("Validation failed with {count} error(s): {first}")]
    ValidationFailed { count: usize, first: String },
    #[error("Failed to remove source storage {path}: {source}")]
    Cleanup {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Preparing,
    Metadata,
    Steps,
    Files,
    Timeline,
    Evidence,
    Feedback,
    Checkpoints,
    Validating,
    Cleanup,
    Complete,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Preparing => "preparing",
            MigrationPhase::Metadata => "metadata",
            MigrationPhase::Steps => "steps",
            MigrationPhase::Files => "files",
            MigrationPhase::Timeline => "timeline",
            MigrationPhase::Evidence => "evidence",
            MigrationPhase::Feedback => "feedback",
            MigrationPhase::Checkpoints => "checkpoints",
            MigrationPhase::Validating => "validating",
            MigrationPhase::Cleanup => "cleanup",
            MigrationPhase::Complete => "complete",
        }
    }

    pub fn percent(&self) -> u8 {
        match self {
            MigrationPhase::Preparing => 0,
            MigrationPhase::Metadata => 10,
            MigrationPhase::Steps => 20,
            MigrationPhase::Files => 35,
            MigrationPhase::Timeline => 50,
            MigrationPhase::Evidence => 60,
            MigrationPhase::Feedback => 70,
            MigrationPhase::Checkpoints => 80,
            MigrationPhase::Validating => 90,
            MigrationPhase::Cleanup => 95,
            MigrationPhase::Complete => 100,
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MigrationProgress {
    pub phase: MigrationPhase,
    pub percent: u8,
    pub message: String,
}

pub type ProgressCallback<'a> = &'a mut dyn FnMut(&MigrationProgress);

pub struct MigrationOptions<'a> {
    pub overwrite: bool,
    pub keep_source: bool,
    pub validate: bool,
    pub on_progress: Option<ProgressCallback<'a>>,
}

impl Default for MigrationOptions<'_> {
    fn default() -> Self {
        Self {
            overwrite: false,
            keep_source: true,
            validate: true,
            on_progress: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MigrationStats {
    pub steps_converted: usize,
    pub files_converted: usize,
    pub timeline_events_converted: usize,
    pub evidence_converted: usize,
    pub feedback_converted: usize,
    pub checkpoints_converted: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MigrationResult {
    pub success: bool,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub source_format: PlanFormat,
    pub target_format: PlanFormat,
    pub stats: MigrationStats,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub validation: Option<ValidationReport>,
    pub source_deleted: bool,
    pub elapsed_ms: u64,
}

pub struct Migrator {
    config: PlanConfig,
}

impl Migrator {
    pub fn new(config: PlanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlanConfig {
        &self.config
    }

    /// Copies every collection from `source` into a freshly initialized `target`.
    /// Both providers are closed before returning. The target is not rolled back
    /// on failure and may be partially populated.
    pub fn migrate(
        &self,
        source_path: &Path,
        target_path: &Path,
        source: Box<dyn StorageProvider>,
        target: Box<dyn StorageProvider>,
        options: MigrationOptions<'_>,
    ) -> MigrationResult {
        let started = Instant::now();
        let source_format = source.format();
        let mut run = MigrationRun {
            options,
            result: MigrationResult {
                success: false,
                source_path: source_path.to_path_buf(),
                target_path: target_path.to_path_buf(),
                source_format,
                target_format: target.format(),
                stats: MigrationStats::default(),
                warnings: Vec::new(),
                error: None,
                validation: None,
                source_deleted: false,
                elapsed_ms: 0,
            },
        };

        let copied = run.copy_and_validate(source.as_ref(), target.as_ref());

        if let Err(err) = target.close() {
            run.result
                .warnings
                .push(format!("Failed to close target: {err}"));
        }
        if let Err(err) = source.close() {
            run.result
                .warnings
                .push(format!("Failed to close source: {err}"));
        }

        let outcome = copied.and_then(|()| {
            if run.options.keep_source {
                return Ok(());
            }
            run.report(
                MigrationPhase::Cleanup,
                format!("Removing source {}", source_path.display()),
            );
            delete_plan_storage(source_path, source_format).map_err(|source| {
                MigrationError::Cleanup {
                    path: source_path.display().to_string(),
                    source,
                }
            })?;
            run.result.source_deleted = true;
            Ok(())
        });

        run.result.elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                run.result.success = true;
                run.report(MigrationPhase::Complete, "Migration complete".to_string());
                info!(
                    event = "migration_complete",
                    source = %source_path.display(),
                    target = %target_path.display(),
                    steps = run.result.stats.steps_converted,
                    files = run.result.stats.files_converted,
                    elapsed_ms = run.result.elapsed_ms
                );
            }
            Err(err) => {
                warn!(
                    event = "migration_failed",
                    source = %source_path.display(),
                    target = %target_path.display(),
                    error = %err
                );
                run.result.error = Some(err.to_string());
            }
        }
        run.result
    }
}

struct MigrationRun<'a> {
    options: MigrationOptions<'a>,
    result: MigrationResult,
}

impl MigrationRun<'_> {
    fn report(&mut self, phase: MigrationPhase, message: String) {
        info!(
            event = "migration_phase",
            phase = phase.as_str(),
            percent = phase.percent(),
            message = %message
        );
        let progress = MigrationProgress {
            phase,
            percent: phase.percent(),
            message,
        };
        if let Some(callback) = self.options.on_progress.as_deref_mut() {
            callback(&progress);
        }
    }

    fn copy_and_validate(
        &mut self,
        source: &dyn StorageProvider,
        target: &dyn StorageProvider,
    ) -> Result<(), MigrationError> {
        self.report(MigrationPhase::Preparing, "Checking target".to_string());
        if same_store(source.path(), target.path()) {
            return Err(MigrationError::SameStore(
                target.path().display().to_string(),
            ));
        }
        if target.exists() {
            if !self.options.overwrite {
                return Err(MigrationError::TargetExists(
                    target.path().display().to_string(),
                ));
            }
            target.delete_plan()?;
            self.result
                .warnings
                .push(format!("Replaced existing plan at {}", target.path().display()));
        }

        self.report(MigrationPhase::Metadata, "Reading source metadata".to_string());
        let metadata = source
            .get_metadata()
            .map_err(MigrationError::SourceMetadata)?;
        target
            .initialize(&metadata)
            .map_err(MigrationError::TargetInit)?;

        self.report(MigrationPhase::Steps, "Copying steps".to_string());
        for step in source.get_steps().map_err(copy_error("steps"))? {
            target.add_step(&step).map_err(copy_error("steps"))?;
            self.result.stats.steps_converted += 1;
        }

        self.report(MigrationPhase::Files, "Copying files".to_string());
        for file in source.get_files(None).map_err(copy_error("files"))? {
            target.save_file(&file).map_err(copy_error("files"))?;
            self.result.stats.files_converted += 1;
        }

        self.report(MigrationPhase::Timeline, "Copying timeline".to_string());
        let events = source
            .get_timeline(&TimelineQuery::default())
            .map_err(copy_error("timeline"))?;
        // Oldest first so insertion order follows the original history.
        for event in events.iter().rev() {
            target
                .add_timeline_event(&NewTimelineEvent::from(event))
                .map_err(copy_error("timeline"))?;
            self.result.stats.timeline_events_converted += 1;
        }

        self.report(MigrationPhase::Evidence, "Copying evidence".to_string());
        for evidence in source.get_evidence().map_err(copy_error("evidence"))? {
            target
                .add_evidence(&evidence)
                .map_err(copy_error("evidence"))?;
            self.result.stats.evidence_converted += 1;
        }

        self.report(MigrationPhase::Feedback, "Copying feedback".to_string());
        for feedback in source.get_feedback().map_err(copy_error("feedback"))? {
            target
                .add_feedback(&feedback)
                .map_err(copy_error("feedback"))?;
            self.result.stats.feedback_converted += 1;
        }

        self.report(MigrationPhase::Checkpoints, "Copying checkpoints".to_string());
        let checkpoints = source
            .list_checkpoints()
            .map_err(copy_error("checkpoints"))?;
        for checkpoint in checkpoints.iter().rev() {
            target
                .save_checkpoint(checkpoint)
                .map_err(copy_error("checkpoints"))?;
            self.result.stats.checkpoints_converted += 1;
        }

        if self.options.validate {
            self.report(MigrationPhase::Validating, "Validating target".to_string());
            let report = validate(source, target);
            self.result.warnings.extend(report.warnings.iter().cloned());
            let failure = report.errors.first().map(|first| MigrationError::ValidationFailed {
                count: report.errors.len(),
                first: first.message.clone(),
            });
            self.result.validation = Some(report);
            if let Some(err) = failure {
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Paths that cannot be resolved (not yet created, in-memory) never match.
pub fn same_store(source: &Path, target: &Path) -> bool {
    match (fs::canonicalize(source), fs::canonicalize(target)) {
        (Ok(source), Ok(target)) => source == target,
        _ => false,
    }
}

fn copy_error(collection: &'static str) -> impl Fn(StorageError) -> MigrationError {
    move |source| MigrationError::Copy { collection, source }
}

/// Removes a plan's backing storage: the database file with its WAL/SHM side
/// files, or the whole directory tree.
pub fn delete_plan_storage(path: &Path, format: PlanFormat) -> io::Result<()> {
    match format {
        PlanFormat::Sqlite => {
            fs::remove_file(path)?;
            for suffix in SQLITE_SIDE_FILES {
                let mut side = path.as_os_str().to_owned();
                side.push(suffix);
                let side = PathBuf::from(side);
                if side.exists() {
                    fs::remove_file(&side)?;
                }
            }
            Ok(())
        }
        PlanFormat::Directory => fs::remove_dir_all(path),
    }
}

pub fn infer_target_format(source_format: PlanFormat) -> PlanFormat {
    source_format.opposite()
}

pub fn generate_target_path(
    source_path: &str,
    target_format: PlanFormat,
    config: &PlanConfig,
) -> String {
    let base = trim_trailing_separators(source_path);
    match target_format {
        PlanFormat::Sqlite => format!("{base}{}", config.sqlite.extension),
        PlanFormat::Directory => {
            let stem = base
                .strip_suffix(config.sqlite.extension.as_str())
                .unwrap_or(base);
            format!("{stem}{DIRECTORY_TARGET_SUFFIX}")
        }
    }
}
