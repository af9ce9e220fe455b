use chrono::{DateTime, Utc};
use plan_core::{
    Checkpoint, CheckpointSnapshot, Evidence, Feedback, FileSnapshot, MetadataUpdate,
    NewTimelineEvent, PlanFile, PlanFormat, PlanMetadata, SearchHit, Step, StepSnapshot,
    StepUpdate, TimelineEvent, TimelineQuery,
};
use std::path::Path;
use thiserror::Error;

pub mod factory;
pub mod search;
pub mod sqlite;

pub use factory::{DirectoryProviderFn, ProviderFactory};
pub use sqlite::SqliteProvider;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("no plan exists in {0}")]
    NoPlan(String),
    #[error("plan already exists in {path} (id {plan_id})")]
    PlanExists { path: String, plan_id: String },
    #[error("step {0} already exists")]
    StepExists(u32),
    #[error("step {0} not found")]
    StepNotFound(u32),
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid plan path: {0}")]
    InvalidPath(String),
    #[error("{0} format provider is not available")]
    FormatUnavailable(PlanFormat),
}

/// Storage contract shared by every plan format. Point lookups return `Ok(None)`
/// for a missing entity; `Err` is reserved for failed operations.
pub trait StorageProvider {
    fn format(&self) -> PlanFormat;

    fn path(&self) -> &Path;

    /// Whether a plan is present. Query failures count as absent.
    fn exists(&self) -> bool;

    fn initialize(&self, metadata: &PlanMetadata) -> Result<(), StorageError>;

    /// Removes the plan together with every entity that belongs to it.
    fn delete_plan(&self) -> Result<bool, StorageError>;

    fn get_metadata(&self) -> Result<PlanMetadata, StorageError>;

    fn update_metadata(&self, update: &MetadataUpdate) -> Result<(), StorageError>;

    /// Steps ordered by `number` ascending.
    fn get_steps(&self) -> Result<Vec<Step>, StorageError>;

    fn get_step(&self, number: u32) -> Result<Option<Step>, StorageError>;

    fn add_step(&self, step: &Step) -> Result<(), StorageError>;

    fn update_step(&self, number: u32, update: &StepUpdate) -> Result<(), StorageError>;

    fn delete_step(&self, number: u32) -> Result<bool, StorageError>;

    fn get_files(&self, file_type: Option<&str>) -> Result<Vec<PlanFile>, StorageError>;

    fn get_file(&self, file_type: &str, filename: &str) -> Result<Option<PlanFile>, StorageError>;

    fn save_file(&self, file: &PlanFile) -> Result<(), StorageError>;

    fn delete_file(&self, file_type: &str, filename: &str) -> Result<bool, StorageError>;

    fn add_timeline_event(&self, event: &NewTimelineEvent) -> Result<TimelineEvent, StorageError>;

    /// Newest first.
    fn get_timeline(&self, query: &TimelineQuery) -> Result<Vec<TimelineEvent>, StorageError>;

    fn add_evidence(&self, evidence: &Evidence) -> Result<(), StorageError>;

    fn get_evidence(&self) -> Result<Vec<Evidence>, StorageError>;

    fn add_feedback(&self, feedback: &Feedback) -> Result<(), StorageError>;

    fn get_feedback(&self) -> Result<Vec<Feedback>, StorageError>;

    /// Stores a checkpoint verbatim, replacing one with the same name.
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    fn get_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, StorageError>;

    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError>;

    /// Applies a snapshot back onto metadata, step statuses and file contents as one unit.
    fn restore_checkpoint(&self, name: &str) -> Result<(), StorageError>;

    fn delete_checkpoint(&self, name: &str) -> Result<bool, StorageError>;

    fn search(&self, query: &str) -> Result<Vec<SearchHit>, StorageError>;

    fn close(self: Box<Self>) -> Result<(), StorageError>;

    fn create_checkpoint(&self, name: &str) -> Result<Checkpoint, StorageError> {
        let checkpoint = snapshot_checkpoint(self, name, Utc::now())?;
        self.save_checkpoint(&checkpoint)?;
        Ok(checkpoint)
    }
}

pub fn snapshot_checkpoint<P: StorageProvider + ?Sized>(
    provider: &P,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Checkpoint, StorageError> {
    if name.trim().is_empty() {
        return Err(StorageError::InvalidInput(
            "checkpoint name cannot be empty".to_string(),
        ));
    }
    let metadata = provider.get_metadata()?;
    let steps = provider
        .get_steps()?
        .iter()
        .map(StepSnapshot::from)
        .collect();
    let files = provider
        .get_files(None)?
        .iter()
        .map(FileSnapshot::from)
        .collect();

    Ok(Checkpoint {
        name: name.to_string(),
        created_at: now,
        snapshot: CheckpointSnapshot {
            metadata,
            steps,
            files,
        },
    })
}
