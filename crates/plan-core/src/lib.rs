use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod config;
pub mod format;

pub use config::{ConfigError, DirectoryConfig, PlanConfig, SqliteConfig};
pub use format::PlanFormat;

pub const PLAN_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStage {
    #[default]
    Idea,
    Shaping,
    Built,
    Executing,
    Completed,
    Cancelled,
}

impl PlanStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStage::Idea => "idea",
            PlanStage::Shaping => "shaping",
            PlanStage::Built => "built",
            PlanStage::Executing => "executing",
            PlanStage::Completed => "completed",
            PlanStage::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PlanStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanStage {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "idea" => Ok(PlanStage::Idea),
            "shaping" => Ok(PlanStage::Shaping),
            "built" => Ok(PlanStage::Built),
            "executing" => Ok(PlanStage::Executing),
            "completed" => Ok(PlanStage::Completed),
            "cancelled" | "canceled" => Ok(PlanStage::Cancelled),
            other => Err(format!("Unknown stage: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(StepStatus::Pending),
            "in_progress" | "in-progress" | "inprogress" => Ok(StepStatus::InProgress),
            "completed" | "done" => Ok(StepStatus::Completed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    PlanCreated,
    PlanUpdated,
    StageChanged,
    StepAdded,
    StepStarted,
    StepCompleted,
    StepSkipped,
    FileSaved,
    EvidenceAdded,
    FeedbackAdded,
    CheckpointCreated,
    CheckpointRestored,
    PlanMigrated,
}

impl TimelineEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineEventType::PlanCreated => "plan_created",
            TimelineEventType::PlanUpdated => "plan_updated",
            TimelineEventType::StageChanged => "stage_changed",
            TimelineEventType::StepAdded => "step_added",
            TimelineEventType::StepStarted => "step_started",
            TimelineEventType::StepCompleted => "step_completed",
            TimelineEventType::StepSkipped => "step_skipped",
            TimelineEventType::FileSaved => "file_saved",
            TimelineEventType::EvidenceAdded => "evidence_added",
            TimelineEventType::FeedbackAdded => "feedback_added",
            TimelineEventType::CheckpointCreated => "checkpoint_created",
            TimelineEventType::CheckpointRestored => "checkpoint_restored",
            TimelineEventType::PlanMigrated => "plan_migrated",
        }
    }
}

impl fmt::Display for TimelineEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimelineEventType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "plan_created" => Ok(TimelineEventType::PlanCreated),
            "plan_updated" => Ok(TimelineEventType::PlanUpdated),
            "stage_changed" => Ok(TimelineEventType::StageChanged),
            "step_added" => Ok(TimelineEventType::StepAdded),
            "step_started" => Ok(TimelineEventType::StepStarted),
            "step_completed" => Ok(TimelineEventType::StepCompleted),
            "step_skipped" => Ok(TimelineEventType::StepSkipped),
            "file_saved" => Ok(TimelineEventType::FileSaved),
            "evidence_added" => Ok(TimelineEventType::EvidenceAdded),
            "feedback_added" => Ok(TimelineEventType::FeedbackAdded),
            "checkpoint_created" => Ok(TimelineEventType::CheckpointCreated),
            "checkpoint_restored" => Ok(TimelineEventType::CheckpointRestored),
            "plan_migrated" => Ok(TimelineEventType::PlanMigrated),
            other => Err(format!("Unknown timeline event type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub stage: PlanStage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    PLAN_SCHEMA_VERSION
}

impl PlanMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            stage: PlanStage::Idea,
            created_at: now,
            updated_at: now,
            schema_version: PLAN_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub stage: Option<PlanStage>,
}

impl MetadataUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.stage.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub number: u32,
    pub code: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content: String,
}

impl Step {
    pub fn new(number: u32, code: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            number,
            code: code.into(),
            title: title.into(),
            description: None,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            content: String::new(),
        }
    }
}

/// Partial step patch. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepUpdate {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<StepStatus>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content: Option<String>,
}

impl StepUpdate {
    pub fn is_empty(&self) -> bool {
        self.code.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
            && self.content.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFile {
    #[serde(rename = "type")]
    pub file_type: String,
    pub filename: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanFile {
    pub fn new(
        file_type: impl Into<String>,
        filename: impl Into<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            file_type: file_type.into(),
            filename: filename.into(),
            content: content.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.file_type, &self.filename)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: TimelineEventType,
    #[serde(default)]
    pub data: Value,
}

/// Timeline append request; the provider assigns an id when none is given.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTimelineEvent {
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub event_type: TimelineEventType,
    pub data: Value,
}

impl NewTimelineEvent {
    pub fn new(event_type: TimelineEventType, timestamp: DateTime<Utc>, data: Value) -> Self {
        Self {
            id: None,
            timestamp,
            event_type,
            data,
        }
    }
}

impl From<&TimelineEvent> for NewTimelineEvent {
    fn from(event: &TimelineEvent) -> Self {
        Self {
            id: Some(event.id.clone()),
            timestamp: event.timestamp,
            event_type: event.event_type,
            data: event.data.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelineQuery {
    pub since: Option<DateTime<Utc>>,
    pub event_type: Option<TimelineEventType>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub gathering_method: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub relevance: Option<f64>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Evidence {
    pub fn new(description: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_record_id(),
            description: description.into(),
            source: None,
            source_url: None,
            gathering_method: None,
            content: None,
            file_path: None,
            relevance: None,
            query: None,
            summary: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    pub content: String,
    #[serde(default)]
    pub participants: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Feedback {
    pub fn new(content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_record_id(),
            title: None,
            platform: None,
            content: content.into(),
            participants: Vec::new(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub number: u32,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Step> for StepSnapshot {
    fn from(step: &Step) -> Self {
        Self {
            number: step.number,
            status: step.status,
            started_at: step.started_at,
            completed_at: step.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSnapshot {
    #[serde(rename = "type")]
    pub file_type: String,
    pub filename: String,
    pub content: String,
}

impl From<&PlanFile> for FileSnapshot {
    fn from(file: &PlanFile) -> Self {
        Self {
            file_type: file.file_type.clone(),
            filename: file.filename.clone(),
            content: file.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSnapshot {
    pub metadata: PlanMetadata,
    #[serde(default)]
    pub steps: Vec<StepSnapshot>,
    #[serde(default)]
    pub files: Vec<FileSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub snapshot: CheckpointSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SearchHitKind {
    Step,
    File,
    Evidence,
}

impl SearchHitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchHitKind::Step => "step",
            SearchHitKind::File => "file",
            SearchHitKind::Evidence => "evidence",
        }
    }
}

impl fmt::Display for SearchHitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub kind: SearchHitKind,
    /// Step number, `type/filename`, or evidence id.
    pub id: String,
    pub title: String,
    pub snippet: String,
    pub score: f64,
}

pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
