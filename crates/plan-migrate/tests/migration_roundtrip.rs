use chrono::{DateTime, Duration, TimeZone, Utc};
use plan_core::{
    Checkpoint, Evidence, Feedback, MetadataUpdate, NewTimelineEvent, PlanConfig, PlanFile,
    PlanFormat, PlanMetadata, PlanStage, SearchHit, Step, StepStatus, StepUpdate, TimelineEvent,
    TimelineEventType, TimelineQuery,
};
use plan_migrate::{
    validate, MigrationOptions, MigrationPhase, MigrationProgress, Migrator, ValidationErrorKind,
};
use plan_storage::{ProviderFactory, SqliteProvider, StorageError, StorageProvider};
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn ts(offset_minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 11, 10, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::minutes(offset_minutes)
}

fn open(path: &Path) -> Box<dyn StorageProvider> {
    ProviderFactory::default()
        .create_provider(path, Some(PlanFormat::Sqlite))
        .expect("open provider")
}

fn seed_plan(path: &Path) {
    let provider = open(path);
    let mut metadata = PlanMetadata::new("search-revamp", "Search revamp", ts(0));
    metadata.stage = PlanStage::Executing;
    provider.initialize(&metadata).expect("initialize");

    for number in 1..=3 {
        let mut step = Step::new(number, format!("step-{number}"), format!("Step {number}"));
        step.content = format!("Body of step {number}\n");
        provider.add_step(&step).expect("add step");
    }
    provider
        .update_step(
            1,
            &StepUpdate {
                status: Some(StepStatus::Completed),
                started_at: Some(ts(1)),
                completed_at: Some(ts(2)),
                ..StepUpdate::default()
            },
        )
        .expect("complete step");

    provider
        .save_file(&PlanFile::new("doc", "summary.md", "# Summary", ts(0)))
        .expect("save file");
    provider
        .save_file(&PlanFile::new("research", "ranking.md", "BM25 notes", ts(3)))
        .expect("save file");

    for (offset, event_type) in [
        (0, TimelineEventType::PlanCreated),
        (1, TimelineEventType::StepStarted),
        (2, TimelineEventType::StepCompleted),
        (4, TimelineEventType::StageChanged),
    ] {
        provider
            .add_timeline_event(&NewTimelineEvent::new(
                event_type,
                ts(offset),
                json!({"offset": offset}),
            ))
            .expect("add event");
    }

    let mut evidence = Evidence::new("Users search by SKU", ts(5));
    evidence.relevance = Some(0.9);
    provider.add_evidence(&evidence).expect("add evidence");
    provider
        .add_evidence(&Evidence::new("Typos in 12% of queries", ts(6)))
        .expect("add evidence");

    let mut feedback = Feedback::new("Prioritize typo tolerance", ts(7));
    feedback.participants = vec!["pm".to_string()];
    provider.add_feedback(&feedback).expect("add feedback");
    provider
        .add_feedback(&Feedback::new("Keep latency under 50ms", ts(8)))
        .expect("add feedback");

    provider.create_checkpoint("mid-flight").expect("checkpoint");
    provider.close().expect("close");
}

#[test]
fn roundtrip_copies_everything_and_validates() {
    let dir = tempdir().expect("temp dir");
    let source_path = dir.path().join("search.plan");
    let target_path = dir.path().join("copy.plan");
    seed_plan(&source_path);

    let mut phases: Vec<MigrationProgress> = Vec::new();
    let mut on_progress = |progress: &MigrationProgress| phases.push(progress.clone());
    let result = Migrator::new(PlanConfig::default()).migrate(
        &source_path,
        &target_path,
        open(&source_path),
        open(&target_path),
        MigrationOptions {
            on_progress: Some(&mut on_progress),
            ..MigrationOptions::default()
        },
    );

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.stats.steps_converted, 3);
    assert_eq!(result.stats.files_converted, 2);
    assert_eq!(result.stats.timeline_events_converted, 4);
    assert_eq!(result.stats.evidence_converted, 2);
    assert_eq!(result.stats.feedback_converted, 2);
    assert_eq!(result.stats.checkpoints_converted, 1);
    let validation = result.validation.expect("validation ran");
    assert!(validation.valid);
    assert!(validation.errors.is_empty());
    assert!(!result.source_deleted);
    assert!(source_path.exists());

    let seen: Vec<MigrationPhase> = phases.iter().map(|p| p.phase).collect();
    assert_eq!(seen.first(), Some(&MigrationPhase::Preparing));
    assert!(seen.contains(&MigrationPhase::Validating));
    assert_eq!(seen.last(), Some(&MigrationPhase::Complete));
    assert!(!seen.contains(&MigrationPhase::Cleanup));

    let target = open(&target_path);
    let metadata = target.get_metadata().expect("metadata");
    assert_eq!(metadata.id, "search-revamp");
    assert_eq!(metadata.stage, PlanStage::Executing);
    let step = target.get_step(1).expect("step").expect("present");
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.completed_at, Some(ts(2)));
    let timeline = target
        .get_timeline(&TimelineQuery::default())
        .expect("timeline");
    assert_eq!(timeline[0].event_type, TimelineEventType::StageChanged);
    assert!(target.get_checkpoint("mid-flight").expect("get").is_some());
}

#[test]
fn existing_target_is_refused_without_overwrite() {
    let dir = tempdir().expect("temp dir");
    let source_path = dir.path().join("search.plan");
    let target_path = dir.path().join("taken.plan");
    seed_plan(&source_path);
    {
        let target = open(&target_path);
        target
            .initialize(&PlanMetadata::new("occupant", "Occupant", ts(0)))
            .expect("initialize");
        target.close().expect("close");
    }

    let result = Migrator::new(PlanConfig::default()).migrate(
        &source_path,
        &target_path,
        open(&source_path),
        open(&target_path),
        MigrationOptions::default(),
    );

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|error| error.contains("already exists")));
    let target = open(&target_path);
    assert_eq!(target.get_metadata().expect("metadata").id, "occupant");
    assert!(target.get_steps().expect("steps").is_empty());
}

#[test]
fn overwrite_replaces_existing_target() {
    let dir = tempdir().expect("temp dir");
    let source_path = dir.path().join("search.plan");
    let target_path = dir.path().join("taken.plan");
    seed_plan(&source_path);
    {
        let target = open(&target_path);
        target
            .initialize(&PlanMetadata::new("occupant", "Occupant", ts(0)))
            .expect("initialize");
        target
            .add_step(&Step::new(9, "stale", "Stale"))
            .expect("add step");
        target.close().expect("close");
    }

    let result = Migrator::new(PlanConfig::default()).migrate(
        &source_path,
        &target_path,
        open(&source_path),
        open(&target_path),
        MigrationOptions {
            overwrite: true,
            ..MigrationOptions::default()
        },
    );

    assert!(result.success, "{:?}", result.error);
    assert!(result.warnings.iter().any(|w| w.contains("Replaced")));
    let target = open(&target_path);
    assert_eq!(target.get_metadata().expect("metadata").id, "search-revamp");
    assert!(target.get_step(9).expect("step").is_none());
}

#[test]
fn source_is_deleted_with_side_files_when_not_kept() {
    let dir = tempdir().expect("temp dir");
    let source_path = dir.path().join("search.plan");
    let target_path = dir.path().join("moved.plan");
    seed_plan(&source_path);

    let result = Migrator::new(PlanConfig::default()).migrate(
        &source_path,
        &target_path,
        open(&source_path),
        open(&target_path),
        MigrationOptions {
            keep_source: false,
            ..MigrationOptions::default()
        },
    );

    assert!(result.success, "{:?}", result.error);
    assert!(result.source_deleted);
    assert!(!source_path.exists());
    assert!(!side_file(&source_path, "-wal").exists());
    assert!(!side_file(&source_path, "-shm").exists());
    assert!(target_path.exists());
}

#[test]
fn missing_source_plan_fails_on_metadata() {
    let dir = tempdir().expect("temp dir");
    let source_path = dir.path().join("empty.plan");
    let target_path = dir.path().join("copy.plan");

    let result = Migrator::new(PlanConfig::default()).migrate(
        &source_path,
        &target_path,
        open(&source_path),
        open(&target_path),
        MigrationOptions::default(),
    );

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|error| error.contains("source metadata")));
    assert_eq!(result.stats.steps_converted, 0);
}

#[test]
fn validation_failure_aborts_and_keeps_source() {
    let dir = tempdir().expect("temp dir");
    let source_path = dir.path().join("search.plan");
    let target_path = dir.path().join("lossy.plan");
    seed_plan(&source_path);

    let lossy = FaultyTarget {
        inner: SqliteProvider::open(&target_path, &PlanConfig::default().sqlite)
            .expect("open target"),
        drop_feedback: true,
        fail_timeline: false,
    };
    let result = Migrator::new(PlanConfig::default()).migrate(
        &source_path,
        &target_path,
        open(&source_path),
        Box::new(lossy),
        MigrationOptions {
            keep_source: false,
            ..MigrationOptions::default()
        },
    );

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|error| error.contains("Validation failed with 2 error(s)")));
    assert_eq!(result.stats.feedback_converted, 2);
    let validation = result.validation.expect("validation ran");
    assert!(validation
        .errors
        .iter()
        .all(|error| error.kind == ValidationErrorKind::ContentMismatch));
    assert!(!result.source_deleted);
    assert!(source_path.exists());
}

#[test]
fn same_store_overwrite_is_refused_and_plan_survives() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("search.plan");
    seed_plan(&path);
    let alias = dir.path().join(".").join("search.plan");

    let result = Migrator::new(PlanConfig::default()).migrate(
        &path,
        &alias,
        open(&path),
        open(&alias),
        MigrationOptions {
            overwrite: true,
            keep_source: false,
            ..MigrationOptions::default()
        },
    );

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|error| error.contains("same store")));
    assert!(!result.source_deleted);
    let provider = open(&path);
    assert!(provider.exists());
    assert_eq!(provider.get_metadata().expect("metadata").id, "search-revamp");
    assert_eq!(provider.get_steps().expect("steps").len(), 3);
}

#[test]
fn unreadable_target_timeline_is_only_a_warning() {
    let dir = tempdir().expect("temp dir");
    let source_path = dir.path().join("search.plan");
    let copy_path = dir.path().join("copy.plan");
    seed_plan(&source_path);
    let copied = Migrator::new(PlanConfig::default()).migrate(
        &source_path,
        &copy_path,
        open(&source_path),
        open(&copy_path),
        MigrationOptions::default(),
    );
    assert!(copied.success, "{:?}", copied.error);

    let source = open(&source_path);
    let target = FaultyTarget {
        inner: SqliteProvider::open(&copy_path, &PlanConfig::default().sqlite)
            .expect("open target"),
        drop_feedback: false,
        fail_timeline: true,
    };
    let report = validate(source.as_ref(), &target);

    assert!(report.valid, "{:?}", report.errors);
    assert!(report
        .warnings
        .iter()
        .any(|warning| warning.starts_with("Failed to read target timeline")));
    assert_eq!(report.counts.timeline_events, 0);
}

fn side_file(path: &Path, suffix: &str) -> PathBuf {
    let mut side = path.as_os_str().to_owned();
    side.push(suffix);
    PathBuf::from(side)
}

/// Wraps a real store and injects feedback loss or timeline read failures.
struct FaultyTarget {
    inner: SqliteProvider,
    drop_feedback: bool,
    fail_timeline: bool,
}

impl StorageProvider for FaultyTarget {
    fn format(&self) -> PlanFormat {
        self.inner.format()
    }

    fn path(&self) -> &Path {
        self.inner.path()
    }

    fn exists(&self) -> bool {
        self.inner.exists()
    }

    fn initialize(&self, metadata: &PlanMetadata) -> Result<(), StorageError> {
        self.inner.initialize(metadata)
    }

    fn delete_plan(&self) -> Result<bool, StorageError> {
        self.inner.delete_plan()
    }

    fn get_metadata(&self) -> Result<PlanMetadata, StorageError> {
        self.inner.get_metadata()
    }

    fn update_metadata(&self, update: &MetadataUpdate) -> Result<(), StorageError> {
        self.inner.update_metadata(update)
    }

    fn get_steps(&self) -> Result<Vec<Step>, StorageError> {
        self.inner.get_steps()
    }

    fn get_step(&self, number: u32) -> Result<Option<Step>, StorageError> {
        self.inner.get_step(number)
    }

    fn add_step(&self, step: &Step) -> Result<(), StorageError> {
        self.inner.add_step(step)
    }

    fn update_step(&self, number: u32, update: &StepUpdate) -> Result<(), StorageError> {
        self.inner.update_step(number, update)
    }

    fn delete_step(&self, number: u32) -> Result<bool, StorageError> {
        self.inner.delete_step(number)
    }

    fn get_files(&self, file_type: Option<&str>) -> Result<Vec<PlanFile>, StorageError> {
        self.inner.get_files(file_type)
    }

    fn get_file(&self, file_type: &str, filename: &str) -> Result<Option<PlanFile>, StorageError> {
        self.inner.get_file(file_type, filename)
    }

    fn save_file(&self, file: &PlanFile) -> Result<(), StorageError> {
        self.inner.save_file(file)
    }

    fn delete_file(&self, file_type: &str, filename: &str) -> Result<bool, StorageError> {
        self.inner.delete_file(file_type, filename)
    }

    fn add_timeline_event(&self, event: &NewTimelineEvent) -> Result<TimelineEvent, StorageError> {
        self.inner.add_timeline_event(event)
    }

    fn get_timeline(&self, query: &TimelineQuery) -> Result<Vec<TimelineEvent>, StorageError> {
        if self.fail_timeline {
            return Err(StorageError::InvalidInput("timeline unavailable".to_string()));
        }
        self.inner.get_timeline(query)
    }

    fn add_evidence(&self, evidence: &Evidence) -> Result<(), StorageError> {
        self.inner.add_evidence(evidence)
    }

    fn get_evidence(&self) -> Result<Vec<Evidence>, StorageError> {
        self.inner.get_evidence()
    }

    fn add_feedback(&self, feedback: &Feedback) -> Result<(), StorageError> {
        if self.drop_feedback {
            return Ok(());
        }
        self.inner.add_feedback(feedback)
    }

    fn get_feedback(&self) -> Result<Vec<Feedback>, StorageError> {
        self.inner.get_feedback()
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.inner.save_checkpoint(checkpoint)
    }

    fn get_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, StorageError> {
        self.inner.get_checkpoint(name)
    }

    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError> {
        self.inner.list_checkpoints()
    }

    fn restore_checkpoint(&self, name: &str) -> Result<(), StorageError> {
        self.inner.restore_checkpoint(name)
    }

    fn delete_checkpoint(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.delete_checkpoint(name)
    }

    fn search(&self, query: &str) -> Result<Vec<SearchHit>, StorageError> {
        self.inner.search(query)
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        Box::new(self.inner).close()
    }
}
