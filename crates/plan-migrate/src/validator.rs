use chrono::{DateTime, Utc};
use plan_core::{PlanFile, Step, TimelineEventType, TimelineQuery};
use plan_storage::{StorageError, StorageProvider};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    MissingStep,
    ContentMismatch,
    MetadataDifference,
    MissingFile,
    MissingEvent,
}

impl ValidationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationErrorKind::MissingStep => "missing_step",
            ValidationErrorKind::ContentMismatch => "content_mismatch",
            ValidationErrorKind::MetadataDifference => "metadata_difference",
            ValidationErrorKind::MissingFile => "missing_file",
            ValidationErrorKind::MissingEvent => "missing_event",
        }
    }
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ComparisonCounts {
    pub steps: usize,
    pub files: usize,
    pub timeline_events: usize,
    pub evidence: usize,
    pub feedback: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    pub counts: ComparisonCounts,
}

impl ValidationReport {
    fn error(&mut self, kind: ValidationErrorKind, message: impl Into<String>) {
        self.errors.push(ValidationError {
            kind,
            message: message.into(),
        });
    }

    fn read_failure(&mut self, kind: ValidationErrorKind, what: &str, err: &StorageError) {
        self.error(kind, format!("Failed to read {what}: {err}"));
    }

    fn read_warning(&mut self, what: &str, err: &StorageError) {
        self.warnings.push(format!("Failed to read {what}: {err}"));
    }
}

/// Compares two providers entity by entity. Timeline gaps and unreadable
/// timelines are warnings because event ids and copy-time timestamps may be
/// regenerated; everything else must round-trip exactly.
pub fn validate(source: &dyn StorageProvider, target: &dyn StorageProvider) -> ValidationReport {
    let mut report = ValidationReport::default();

    compare_metadata(source, target, &mut report);
    compare_steps(source, target, &mut report);
    compare_files(source, target, &mut report);
    compare_timeline(source, target, &mut report);
    compare_evidence(source, target, &mut report);
    compare_feedback(source, target, &mut report);

    report.valid = report.errors.is_empty();
    if report.valid {
        info!(
            event = "validation_passed",
            steps = report.counts.steps,
            files = report.counts.files,
            warnings = report.warnings.len()
        );
    } else {
        warn!(
            event = "validation_failed",
            errors = report.errors.len(),
            warnings = report.warnings.len()
        );
    }
    report
}

fn compare_metadata(
    source: &dyn StorageProvider,
    target: &dyn StorageProvider,
    report: &mut ValidationReport,
) {
    let source_meta = match source.get_metadata() {
        Ok(meta) => meta,
        Err(err) => {
            report.read_failure(ValidationErrorKind::MetadataDifference, "source metadata", &err);
            return;
        }
    };
    let target_meta = match target.get_metadata() {
        Ok(meta) => meta,
        Err(err) => {
            report.read_failure(ValidationErrorKind::MetadataDifference, "target metadata", &err);
            return;
        }
    };

    let fields = [
        ("id", source_meta.id.clone(), target_meta.id.clone()),
        ("name", source_meta.name.clone(), target_meta.name.clone()),
        (
            "stage",
            source_meta.stage.to_string(),
            target_meta.stage.to_string(),
        ),
    ];
    for (field, expected, actual) in fields {
        if expected != actual {
            report.error(
                ValidationErrorKind::MetadataDifference,
                format!("Metadata {field} differs: source '{expected}', target '{actual}'"),
            );
        }
    }
}

fn compare_steps(
    source: &dyn StorageProvider,
    target: &dyn StorageProvider,
    report: &mut ValidationReport,
) {
    let (source_steps, target_steps) = match (source.get_steps(), target.get_steps()) {
        (Ok(source_steps), Ok(target_steps)) => (source_steps, target_steps),
        (Err(err), _) => {
            report.read_failure(ValidationErrorKind::MissingStep, "source steps", &err);
            return;
        }
        (_, Err(err)) => {
            report.read_failure(ValidationErrorKind::MissingStep, "target steps", &err);
            return;
        }
    };
    report.counts.steps = source_steps.len();

    let by_number: BTreeMap<u32, &Step> = target_steps
        .iter()
        .map(|step| (step.number, step))
        .collect();

    for step in &source_steps {
        let Some(other) = by_number.get(&step.number) else {
            report.error(
                ValidationErrorKind::MissingStep,
                format!("Step {} '{}' is missing in target", step.number, step.title),
            );
            continue;
        };
        if step.title != other.title {
            report.error(
                ValidationErrorKind::ContentMismatch,
                format!(
                    "Step {} title differs: source '{}', target '{}'",
                    step.number, step.title, other.title
                ),
            );
        }
        if step.status != other.status {
            report.error(
                ValidationErrorKind::ContentMismatch,
                format!(
                    "Step {} status differs: source '{}', target '{}'",
                    step.number, step.status, other.status
                ),
            );
        }
        let (expected, actual) = (step.content.trim(), other.content.trim());
        if expected != actual {
            report.error(
                ValidationErrorKind::ContentMismatch,
                format!(
                    "Step {} content differs: source {} chars, target {} chars",
                    step.number,
                    expected.chars().count(),
                    actual.chars().count()
                ),
            );
        }
    }

    let source_numbers: BTreeSet<u32> = source_steps.iter().map(|step| step.number).collect();
    for step in &target_steps {
        if !source_numbers.contains(&step.number) {
            report.error(
                ValidationErrorKind::MissingStep,
                format!(
                    "Step {} '{}' exists in target but not in source",
                    step.number, step.title
                ),
            );
        }
    }
}

fn compare_files(
    source: &dyn StorageProvider,
    target: &dyn StorageProvider,
    report: &mut ValidationReport,
) {
    let (source_files, target_files) = match (source.get_files(None), target.get_files(None)) {
        (Ok(source_files), Ok(target_files)) => (source_files, target_files),
        (Err(err), _) => {
            report.read_failure(ValidationErrorKind::MissingFile, "source files", &err);
            return;
        }
        (_, Err(err)) => {
            report.read_failure(ValidationErrorKind::MissingFile, "target files", &err);
            return;
        }
    };
    report.counts.files = source_files.len();

    let by_key: BTreeMap<(&str, &str), &PlanFile> =
        target_files.iter().map(|file| (file.key(), file)).collect();

    for file in &source_files {
        let Some(other) = by_key.get(&file.key()) else {
            report.error(
                ValidationErrorKind::MissingFile,
                format!("File {}/{} is missing in target", file.file_type, file.filename),
            );
            continue;
        };
        let (expected, actual) = (file.content.trim(), other.content.trim());
        if expected != actual {
            report.error(
                ValidationErrorKind::ContentMismatch,
                format!(
                    "File {}/{} content differs: source {} chars, target {} chars",
                    file.file_type,
                    file.filename,
                    expected.chars().count(),
                    actual.chars().count()
                ),
            );
        }
    }

    let source_keys: BTreeSet<(&str, &str)> = source_files.iter().map(PlanFile::key).collect();
    for file in &target_files {
        if !source_keys.contains(&file.key()) {
            report.error(
                ValidationErrorKind::MissingFile,
                format!(
                    "File {}/{} exists in target but not in source",
                    file.file_type, file.filename
                ),
            );
        }
    }
}

fn compare_timeline(
    source: &dyn StorageProvider,
    target: &dyn StorageProvider,
    report: &mut ValidationReport,
) {
    let query = TimelineQuery::default();
    let (source_events, target_events) =
        match (source.get_timeline(&query), target.get_timeline(&query)) {
            (Ok(source_events), Ok(target_events)) => (source_events, target_events),
            (Err(err), _) => {
                report.read_warning("source timeline", &err);
                return;
            }
            (_, Err(err)) => {
                report.read_warning("target timeline", &err);
                return;
            }
        };
    report.counts.timeline_events = source_events.len();

    let present: HashSet<(TimelineEventType, DateTime<Utc>)> = target_events
        .iter()
        .map(|event| (event.event_type, event.timestamp))
        .collect();
    for event in &source_events {
        if !present.contains(&(event.event_type, event.timestamp)) {
            report.warnings.push(format!(
                "Timeline event {} at {} not found in target",
                event.event_type,
                event.timestamp.to_rfc3339()
            ));
        }
    }
}

fn compare_evidence(
    source: &dyn StorageProvider,
    target: &dyn StorageProvider,
    report: &mut ValidationReport,
) {
    let (source_items, target_items) = match (source.get_evidence(), target.get_evidence()) {
        (Ok(source_items), Ok(target_items)) => (source_items, target_items),
        (Err(err), _) => {
            report.read_failure(ValidationErrorKind::ContentMismatch, "source evidence", &err);
            return;
        }
        (_, Err(err)) => {
            report.read_failure(ValidationErrorKind::ContentMismatch, "target evidence", &err);
            return;
        }
    };
    report.counts.evidence = source_items.len();

    let present: HashSet<&str> = target_items
        .iter()
        .map(|item| item.description.as_str())
        .collect();
    for item in &source_items {
        if !present.contains(item.description.as_str()) {
            report.error(
                ValidationErrorKind::ContentMismatch,
                format!("Evidence '{}' is missing in target", item.description),
            );
        }
    }
}

fn compare_feedback(
    source: &dyn StorageProvider,
    target: &dyn StorageProvider,
    report: &mut ValidationReport,
) {
    let (source_items, target_items) = match (source.get_feedback(), target.get_feedback()) {
        (Ok(source_items), Ok(target_items)) => (source_items, target_items),
        (Err(err), _) => {
            report.read_failure(ValidationErrorKind::ContentMismatch, "source feedback", &err);
            return;
        }
        (_, Err(err)) => {
            report.read_failure(ValidationErrorKind::ContentMismatch, "target feedback", &err);
            return;
        }
    };
    report.counts.feedback = source_items.len();

    let present: HashSet<&str> = target_items
        .iter()
        .map(|item| item.content.as_str())
        .collect();
    for item in &source_items {
        if !present.contains(item.content.as_str()) {
            report.error(
                ValidationErrorKind::ContentMismatch,
                format!(
                    "Feedback '{}' is missing in target",
                    truncate_for_message(&item.content)
                ),
            );
        }
    }
}

fn truncate_for_message(text: &str) -> String {
    const LIMIT: usize = 60;
    if text.chars().count() <= LIMIT {
        return text.to_string();
    }
    let head: String = text.chars().take(LIMIT).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use plan_core::{
        Evidence, Feedback, MetadataUpdate, NewTimelineEvent, PlanMetadata, PlanStage, StepStatus,
        StepUpdate,
    };
    use plan_storage::SqliteProvider;
    use serde_json::json;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 8, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn populated() -> SqliteProvider {
        let provider = SqliteProvider::open_in_memory().expect("open");
        provider
            .initialize(&PlanMetadata::new("billing", "Billing revamp", ts(0)))
            .expect("initialize");
        let mut step = Step::new(1, "schema", "Design schema");
        step.content = "Tables and indexes".to_string();
        provider.add_step(&step).expect("step");
        provider
            .save_file(&PlanFile::new("doc", "summary.md", "Summary", ts(1)))
            .expect("file");
        provider
            .add_timeline_event(&NewTimelineEvent::new(
                TimelineEventType::PlanCreated,
                ts(0),
                json!({}),
            ))
            .expect("event");
        provider
            .add_evidence(&Evidence::new("Invoices grow 10% monthly", ts(2)))
            .expect("evidence");
        provider
            .add_feedback(&Feedback::new("Ship behind a flag", ts(3)))
            .expect("feedback");
        provider
    }

    #[test]
    fn identical_providers_are_valid() {
        let source = populated();
        let target = populated();
        let report = validate(&source, &target);
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.warnings.is_empty());
        assert_eq!(
            report.counts,
            ComparisonCounts {
                steps: 1,
                files: 1,
                timeline_events: 1,
                evidence: 1,
                feedback: 1,
            }
        );
    }

    #[test]
    fn whitespace_only_content_changes_are_ignored() {
        let source = populated();
        let target = populated();
        target
            .update_step(
                1,
                &StepUpdate {
                    content: Some("\n  Tables and indexes  \n".to_string()),
                    ..StepUpdate::default()
                },
            )
            .expect("update");
        assert!(validate(&source, &target).valid);
    }

    #[test]
    fn step_differences_are_hard_errors() {
        let source = populated();
        let target = populated();
        target
            .update_step(
                1,
                &StepUpdate {
                    status: Some(StepStatus::Completed),
                    content: Some("Different body".to_string()),
                    ..StepUpdate::default()
                },
            )
            .expect("update");
        target
            .add_step(&Step::new(2, "extra", "Unexpected"))
            .expect("extra step");

        let report = validate(&source, &target);
        assert!(!report.valid);
        let kinds: Vec<ValidationErrorKind> = report.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ValidationErrorKind::ContentMismatch,
                ValidationErrorKind::ContentMismatch,
                ValidationErrorKind::MissingStep,
            ]
        );
        assert!(report.errors[1].message.contains("18 chars"));
        assert!(report.errors[2].message.contains("not in source"));
    }

    #[test]
    fn metadata_and_missing_entities_are_reported() {
        let source = populated();
        let target = SqliteProvider::open_in_memory().expect("open");
        target
            .initialize(&PlanMetadata::new("billing", "Billing", ts(0)))
            .expect("initialize");
        target
            .update_metadata(&MetadataUpdate {
                stage: Some(PlanStage::Built),
                ..MetadataUpdate::default()
            })
            .expect("stage");

        let report = validate(&source, &target);
        assert!(!report.valid);
        let count = |kind| report.errors.iter().filter(|e| e.kind == kind).count();
        assert_eq!(count(ValidationErrorKind::MetadataDifference), 2);
        assert_eq!(count(ValidationErrorKind::MissingStep), 1);
        assert_eq!(count(ValidationErrorKind::MissingFile), 1);
        assert_eq!(count(ValidationErrorKind::ContentMismatch), 2);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.errors.iter().all(|e| e.kind != ValidationErrorKind::MissingEvent));
    }

    #[test]
    fn unreadable_metadata_is_a_hard_error() {
        let source = populated();
        let target = SqliteProvider::open_in_memory().expect("open");
        let report = validate(&source, &target);
        assert!(!report.valid);
        assert_eq!(report.errors[0].kind, ValidationErrorKind::MetadataDifference);
    }
}
