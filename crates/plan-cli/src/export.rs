use anyhow::{Context, Result};
use plan_core::{Evidence, Feedback, PlanFile, PlanMetadata, Step, StepStatus};
use plan_storage::{StorageError, StorageProvider};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Generated markdown keyed by relative filename, one map per output folder.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MarkdownExport {
    pub plan: BTreeMap<String, String>,
    pub steps: BTreeMap<String, String>,
    pub evidence: BTreeMap<String, String>,
    pub feedback: BTreeMap<String, String>,
}

impl MarkdownExport {
    pub fn file_count(&self) -> usize {
        self.plan.len() + self.steps.len() + self.evidence.len() + self.feedback.len()
    }

    fn collections(&self) -> [(&'static str, &BTreeMap<String, String>); 4] {
        [
            ("plan", &self.plan),
            ("steps", &self.steps),
            ("evidence", &self.evidence),
            ("feedback", &self.feedback),
        ]
    }
}

pub fn render_plan(provider: &dyn StorageProvider) -> Result<MarkdownExport, StorageError> {
    let metadata = provider.get_metadata()?;
    let steps = provider.get_steps()?;
    let files = provider.get_files(None)?;
    let evidence = provider.get_evidence()?;
    let feedback = provider.get_feedback()?;

    let mut export = MarkdownExport::default();
    export
        .plan
        .insert("summary.md".to_string(), render_summary(&metadata, &steps));
    export
        .plan
        .insert("status.md".to_string(), render_status(&steps));
    for file in &files {
        export.plan.insert(file_entry_name(file), file.content.clone());
    }
    for step in &steps {
        export.steps.insert(step_filename(step), render_step(step));
    }
    for (index, item) in evidence.iter().enumerate() {
        export
            .evidence
            .insert(format!("evidence-{:02}.md", index + 1), render_evidence(item));
    }
    for (index, item) in feedback.iter().enumerate() {
        export
            .feedback
            .insert(format!("feedback-{:02}.md", index + 1), render_feedback(item));
    }
    Ok(export)
}

/// Writes every collection under `out_dir/<collection>/`.
pub fn write_export(export: &MarkdownExport, out_dir: &Path) -> Result<()> {
    for (collection, entries) in export.collections() {
        for (name, body) in entries {
            let path = out_dir.join(collection).join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::write(&path, body)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
    }
    Ok(())
}

fn render_summary(metadata: &PlanMetadata, steps: &[Step]) -> String {
    let done = steps.iter().filter(|step| step.status.is_done()).count();
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", metadata.name));
    let description = metadata.description.as_deref().filter(|d| !d.trim().is_empty());
    if let Some(description) = description {
        out.push_str(&format!("{}\n\n", description.trim()));
    }
    out.push_str(&format!("- **Id:** {}\n", metadata.id));
    out.push_str(&format!("- **Stage:** {}\n", metadata.stage));
    out.push_str(&format!("- **Progress:** {done}/{} steps\n", steps.len()));
    out.push_str(&format!("- **Created:** {}\n", metadata.created_at.to_rfc3339()));
    out.push_str(&format!("- **Updated:** {}\n", metadata.updated_at.to_rfc3339()));
    out
}

fn render_status(steps: &[Step]) -> String {
    let mut out = String::from("# Status\n\n");
    if steps.is_empty() {
        out.push_str("_No steps yet._\n");
        return out;
    }
    for step in steps {
        out.push_str(&format!(
            "- [{}] {}. {} ({})\n",
            checkbox(step.status),
            step.number,
            step.title,
            step.status
        ));
    }
    out
}

fn render_step(step: &Step) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Step {}: {}\n\n", step.number, step.title));
    out.push_str(&format!("- **Code:** {}\n", step.code));
    out.push_str(&format!("- **Status:** {}\n", step.status));
    if let Some(started_at) = step.started_at {
        out.push_str(&format!("- **Started:** {}\n", started_at.to_rfc3339()));
    }
    if let Some(completed_at) = step.completed_at {
        out.push_str(&format!("- **Completed:** {}\n", completed_at.to_rfc3339()));
    }
    if let Some(description) = step.description.as_deref() {
        out.push_str(&format!("\n{}\n", description.trim()));
    }
    if !step.content.trim().is_empty() {
        out.push_str(&format!("\n{}\n", step.content.trim()));
    }
    out
}

fn render_evidence(evidence: &Evidence) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", evidence.description));
    let fields = [
        ("Source", evidence.source.as_deref()),
        ("URL", evidence.source_url.as_deref()),
        ("Method", evidence.gathering_method.as_deref()),
        ("Query", evidence.query.as_deref()),
        ("File", evidence.file_path.as_deref()),
    ];
    for (label, value) in fields {
        if let Some(value) = value {
            out.push_str(&format!("- **{label}:** {value}\n"));
        }
    }
    if let Some(relevance) = evidence.relevance {
        out.push_str(&format!("- **Relevance:** {relevance:.2}\n"));
    }
    out.push_str(&format!("- **Captured:** {}\n", evidence.created_at.to_rfc3339()));
    if let Some(summary) = evidence.summary.as_deref() {
        out.push_str(&format!("\n## Summary\n\n{}\n", summary.trim()));
    }
    if let Some(content) = evidence.content.as_deref() {
        out.push_str(&format!("\n## Content\n\n{}\n", content.trim()));
    }
    out
}

fn render_feedback(feedback: &Feedback) -> String {
    let mut out = String::new();
    let title = feedback.title.as_deref().unwrap_or("Feedback");
    out.push_str(&format!("# {title}\n\n"));
    if let Some(platform) = feedback.platform.as_deref() {
        out.push_str(&format!("- **Platform:** {platform}\n"));
    }
    if !feedback.participants.is_empty() {
        let participants = feedback.participants.join(", ");
        out.push_str(&format!("- **Participants:** {participants}\n"));
    }
    out.push_str(&format!("- **Received:** {}\n", feedback.created_at.to_rfc3339()));
    out.push_str(&format!("\n{}\n", feedback.content.trim()));
    out
}

fn checkbox(status: StepStatus) -> char {
    match status {
        StepStatus::Completed => 'x',
        StepStatus::InProgress => '~',
        StepStatus::Skipped => '-',
        StepStatus::Pending => ' ',
    }
}

fn step_filename(step: &Step) -> String {
    let code = slug(&step.code);
    if code.is_empty() {
        format!("{:02}.md", step.number)
    } else {
        format!("{:02}-{code}.md", step.number)
    }
}

fn file_entry_name(file: &PlanFile) -> String {
    let folder = match slug(&file.file_type) {
        folder if folder.is_empty() => "misc".to_string(),
        folder => folder,
    };
    format!("{folder}/{}", sanitize_filename(&file.filename))
}

fn slug(value: &str) -> String {
    let mut out = String::new();
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect();
    match cleaned.trim_start_matches('.') {
        "" => "untitled.md".to_string(),
        rest => rest.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use plan_core::{PlanStage, StepUpdate};
    use plan_storage::SqliteProvider;
    use tempfile::tempdir;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    fn seeded() -> SqliteProvider {
        let provider = SqliteProvider::open_in_memory().expect("open");
        let mut metadata = PlanMetadata::new("billing", "Billing rework", ts());
        metadata.description = Some("Move invoices to the new ledger".to_string());
        metadata.stage = PlanStage::Built;
        provider.initialize(&metadata).expect("initialize");
        provider
            .add_step(&Step::new(1, "Schema Design", "Design schema"))
            .expect("step");
        provider
            .add_step(&Step::new(2, "", "Backfill"))
            .expect("step");
        provider
            .update_step(
                1,
                &StepUpdate {
                    status: Some(StepStatus::Completed),
                    ..StepUpdate::default()
                },
            )
            .expect("update");
        provider
            .save_file(&PlanFile::new("research", "../notes.md", "ledger notes", ts()))
            .expect("file");
        let mut evidence = Evidence::new("Invoices grow 10% monthly", ts());
        evidence.relevance = Some(0.75);
        provider.add_evidence(&evidence).expect("evidence");
        let mut feedback = Feedback::new("Ship behind a flag", ts());
        feedback.participants = vec!["finance".to_string(), "ops".to_string()];
        provider.add_feedback(&feedback).expect("feedback");
        provider
    }

    #[test]
    fn renders_all_four_collections() {
        let provider = seeded();
        let export = render_plan(&provider).expect("render");

        let keys: Vec<&str> = export.plan.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["research/_notes.md", "status.md", "summary.md"]);
        let summary = &export.plan["summary.md"];
        assert!(summary.starts_with("# Billing rework\n"));
        assert!(summary.contains("- **Stage:** built"));
        assert!(summary.contains("- **Progress:** 1/2 steps"));
        assert!(export.plan["status.md"].contains("- [x] 1. Design schema (completed)"));
        assert!(export.plan["status.md"].contains("- [ ] 2. Backfill (pending)"));

        let step_keys: Vec<&str> = export.steps.keys().map(String::as_str).collect();
        assert_eq!(step_keys, vec!["01-schema-design.md", "02.md"]);

        assert!(export.evidence["evidence-01.md"].contains("- **Relevance:** 0.75"));
        assert!(export.feedback["feedback-01.md"].contains("- **Participants:** finance, ops"));
        assert_eq!(export.file_count(), 7);
    }

    fn count_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").path())
            .map(|path| if path.is_dir() { count_files(&path) } else { 1 })
            .sum()
    }

    #[test]
    fn writes_collections_under_output_dir() {
        let provider = seeded();
        let export = render_plan(&provider).expect("render");
        let dir = tempdir().expect("temp dir");

        write_export(&export, dir.path()).expect("write");
        assert_eq!(count_files(dir.path()), export.file_count());
        let status = fs::read_to_string(dir.path().join("plan/status.md")).expect("read");
        assert!(status.starts_with("# Status"));
        assert!(dir.path().join("plan/research/_notes.md").exists());
        assert!(dir.path().join("steps/02.md").exists());
        assert!(dir.path().join("feedback/feedback-01.md").exists());
    }

    #[test]
    fn empty_plan_renders_placeholder_status() {
        let provider = SqliteProvider::open_in_memory().expect("open");
        provider
            .initialize(&PlanMetadata::new("empty", "Empty", ts()))
            .expect("initialize");
        let export = render_plan(&provider).expect("render");
        assert!(export.plan["status.md"].contains("_No steps yet._"));
        assert!(export.steps.is_empty());
    }

    #[test]
    fn slugs_collapse_punctuation() {
        assert_eq!(slug("  Schema Design!! v2 "), "schema-design-v2");
        assert_eq!(slug("---"), "");
        assert_eq!(sanitize_filename("../a/b.md"), "_a_b.md");
        assert_eq!(sanitize_filename("..."), "untitled.md");
    }
}
