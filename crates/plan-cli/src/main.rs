use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use plan_core::format::{detect_plan_format, plan_name_from_path, validate_plan_path};
use plan_core::{
    new_record_id, NewTimelineEvent, PlanConfig, PlanFormat, PlanMetadata, TimelineEventType,
};
use plan_migrate::{
    generate_target_path, infer_target_format, same_store, validate, MigrationOptions,
    MigrationProgress, Migrator, ValidationReport,
};
use plan_storage::{ProviderFactory, StorageProvider};
use serde::Serialize;
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod export;

#[derive(Parser)]
#[command(name = "plan")]
#[command(about = "Plan storage, checkpoints and format migration", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the storage format of a path
    Detect { path: PathBuf },
    /// Create a new plan
    Init {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        format: Option<PlanFormat>,
    },
    /// Print metadata, steps and collection counts
    Show { path: PathBuf },
    /// Substring search across steps, files and evidence
    Search {
        path: PathBuf,
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Manage checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointCommands,
    },
    /// Copy a plan into another store, by default in the other format
    Migrate {
        source: PathBuf,
        #[arg(long)]
        target: Option<PathBuf>,
        #[arg(long)]
        to: Option<PlanFormat>,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        delete_source: bool,
        #[arg(long)]
        no_validate: bool,
    },
    /// Compare two plans for fidelity
    Validate { source: PathBuf, target: PathBuf },
    /// Render a plan as markdown files
    Export {
        path: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    Create { path: PathBuf, name: String },
    Restore { path: PathBuf, name: String },
    List { path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = match &cli.config {
        Some(path) => PlanConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PlanConfig::default(),
    };
    let factory = ProviderFactory::new(config);

    match cli.command {
        Commands::Detect { path } => detect(&path, cli.json),
        Commands::Init {
            path,
            name,
            id,
            description,
            format,
        } => init(&factory, &path, name, id, description, format, cli.json),
        Commands::Show { path } => show(&factory, &path, cli.json),
        Commands::Search { path, query, limit } => {
            search(&factory, &path, &query, limit, cli.json)
        }
        Commands::Checkpoint { action } => match action {
            CheckpointCommands::Create { path, name } => {
                create_checkpoint(&factory, &path, &name, cli.json)
            }
            CheckpointCommands::Restore { path, name } => {
                restore_checkpoint(&factory, &path, &name, cli.json)
            }
            CheckpointCommands::List { path } => list_checkpoints(&factory, &path, cli.json),
        },
        Commands::Migrate {
            source,
            target,
            to,
            overwrite,
            delete_source,
            no_validate,
        } => migrate(
            &factory,
            &source,
            target,
            to,
            MigrateFlags {
                overwrite,
                keep_source: !delete_source,
                validate: !no_validate,
            },
            cli.json,
        ),
        Commands::Validate { source, target } => {
            validate_plans(&factory, &source, &target, cli.json)
        }
        Commands::Export { path, out } => export_plan(&factory, &path, &out, cli.json),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to encode JSON output")?;
    println!("{rendered}");
    Ok(())
}

fn open_existing(factory: &ProviderFactory, path: &Path) -> Result<Box<dyn StorageProvider>> {
    let Some(format) = detect_plan_format(path) else {
        bail!("No plan found at {}", path.display());
    };
    let provider = factory
        .create_provider(path, Some(format))
        .with_context(|| format!("Failed to open {} plan at {}", format, path.display()))?;
    if !provider.exists() {
        bail!("No plan found at {}", path.display());
    }
    Ok(provider)
}

fn detect(path: &Path, json_output: bool) -> Result<()> {
    let format = detect_plan_format(path);
    let label = format.map(|f| f.as_str()).unwrap_or("unknown");
    if json_output {
        print_json(&json!({ "path": path.display().to_string(), "format": label }))
    } else {
        println!("{label}");
        Ok(())
    }
}

fn init(
    factory: &ProviderFactory,
    path: &Path,
    name: Option<String>,
    id: Option<String>,
    description: Option<String>,
    format: Option<PlanFormat>,
    json_output: bool,
) -> Result<()> {
    let format = format.unwrap_or_else(|| factory.resolve_format(path, None));
    let resolved = factory.resolve_path(path, format);
    validate_plan_path(&resolved.to_string_lossy(), format, factory.config())
        .map_err(anyhow::Error::msg)?;
    let provider = factory
        .create_provider(&resolved, Some(format))
        .with_context(|| format!("Failed to open {} plan at {}", format, resolved.display()))?;
    let name = name.unwrap_or_else(|| {
        plan_name_from_path(&path.to_string_lossy(), format, factory.config())
    });
    let now = Utc::now();
    let mut metadata = PlanMetadata::new(id.unwrap_or_else(new_record_id), name, now);
    metadata.description = description;

    provider.initialize(&metadata)?;
    provider.add_timeline_event(&NewTimelineEvent::new(
        TimelineEventType::PlanCreated,
        now,
        json!({ "name": metadata.name, "format": format.as_str() }),
    ))?;
    info!(
        event = "plan_initialized",
        path = %provider.path().display(),
        plan_id = %metadata.id,
        format = %format
    );

    if json_output {
        print_json(&json!({ "path": provider.path().display().to_string(), "metadata": metadata }))?;
    } else {
        println!("Created plan '{}' at {}", metadata.name, provider.path().display());
    }
    provider.close()?;
    Ok(())
}

fn show(factory: &ProviderFactory, path: &Path, json_output: bool) -> Result<()> {
    let provider = open_existing(factory, path)?;
    let metadata = provider.get_metadata()?;
    let steps = provider.get_steps()?;
    let files = provider.get_files(None)?;
    let evidence = provider.get_evidence()?;
    let feedback = provider.get_feedback()?;
    let checkpoints = provider.list_checkpoints()?;

    if json_output {
        let file_keys: Vec<_> = files
            .iter()
            .map(|file| json!({ "type": file.file_type, "filename": file.filename }))
            .collect();
        print_json(&json!({
            "format": provider.format().as_str(),
            "metadata": metadata,
            "steps": steps,
            "files": file_keys,
            "evidence": evidence.len(),
            "feedback": feedback.len(),
            "checkpoints": checkpoints.len(),
        }))?;
    } else {
        println!("{} ({})", metadata.name, metadata.id);
        println!("Stage: {}", metadata.stage);
        if let Some(description) = metadata.description.as_deref() {
            println!("{description}");
        }
        println!("Steps:");
        for step in &steps {
            println!("- [{}] {}. {}", step.status, step.number, step.title);
        }
        println!(
            "{} files, {} evidence, {} feedback, {} checkpoints",
            files.len(),
            evidence.len(),
            feedback.len(),
            checkpoints.len()
        );
    }
    provider.close()?;
    Ok(())
}

fn search(
    factory: &ProviderFactory,
    path: &Path,
    query: &str,
    limit: usize,
    json_output: bool,
) -> Result<()> {
    let provider = open_existing(factory, path)?;
    let mut hits = provider.search(query)?;
    hits.truncate(limit);

    if json_output {
        print_json(&hits)?;
    } else if hits.is_empty() {
        println!("No matches for '{query}'");
    } else {
        for hit in &hits {
            println!("{:.2} {} {} {}", hit.score, hit.kind, hit.id, hit.title);
            println!("     {}", hit.snippet);
        }
    }
    provider.close()?;
    Ok(())
}

fn create_checkpoint(
    factory: &ProviderFactory,
    path: &Path,
    name: &str,
    json_output: bool,
) -> Result<()> {
    let provider = open_existing(factory, path)?;
    let checkpoint = provider.create_checkpoint(name)?;
    provider.add_timeline_event(&NewTimelineEvent::new(
        TimelineEventType::CheckpointCreated,
        checkpoint.created_at,
        json!({ "name": checkpoint.name, "steps": checkpoint.snapshot.steps.len() }),
    ))?;
    info!(event = "checkpoint_created", path = %path.display(), name = %checkpoint.name);

    if json_output {
        print_json(&checkpoint)?;
    } else {
        println!("Saved checkpoint '{}'", checkpoint.name);
    }
    provider.close()?;
    Ok(())
}

fn restore_checkpoint(
    factory: &ProviderFactory,
    path: &Path,
    name: &str,
    json_output: bool,
) -> Result<()> {
    let provider = open_existing(factory, path)?;
    provider.restore_checkpoint(name)?;
    provider.add_timeline_event(&NewTimelineEvent::new(
        TimelineEventType::CheckpointRestored,
        Utc::now(),
        json!({ "name": name }),
    ))?;

    if json_output {
        print_json(&json!({ "restored": name }))?;
    } else {
        println!("Restored checkpoint '{name}'");
    }
    provider.close()?;
    Ok(())
}

fn list_checkpoints(factory: &ProviderFactory, path: &Path, json_output: bool) -> Result<()> {
    let provider = open_existing(factory, path)?;
    let checkpoints = provider.list_checkpoints()?;

    if json_output {
        let summary: Vec<_> = checkpoints
            .iter()
            .map(|checkpoint| {
                json!({
                    "name": checkpoint.name,
                    "createdAt": checkpoint.created_at,
                    "stage": checkpoint.snapshot.metadata.stage,
                    "steps": checkpoint.snapshot.steps.len(),
                    "files": checkpoint.snapshot.files.len(),
                })
            })
            .collect();
        print_json(&summary)?;
    } else if checkpoints.is_empty() {
        println!("No checkpoints");
    } else {
        for checkpoint in &checkpoints {
            println!(
                "{}  {}  stage={}",
                checkpoint.created_at.to_rfc3339(),
                checkpoint.name,
                checkpoint.snapshot.metadata.stage
            );
        }
    }
    provider.close()?;
    Ok(())
}

struct MigrateFlags {
    overwrite: bool,
    keep_source: bool,
    validate: bool,
}

fn migrate(
    factory: &ProviderFactory,
    source_path: &Path,
    target_path: Option<PathBuf>,
    to: Option<PlanFormat>,
    flags: MigrateFlags,
    json_output: bool,
) -> Result<()> {
    let Some(source_format) = detect_plan_format(source_path) else {
        bail!("Cannot detect plan format of {}", source_path.display());
    };
    let target_format = to.unwrap_or_else(|| infer_target_format(source_format));
    if !factory.supports(target_format) {
        bail!(
            "{target_format} provider not registered; use --to {source_format} --target <path> \
             for a {source_format} copy"
        );
    }
    let target_path = match target_path {
        Some(path) => path,
        None if target_format == source_format => {
            bail!("--target is required when copying within the {source_format} format")
        }
        None => PathBuf::from(generate_target_path(
            &source_path.to_string_lossy(),
            target_format,
            factory.config(),
        )),
    };
    if same_store(source_path, &factory.resolve_path(&target_path, target_format)) {
        bail!(
            "Source and target are the same store: {}",
            source_path.display()
        );
    }

    let source = factory
        .create_provider(source_path, Some(source_format))
        .with_context(|| format!("Failed to open source {}", source_path.display()))?;
    let target = factory
        .create_provider(&target_path, Some(target_format))
        .with_context(|| format!("Failed to open target {}", target_path.display()))?;
    let source_path = source.path().to_path_buf();
    let target_path = target.path().to_path_buf();

    let mut on_progress = |progress: &MigrationProgress| {
        if !json_output {
            eprintln!("[{:>3}%] {}", progress.percent, progress.message);
        }
    };
    let result = Migrator::new(factory.config().clone()).migrate(
        &source_path,
        &target_path,
        source,
        target,
        MigrationOptions {
            overwrite: flags.overwrite,
            keep_source: flags.keep_source,
            validate: flags.validate,
            on_progress: Some(&mut on_progress),
        },
    );

    if result.success {
        record_migration(factory, &result.target_path, target_format, &result.source_path);
    }
    if json_output {
        print_json(&result)?;
    } else {
        for warning in &result.warnings {
            println!("warning: {warning}");
        }
        let stats = &result.stats;
        println!(
            "{} steps, {} files, {} events, {} evidence, {} feedback, {} checkpoints in {}ms",
            stats.steps_converted,
            stats.files_converted,
            stats.timeline_events_converted,
            stats.evidence_converted,
            stats.feedback_converted,
            stats.checkpoints_converted,
            result.elapsed_ms
        );
    }
    match result.error {
        Some(error) => bail!("Migration failed: {error}"),
        None => {
            if !json_output {
                println!("Migrated to {}", result.target_path.display());
            }
            Ok(())
        }
    }
}

/// Best effort: a missing provenance event does not fail a completed migration.
fn record_migration(factory: &ProviderFactory, target: &Path, format: PlanFormat, source: &Path) {
    let appended = factory
        .create_provider(target, Some(format))
        .and_then(|provider| {
            provider.add_timeline_event(&NewTimelineEvent::new(
                TimelineEventType::PlanMigrated,
                Utc::now(),
                json!({ "from": source.display().to_string(), "format": format.as_str() }),
            ))?;
            provider.close()
        });
    if let Err(err) = appended {
        warn!(event = "migration_event_failed", target = %target.display(), error = %err);
    }
}

fn validate_plans(
    factory: &ProviderFactory,
    source_path: &Path,
    target_path: &Path,
    json_output: bool,
) -> Result<()> {
    let source = open_existing(factory, source_path)?;
    let target = open_existing(factory, target_path)?;
    let report = validate(source.as_ref(), target.as_ref());
    source.close()?;
    target.close()?;

    if json_output {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    if !report.valid {
        bail!("Validation failed with {} error(s)", report.errors.len());
    }
    Ok(())
}

fn print_report(report: &ValidationReport) {
    let counts = &report.counts;
    println!(
        "Compared {} steps, {} files, {} events, {} evidence, {} feedback",
        counts.steps, counts.files, counts.timeline_events, counts.evidence, counts.feedback
    );
    for error in &report.errors {
        println!("error[{}]: {}", error.kind.as_str(), error.message);
    }
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    println!("{}", if report.valid { "valid" } else { "invalid" });
}

fn export_plan(factory: &ProviderFactory, path: &Path, out: &Path, json_output: bool) -> Result<()> {
    let provider = open_existing(factory, path)?;
    let rendered = export::render_plan(provider.as_ref())?;
    provider.close()?;
    export::write_export(&rendered, out)?;
    let written = rendered.file_count();
    info!(event = "plan_exported", path = %path.display(), out = %out.display(), files = written);

    if json_output {
        print_json(&json!({ "out": out.display().to_string(), "files": written }))
    } else {
        println!("Wrote {written} files to {}", out.display());
        Ok(())
    }
}
