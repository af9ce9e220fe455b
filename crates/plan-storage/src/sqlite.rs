use crate::search::{rank_hits, score_for_count, snippet_around, SearchTerm};
use crate::{StorageError, StorageProvider};
use chrono::{DateTime, SecondsFormat, Utc};
use plan_core::{
    Checkpoint, Evidence, Feedback, MetadataUpdate, NewTimelineEvent, PlanFile, PlanFormat,
    PlanMetadata, PlanStage, SearchHit, SearchHitKind, SqliteConfig, Step, StepStatus, StepUpdate,
    TimelineEvent, TimelineEventType, TimelineQuery, PLAN_SCHEMA_VERSION,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA_SQL: &str = include_str!("../migrations/0001_plan_schema.sql");

const STEP_COLUMNS: &str =
    "number, code, title, description, status, started_at, completed_at, content";
const FILE_COLUMNS: &str = "type, filename, content, created_at, updated_at";
const EVIDENCE_COLUMNS: &str = "id, description, source, source_url, gathering_method, content, \
     file_path, relevance, query, summary, created_at";
const FEEDBACK_COLUMNS: &str = "id, title, platform, content, participants_json, created_at";

pub struct SqliteProvider {
    conn: Connection,
    path: PathBuf,
    plan_id: Cell<Option<i64>>,
}

impl SqliteProvider {
    pub fn open(path: impl AsRef<Path>, config: &SqliteConfig) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        let provider = Self {
            conn,
            path,
            plan_id: Cell::new(None),
        };
        provider.configure(config)?;
        Ok(provider)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let provider = Self {
            conn,
            path: PathBuf::from(":memory:"),
            plan_id: Cell::new(None),
        };
        provider.configure(&SqliteConfig::default())?;
        Ok(provider)
    }

    fn configure(&self, config: &SqliteConfig) -> Result<(), StorageError> {
        let mode: String = self.conn.pragma_update_and_check(
            None,
            "journal_mode",
            config.journal_mode.as_str(),
            |row| row.get(0),
        )?;
        self.conn
            .pragma_update(None, "foreign_keys", config.foreign_keys)?;
        self.conn
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        debug!(
            event = "sqlite_opened",
            path = %self.path.display(),
            journal_mode = %mode,
            foreign_keys = config.foreign_keys
        );
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    fn lookup_plan_row(&self) -> Result<Option<i64>, StorageError> {
        if !self.table_exists("plans")? {
            return Ok(None);
        }
        Ok(self
            .conn
            .query_row("SELECT id FROM plans ORDER BY id LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn plan_id(&self) -> Result<i64, StorageError> {
        if let Some(id) = self.plan_id.get() {
            return Ok(id);
        }
        let id = self
            .lookup_plan_row()?
            .ok_or_else(|| StorageError::NoPlan(self.path.display().to_string()))?;
        self.plan_id.set(Some(id));
        Ok(id)
    }

    fn collect_steps(&self, sql: &str, plan_id: i64) -> Result<Vec<Step>, StorageError> {
        let mut statement = self.conn.prepare(sql)?;
        let rows = statement.query_map([plan_id], step_from_row)?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row?);
        }
        Ok(steps)
    }
}

impl StorageProvider for SqliteProvider {
    fn format(&self) -> PlanFormat {
        PlanFormat::Sqlite
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn exists(&self) -> bool {
        matches!(self.lookup_plan_row(), Ok(Some(_)))
    }

    fn initialize(&self, metadata: &PlanMetadata) -> Result<(), StorageError> {
        if metadata.id.trim().is_empty() {
            return Err(StorageError::InvalidInput(
                "plan id cannot be empty".to_string(),
            ));
        }
        self.conn.execute_batch(SCHEMA_SQL)?;
        if self.lookup_plan_row()?.is_some() {
            let existing: String = self
                .conn
                .query_row("SELECT code FROM plans ORDER BY id LIMIT 1", [], |row| {
                    row.get(0)
                })?;
            return Err(StorageError::PlanExists {
                path: self.path.display().to_string(),
                plan_id: existing,
            });
        }

        self.conn.execute(
            "
            INSERT INTO plans (
                code,
                name,
                description,
                stage,
                created_at,
                updated_at,
                schema_version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                metadata.id,
                metadata.name,
                metadata.description,
                metadata.stage.as_str(),
                format_timestamp(metadata.created_at),
                format_timestamp(metadata.updated_at),
                i64::from(PLAN_SCHEMA_VERSION),
            ],
        )?;
        self.plan_id.set(Some(self.conn.last_insert_rowid()));

        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![
                i64::from(PLAN_SCHEMA_VERSION),
                format_timestamp(Utc::now())
            ],
        )?;
        self.conn
            .pragma_update(None, "user_version", i64::from(PLAN_SCHEMA_VERSION))?;

        info!(
            event = "plan_initialized",
            path = %self.path.display(),
            plan = %metadata.id
        );
        Ok(())
    }

    fn delete_plan(&self) -> Result<bool, StorageError> {
        let Some(plan_id) = self.lookup_plan_row()? else {
            return Ok(false);
        };
        let changes = self
            .conn
            .execute("DELETE FROM plans WHERE id = ?1", [plan_id])?;
        self.plan_id.set(None);
        info!(event = "plan_deleted", path = %self.path.display());
        Ok(changes > 0)
    }

    fn get_metadata(&self) -> Result<PlanMetadata, StorageError> {
        let plan_id = self.plan_id()?;
        let metadata = self.conn.query_row(
            "
            SELECT code, name, description, stage, created_at, updated_at, schema_version
            FROM plans
            WHERE id = ?1
            ",
            [plan_id],
            |row| {
                Ok(PlanMetadata {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    stage: parse_enum::<PlanStage>(row, 3)?,
                    created_at: timestamp_column(row, 4)?,
                    updated_at: timestamp_column(row, 5)?,
                    schema_version: row.get::<_, i64>(6)? as u32,
                })
            },
        )?;
        Ok(metadata)
    }

    fn update_metadata(&self, update: &MetadataUpdate) -> Result<(), StorageError> {
        let plan_id = self.plan_id()?;
        if update.is_empty() {
            return Ok(());
        }
        let mut patch = Patch::default();
        patch.set_opt("name", update.name.clone().map(SqlValue::Text));
        patch.set_opt("description", update.description.clone().map(SqlValue::Text));
        patch.set_opt(
            "stage",
            update
                .stage
                .map(|stage| SqlValue::Text(stage.as_str().to_string())),
        );
        patch.set("updated_at", SqlValue::Text(format_timestamp(Utc::now())));
        patch.apply(&self.conn, "plans", "id = ?", vec![SqlValue::Integer(plan_id)])?;
        Ok(())
    }

    fn get_steps(&self) -> Result<Vec<Step>, StorageError> {
        let plan_id = self.plan_id()?;
        self.collect_steps(
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE plan_id = ?1 ORDER BY number ASC"),
            plan_id,
        )
    }

    fn get_step(&self, number: u32) -> Result<Option<Step>, StorageError> {
        let plan_id = self.plan_id()?;
        let step = self
            .conn
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE plan_id = ?1 AND number = ?2"),
                params![plan_id, i64::from(number)],
                step_from_row,
            )
            .optional()?;
        Ok(step)
    }

    fn add_step(&self, step: &Step) -> Result<(), StorageError> {
        let plan_id = self.plan_id()?;
        if step.number == 0 {
            return Err(StorageError::InvalidInput(
                "step numbers start at 1".to_string(),
            ));
        }
        let result = self.conn.execute(
            "
            INSERT INTO steps (
                plan_id,
                number,
                code,
                title,
                description,
                status,
                started_at,
                completed_at,
                content
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                plan_id,
                i64::from(step.number),
                step.code,
                step.title,
                step.description,
                step.status.as_str(),
                step.started_at.map(format_timestamp),
                step.completed_at.map(format_timestamp),
                step.content,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(StorageError::StepExists(step.number)),
            Err(err) => Err(err.into()),
        }
    }

    fn update_step(&self, number: u32, update: &StepUpdate) -> Result<(), StorageError> {
        let plan_id = self.plan_id()?;
        if update.is_empty() {
            return Ok(());
        }
        let mut patch = Patch::default();
        patch.set_opt("code", update.code.clone().map(SqlValue::Text));
        patch.set_opt("title", update.title.clone().map(SqlValue::Text));
        patch.set_opt("description", update.description.clone().map(SqlValue::Text));
        patch.set_opt(
            "status",
            update
                .status
                .map(|status| SqlValue::Text(status.as_str().to_string())),
        );
        patch.set_opt(
            "started_at",
            update.started_at.map(|ts| SqlValue::Text(format_timestamp(ts))),
        );
        patch.set_opt(
            "completed_at",
            update
                .completed_at
                .map(|ts| SqlValue::Text(format_timestamp(ts))),
        );
        patch.set_opt("content", update.content.clone().map(SqlValue::Text));
        let changes = patch.apply(
            &self.conn,
            "steps",
            "plan_id = ? AND number = ?",
            vec![SqlValue::Integer(plan_id), SqlValue::Integer(i64::from(number))],
        )?;
        if changes == 0 {
            return Err(StorageError::StepNotFound(number));
        }
        Ok(())
    }

    fn delete_step(&self, number: u32) -> Result<bool, StorageError> {
        let plan_id = self.plan_id()?;
        let changes = self.conn.execute(
            "DELETE FROM steps WHERE plan_id = ?1 AND number = ?2",
            params![plan_id, i64::from(number)],
        )?;
        Ok(changes > 0)
    }

    fn get_files(&self, file_type: Option<&str>) -> Result<Vec<PlanFile>, StorageError> {
        let plan_id = self.plan_id()?;
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT {FILE_COLUMNS}
            FROM files
            WHERE plan_id = ?1 AND (?2 IS NULL OR type = ?2)
            ORDER BY type ASC, filename ASC
            "
        ))?;
        let rows = statement.query_map(params![plan_id, file_type], file_from_row)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    fn get_file(&self, file_type: &str, filename: &str) -> Result<Option<PlanFile>, StorageError> {
        let plan_id = self.plan_id()?;
        let file = self
            .conn
            .query_row(
                &format!(
                    "SELECT {FILE_COLUMNS} FROM files WHERE plan_id = ?1 AND type = ?2 AND filename = ?3"
                ),
                params![plan_id, file_type, filename],
                file_from_row,
            )
            .optional()?;
        Ok(file)
    }

    fn save_file(&self, file: &PlanFile) -> Result<(), StorageError> {
        let plan_id = self.plan_id()?;
        upsert_file(
            &self.conn,
            plan_id,
            &file.file_type,
            &file.filename,
            &file.content,
            file.created_at,
            file.updated_at,
        )
    }

    fn delete_file(&self, file_type: &str, filename: &str) -> Result<bool, StorageError> {
        let plan_id = self.plan_id()?;
        let changes = self.conn.execute(
            "DELETE FROM files WHERE plan_id = ?1 AND type = ?2 AND filename = ?3",
            params![plan_id, file_type, filename],
        )?;
        Ok(changes > 0)
    }

    fn add_timeline_event(&self, event: &NewTimelineEvent) -> Result<TimelineEvent, StorageError> {
        let plan_id = self.plan_id()?;
        let id = event
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(plan_core::new_record_id);
        let data_json = serde_json::to_string(&event.data)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT INTO timeline_events (id, plan_id, timestamp, type, data_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                id,
                plan_id,
                format_timestamp(event.timestamp),
                event.event_type.as_str(),
                data_json,
            ],
        )?;
        Ok(TimelineEvent {
            id,
            timestamp: event.timestamp,
            event_type: event.event_type,
            data: event.data.clone(),
        })
    }

    fn get_timeline(&self, query: &TimelineQuery) -> Result<Vec<TimelineEvent>, StorageError> {
        let plan_id = self.plan_id()?;
        let mut sql = String::from(
            "SELECT id, timestamp, type, data_json FROM timeline_events WHERE plan_id = ?",
        );
        let mut values = vec![SqlValue::Integer(plan_id)];
        if let Some(since) = query.since {
            sql.push_str(" AND timestamp >= ?");
            values.push(SqlValue::Text(format_timestamp(since)));
        }
        if let Some(event_type) = query.event_type {
            sql.push_str(" AND type = ?");
            values.push(SqlValue::Text(event_type.as_str().to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC, rowid DESC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(limit as i64));
        }

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(values), |row| {
            let data_json: String = row.get(3)?;
            let data = serde_json::from_str(&data_json).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            Ok(TimelineEvent {
                id: row.get(0)?,
                timestamp: timestamp_column(row, 1)?,
                event_type: parse_enum::<TimelineEventType>(row, 2)?,
                data,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    fn add_evidence(&self, evidence: &Evidence) -> Result<(), StorageError> {
        let plan_id = self.plan_id()?;
        if let Some(relevance) = evidence.relevance {
            if !(0.0..=1.0).contains(&relevance) {
                return Err(StorageError::InvalidInput(format!(
                    "evidence relevance must be within [0, 1], got {relevance}"
                )));
            }
        }
        self.conn.execute(
            &format!(
                "INSERT INTO evidence (plan_id, {EVIDENCE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                plan_id,
                evidence.id,
                evidence.description,
                evidence.source,
                evidence.source_url,
                evidence.gathering_method,
                evidence.content,
                evidence.file_path,
                evidence.relevance,
                evidence.query,
                evidence.summary,
                format_timestamp(evidence.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_evidence(&self) -> Result<Vec<Evidence>, StorageError> {
        let plan_id = self.plan_id()?;
        let mut statement = self.conn.prepare(&format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evidence WHERE plan_id = ?1 ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = statement.query_map([plan_id], evidence_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn add_feedback(&self, feedback: &Feedback) -> Result<(), StorageError> {
        let plan_id = self.plan_id()?;
        let participants_json = serde_json::to_string(&feedback.participants)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            &format!(
                "INSERT INTO feedback (plan_id, {FEEDBACK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                plan_id,
                feedback.id,
                feedback.title,
                feedback.platform,
                feedback.content,
                participants_json,
                format_timestamp(feedback.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_feedback(&self) -> Result<Vec<Feedback>, StorageError> {
        let plan_id = self.plan_id()?;
        let mut statement = self.conn.prepare(&format!(
            "SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE plan_id = ?1 ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = statement.query_map([plan_id], |row| {
            let participants_json: String = row.get(4)?;
            let participants: Vec<String> =
                serde_json::from_str(&participants_json).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
            Ok(Feedback {
                id: row.get(0)?,
                title: row.get(1)?,
                platform: row.get(2)?,
                content: row.get(3)?,
                participants,
                created_at: timestamp_column(row, 5)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let plan_id = self.plan_id()?;
        let snapshot_json = serde_json::to_string(&checkpoint.snapshot)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT INTO checkpoints (plan_id, name, created_at, snapshot_json)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(plan_id, name) DO UPDATE SET
                created_at=excluded.created_at,
                snapshot_json=excluded.snapshot_json
            ",
            params![
                plan_id,
                checkpoint.name,
                format_timestamp(checkpoint.created_at),
                snapshot_json,
            ],
        )?;
        Ok(())
    }

    fn get_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, StorageError> {
        let plan_id = self.plan_id()?;
        let checkpoint = self
            .conn
            .query_row(
                "
                SELECT name, created_at, snapshot_json
                FROM checkpoints
                WHERE plan_id = ?1 AND name = ?2
                ",
                params![plan_id, name],
                checkpoint_from_row,
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError> {
        let plan_id = self.plan_id()?;
        let mut statement = self.conn.prepare(
            "
            SELECT name, created_at, snapshot_json
            FROM checkpoints
            WHERE plan_id = ?1
            ORDER BY created_at DESC, id DESC
            ",
        )?;
        let rows = statement.query_map([plan_id], checkpoint_from_row)?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row?);
        }
        Ok(checkpoints)
    }

    fn restore_checkpoint(&self, name: &str) -> Result<(), StorageError> {
        let plan_id = self.plan_id()?;
        let checkpoint = self
            .get_checkpoint(name)?
            .ok_or_else(|| StorageError::CheckpointNotFound(name.to_string()))?;
        let snapshot = &checkpoint.snapshot;
        let now = Utc::now();

        // Dropping the transaction on any early return rolls everything back.
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "
            UPDATE plans
            SET name = ?1, description = ?2, stage = ?3, updated_at = ?4
            WHERE id = ?5
            ",
            params![
                snapshot.metadata.name,
                snapshot.metadata.description,
                snapshot.metadata.stage.as_str(),
                format_timestamp(now),
                plan_id,
            ],
        )?;
        for step in &snapshot.steps {
            tx.execute(
                "
                UPDATE steps
                SET status = ?1, started_at = ?2, completed_at = ?3
                WHERE plan_id = ?4 AND number = ?5
                ",
                params![
                    step.status.as_str(),
                    step.started_at.map(format_timestamp),
                    step.completed_at.map(format_timestamp),
                    plan_id,
                    i64::from(step.number),
                ],
            )?;
        }
        for file in &snapshot.files {
            upsert_file(
                &tx,
                plan_id,
                &file.file_type,
                &file.filename,
                &file.content,
                now,
                now,
            )?;
        }
        tx.commit()?;

        info!(
            event = "checkpoint_restored",
            path = %self.path.display(),
            checkpoint = name,
            steps = snapshot.steps.len(),
            files = snapshot.files.len()
        );
        Ok(())
    }

    fn delete_checkpoint(&self, name: &str) -> Result<bool, StorageError> {
        let plan_id = self.plan_id()?;
        let changes = self.conn.execute(
            "DELETE FROM checkpoints WHERE plan_id = ?1 AND name = ?2",
            params![plan_id, name],
        )?;
        Ok(changes > 0)
    }

    fn search(&self, query: &str) -> Result<Vec<SearchHit>, StorageError> {
        let Some(term) = SearchTerm::new(query) else {
            return Ok(Vec::new());
        };
        let mut hits = Vec::new();

        for step in self.get_steps()? {
            let text = format!("{}\n{}", step.title, step.content);
            if let Some(hit) = score_document(
                &term,
                &text,
                SearchHitKind::Step,
                step.number.to_string(),
                step.title.clone(),
            ) {
                hits.push(hit);
            }
        }

        for file in self.get_files(None)? {
            if let Some(hit) = score_document(
                &term,
                &file.content,
                SearchHitKind::File,
                format!("{}/{}", file.file_type, file.filename),
                file.filename.clone(),
            ) {
                hits.push(hit);
            }
        }

        for evidence in self.get_evidence()? {
            let text = match &evidence.content {
                Some(content) => format!("{}\n{content}", evidence.description),
                None => evidence.description.clone(),
            };
            if let Some(hit) = score_document(
                &term,
                &text,
                SearchHitKind::Evidence,
                evidence.id.clone(),
                evidence.description.clone(),
            ) {
                hits.push(hit);
            }
        }

        rank_hits(&mut hits);
        debug!(event = "plan_search", query, hits = hits.len());
        Ok(hits)
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        let SqliteProvider { conn, path, .. } = *self;
        conn.close().map_err(|(_, err)| StorageError::from(err))?;
        debug!(event = "sqlite_closed", path = %path.display());
        Ok(())
    }
}

/// Column/value pairs for a partial UPDATE.
#[derive(Default)]
struct Patch {
    columns: Vec<&'static str>,
    values: Vec<SqlValue>,
}

impl Patch {
    fn set(&mut self, column: &'static str, value: SqlValue) {
        self.columns.push(column);
        self.values.push(value);
    }

    fn set_opt(&mut self, column: &'static str, value: Option<SqlValue>) {
        if let Some(value) = value {
            self.set(column, value);
        }
    }

    fn apply(
        self,
        conn: &Connection,
        table: &str,
        where_clause: &str,
        where_values: Vec<SqlValue>,
    ) -> Result<usize, StorageError> {
        let assignments = self
            .columns
            .iter()
            .map(|column| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE {table} SET {assignments} WHERE {where_clause}");
        let values = self.values.into_iter().chain(where_values);
        Ok(conn.execute(&sql, params_from_iter(values))?)
    }
}

fn upsert_file(
    conn: &Connection,
    plan_id: i64,
    file_type: &str,
    filename: &str,
    content: &str,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO files (plan_id, type, filename, content, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(plan_id, type, filename) DO UPDATE SET
            content=excluded.content,
            updated_at=excluded.updated_at
        ",
        params![
            plan_id,
            file_type,
            filename,
            content,
            format_timestamp(created_at),
            format_timestamp(updated_at),
        ],
    )?;
    Ok(())
}

fn score_document(
    term: &SearchTerm,
    text: &str,
    kind: SearchHitKind,
    id: String,
    title: String,
) -> Option<SearchHit> {
    let offsets = term.match_offsets(text);
    let first = *offsets.first()?;
    Some(SearchHit {
        kind,
        id,
        title,
        snippet: snippet_around(text, first, term.len()),
        score: score_for_count(offsets.len()),
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        number: row.get::<_, i64>(0)? as u32,
        code: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: parse_enum::<StepStatus>(row, 4)?,
        started_at: optional_timestamp_column(row, 5)?,
        completed_at: optional_timestamp_column(row, 6)?,
        content: row.get(7)?,
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<PlanFile> {
    Ok(PlanFile {
        file_type: row.get(0)?,
        filename: row.get(1)?,
        content: row.get(2)?,
        created_at: timestamp_column(row, 3)?,
        updated_at: timestamp_column(row, 4)?,
    })
}

fn evidence_from_row(row: &Row<'_>) -> rusqlite::Result<Evidence> {
    Ok(Evidence {
        id: row.get(0)?,
        description: row.get(1)?,
        source: row.get(2)?,
        source_url: row.get(3)?,
        gathering_method: row.get(4)?,
        content: row.get(5)?,
        file_path: row.get(6)?,
        relevance: row.get(7)?,
        query: row.get(8)?,
        summary: row.get(9)?,
        created_at: timestamp_column(row, 10)?,
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    let snapshot_json: String = row.get(2)?;
    let snapshot = serde_json::from_str(&snapshot_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Checkpoint {
        name: row.get(0)?,
        created_at: timestamp_column(row, 1)?,
        snapshot,
    })
}

fn parse_enum<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(index)?;
    raw.parse::<T>().map_err(|reason| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, reason)),
        )
    })
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_timestamp(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn optional_timestamp_column(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| {
        parse_timestamp(&value).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
    })
    .transpose()
}

/// Fixed-width UTC text so lexical order matches chronological order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{value}: {err}")))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}
