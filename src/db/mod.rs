use crate::errors::{AppError, AppResult};
use crate::models::{MetricDefinition, MetricSnapshot, RefreshReport, RefreshWrite, TargetServer};
use crate::pipeline::MetricCatalog;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Version 2 added `metric_definitions.table_hint`.
pub const SCHEMA_VERSION: i64 = 2;

const DEFINITION_COLUMNS: &str = "id, group_name, label, target_server, table_hint, canonical_expression,
     last_value, last_error, last_updated";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogChange {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub snapshots: usize,
    pub reports: usize,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        // journal_mode answers with a row, so it cannot go through execute_batch
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Schema ───────────────────────────────────────────────────────────────

    pub fn schema_version(&self) -> AppResult<i64> {
        let conn = self.conn()?;
        read_schema_version(&conn)
    }

    fn migrate(&self) -> AppResult<()> {
        let mut conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let version = read_schema_version(&conn)?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        let tx = conn.transaction()?;
        if !column_exists(&tx, "metric_definitions", "table_hint")? {
            tx.execute("ALTER TABLE metric_definitions ADD COLUMN table_hint TEXT", [])?;
        }
        tx.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('schema_version', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![SCHEMA_VERSION.to_string(), timestamp(Utc::now())],
        )?;
        tx.commit()?;
        tracing::info!(from = version, to = SCHEMA_VERSION, "metric store schema migrated");
        Ok(())
    }

    // ─── Metric Definitions ───────────────────────────────────────────────────

    pub fn list_definitions(&self) -> AppResult<Vec<MetricDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM metric_definitions ORDER BY ordinal ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], parse_definition_row)?;
        let mut definitions = Vec::new();
        for row in rows {
            definitions.push(row?);
        }
        Ok(definitions)
    }

    pub fn get_definition(&self, id: &str) -> AppResult<Option<MetricDefinition>> {
        let conn = self.conn()?;
        let definition = conn
            .query_row(
                &format!("SELECT {DEFINITION_COLUMNS} FROM metric_definitions WHERE id = ?1"),
                [id],
                parse_definition_row,
            )
            .optional()?;
        Ok(definition)
    }

    /// Inserts or fully overwrites one definition, refresh fields included.
    pub fn save_definition(&self, definition: &MetricDefinition) -> AppResult<()> {
        let conn = self.conn()?;
        let next_ordinal: i64 = conn.query_row(
            "SELECT COALESCE(MAX(ordinal), -1) + 1 FROM metric_definitions",
            [],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO metric_definitions (
               id, ordinal, group_name, label, target_server, table_hint, canonical_expression,
               last_value, last_error, last_updated
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
               group_name = excluded.group_name,
               label = excluded.label,
               target_server = excluded.target_server,
               table_hint = excluded.table_hint,
               canonical_expression = excluded.canonical_expression,
               last_value = excluded.last_value,
               last_error = excluded.last_error,
               last_updated = excluded.last_updated",
            params![
                definition.id,
                next_ordinal,
                definition.group_name,
                definition.label,
                definition.target_server.as_str(),
                definition.table_hint,
                definition.canonical_expression,
                finite_or_zero(definition.last_value),
                definition.last_error,
                definition.last_updated.map(timestamp),
            ],
        )?;
        Ok(())
    }

    /// Swaps the catalog wholesale. Ids that survive keep their last refresh
    /// fields; ids missing from `definitions` are removed with their history.
    pub fn replace_catalog(&self, definitions: &[MetricDefinition]) -> AppResult<CatalogChange> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: HashSet<String> = {
            let mut stmt = tx.prepare("SELECT id FROM metric_definitions")?;
            let ids = stmt.query_map([], |row| row.get::<_, String>(0))?;
            ids.collect::<Result<_, _>>()?
        };

        let mut change = CatalogChange::default();
        let mut incoming = HashSet::new();
        for (ordinal, definition) in definitions.iter().enumerate() {
            if !incoming.insert(definition.id.as_str()) {
                return Err(AppError::Catalog(format!("duplicate metric id '{}'", definition.id)));
            }
            tx.execute(
                "INSERT INTO metric_definitions (
                   id, ordinal, group_name, label, target_server, table_hint, canonical_expression
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   ordinal = excluded.ordinal,
                   group_name = excluded.group_name,
                   label = excluded.label,
                   target_server = excluded.target_server,
                   table_hint = excluded.table_hint,
                   canonical_expression = excluded.canonical_expression",
                params![
                    definition.id,
                    ordinal as i64,
                    definition.group_name,
                    definition.label,
                    definition.target_server.as_str(),
                    definition.table_hint,
                    definition.canonical_expression,
                ],
            )?;
            if existing.contains(&definition.id) {
                change.updated += 1;
            } else {
                change.inserted += 1;
            }
        }

        for id in existing.iter().filter(|id| !incoming.contains(id.as_str())) {
            change.removed += tx.execute("DELETE FROM metric_definitions WHERE id = ?1", [id])?;
        }

        tx.commit()?;
        Ok(change)
    }

    /// Updates the three refresh fields and appends a history row in one
    /// transaction.
    pub fn record_refresh(&self, metric_id: &str, write: &RefreshWrite) -> AppResult<MetricSnapshot> {
        let value = finite_or_zero(write.value);
        let recorded_at = timestamp(write.updated_at);
        let snapshot_id = Uuid::new_v4().to_string();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE metric_definitions SET last_value = ?1, last_error = ?2, last_updated = ?3 WHERE id = ?4",
            params![value, write.error, recorded_at, metric_id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("metric definition {metric_id}")));
        }
        tx.execute(
            "INSERT INTO metric_snapshots (id, metric_id, value, error, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![snapshot_id, metric_id, value, write.error, recorded_at],
        )?;
        tx.commit()?;

        Ok(MetricSnapshot {
            id: snapshot_id,
            metric_id: metric_id.to_string(),
            value,
            error: write.error.clone(),
            recorded_at: write.updated_at,
        })
    }

    // ─── Snapshots & Reports ──────────────────────────────────────────────────

    /// Most recent first.
    pub fn list_snapshots(&self, metric_id: &str, limit: u32) -> AppResult<Vec<MetricSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, metric_id, value, error, recorded_at
             FROM metric_snapshots WHERE metric_id = ?1 ORDER BY recorded_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![metric_id, limit], parse_snapshot_row)?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }

    pub fn prune_snapshots(&self, retention_days: u32) -> AppResult<PruneSummary> {
        let cutoff = timestamp(Utc::now() - Duration::days(i64::from(retention_days)));
        let conn = self.conn()?;
        let snapshots = conn.execute("DELETE FROM metric_snapshots WHERE recorded_at < ?1", [&cutoff])?;
        let reports = conn.execute("DELETE FROM refresh_reports WHERE finished_at < ?1", [&cutoff])?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(PruneSummary { snapshots, reports })
    }

    pub fn save_refresh_report(&self, report: &RefreshReport) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO refresh_reports (id, started_at, finished_at, succeeded, failed, report_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.id,
                timestamp(report.started_at),
                timestamp(report.finished_at),
                report.succeeded() as i64,
                report.failed() as i64,
                serde_json::to_string(report)?,
            ],
        )?;
        Ok(())
    }

    pub fn latest_report(&self) -> AppResult<Option<RefreshReport>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT report_json FROM refresh_reports ORDER BY finished_at DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MetricCatalog for Database {
    async fn load_definitions(&self) -> AppResult<Vec<MetricDefinition>> {
        self.list_definitions()
    }

    async fn save(&self, definition: &MetricDefinition) -> AppResult<()> {
        self.save_definition(definition)
    }

    async fn record_refresh(&self, metric_id: &str, write: &RefreshWrite) -> AppResult<()> {
        Database::record_refresh(self, metric_id, write).map(|_| ())
    }

    async fn record_report(&self, report: &RefreshReport) -> AppResult<()> {
        self.save_refresh_report(report)
    }
}

fn read_schema_version(conn: &Connection) -> AppResult<i64> {
    let raw = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(raw.and_then(|raw| raw.trim().parse().ok()).unwrap_or(1))
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Fixed-width UTC text so stored timestamps order lexically.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_definition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricDefinition> {
    Ok(MetricDefinition {
        id: row.get(0)?,
        group_name: row.get(1)?,
        label: row.get(2)?,
        target_server: parse_target(&row.get::<_, String>(3)?)?,
        table_hint: row.get(4)?,
        canonical_expression: row.get(5)?,
        last_value: row.get(6)?,
        last_error: row.get(7)?,
        last_updated: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
    })
}

fn parse_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricSnapshot> {
    Ok(MetricSnapshot {
        id: row.get(0)?,
        metric_id: row.get(1)?,
        value: row.get(2)?,
        error: row.get(3)?,
        recorded_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn parse_target(raw: &str) -> rusqlite::Result<TargetServer> {
    TargetServer::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown target server '{}'", raw),
            )),
        )
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}
