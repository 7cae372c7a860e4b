use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::model::{EntityIdPattern, EntityReference, ReportRow};

pub const DB_FILE_NAME: &str = "sdc_deleted_report.sqlite";

#[derive(Debug, Clone)]
pub struct StoredRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub candidates: usize,
    pub body_sha256: String,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub candidates: i64,
    pub references_total: i64,
    pub rows_total: i64,
    pub body_sha256: String,
}

pub fn open_store(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
              run_id TEXT PRIMARY KEY,
              started_at TEXT NOT NULL,
              candidates INTEGER NOT NULL,
              references_total INTEGER NOT NULL,
              rows_total INTEGER NOT NULL,
              body_sha256 TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entity_references (
              run_id TEXT NOT NULL,
              entity TEXT NOT NULL,
              subject TEXT NOT NULL,
              subject_kind TEXT NOT NULL,
              predicate TEXT NOT NULL,
              FOREIGN KEY(run_id) REFERENCES runs(run_id)
            );

            CREATE TABLE IF NOT EXISTS report_rows (
              run_id TEXT NOT NULL,
              entity TEXT NOT NULL,
              deleted_by TEXT NOT NULL,
              deleted_at TEXT NOT NULL,
              uses INTEGER NOT NULL,
              PRIMARY KEY(run_id, entity),
              FOREIGN KEY(run_id) REFERENCES runs(run_id)
            );

            CREATE INDEX IF NOT EXISTS idx_entity_references_run
              ON entity_references(run_id, entity);
            ",
        )
        .context("failed to create debug dump schema")?;
    Ok(())
}

/// Replace everything stored for `run.run_id` in one transaction.
pub fn save_run(
    connection: &mut Connection,
    run: &StoredRun,
    references: &[EntityReference],
    rows: &[ReportRow],
) -> Result<()> {
    let tx = connection.transaction()?;

    tx.execute("DELETE FROM report_rows WHERE run_id = ?1", params![run.run_id])?;
    tx.execute(
        "DELETE FROM entity_references WHERE run_id = ?1",
        params![run.run_id],
    )?;
    tx.execute(
        "
        INSERT INTO runs(run_id, started_at, candidates, references_total, rows_total, body_sha256)
        VALUES(?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(run_id) DO UPDATE SET
          started_at=excluded.started_at,
          candidates=excluded.candidates,
          references_total=excluded.references_total,
          rows_total=excluded.rows_total,
          body_sha256=excluded.body_sha256
        ",
        params![
            run.run_id,
            run.started_at,
            run.candidates as i64,
            references.len() as i64,
            rows.len() as i64,
            run.body_sha256,
        ],
    )?;

    {
        let mut insert_reference = tx.prepare(
            "
            INSERT INTO entity_references(run_id, entity, subject, subject_kind, predicate)
            VALUES(?1, ?2, ?3, ?4, ?5)
            ",
        )?;
        for reference in references {
            insert_reference.execute(params![
                run.run_id,
                reference.entity.to_string(),
                reference.subject,
                reference.subject_kind.as_str(),
                reference.predicate,
            ])?;
        }

        let mut insert_row = tx.prepare(
            "
            INSERT INTO report_rows(run_id, entity, deleted_by, deleted_at, uses)
            VALUES(?1, ?2, ?3, ?4, ?5)
            ",
        )?;
        for row in rows {
            insert_row.execute(params![
                run.run_id,
                row.entity.to_string(),
                row.deleted_by,
                row.deleted_at,
                row.uses as i64,
            ])?;
        }
    }

    tx.commit()
        .with_context(|| format!("failed to commit debug dump for {}", run.run_id))?;
    Ok(())
}

pub fn latest_run(connection: &Connection) -> Result<Option<RunSummary>> {
    let summary = connection
        .query_row(
            "
            SELECT run_id, started_at, candidates, references_total, rows_total, body_sha256
            FROM runs
            ORDER BY started_at DESC, run_id DESC
            LIMIT 1
            ",
            [],
            map_run_summary,
        )
        .optional()?;
    Ok(summary)
}

pub fn find_run(connection: &Connection, run_id: &str) -> Result<Option<RunSummary>> {
    let summary = connection
        .query_row(
            "
            SELECT run_id, started_at, candidates, references_total, rows_total, body_sha256
            FROM runs
            WHERE run_id = ?1
            ",
            params![run_id],
            map_run_summary,
        )
        .optional()?;
    Ok(summary)
}

fn map_run_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunSummary> {
    Ok(RunSummary {
        run_id: row.get(0)?,
        started_at: row.get(1)?,
        candidates: row.get(2)?,
        references_total: row.get(3)?,
        rows_total: row.get(4)?,
        body_sha256: row.get(5)?,
    })
}

pub fn load_report_rows(
    connection: &Connection,
    run_id: &str,
    pattern: &EntityIdPattern,
) -> Result<Vec<ReportRow>> {
    let mut statement = connection.prepare(
        "
        SELECT entity, deleted_by, deleted_at, uses
        FROM report_rows
        WHERE run_id = ?1
        ORDER BY CAST(SUBSTR(entity, 2) AS INTEGER) ASC
        ",
    )?;

    let mut rows = statement.query(params![run_id])?;
    let mut out = Vec::<ReportRow>::new();

    while let Some(row) = rows.next()? {
        let raw_entity: String = row.get(0)?;
        let entity = pattern
            .parse(&raw_entity)
            .with_context(|| format!("invalid entity id in debug dump: {raw_entity}"))?;
        out.push(ReportRow {
            entity,
            deleted_by: row.get(1)?,
            deleted_at: row.get(2)?,
            uses: row.get::<_, i64>(3)? as usize,
        });
    }

    Ok(out)
}

pub fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}
