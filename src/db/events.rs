//! Append-only task event log.

use super::tasks::NewEvent;
use super::{enum_column, json_column, Database};
use crate::types::TaskEvent;
use anyhow::Result;
use rusqlite::{params, Connection, Row};

pub(crate) fn insert_event(
    conn: &Connection,
    task_id: &str,
    event: &NewEvent,
    now: i64,
) -> Result<i64> {
    let metadata = event
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO task_events (task_id, action, from_status, to_status, tx_hash, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            task_id,
            event.action.as_str(),
            event.from.as_str(),
            event.to.as_str(),
            event.tx_hash,
            metadata,
            now,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

fn parse_event_row(row: &Row) -> rusqlite::Result<TaskEvent> {
    Ok(TaskEvent {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        action: enum_column(row.get("action")?)?,
        from_status: enum_column(row.get("from_status")?)?,
        to_status: enum_column(row.get("to_status")?)?,
        tx_hash: row.get("tx_hash")?,
        metadata: json_column(row.get("metadata")?)?,
        created_at: row.get("created_at")?,
    })
}

impl Database {
    /// Events for a task in insertion order.
    pub fn task_events(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_events WHERE task_id = ?1 ORDER BY id",
            )?;
            let events = stmt
                .query_map(params![task_id], parse_event_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
    }
}
