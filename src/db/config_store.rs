//! Config key/value store with change history

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize)]
pub struct ConfigChange {
    pub id: i64,
    pub key: String,
    pub old_value: String,
    pub new_value: String,
    pub source: String,
    pub created_at: String,
}

/// Record the applied value and its history row in one transaction.
pub fn record_change(
    conn: Arc<Mutex<Connection>>,
    key: &str,
    old_value: &str,
    new_value: &str,
    source: &str,
) -> SqlResult<()> {
    let mut conn = conn.lock().unwrap();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO config_values (key, value, updated_at)
         VALUES (?1, ?2, CURRENT_TIMESTAMP)
         ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             updated_at = excluded.updated_at",
        params![key, new_value],
    )?;
    tx.execute(
        "INSERT INTO config_history (key, old_value, new_value, source)
         VALUES (?1, ?2, ?3, ?4)",
        params![key, old_value, new_value, source],
    )?;
    tx.commit()
}

pub fn get_value(conn: Arc<Mutex<Connection>>, key: &str) -> SqlResult<Option<String>> {
    let conn = conn.lock().unwrap();
    conn.query_row(
        "SELECT value FROM config_values WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn history(conn: Arc<Mutex<Connection>>, limit: usize) -> SqlResult<Vec<ConfigChange>> {
    let conn = conn.lock().unwrap();
    let mut stmt = conn.prepare(
        "SELECT id, key, old_value, new_value, source, created_at
         FROM config_history ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(ConfigChange {
            id: row.get(0)?,
            key: row.get(1)?,
            old_value: row.get(2)?,
            new_value: row.get(3)?,
            source: row.get(4)?,
            created_at: row.get(5)?,
        })
    })?;
    rows.collect()
}
