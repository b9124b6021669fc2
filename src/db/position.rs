//! Durable position fields

use crate::core::types::DurableFields;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::sync::{Arc, Mutex};

fn from_row(row: &Row) -> SqlResult<(String, String, DurableFields)> {
    let open_date: Option<String> = row.get(2)?;
    Ok((
        row.get(0)?,
        row.get(1)?,
        DurableFields {
            open_date: open_date.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
            profit_triggered: row.get::<_, i64>(3)? != 0,
            highest_price: row.get(4)?,
            stop_loss_price: row.get(5)?,
            breakout_triggered: row.get::<_, i64>(6)? != 0,
            breakout_highest: row.get(7)?,
        },
    ))
}

/// Write one instrument's durable subset. Called only by the flush loop and
/// the shutdown sequencer.
pub fn upsert(
    conn: Arc<Mutex<Connection>>,
    instrument: &str,
    name: &str,
    durable: &DurableFields,
) -> SqlResult<()> {
    let conn = conn.lock().unwrap();
    conn.execute(
        "INSERT INTO positions (
            instrument, name, open_date, profit_triggered, highest_price,
            stop_loss_price, breakout_triggered, breakout_highest, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(instrument) DO UPDATE SET
            name = excluded.name,
            open_date = excluded.open_date,
            profit_triggered = excluded.profit_triggered,
            highest_price = excluded.highest_price,
            stop_loss_price = excluded.stop_loss_price,
            breakout_triggered = excluded.breakout_triggered,
            breakout_highest = excluded.breakout_highest,
            updated_at = excluded.updated_at",
        params![
            instrument,
            name,
            durable.open_date.map(|d| d.to_rfc3339()),
            durable.profit_triggered as i64,
            durable.highest_price,
            durable.stop_loss_price,
            durable.breakout_triggered as i64,
            durable.breakout_highest,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Load every persisted row, used to seed the store at startup.
pub fn load_all(conn: Arc<Mutex<Connection>>) -> SqlResult<Vec<(String, String, DurableFields)>> {
    let conn = conn.lock().unwrap();
    let mut stmt = conn.prepare(
        "SELECT instrument, name, open_date, profit_triggered, highest_price,
                stop_loss_price, breakout_triggered, breakout_highest
         FROM positions ORDER BY instrument",
    )?;
    let rows = stmt.query_map([], from_row)?;
    rows.collect()
}

pub fn find(
    conn: Arc<Mutex<Connection>>,
    instrument: &str,
) -> SqlResult<Option<(String, String, DurableFields)>> {
    let conn = conn.lock().unwrap();
    conn.query_row(
        "SELECT instrument, name, open_date, profit_triggered, highest_price,
                stop_loss_price, breakout_triggered, breakout_highest
         FROM positions WHERE instrument = ?1",
        params![instrument],
        from_row,
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_upsert_and_reload() {
        let db = Database::new_in_memory().unwrap();
        db.run_migrations().unwrap();
        let conn = db.connection();

        let durable = DurableFields {
            open_date: Some(Utc::now()),
            profit_triggered: true,
            highest_price: 11.2,
            stop_loss_price: 9.25,
            breakout_triggered: false,
            breakout_highest: 0.0,
        };
        upsert(Arc::clone(&conn), "600036", "CMB", &durable).unwrap();

        // Second write supersedes the first.
        let mut updated = durable.clone();
        updated.highest_price = 11.8;
        upsert(Arc::clone(&conn), "600036", "CMB", &updated).unwrap();

        let rows = load_all(Arc::clone(&conn)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "600036");
        assert!((rows[0].2.highest_price - 11.8).abs() < 1e-9);
        assert!(rows[0].2.profit_triggered);
        assert!(rows[0].2.open_date.is_some());

        assert!(find(Arc::clone(&conn), "600036").unwrap().is_some());
        assert!(find(conn, "000001").unwrap().is_none());
    }
}
