//! Trade record table

use rusqlite::{params, Connection, Result as SqlResult, Row};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub instrument: String,
    pub side: String,
    pub price: f64,
    pub volume: f64,
    pub amount: f64,
    pub order_id: String,
    /// Which condition class produced the trade.
    pub strategy: String,
    pub created_at: Option<String>,
}

fn from_row(row: &Row) -> SqlResult<TradeRecord> {
    Ok(TradeRecord {
        id: Some(row.get(0)?),
        instrument: row.get(1)?,
        side: row.get(2)?,
        price: row.get(3)?,
        volume: row.get(4)?,
        amount: row.get(5)?,
        order_id: row.get(6)?,
        strategy: row.get(7)?,
        created_at: Some(row.get(8)?),
    })
}

pub fn insert(conn: Arc<Mutex<Connection>>, record: &TradeRecord) -> SqlResult<i64> {
    let conn = conn.lock().unwrap();
    conn.execute(
        "INSERT INTO trade_records (
            instrument, side, price, volume, amount, order_id, strategy
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.instrument,
            record.side,
            record.price,
            record.volume,
            record.amount,
            record.order_id,
            record.strategy,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_by_instrument(
    conn: Arc<Mutex<Connection>>,
    instrument: &str,
) -> SqlResult<Vec<TradeRecord>> {
    let conn = conn.lock().unwrap();
    let mut stmt = conn.prepare(
        "SELECT id, instrument, side, price, volume, amount, order_id, strategy, created_at
         FROM trade_records WHERE instrument = ?1 ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt.query_map(params![instrument], from_row)?;
    rows.collect()
}

pub fn list_recent(conn: Arc<Mutex<Connection>>, limit: usize) -> SqlResult<Vec<TradeRecord>> {
    let conn = conn.lock().unwrap();
    let mut stmt = conn.prepare(
        "SELECT id, instrument, side, price, volume, amount, order_id, strategy, created_at
         FROM trade_records ORDER BY created_at DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], from_row)?;
    rows.collect()
}
