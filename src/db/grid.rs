//! Grid session and grid trade tables

use crate::core::grid_session::{ExitReason, GridParams, GridSession, SessionStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::sync::{Arc, Mutex};

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn session_from_row(row: &Row) -> SqlResult<GridSession> {
    let exit_reason: Option<String> = row.get(14)?;
    let exited_at: Option<String> = row.get(23)?;
    Ok(GridSession {
        id: row.get(0)?,
        instrument: row.get(1)?,
        locked_center: row.get(2)?,
        current_center: row.get(3)?,
        params: GridParams {
            price_interval: row.get(4)?,
            sell_ratio: row.get(5)?,
            buy_amount: row.get(6)?,
            callback_ratio: row.get(7)?,
            max_investment: row.get(8)?,
            max_deviation: row.get(9)?,
            target_profit: row.get(10)?,
            stop_loss: row.get(11)?,
            max_duration_days: row.get(12)?,
        },
        status: SessionStatus::from_str(&row.get::<_, String>(13)?),
        exit_reason: exit_reason.as_deref().and_then(ExitReason::from_str),
        trade_count: row.get(15)?,
        buy_count: row.get(16)?,
        sell_count: row.get(17)?,
        buy_amount_total: row.get(18)?,
        sell_amount_total: row.get(19)?,
        buy_volume_total: row.get(20)?,
        sell_volume_total: row.get(21)?,
        created_at: parse_ts(row.get(22)?),
        exited_at: exited_at.map(parse_ts),
        updated_at: parse_ts(row.get(24)?),
        end_time: parse_ts(row.get(25)?),
    })
}

const SESSION_COLUMNS: &str = "id, instrument, locked_center, current_center, price_interval, \
     sell_ratio, buy_amount, callback_ratio, max_investment, max_deviation, \
     target_profit, stop_loss, max_duration_days, status, exit_reason, \
     trade_count, buy_count, sell_count, buy_amount_total, sell_amount_total, \
     buy_volume_total, sell_volume_total, created_at, exited_at, updated_at, end_time";

pub fn upsert_session(conn: Arc<Mutex<Connection>>, session: &GridSession) -> SqlResult<()> {
    let conn = conn.lock().unwrap();
    conn.execute(
        "INSERT INTO grid_sessions (
            id, instrument, locked_center, current_center, price_interval,
            sell_ratio, buy_amount, callback_ratio, max_investment,
            max_deviation, target_profit, stop_loss, max_duration_days,
            status, exit_reason, trade_count, buy_count, sell_count,
            buy_amount_total, sell_amount_total, buy_volume_total,
            sell_volume_total, created_at, updated_at, exited_at, end_time
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                  ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
        ON CONFLICT(id) DO UPDATE SET
            current_center = excluded.current_center,
            status = excluded.status,
            exit_reason = excluded.exit_reason,
            trade_count = excluded.trade_count,
            buy_count = excluded.buy_count,
            sell_count = excluded.sell_count,
            buy_amount_total = excluded.buy_amount_total,
            sell_amount_total = excluded.sell_amount_total,
            buy_volume_total = excluded.buy_volume_total,
            sell_volume_total = excluded.sell_volume_total,
            updated_at = excluded.updated_at,
            exited_at = excluded.exited_at",
        params![
            session.id,
            session.instrument,
            session.locked_center,
            session.current_center,
            session.params.price_interval,
            session.params.sell_ratio,
            session.params.buy_amount,
            session.params.callback_ratio,
            session.params.max_investment,
            session.params.max_deviation,
            session.params.target_profit,
            session.params.stop_loss,
            session.params.max_duration_days,
            session.status.as_str(),
            session.exit_reason.map(|r| r.as_str()),
            session.trade_count,
            session.buy_count,
            session.sell_count,
            session.buy_amount_total,
            session.sell_amount_total,
            session.buy_volume_total,
            session.sell_volume_total,
            session.created_at.to_rfc3339(),
            session.updated_at.to_rfc3339(),
            session.exited_at.map(|d| d.to_rfc3339()),
            session.end_time.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Sessions that survive a restart: pending and active ones.
pub fn load_open_sessions(conn: Arc<Mutex<Connection>>) -> SqlResult<Vec<GridSession>> {
    let conn = conn.lock().unwrap();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM grid_sessions WHERE status IN ('PENDING', 'ACTIVE') ORDER BY instrument",
        SESSION_COLUMNS
    ))?;
    let rows = stmt.query_map([], session_from_row)?;
    rows.collect()
}

pub fn find_session(conn: Arc<Mutex<Connection>>, id: &str) -> SqlResult<Option<GridSession>> {
    let conn = conn.lock().unwrap();
    conn.query_row(
        &format!("SELECT {} FROM grid_sessions WHERE id = ?1", SESSION_COLUMNS),
        params![id],
        session_from_row,
    )
    .optional()
}

pub fn list_sessions(conn: Arc<Mutex<Connection>>, instrument: &str) -> SqlResult<Vec<GridSession>> {
    let conn = conn.lock().unwrap();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM grid_sessions WHERE instrument = ?1 ORDER BY created_at DESC",
        SESSION_COLUMNS
    ))?;
    let rows = stmt.query_map(params![instrument], session_from_row)?;
    rows.collect()
}

/// One grid fill with the level that produced it and the extremum that
/// preceded it.
#[derive(Debug, Clone)]
pub struct GridTrade {
    pub id: Option<i64>,
    pub session_id: String,
    pub side: String,
    pub level_price: f64,
    pub fill_price: f64,
    pub volume: f64,
    pub extremum_price: f64,
    pub created_at: Option<String>,
}

pub fn insert_trade(conn: Arc<Mutex<Connection>>, trade: &GridTrade) -> SqlResult<i64> {
    let conn = conn.lock().unwrap();
    conn.execute(
        "INSERT INTO grid_trades (
            session_id, side, level_price, fill_price, volume, extremum_price
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            trade.session_id,
            trade.side,
            trade.level_price,
            trade.fill_price,
            trade.volume,
            trade.extremum_price,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_trades(conn: Arc<Mutex<Connection>>, session_id: &str) -> SqlResult<Vec<GridTrade>> {
    let conn = conn.lock().unwrap();
    let mut stmt = conn.prepare(
        "SELECT id, session_id, side, level_price, fill_price, volume, extremum_price, created_at
         FROM grid_trades WHERE session_id = ?1 ORDER BY created_at, id",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        Ok(GridTrade {
            id: Some(row.get(0)?),
            session_id: row.get(1)?,
            side: row.get(2)?,
            level_price: row.get(3)?,
            fill_price: row.get(4)?,
            volume: row.get(5)?,
            extremum_price: row.get(6)?,
            created_at: Some(row.get(7)?),
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn params_fixture() -> GridParams {
        GridParams {
            price_interval: 0.05,
            sell_ratio: 0.2,
            buy_amount: 10_000.0,
            callback_ratio: 0.005,
            max_investment: 50_000.0,
            max_deviation: 0.20,
            target_profit: 0.15,
            stop_loss: -0.10,
            max_duration_days: 90,
        }
    }

    #[test]
    fn test_session_round_trip() {
        let db = Database::new_in_memory().unwrap();
        db.run_migrations().unwrap();
        let conn = db.connection();

        let mut session = GridSession::new("600036", 10.0, params_fixture());
        upsert_session(Arc::clone(&conn), &session).unwrap();

        session.record_fill(true, 9.98, 1000.0, 9980.0);
        upsert_session(Arc::clone(&conn), &session).unwrap();

        let loaded = find_session(Arc::clone(&conn), &session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Active);
        assert!((loaded.current_center - 9.98).abs() < 1e-9);
        assert!((loaded.locked_center - 10.0).abs() < 1e-9);
        assert_eq!(loaded.buy_count, 1);

        let open = load_open_sessions(Arc::clone(&conn)).unwrap();
        assert_eq!(open.len(), 1);

        session.exit(ExitReason::TargetProfit, false);
        upsert_session(Arc::clone(&conn), &session).unwrap();
        let open = load_open_sessions(Arc::clone(&conn)).unwrap();
        assert!(open.is_empty());

        let loaded = find_session(conn, &session.id).unwrap().unwrap();
        assert_eq!(loaded.exit_reason, Some(ExitReason::TargetProfit));
    }

    #[test]
    fn test_unique_running_session_per_instrument() {
        let db = Database::new_in_memory().unwrap();
        db.run_migrations().unwrap();
        let conn = db.connection();

        let first = GridSession::new("600036", 10.0, params_fixture());
        upsert_session(Arc::clone(&conn), &first).unwrap();

        let second = GridSession::new("600036", 10.5, params_fixture());
        assert!(upsert_session(Arc::clone(&conn), &second).is_err());

        // A terminal first session frees the slot.
        let mut first = first;
        first.exit(ExitReason::Operator, true);
        upsert_session(Arc::clone(&conn), &first).unwrap();
        upsert_session(conn, &second).unwrap();
    }

    #[test]
    fn test_grid_trades() {
        let db = Database::new_in_memory().unwrap();
        db.run_migrations().unwrap();
        let conn = db.connection();

        let session = GridSession::new("600036", 10.0, params_fixture());
        upsert_session(Arc::clone(&conn), &session).unwrap();

        insert_trade(
            Arc::clone(&conn),
            &GridTrade {
                id: None,
                session_id: session.id.clone(),
                side: "SELL".to_string(),
                level_price: 10.5,
                fill_price: 10.547,
                volume: 2000.0,
                extremum_price: 10.60,
                created_at: None,
            },
        )
        .unwrap();

        let trades = list_trades(conn, &session.id).unwrap();
        assert_eq!(trades.len(), 1);
        assert!((trades[0].extremum_price - 10.60).abs() < 1e-9);
    }
}
