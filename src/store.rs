//! Durable per-strategy state store
//!
//! SQLite-based persistence with a JSON snapshot export for external readers.
//! One database file per strategy keeps write paths contention-free across
//! strategies. WAL journal mode gives crash-consistent commits; the cycle
//! state snapshot, trade append and pending-set removal for a fill happen in
//! a single transaction so a crash can never observe a half-applied fill.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cycle::CycleState;
use crate::error::StoreError;
use crate::oms::types::OrderIntent;
use crate::types::{Money, Side, TradeRecord};

pub struct StateStore {
    conn: Mutex<Connection>,
    strategy_id: String,
    json_backup_path: PathBuf,
    auto_export: bool,
}

impl StateStore {
    /// Open (or create) the store at `{state_dir}/{strategy_id}/state.db`.
    pub fn open(state_dir: impl AsRef<Path>, strategy_id: &str) -> Result<Self, StoreError> {
        let dir = state_dir.as_ref().join(strategy_id);
        std::fs::create_dir_all(&dir)?;

        let db_path = dir.join("state.db");
        let conn = Connection::open(&db_path)?;

        // WAL mode for crash consistency of committed writes
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        let store = Self {
            conn: Mutex::new(conn),
            strategy_id: strategy_id.to_string(),
            json_backup_path: dir.join("state.json"),
            auto_export: true,
        };
        store.create_tables()?;
        info!(strategy = %store.strategy_id, path = %db_path.display(), "state store opened");
        Ok(store)
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store connection poisoned");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cycle_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pending_orders (
                client_order_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL UNIQUE,
                ts TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                cycle_label TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                commission TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades(ts)",
            [],
        )?;

        debug!(strategy = %self.strategy_id, "database schema created/verified");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cycle state snapshot
    // ------------------------------------------------------------------

    pub fn save_cycle_state(&self, state: &CycleState) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().expect("store connection poisoned");
            let data = serde_json::to_string(state)?;
            conn.execute(
                "INSERT OR REPLACE INTO cycle_state (id, data, updated_at) VALUES (1, ?1, ?2)",
                params![data, Utc::now().to_rfc3339()],
            )?;
        }
        if self.auto_export {
            self.export_json()?;
        }
        Ok(())
    }

    /// Load and schema-validate the persisted snapshot. A malformed record is
    /// rejected here, at load time, rather than exploding at first field use.
    pub fn load_cycle_state(&self) -> Result<Option<CycleState>, StoreError> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let row: Option<String> = conn
            .query_row("SELECT data FROM cycle_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        match row {
            Some(data) => {
                let state: CycleState = serde_json::from_str(&data)
                    .map_err(|e| StoreError::Corrupt(format!("cycle state: {e}")))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Pending order intents (write-ahead set)
    // ------------------------------------------------------------------

    pub fn write_pending(&self, intent: &OrderIntent) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let data = serde_json::to_string(intent)?;
        conn.execute(
            "INSERT OR REPLACE INTO pending_orders (client_order_id, data, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                intent.client_order_id.to_string(),
                data,
                Utc::now().to_rfc3339()
            ],
        )?;
        debug!(
            strategy = %self.strategy_id,
            intent = %intent.client_order_id,
            status = ?intent.status,
            "pending intent persisted"
        );
        Ok(())
    }

    pub fn remove_pending(&self, client_order_id: &Uuid) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "DELETE FROM pending_orders WHERE client_order_id = ?1",
            params![client_order_id.to_string()],
        )?;
        Ok(())
    }

    pub fn load_pending(&self) -> Result<Vec<OrderIntent>, StoreError> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt =
            conn.prepare("SELECT data FROM pending_orders ORDER BY updated_at ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut intents = Vec::new();
        for row in rows {
            let data = row?;
            let intent: OrderIntent = serde_json::from_str(&data)
                .map_err(|e| StoreError::Corrupt(format!("pending intent: {e}")))?;
            intents.push(intent);
        }
        Ok(intents)
    }

    // ------------------------------------------------------------------
    // Append-only trade history
    // ------------------------------------------------------------------

    /// Append a trade record. Returns false (and writes nothing) when a trade
    /// with the same exchange order id already exists - the idempotency guard
    /// for repeated reconciliation of the same fill.
    pub fn append_trade(&self, trade: &TradeRecord) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store connection poisoned");
        Self::insert_trade(&conn, trade)
    }

    fn insert_trade(conn: &Connection, trade: &TradeRecord) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO trades
             (order_id, ts, side, quantity, price, cycle_label, realized_pnl, commission)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                trade.order_id,
                trade.timestamp.to_rfc3339(),
                trade.side.as_str(),
                trade.quantity.to_string(),
                trade.price.to_string(),
                trade.cycle_label,
                trade.realized_pnl.to_string(),
                trade.commission.to_string(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn has_trade(&self, order_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE order_id = ?1",
            params![order_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn load_trade_history(&self) -> Result<Vec<TradeRecord>, StoreError> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT ts, side, quantity, price, cycle_label, realized_pnl, commission, order_id
             FROM trades ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut trades = Vec::new();
        for row in rows {
            let (ts, side, quantity, price, cycle_label, realized_pnl, commission, order_id) =
                row?;
            trades.push(TradeRecord {
                timestamp: parse_timestamp(&ts)?,
                side: parse_side(&side)?,
                quantity: parse_decimal(&quantity)?,
                price: parse_decimal(&price)?,
                cycle_label,
                realized_pnl: parse_decimal(&realized_pnl)?,
                commission: parse_decimal(&commission)?,
                order_id,
            });
        }
        Ok(trades)
    }

    // ------------------------------------------------------------------
    // Fill commit
    // ------------------------------------------------------------------

    /// Atomically record an applied fill: append the trade, replace the cycle
    /// state snapshot, and drop the intent from the pending set. Returns false
    /// when the trade was already recorded (nothing is written in that case
    /// beyond removing the stale pending intent).
    pub fn commit_fill(
        &self,
        state: &CycleState,
        trade: &TradeRecord,
        client_order_id: &Uuid,
    ) -> Result<bool, StoreError> {
        let inserted = {
            let mut conn = self.conn.lock().expect("store connection poisoned");
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let inserted = Self::insert_trade(&tx, trade)?;
            if inserted {
                let data = serde_json::to_string(state)?;
                tx.execute(
                    "INSERT OR REPLACE INTO cycle_state (id, data, updated_at) VALUES (1, ?1, ?2)",
                    params![data, Utc::now().to_rfc3339()],
                )?;
            }
            tx.execute(
                "DELETE FROM pending_orders WHERE client_order_id = ?1",
                params![client_order_id.to_string()],
            )?;
            tx.commit()?;
            inserted
        };

        if self.auto_export {
            self.export_json()?;
        }
        Ok(inserted)
    }

    // ------------------------------------------------------------------
    // JSON snapshot export (read-only collaborator surface)
    // ------------------------------------------------------------------

    pub fn export_json(&self) -> Result<(), StoreError> {
        let state = self.load_cycle_state()?;
        let pending = self.load_pending()?;
        let trades = self.load_trade_history()?;

        let snapshot = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "strategy_id": self.strategy_id,
            "cycle_state": state,
            "pending_orders": pending,
            "trade_count": trades.len(),
            "trades": trades,
        });

        // Write-then-rename so readers never observe a torn file
        let tmp_path = self.json_backup_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(&snapshot)?)?;
        std::fs::rename(&tmp_path, &self.json_backup_path)?;
        debug!(strategy = %self.strategy_id, path = %self.json_backup_path.display(), "snapshot exported");
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s}: {e}")))
}

fn parse_side(s: &str) -> Result<Side, StoreError> {
    match s {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(StoreError::Corrupt(format!("side {other}"))),
    }
}

fn parse_decimal(s: &str) -> Result<Money, StoreError> {
    s.parse::<rust_decimal::Decimal>()
        .map(Money::from_decimal)
        .map_err(|e| StoreError::Corrupt(format!("decimal {s}: {e}")))
}
