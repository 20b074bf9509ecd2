use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension as _, Row, params, params_from_iter};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::models::{ListPaymentsRequest, Payment, PaymentStatus, PaymentType, PaymentTypeFilter};
use crate::reverse_swap::{FullReverseSwapInfo, ReverseSwapStatus};
use crate::swap::{SwapInfo, SwapStatus};

pub const KEY_NODE_STATE: &str = "node_state";
pub const KEY_LSP_ID: &str = "lsp_id";
pub const KEY_LAST_SYNC: &str = "last_sync_time";
pub const KEY_STATIC_BACKUP: &str = "static_backup";

const PAYMENT_COLUMNS: &str =
    "id, payment_type, payment_time, amount_msat, fee_msat, status, error, description, details, \
     metadata";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create storage dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert_payment(&mut self, payment: &Payment) -> Result<()> {
        let details = serde_json::to_string(&payment.details).context("encode payment details")?;
        self.conn
            .execute(
                r#"
INSERT INTO payments (
  id,
  payment_type,
  payment_time,
  amount_msat,
  fee_msat,
  status,
  error,
  description,
  details,
  metadata
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
)
"#,
                params![
                    &payment.id,
                    payment_type_to_str(payment.payment_type),
                    payment.payment_time,
                    to_sql_int(payment.amount_msat)?,
                    to_sql_int(payment.fee_msat)?,
                    payment_status_to_str(payment.status),
                    &payment.error,
                    &payment.description,
                    details,
                    &payment.metadata,
                ],
            )
            .with_context(|| format!("insert payment {}", payment.id))?;
        Ok(())
    }

    /// Records a new pending attempt. A failed record with the same id is
    /// replaced; returns false when a pending or completed one exists.
    pub fn start_payment_attempt(&mut self, payment: &Payment) -> Result<bool> {
        let details = serde_json::to_string(&payment.details).context("encode payment details")?;
        let rows = self
            .conn
            .execute(
                r#"
INSERT INTO payments (
  id, payment_type, payment_time, amount_msat, fee_msat,
  status, error, description, details, metadata
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
)
ON CONFLICT(id) DO UPDATE SET
  payment_type = excluded.payment_type,
  payment_time = excluded.payment_time,
  amount_msat = excluded.amount_msat,
  fee_msat = excluded.fee_msat,
  status = excluded.status,
  error = excluded.error,
  description = excluded.description,
  details = excluded.details,
  metadata = excluded.metadata
WHERE payments.status = 'failed'
"#,
                params![
                    &payment.id,
                    payment_type_to_str(payment.payment_type),
                    payment.payment_time,
                    to_sql_int(payment.amount_msat)?,
                    to_sql_int(payment.fee_msat)?,
                    payment_status_to_str(payment.status),
                    &payment.error,
                    &payment.description,
                    details,
                    &payment.metadata,
                ],
            )
            .with_context(|| format!("start payment attempt {}", payment.id))?;
        Ok(rows == 1)
    }

    /// Overwrites a payment that is still pending. Returns false when the
    /// stored record is missing or already terminal.
    pub fn update_pending_payment(&mut self, payment: &Payment) -> Result<bool> {
        let details = serde_json::to_string(&payment.details).context("encode payment details")?;
        let rows = self
            .conn
            .execute(
                r#"
UPDATE payments SET
  payment_time = ?2,
  amount_msat = ?3,
  fee_msat = ?4,
  status = ?5,
  error = ?6,
  description = ?7,
  details = ?8,
  metadata = COALESCE(?9, metadata)
WHERE id = ?1 AND status = 'pending'
"#,
                params![
                    &payment.id,
                    payment.payment_time,
                    to_sql_int(payment.amount_msat)?,
                    to_sql_int(payment.fee_msat)?,
                    payment_status_to_str(payment.status),
                    &payment.error,
                    &payment.description,
                    details,
                    &payment.metadata,
                ],
            )
            .with_context(|| format!("update payment {}", payment.id))?;
        Ok(rows == 1)
    }

    /// Drops a pending record nobody is going to pay.
    pub fn delete_pending_payment(&mut self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM payments WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .with_context(|| format!("delete pending payment {id}"))?;
        Ok(rows == 1)
    }

    /// Returns false when no payment has this id.
    pub fn set_payment_metadata(&mut self, id: &str, metadata: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE payments SET metadata = ?2 WHERE id = ?1",
                params![id, metadata],
            )
            .with_context(|| format!("set metadata of payment {id}"))?;
        Ok(rows == 1)
    }

    pub fn get_payment(&self, id: &str) -> Result<Option<Payment>> {
        self.conn
            .query_row(
                &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1"),
                params![id],
                payment_from_row,
            )
            .optional()
            .with_context(|| format!("get payment {id}"))
    }

    /// Newest first.
    pub fn list_payments(&self, req: &ListPaymentsRequest) -> Result<Vec<Payment>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        let payment_type = match req.filter {
            PaymentTypeFilter::All => None,
            PaymentTypeFilter::Sent => Some(PaymentType::Sent),
            PaymentTypeFilter::Received => Some(PaymentType::Received),
            PaymentTypeFilter::ClosedChannel => Some(PaymentType::ClosedChannel),
        };
        if let Some(payment_type) = payment_type {
            values.push(Value::Text(payment_type_to_str(payment_type).to_string()));
            clauses.push(format!("payment_type = ?{}", values.len()));
        }
        if let Some(from) = req.from_timestamp {
            values.push(Value::Integer(from));
            clauses.push(format!("payment_time >= ?{}", values.len()));
        }
        if let Some(to) = req.to_timestamp {
            values.push(Value::Integer(to));
            clauses.push(format!("payment_time <= ?{}", values.len()));
        }
        if !req.include_failures.unwrap_or(false) {
            clauses.push("status != 'failed'".to_string());
        }

        let mut sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY payment_time DESC, id");
        if req.limit.is_some() || req.offset.is_some() {
            values.push(Value::Integer(req.limit.map_or(-1, i64::from)));
            values.push(Value::Integer(i64::from(req.offset.unwrap_or(0))));
            sql.push_str(&format!(" LIMIT ?{} OFFSET ?{}", values.len() - 1, values.len()));
        }

        let mut stmt = self.conn.prepare(&sql).context("prepare list payments")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), payment_from_row)
            .context("query list payments")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read payment row")?);
        }
        Ok(out)
    }

    pub fn set_open_channel_fee(&mut self, payment_hash: &str, fee_msat: u64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO open_channel_fees (payment_hash, fee_msat) VALUES (?1, ?2)",
                params![payment_hash, to_sql_int(fee_msat)?],
            )
            .with_context(|| format!("set open channel fee {payment_hash}"))?;
        Ok(())
    }

    pub fn open_channel_fee(&self, payment_hash: &str) -> Result<Option<u64>> {
        let fee: Option<i64> = self
            .conn
            .query_row(
                "SELECT fee_msat FROM open_channel_fees WHERE payment_hash = ?1",
                params![payment_hash],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("get open channel fee {payment_hash}"))?;
        Ok(fee.map(|f| u64::try_from(f).unwrap_or_default()))
    }

    pub fn insert_swap(&mut self, swap: &SwapInfo) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO swaps (bitcoin_address, payment_hash, created_at, status, data)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
                params![
                    &swap.bitcoin_address,
                    hex::encode(&swap.payment_hash),
                    swap.created_at,
                    swap_status_to_str(swap.status),
                    serde_json::to_string(swap).context("encode swap")?,
                ],
            )
            .with_context(|| format!("insert swap {}", swap.bitcoin_address))?;
        Ok(())
    }

    pub fn update_swap(&mut self, swap: &SwapInfo) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE swaps SET status = ?2, data = ?3 WHERE bitcoin_address = ?1",
                params![
                    &swap.bitcoin_address,
                    swap_status_to_str(swap.status),
                    serde_json::to_string(swap).context("encode swap")?,
                ],
            )
            .with_context(|| format!("update swap {}", swap.bitcoin_address))?;
        anyhow::ensure!(rows == 1, "swap not found: {}", swap.bitcoin_address);
        Ok(())
    }

    pub fn get_swap(&self, bitcoin_address: &str) -> Result<Option<SwapInfo>> {
        self.conn
            .query_row(
                "SELECT data FROM swaps WHERE bitcoin_address = ?1",
                params![bitcoin_address],
                |row| json_col(row, 0),
            )
            .optional()
            .with_context(|| format!("get swap {bitcoin_address}"))
    }

    pub fn get_swap_by_hash(&self, payment_hash: &[u8]) -> Result<Option<SwapInfo>> {
        self.conn
            .query_row(
                "SELECT data FROM swaps WHERE payment_hash = ?1",
                params![hex::encode(payment_hash)],
                |row| json_col(row, 0),
            )
            .optional()
            .context("get swap by payment hash")
    }

    /// Oldest first; all swaps when `statuses` is empty.
    pub fn list_swaps(&self, statuses: &[SwapStatus]) -> Result<Vec<SwapInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, data FROM swaps ORDER BY created_at, bitcoin_address")
            .context("prepare list swaps")?;
        let rows = stmt
            .query_map([], |row| {
                let status = swap_status_from_str(&row.get::<_, String>(0)?, 0)?;
                let swap: SwapInfo = json_col(row, 1)?;
                Ok((status, swap))
            })
            .context("query list swaps")?;

        let mut out = Vec::new();
        for row in rows {
            let (status, swap) = row.context("read swap row")?;
            if statuses.is_empty() || statuses.contains(&status) {
                out.push(swap);
            }
        }
        Ok(out)
    }

    pub fn insert_reverse_swap(&mut self, rsi: &FullReverseSwapInfo) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO reverse_swaps (id, lockup_address, created_at_block_height, status, data)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
                params![
                    &rsi.id,
                    &rsi.lockup_address,
                    rsi.created_at_block_height,
                    reverse_status_to_str(rsi.status),
                    serde_json::to_string(rsi).context("encode reverse swap")?,
                ],
            )
            .with_context(|| format!("insert reverse swap {}", rsi.id))?;
        Ok(())
    }

    pub fn update_reverse_swap(&mut self, rsi: &FullReverseSwapInfo) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE reverse_swaps SET status = ?2, data = ?3 WHERE id = ?1",
                params![
                    &rsi.id,
                    reverse_status_to_str(rsi.status),
                    serde_json::to_string(rsi).context("encode reverse swap")?,
                ],
            )
            .with_context(|| format!("update reverse swap {}", rsi.id))?;
        anyhow::ensure!(rows == 1, "reverse swap not found: {}", rsi.id);
        Ok(())
    }

    pub fn get_reverse_swap(&self, id: &str) -> Result<Option<FullReverseSwapInfo>> {
        self.conn
            .query_row(
                "SELECT data FROM reverse_swaps WHERE id = ?1",
                params![id],
                |row| json_col(row, 0),
            )
            .optional()
            .with_context(|| format!("get reverse swap {id}"))
    }

    pub fn list_reverse_swaps(&self) -> Result<Vec<FullReverseSwapInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM reverse_swaps ORDER BY created_at_block_height, id")
            .context("prepare list reverse swaps")?;
        let rows = stmt
            .query_map([], |row| json_col(row, 0))
            .context("query list reverse swaps")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read reverse swap row")?);
        }
        Ok(out)
    }

    pub fn set_setting(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .with_context(|| format!("set setting {key}"))?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("get setting {key}"))
    }

    pub fn set_json_setting<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).with_context(|| format!("encode setting {key}"))?;
        self.set_setting(key, &json)
    }

    pub fn get_json_setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_setting(key)?
            .map(|json| {
                serde_json::from_str(&json).with_context(|| format!("decode setting {key}"))
            })
            .transpose()
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS payments (
  id TEXT PRIMARY KEY,
  payment_type TEXT NOT NULL,
  payment_time INTEGER NOT NULL,
  amount_msat INTEGER NOT NULL,
  fee_msat INTEGER NOT NULL,
  status TEXT NOT NULL,
  error TEXT,
  description TEXT,
  details TEXT NOT NULL,
  metadata TEXT
);
CREATE INDEX IF NOT EXISTS payments_time_idx ON payments(payment_time);

CREATE TABLE IF NOT EXISTS open_channel_fees (
  payment_hash TEXT PRIMARY KEY,
  fee_msat INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS swaps (
  bitcoin_address TEXT PRIMARY KEY,
  payment_hash TEXT NOT NULL UNIQUE,
  created_at INTEGER NOT NULL,
  status TEXT NOT NULL,
  data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS swaps_status_idx ON swaps(status);

CREATE TABLE IF NOT EXISTS reverse_swaps (
  id TEXT PRIMARY KEY,
  lockup_address TEXT NOT NULL,
  created_at_block_height INTEGER NOT NULL,
  status TEXT NOT NULL,
  data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS reverse_swaps_status_idx ON reverse_swaps(status);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    let payment_type = payment_type_from_str(&row.get::<_, String>(1)?, 1)?;
    let amount_msat: i64 = row.get(3)?;
    let fee_msat: i64 = row.get(4)?;
    let status = payment_status_from_str(&row.get::<_, String>(5)?, 5)?;
    Ok(Payment {
        id: row.get(0)?,
        payment_type,
        payment_time: row.get(2)?,
        amount_msat: from_sql_int(amount_msat, 3, "amount_msat")?,
        fee_msat: from_sql_int(fee_msat, 4, "fee_msat")?,
        status,
        error: row.get(6)?,
        description: row.get(7)?,
        details: json_col(row, 8)?,
        metadata: row.get(9)?,
    })
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, col: usize) -> rusqlite::Result<T> {
    let json: String = row.get(col)?;
    serde_json::from_str(&json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("value out of range: {value}"))
}

fn from_sql_int(value: i64, col: usize, name: &str) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Integer,
            format!("invalid {name} {value}").into(),
        )
    })
}

fn payment_type_to_str(payment_type: PaymentType) -> &'static str {
    match payment_type {
        PaymentType::Sent => "sent",
        PaymentType::Received => "received",
        PaymentType::ClosedChannel => "closed_channel",
    }
}

fn payment_type_from_str(s: &str, col: usize) -> rusqlite::Result<PaymentType> {
    match s {
        "sent" => Ok(PaymentType::Sent),
        "received" => Ok(PaymentType::Received),
        "closed_channel" => Ok(PaymentType::ClosedChannel),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown payment type: {other}").into(),
        )),
    }
}

fn payment_status_to_str(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Pending => "pending",
        PaymentStatus::Complete => "complete",
        PaymentStatus::Failed => "failed",
    }
}

fn payment_status_from_str(s: &str, col: usize) -> rusqlite::Result<PaymentStatus> {
    match s {
        "pending" => Ok(PaymentStatus::Pending),
        "complete" => Ok(PaymentStatus::Complete),
        "failed" => Ok(PaymentStatus::Failed),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown payment status: {other}").into(),
        )),
    }
}

fn swap_status_to_str(status: SwapStatus) -> &'static str {
    match status {
        SwapStatus::WaitingDeposit => "waiting_deposit",
        SwapStatus::WaitingConfirmation => "waiting_confirmation",
        SwapStatus::Redeemed => "redeemed",
        SwapStatus::Refundable => "refundable",
        SwapStatus::Refunded => "refunded",
        SwapStatus::Expired => "expired",
    }
}

fn swap_status_from_str(s: &str, col: usize) -> rusqlite::Result<SwapStatus> {
    match s {
        "waiting_deposit" => Ok(SwapStatus::WaitingDeposit),
        "waiting_confirmation" => Ok(SwapStatus::WaitingConfirmation),
        "redeemed" => Ok(SwapStatus::Redeemed),
        "refundable" => Ok(SwapStatus::Refundable),
        "refunded" => Ok(SwapStatus::Refunded),
        "expired" => Ok(SwapStatus::Expired),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown swap status: {other}").into(),
        )),
    }
}

fn reverse_status_to_str(status: ReverseSwapStatus) -> &'static str {
    match status {
        ReverseSwapStatus::Initial => "initial",
        ReverseSwapStatus::InProgress => "in_progress",
        ReverseSwapStatus::Cancelled => "cancelled",
        ReverseSwapStatus::CompletedSeen => "completed_seen",
        ReverseSwapStatus::CompletedConfirmed => "completed_confirmed",
    }
}
