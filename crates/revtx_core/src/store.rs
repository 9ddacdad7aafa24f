//! Durable store for transactions and their call logs.
//!
//! This module handles the file system layout and the SQL schema:
//!
//! ```text
//! <data_dir>/
//! ├─ tx.db              # SQLite database (tx, call, undo_call, _meta)
//! ├─ tx.db.lck          # Lock sidecar (see crate::lock)
//! ├─ .trash/<ser_id>/   # Per-transaction trash, created lazily
//! └─ .tmp/<ser_id>/     # Per-transaction tmp, created lazily
//! ```
//!
//! The lock sidecar is never the database file itself - that would collide
//! with SQLite's own OS-level locks.
//!
//! The store also owns the SQL-level transaction boundary. `begin_sqltx` /
//! `commit_sqltx` / `rollback_sqltx` track whether a SQL transaction is
//! open so commit and rollback are idempotent when none is; the call loop
//! relies on this when it switches to autocommit mid-request.

use crate::error::{TxError, TxResult};
use crate::func::ArgMap;
use crate::status::TxStatus;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 4;

const DB_FILE: &str = "tx.db";
const LOCK_FILE: &str = "tx.db.lck";
const TRASH_DIR: &str = ".trash";
const TMP_DIR: &str = ".tmp";
/// Minimum ctime increment when the clock does not advance between inserts.
const CTIME_EPSILON: f64 = 1e-6;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS tx (
    ser_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    str_id       TEXT NOT NULL UNIQUE,
    owner_id     TEXT NOT NULL DEFAULT '',
    summary      TEXT,
    status       TEXT NOT NULL,
    ctime        REAL NOT NULL,
    commit_time  REAL,
    last_call_id INTEGER
);
CREATE TABLE IF NOT EXISTS call (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_ser_id INTEGER NOT NULL,
    sp        TEXT UNIQUE,
    ctime     REAL NOT NULL,
    f         TEXT NOT NULL,
    args      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS undo_call (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_ser_id INTEGER NOT NULL,
    sp        TEXT UNIQUE,
    ctime     REAL NOT NULL,
    f         TEXT NOT NULL,
    args      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS _meta (
    name  TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_call_tx ON call (tx_ser_id, ctime, id);
CREATE INDEX IF NOT EXISTS ix_undo_call_tx ON undo_call (tx_ser_id, ctime, id);
";

const TX_COLUMNS: &str = "ser_id, str_id, owner_id, summary, status, ctime, commit_time, \
                          last_call_id";

/// The two structurally identical call tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTable {
    /// Forward calls (`call`).
    Call,
    /// Inverse calls recorded from dry-run probes (`undo_call`).
    UndoCall,
}

impl CallTable {
    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::UndoCall => "undo_call",
        }
    }
}

/// A persisted transaction record.
#[derive(Debug, Clone)]
pub struct TxRecord {
    /// Monotonic id assigned by the store; identity inside the store.
    pub ser_id: i64,
    /// Caller-supplied id, unique forever; identity across the API.
    pub str_id: String,
    /// Opaque owner token, default empty.
    pub owner_id: String,
    /// Optional free-text summary.
    pub summary: Option<String>,
    /// Current status.
    pub status: TxStatus,
    /// Creation time, seconds since epoch.
    pub ctime: f64,
    /// Set when the transaction first commits.
    pub commit_time: Option<f64>,
    /// Id of the most recent fully-executed call; enables resume.
    pub last_call_id: Option<i64>,
}

impl TxRecord {
    /// Renders the record for `list` detail payloads.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "tx_id": self.str_id,
            "tx_status": self.status.as_char().to_string(),
            "tx_summary": self.summary,
            "tx_ctime": self.ctime,
            "tx_commit_time": self.commit_time,
            "owner_id": self.owner_id,
        })
    }
}

/// A persisted call or undo-call row.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Row id, monotonic per table.
    pub id: i64,
    /// Owning transaction.
    pub tx_ser_id: i64,
    /// Reserved savepoint label.
    pub sp: Option<String>,
    /// Insertion time.
    pub ctime: f64,
    /// Qualified function name.
    pub f: String,
    /// Caller arguments.
    pub args: ArgMap,
}

/// Filters for [`Store::list_txs`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Exact string id.
    pub str_id: Option<String>,
    /// Restrict to these statuses.
    pub statuses: Option<Vec<TxStatus>>,
    /// Exact owner id.
    pub owner_id: Option<String>,
}

/// SQLite-backed persistence for transaction records and call logs.
pub struct Store {
    conn: Connection,
    data_dir: PathBuf,
    in_sqltx: bool,
    last_ctime: f64,
}

impl Store {
    /// Opens or creates the store under `data_dir`.
    ///
    /// Ensures the directory layout, creates tables if absent, and checks
    /// the schema version: a version at or below 3 (or above
    /// [`SCHEMA_VERSION`]) is a fatal error directing the operator to
    /// migrate or downgrade - this is the one non-recoverable failure in
    /// the manager.
    pub fn open(data_dir: &Path, create_if_missing: bool) -> TxResult<Self> {
        if !data_dir.exists() {
            if create_if_missing {
                fs::create_dir_all(data_dir)?;
            } else {
                return Err(TxError::invalid_argument(format!(
                    "data directory does not exist: {}",
                    data_dir.display()
                )));
            }
        }
        fs::create_dir_all(data_dir.join(TRASH_DIR))?;
        fs::create_dir_all(data_dir.join(TMP_DIR))?;

        let conn = Connection::open(data_dir.join(DB_FILE))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;

        let stored: Option<String> = conn
            .query_row("SELECT value FROM _meta WHERE name = 'v'", [], |row| {
                row.get(0)
            })
            .optional()?;
        match stored {
            None => {
                conn.execute(
                    "INSERT INTO _meta (name, value) VALUES ('v', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(value) => {
                let found = value.parse::<i64>().unwrap_or(0);
                if found < SCHEMA_VERSION {
                    return Err(TxError::SchemaTooOld {
                        found,
                        supported: SCHEMA_VERSION,
                    });
                }
                if found > SCHEMA_VERSION {
                    return Err(TxError::SchemaTooNew {
                        found,
                        supported: SCHEMA_VERSION,
                    });
                }
            }
        }

        tracing::debug!(data_dir = %data_dir.display(), "store opened");
        Ok(Self {
            conn,
            data_dir: data_dir.to_path_buf(),
            in_sqltx: false,
            last_ctime: 0.0,
        })
    }

    /// The lock sidecar path for this store.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    /// Current time in epoch seconds, bumped so consecutive calls are
    /// strictly increasing even when the clock does not advance. Keeps
    /// `(ctime, id)` a total order within a batch.
    pub fn now(&mut self) -> f64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64());
        let t = if wall <= self.last_ctime {
            self.last_ctime + CTIME_EPSILON
        } else {
            wall
        };
        self.last_ctime = t;
        t
    }

    // --- SQL-level transaction boundary ---

    /// Begins a SQL transaction if none is open.
    pub fn begin_sqltx(&mut self) -> TxResult<()> {
        if !self.in_sqltx {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_sqltx = true;
        }
        Ok(())
    }

    /// Commits the open SQL transaction; no-op when none is open.
    pub fn commit_sqltx(&mut self) -> TxResult<()> {
        if self.in_sqltx {
            self.conn.execute_batch("COMMIT")?;
            self.in_sqltx = false;
        }
        Ok(())
    }

    /// Rolls back the open SQL transaction; no-op when none is open.
    pub fn rollback_sqltx(&mut self) -> TxResult<()> {
        if self.in_sqltx {
            self.conn.execute_batch("ROLLBACK")?;
            self.in_sqltx = false;
        }
        Ok(())
    }

    /// Whether a SQL transaction is currently open.
    #[must_use]
    pub fn sqltx_open(&self) -> bool {
        self.in_sqltx
    }

    // --- Transaction records ---

    /// Inserts a new transaction record and returns its `ser_id`.
    pub fn insert_tx(
        &mut self,
        str_id: &str,
        owner_id: &str,
        summary: Option<&str>,
        status: TxStatus,
        ctime: f64,
    ) -> TxResult<i64> {
        self.conn.execute(
            "INSERT INTO tx (str_id, owner_id, summary, status, ctime) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                str_id,
                owner_id,
                summary,
                status.as_char().to_string(),
                ctime
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Loads a transaction by its string id.
    pub fn get_tx_by_str_id(&self, str_id: &str) -> TxResult<Option<TxRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {TX_COLUMNS} FROM tx WHERE str_id = ?1"),
                params![str_id],
                Self::map_tx_row,
            )
            .optional()?;
        raw.map(Self::finish_tx_row).transpose()
    }

    /// Loads a transaction by its serial id.
    pub fn get_tx_by_ser_id(&self, ser_id: i64) -> TxResult<Option<TxRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {TX_COLUMNS} FROM tx WHERE ser_id = ?1"),
                params![ser_id],
                Self::map_tx_row,
            )
            .optional()?;
        raw.map(Self::finish_tx_row).transpose()
    }

    /// Updates a transaction's status, optionally clearing the resume
    /// marker (done whenever the status enters a new transient or terminal
    /// state).
    pub fn update_tx_status(
        &mut self,
        ser_id: i64,
        status: TxStatus,
        clear_last_call_id: bool,
    ) -> TxResult<()> {
        let sql = if clear_last_call_id {
            "UPDATE tx SET status = ?1, last_call_id = NULL WHERE ser_id = ?2"
        } else {
            "UPDATE tx SET status = ?1 WHERE ser_id = ?2"
        };
        self.conn
            .execute(sql, params![status.as_char().to_string(), ser_id])?;
        Ok(())
    }

    /// Sets a transaction's commit time.
    pub fn set_commit_time(&mut self, ser_id: i64, commit_time: f64) -> TxResult<()> {
        self.conn.execute(
            "UPDATE tx SET commit_time = ?1 WHERE ser_id = ?2",
            params![commit_time, ser_id],
        )?;
        Ok(())
    }

    /// Advances the resume marker to the given call id.
    pub fn set_last_call_id(&mut self, ser_id: i64, call_id: i64) -> TxResult<()> {
        self.conn.execute(
            "UPDATE tx SET last_call_id = ?1 WHERE ser_id = ?2",
            params![call_id, ser_id],
        )?;
        Ok(())
    }

    /// Deletes a transaction record and its rows in both call tables.
    pub fn delete_tx(&mut self, ser_id: i64) -> TxResult<()> {
        self.conn
            .execute("DELETE FROM call WHERE tx_ser_id = ?1", params![ser_id])?;
        self.conn.execute(
            "DELETE FROM undo_call WHERE tx_ser_id = ?1",
            params![ser_id],
        )?;
        self.conn
            .execute("DELETE FROM tx WHERE ser_id = ?1", params![ser_id])?;
        Ok(())
    }

    /// Lists transactions matching the filter, ordered by `(ctime, ser_id)`
    /// ascending.
    pub fn list_txs(&self, filter: &ListFilter) -> TxResult<Vec<TxRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TX_COLUMNS} FROM tx \
             WHERE (?1 IS NULL OR str_id = ?1) AND (?2 IS NULL OR owner_id = ?2) \
             ORDER BY ctime ASC, ser_id ASC"
        ))?;
        let rows = stmt.query_map(
            params![filter.str_id.as_deref(), filter.owner_id.as_deref()],
            Self::map_tx_row,
        )?;
        let mut txs = Vec::new();
        for raw in rows {
            let tx = Self::finish_tx_row(raw?)?;
            if let Some(statuses) = &filter.statuses {
                if !statuses.contains(&tx.status) {
                    continue;
                }
            }
            txs.push(tx);
        }
        Ok(txs)
    }

    /// All non-terminal transactions, most recently created first - the
    /// recovery work list.
    pub fn non_terminal_txs(&self) -> TxResult<Vec<TxRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TX_COLUMNS} FROM tx \
             WHERE status IN ('i', 'a', 'u', 'd', 'v', 'e') \
             ORDER BY ctime DESC, ser_id DESC"
        ))?;
        let rows = stmt.query_map([], Self::map_tx_row)?;
        rows.map(|raw| Self::finish_tx_row(raw?)).collect()
    }

    /// The most recently committed transaction (undo's default target).
    pub fn latest_committed(&self) -> TxResult<Option<TxRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {TX_COLUMNS} FROM tx WHERE status = 'C' \
                     ORDER BY commit_time DESC, ser_id DESC LIMIT 1"
                ),
                [],
                Self::map_tx_row,
            )
            .optional()?;
        raw.map(Self::finish_tx_row).transpose()
    }

    /// The earliest undone transaction (redo's default target).
    pub fn earliest_undone(&self) -> TxResult<Option<TxRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {TX_COLUMNS} FROM tx WHERE status = 'U' \
                     ORDER BY commit_time ASC, ser_id ASC LIMIT 1"
                ),
                [],
                Self::map_tx_row,
            )
            .optional()?;
        raw.map(Self::finish_tx_row).transpose()
    }

    // --- Call tables ---

    /// Inserts a call row and returns its id.
    pub fn insert_call(
        &mut self,
        table: CallTable,
        tx_ser_id: i64,
        sp: Option<&str>,
        ctime: f64,
        f: &str,
        args: &ArgMap,
    ) -> TxResult<i64> {
        let serialized = Value::Object(args.clone()).to_string();
        self.conn.execute(
            &format!(
                "INSERT INTO {} (tx_ser_id, sp, ctime, f, args) VALUES (?1, ?2, ?3, ?4, ?5)",
                table.name()
            ),
            params![tx_ser_id, sp, ctime, f, serialized],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Selects a transaction's rows from one call table in processing
    /// order.
    ///
    /// Rows are ordered by `(ctime, id)` ascending and reversed when
    /// `reversed` is set. When a resume marker is given, already-processed
    /// rows are skipped: the marker row itself is always excluded, and
    /// reversed processing keeps only rows with `ctime <= ctime(marker)`
    /// (`>=` for forward processing).
    pub fn select_calls(
        &self,
        table: CallTable,
        tx_ser_id: i64,
        reversed: bool,
        resume_after: Option<i64>,
    ) -> TxResult<Vec<CallRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, tx_ser_id, sp, ctime, f, args FROM {} \
             WHERE tx_ser_id = ?1 ORDER BY ctime ASC, id ASC",
            table.name()
        ))?;
        let rows = stmt.query_map(params![tx_ser_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut calls = Vec::new();
        for raw in rows {
            let (id, tx_ser_id, sp, ctime, f, args) = raw?;
            calls.push(CallRecord {
                id,
                tx_ser_id,
                sp,
                ctime,
                f,
                args: parse_args(&args)?,
            });
        }

        if let Some(marker) = resume_after {
            let marker_ctime = self
                .conn
                .query_row(
                    &format!("SELECT ctime FROM {} WHERE id = ?1", table.name()),
                    params![marker],
                    |row| row.get::<_, f64>(0),
                )
                .optional()?
                .ok_or_else(|| {
                    TxError::call(500, format!("resume marker {marker} not found"))
                })?;
            calls.retain(|c| {
                c.id != marker
                    && if reversed {
                        c.ctime <= marker_ctime
                    } else {
                        c.ctime >= marker_ctime
                    }
            });
        }
        if reversed {
            calls.reverse();
        }
        Ok(calls)
    }

    /// Deletes a transaction's rows from one call table.
    pub fn delete_calls(&mut self, table: CallTable, tx_ser_id: i64) -> TxResult<usize> {
        let n = self.conn.execute(
            &format!("DELETE FROM {} WHERE tx_ser_id = ?1", table.name()),
            params![tx_ser_id],
        )?;
        Ok(n)
    }

    /// Counts a transaction's rows in one call table.
    pub fn count_calls(&self, table: CallTable, tx_ser_id: i64) -> TxResult<i64> {
        let n = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE tx_ser_id = ?1", table.name()),
            params![tx_ser_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // --- Per-transaction work directories ---

    /// Lazily creates and returns a transaction's trash directory.
    pub fn trash_dir(&self, ser_id: i64) -> TxResult<PathBuf> {
        let path = self.data_dir.join(TRASH_DIR).join(ser_id.to_string());
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Lazily creates and returns a transaction's tmp directory.
    pub fn tmp_dir(&self, ser_id: i64) -> TxResult<PathBuf> {
        let path = self.data_dir.join(TMP_DIR).join(ser_id.to_string());
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Removes a transaction's trash and tmp directories if present.
    pub fn remove_work_dirs(&self, ser_id: i64) {
        for base in [TRASH_DIR, TMP_DIR] {
            let path = self.data_dir.join(base).join(ser_id.to_string());
            if path.exists() {
                let _ = fs::remove_dir_all(&path);
            }
        }
    }

    // --- Row mapping ---

    fn map_tx_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTx> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    }

    fn finish_tx_row(raw: RawTx) -> TxResult<TxRecord> {
        let (ser_id, str_id, owner_id, summary, status, ctime, commit_time, last_call_id) = raw;
        let code = status.chars().next().unwrap_or('\0');
        Ok(TxRecord {
            ser_id,
            str_id,
            owner_id,
            summary,
            status: TxStatus::from_char(code)?,
            ctime,
            commit_time,
            last_call_id,
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("data_dir", &self.data_dir)
            .field("in_sqltx", &self.in_sqltx)
            .finish_non_exhaustive()
    }
}

type RawTx = (
    i64,
    String,
    String,
    Option<String>,
    String,
    f64,
    Option<f64>,
    Option<i64>,
);

fn parse_args(serialized: &str) -> TxResult<ArgMap> {
    match serde_json::from_str::<Value>(serialized) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(TxError::call(
            500,
            format!("stored call args are not a map: {serialized}"),
        )),
    }
}
