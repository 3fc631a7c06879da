use std::{path::Path, sync::Arc};

use chrono::{DateTime, NaiveDate, Utc};
use kop_core::{Error, Result};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS members (
    id            INTEGER PRIMARY KEY,
    member_number TEXT NOT NULL UNIQUE,
    name          TEXT NOT NULL,
    phone         TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'aktif',
    joined_at     TEXT
);
CREATE INDEX IF NOT EXISTS idx_members_phone ON members(phone);

CREATE TABLE IF NOT EXISTS savings (
    id         INTEGER PRIMARY KEY,
    member_id  INTEGER NOT NULL REFERENCES members(id),
    category   TEXT NOT NULL,
    amount     INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_savings_member ON savings(member_id);

CREATE TABLE IF NOT EXISTS loans (
    id                 INTEGER PRIMARY KEY,
    member_id          INTEGER NOT NULL REFERENCES members(id),
    loan_number        TEXT NOT NULL UNIQUE,
    principal          INTEGER NOT NULL,
    outstanding        INTEGER NOT NULL,
    status             TEXT NOT NULL,
    installments_paid  INTEGER NOT NULL DEFAULT 0,
    installments_total INTEGER NOT NULL DEFAULT 0,
    next_due           TEXT
);
CREATE INDEX IF NOT EXISTS idx_loans_member ON loans(member_id);

CREATE TABLE IF NOT EXISTS broadcasts (
    id           INTEGER PRIMARY KEY,
    title        TEXT NOT NULL,
    body         TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'pending'
                 CHECK (status IN ('pending', 'sending', 'completed', 'failed')),
    sent_count   INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    error        TEXT,
    created_at   TEXT NOT NULL,
    started_at   TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_broadcasts_status ON broadcasts(status, created_at);

CREATE TABLE IF NOT EXISTS broadcast_recipients (
    id           INTEGER PRIMARY KEY,
    broadcast_id INTEGER NOT NULL REFERENCES broadcasts(id),
    phone        TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'pending'
                 CHECK (status IN ('pending', 'sent', 'delivered', 'failed')),
    error        TEXT,
    message_id   TEXT,
    sent_at      TEXT,
    delivered_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_recipients_broadcast ON broadcast_recipients(broadcast_id, status);
CREATE INDEX IF NOT EXISTS idx_recipients_message ON broadcast_recipients(message_id);
";

/// Shared SQLite handle with the schema in place.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Connection>,
}

impl Database {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("open {}: {e}", path.display())))?;
        let db = Self {
            conn: Arc::new(conn),
        };
        db.bootstrap(true).await?;
        info!(path = %path.display(), "database ready");
        Ok(db)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("open in-memory database: {e}")))?;
        let db = Self {
            conn: Arc::new(conn),
        };
        db.bootstrap(false).await?;
        Ok(db)
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    async fn bootstrap(&self, wal: bool) -> Result<()> {
        self.conn
            .call(move |conn| -> std::result::Result<(), rusqlite::Error> {
                if wal {
                    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                }
                conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
            .map_err(|e| map_tr_err("schema bootstrap", e))?;
        debug!("schema bootstrapped");
        Ok(())
    }

    /// Cheap connectivity probe.
    pub async fn ping(&self) -> Result<()> {
        self.conn
            .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                conn.execute_batch("SELECT 1;")?;
                Ok(())
            })
            .await
            .map_err(|e| map_tr_err("ping", e))
    }
}

pub(crate) fn map_tr_err(context: &str, e: tokio_rusqlite::Error<rusqlite::Error>) -> Error {
    Error::StoreUnavailable(format!("{context}: {e}"))
}

pub(crate) fn to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Unparseable timestamps read back as `None`.
pub(crate) fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// `YYYY-MM-DD`, optionally followed by a time part.
pub(crate) fn parse_date(raw: Option<String>) -> Option<NaiveDate> {
    let raw = raw?;
    let day = raw.get(..10).unwrap_or(&raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}
