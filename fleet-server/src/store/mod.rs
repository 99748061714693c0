//! SQLite persistence layer.
//!
//! One [`Db`] handle wraps the pool; entity-specific queries live in the
//! submodules. The schema is bootstrapped with idempotent DDL at connect
//! time (full migration tooling is a deployment concern, not ours).

pub mod allocations;
pub mod hangups;
pub mod receipts;
pub mod sms;
pub mod snapshots;
pub mod users;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Idempotent schema bootstrap.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_name     TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    password_salt TEXT NOT NULL,
    role          TEXT NOT NULL DEFAULT 'User',
    is_deleted    INTEGER NOT NULL DEFAULT 0,
    create_time   TEXT NOT NULL,
    update_time   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS com_allocations (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id        INTEGER NOT NULL REFERENCES users(id),
    device_id      TEXT NOT NULL,
    com_ports_json TEXT NOT NULL,
    is_deleted     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS device_com_snapshots (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   TEXT NOT NULL UNIQUE,
    data_json   TEXT NOT NULL,
    update_time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sms_messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id       TEXT NOT NULL,
    com_port        TEXT NOT NULL,
    sender_number   TEXT NOT NULL,
    message_content TEXT NOT NULL,
    received_time   TEXT NOT NULL,
    sms_timestamp   TEXT,
    operator        TEXT,
    is_deleted      INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sms_device   ON sms_messages(device_id);
CREATE INDEX IF NOT EXISTS idx_sms_port     ON sms_messages(com_port);
CREATE INDEX IF NOT EXISTS idx_sms_sender   ON sms_messages(sender_number);
CREATE INDEX IF NOT EXISTS idx_sms_received ON sms_messages(received_time);

CREATE TABLE IF NOT EXISTS call_hangup_records (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id     TEXT NOT NULL,
    com_port      TEXT NOT NULL,
    caller_number TEXT,
    hangup_time   TEXT NOT NULL,
    reason        TEXT NOT NULL,
    raw_line      TEXT,
    is_deleted    INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_hangup_device ON call_hangup_records(device_id);
CREATE INDEX IF NOT EXISTS idx_hangup_time   ON call_hangup_records(hangup_time);

CREATE TABLE IF NOT EXISTS message_read_receipts (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      INTEGER NOT NULL,
    message_type TEXT NOT NULL,
    source_id    INTEGER NOT NULL,
    read_time    TEXT NOT NULL,
    UNIQUE(user_id, message_type, source_id)
);
"#;

/// Normalize a device id or COM port for comparison: trim + uppercase.
#[must_use]
pub fn normalize(value: &str) -> String {
    value.trim().to_uppercase()
}

/// Message categories covered by read receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// An [`sms::SmsRecord`].
    Sms,
    /// A [`hangups::HangupRecord`].
    Hangup,
}

impl MessageType {
    /// Storage and wire string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Sms => "Sms",
            MessageType::Hangup => "Hangup",
        }
    }

    /// Parse the wire string.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Sms" => Some(MessageType::Sms),
            "Hangup" => Some(MessageType::Hangup),
            _ => None,
        }
    }
}

/// Clamped 1-based page request.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// 1-based page number.
    pub number: u32,
    /// Page size, clamped to 1..=200.
    pub size: u32,
}

impl Page {
    /// Maximum page size.
    pub const MAX_SIZE: u32 = 200;

    /// Build a page request, clamping out-of-range values.
    #[must_use]
    pub fn new(number: Option<u32>, size: Option<u32>) -> Self {
        Self {
            number: number.unwrap_or(1).max(1),
            size: size.unwrap_or(20).clamp(1, Self::MAX_SIZE),
        }
    }

    /// SQL OFFSET for this page.
    #[must_use]
    pub fn offset(self) -> i64 {
        i64::from(self.number - 1) * i64::from(self.size)
    }
}

/// Database handle shared across the server.
#[derive(Clone, Debug)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Connect and bootstrap the schema.
    ///
    /// `url` is an sqlx SQLite URL such as `sqlite://fleet.db?mode=rwc`.
    /// In-memory databases are pinned to a single connection so every
    /// query sees the same store.
    pub async fn connect(url: &str) -> Result<Self> {
        let mut options = SqlitePoolOptions::new();
        if url.contains(":memory:") {
            options = options.max_connections(1);
        }
        let pool = options
            .connect(url)
            .await
            .with_context(|| format!("cannot open database {url}"))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("schema bootstrap failed")?;

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn connect_in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// The underlying pool, for entity modules.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
