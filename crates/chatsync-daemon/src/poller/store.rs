//! Read-only access to the chat database.
//!
//! The database belongs to another process that rewrites it continuously.
//! Each query opens its own read-only connection so a replaced, missing or
//! briefly locked file only fails the current poll cycle.

use super::PollerError;
use chatsync_core::time::{from_apple_time, to_apple_time};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, params};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// Timestamp columns are compared in nanoseconds. Legacy databases store
// whole seconds (magnitude below 1e12, see `LEGACY_SECONDS_THRESHOLD`), which
// are scaled up in SQL before comparing against the bound.
const MESSAGES_UPDATED_AFTER: &str = "
    SELECT message_rowid, guid, text, is_from_me, date, date_delivered, date_read, error,
           chat_guid
    FROM (
        SELECT m.ROWID AS message_rowid, m.guid, m.text, m.is_from_me, m.date, m.date_delivered,
               m.date_read, m.error, c.guid AS chat_guid,
               CASE WHEN ABS(m.date) < 1000000000000
                    THEN m.date * 1000000000 ELSE m.date END AS date_ns,
               CASE WHEN ABS(m.date_delivered) < 1000000000000
                    THEN m.date_delivered * 1000000000 ELSE m.date_delivered END AS delivered_ns,
               CASE WHEN ABS(m.date_read) < 1000000000000
                    THEN m.date_read * 1000000000 ELSE m.date_read END AS read_ns
        FROM message m
        LEFT JOIN chat_message_join cmj ON cmj.message_id = m.ROWID
        LEFT JOIN chat c ON c.ROWID = cmj.chat_id
    )
    WHERE date_ns > ?1 OR delivered_ns > ?1 OR read_ns > ?1
    ORDER BY date_ns ASC, message_rowid ASC";

const CHATS_READ_AFTER: &str = "
    SELECT chat_rowid, guid, chat_identifier, display_name, last_read_message_timestamp
    FROM (
        SELECT ROWID AS chat_rowid, guid, chat_identifier, display_name, last_read_message_timestamp,
               CASE WHEN ABS(last_read_message_timestamp) < 1000000000000
                    THEN last_read_message_timestamp * 1000000000
                    ELSE last_read_message_timestamp END AS read_ns
        FROM chat
    )
    WHERE read_ns > ?1
    ORDER BY read_ns ASC, chat_rowid ASC";

/// A row of the `message` table, with its chat guid when joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub rowid: i64,
    pub guid: String,
    pub text: Option<String>,
    pub is_from_me: bool,
    pub chat_guid: Option<String>,
    /// Raw store timestamps (Apple epoch)
    pub date: i64,
    pub date_delivered: i64,
    pub date_read: i64,
    pub error: i64,
}

impl MessageRow {
    /// Identity of this row's delivered state: the same guid with a new
    /// delivered/read/error value is a different key.
    pub fn state_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.guid, self.date_delivered, self.date_read, self.error
        )
    }

    pub fn to_payload(&self) -> serde_json::Value {
        json!({
            "rowid": self.rowid,
            "guid": self.guid,
            "text": self.text,
            "isFromMe": self.is_from_me,
            "chatGuid": self.chat_guid,
            "dateCreated": from_apple_time(self.date),
            "dateDelivered": from_apple_time(self.date_delivered),
            "dateRead": from_apple_time(self.date_read),
            "error": self.error,
        })
    }
}

/// A row of the `chat` table that carries a last-read timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReadRow {
    pub rowid: i64,
    pub guid: String,
    pub chat_identifier: Option<String>,
    pub display_name: Option<String>,
    pub last_read: i64,
}

impl ChatReadRow {
    pub fn state_key(&self) -> String {
        format!("{}:{}", self.guid, self.last_read)
    }

    pub fn to_payload(&self) -> serde_json::Value {
        json!({
            "chatGuid": self.guid,
            "chatIdentifier": self.chat_identifier,
            "displayName": self.display_name,
            "read": true,
            "lastReadAt": from_apple_time(self.last_read),
        })
    }
}

/// Handle to the chat database file. Cheap to clone; holds no connection.
#[derive(Debug, Clone)]
pub struct ChatDatabase {
    path: PathBuf,
}

impl ChatDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, PollerError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| PollerError::Open {
            path: self.path.clone(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Messages created, delivered or read strictly after `after`, oldest
    /// first. Blocking; call from a blocking context.
    pub fn messages_updated_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<MessageRow>, PollerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(MESSAGES_UPDATED_AFTER)?;
        let rows = stmt.query_map(params![to_apple_time(after)], |row| {
            Ok(MessageRow {
                rowid: row.get(0)?,
                guid: row.get(1)?,
                text: row.get(2)?,
                is_from_me: row.get::<_, Option<i64>>(3)?.unwrap_or(0) != 0,
                date: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                date_delivered: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                date_read: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                error: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
                chat_guid: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Chats whose last-read timestamp is strictly after `after`, oldest
    /// first. Blocking; call from a blocking context.
    pub fn chats_read_after(&self, after: DateTime<Utc>) -> Result<Vec<ChatReadRow>, PollerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(CHATS_READ_AFTER)?;
        let rows = stmt.query_map(params![to_apple_time(after)], |row| {
            Ok(ChatReadRow {
                rowid: row.get(0)?,
                guid: row.get(1)?,
                chat_identifier: row.get(2)?,
                display_name: row.get(3)?,
                last_read: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

/// Schema subset the queries above rely on. Used to build fixtures.
pub const FIXTURE_SCHEMA: &str = "
    CREATE TABLE chat (
        ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
        guid TEXT UNIQUE NOT NULL,
        chat_identifier TEXT,
        display_name TEXT,
        last_read_message_timestamp INTEGER DEFAULT 0
    );
    CREATE TABLE message (
        ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
        guid TEXT UNIQUE NOT NULL,
        text TEXT,
        is_from_me INTEGER DEFAULT 0,
        date INTEGER,
        date_delivered INTEGER DEFAULT 0,
        date_read INTEGER DEFAULT 0,
        error INTEGER DEFAULT 0
    );
    CREATE TABLE chat_message_join (
        chat_id INTEGER REFERENCES chat (ROWID) ON DELETE CASCADE,
        message_id INTEGER REFERENCES message (ROWID) ON DELETE CASCADE,
        PRIMARY KEY (chat_id, message_id)
    );";
