//! Durable [`MessageStore`] backed by SQLite.
//!
//! One connection per store, driven through `tokio_rusqlite`'s dedicated
//! worker so every statement is serialized; WAL mode keeps appends cheap.
//! Appends are committed before `append` returns, which is what makes
//! inbound sequence acceptance crash-safe.

use crate::fix::store::{
    AuditEvent, AuditRecord, Direction, MessageStore, SessionRecord, StoreError, StoredMessage,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::OptionalExtension;
use std::path::Path;
use tokio_rusqlite::Connection;

const SQL_ENTER_WAL_MODE: &str = "PRAGMA journal_mode=WAL;";
const SQL_CREATE_MESSAGES: &str = "CREATE TABLE IF NOT EXISTS messages (
    session_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    seq INTEGER NOT NULL,
    msg_type TEXT NOT NULL,
    sender TEXT NOT NULL,
    target TEXT NOT NULL,
    ts TEXT NOT NULL,
    raw BLOB NOT NULL,
    archived_at TEXT,
    PRIMARY KEY (session_id, direction, seq));";
const SQL_CREATE_MESSAGES_TS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS messages_by_time ON messages (session_id, ts);";
const SQL_CREATE_SESSIONS: &str = "CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    sender TEXT NOT NULL,
    target TEXT NOT NULL,
    status TEXT NOT NULL,
    in_seq INTEGER NOT NULL,
    out_seq INTEGER NOT NULL,
    last_hb TEXT,
    start_time TEXT,
    hb_interval INTEGER NOT NULL,
    total_in INTEGER NOT NULL,
    total_out INTEGER NOT NULL);";
const SQL_CREATE_AUDIT: &str = "CREATE TABLE IF NOT EXISTS audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    ts TEXT NOT NULL,
    event TEXT NOT NULL,
    msg_type TEXT,
    raw BLOB,
    direction TEXT,
    peer TEXT,
    text TEXT);";
const SQL_INSERT_MESSAGE: &str = "INSERT INTO messages
    (session_id, direction, seq, msg_type, sender, target, ts, raw)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);";
const SQL_UPSERT_SESSION: &str = "INSERT INTO sessions
    (session_id, sender, target, status, in_seq, out_seq, last_hb, start_time, hb_interval, total_in, total_out)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    ON CONFLICT(session_id) DO UPDATE SET
    status = ?4, in_seq = ?5, out_seq = ?6, last_hb = ?7, hb_interval = ?9,
    total_in = ?10, total_out = ?11;";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<SqliteStore, StoreError> {
        let conn = Connection::open(path.as_ref())
            .await
            .map_err(backend_err)?;
        setup(&conn).await?;
        Ok(SqliteStore { conn })
    }

    /// A private in-memory database, used by tests.
    pub async fn open_in_memory() -> Result<SqliteStore, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(backend_err)?;
        setup(&conn).await?;
        Ok(SqliteStore { conn })
    }
}

async fn setup(conn: &Connection) -> Result<(), StoreError> {
    conn.call(|conn| {
        conn.query_row(SQL_ENTER_WAL_MODE, (), |_| Ok(()))?;
        conn.execute(SQL_CREATE_MESSAGES, ())?;
        conn.execute(SQL_CREATE_MESSAGES_TS_INDEX, ())?;
        conn.execute(SQL_CREATE_SESSIONS, ())?;
        conn.execute(SQL_CREATE_AUDIT, ())?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(backend_err)
}

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn format_ts(ts: DateTime<Utc>) -> String {
    format!("{}", ts.format(TIME_FORMAT))
}

fn read_ts(raw: NaiveDateTime) -> DateTime<Utc> {
    raw.and_utc()
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let direction: String = row.get(1)?;
    let msg_type: String = row.get(3)?;
    let archived: Option<NaiveDateTime> = row.get(8)?;
    Ok(StoredMessage {
        session_id: row.get(0)?,
        direction: Direction::try_from(direction.as_str())
            .unwrap_or(Direction::Incoming),
        seq: row.get(2)?,
        msg_type: msg_type.chars().next().unwrap_or('?'),
        sender_comp_id: row.get(4)?,
        target_comp_id: row.get(5)?,
        ts: read_ts(row.get(6)?),
        raw: row.get(7)?,
        archived_at: archived.map(read_ts),
    })
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, msg: StoredMessage) -> Result<u32, StoreError> {
        let seq = msg.seq;
        let session_id = msg.session_id.clone();
        let direction = msg.direction;
        let result = self
            .conn
            .call(move |conn| {
                conn.execute(
                    SQL_INSERT_MESSAGE,
                    rusqlite::params![
                        msg.session_id,
                        msg.direction.as_str(),
                        msg.seq,
                        msg.msg_type.to_string(),
                        msg.sender_comp_id,
                        msg.target_comp_id,
                        format_ts(msg.ts),
                        msg.raw,
                    ],
                )
                .map(|_| ())
            })
            .await;
        match result {
            Ok(()) => Ok(seq),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateSeq {
                    session_id,
                    direction,
                    seq,
                })
            }
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn get(
        &self,
        session_id: &str,
        direction: Direction,
        seq: u32,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT session_id, direction, seq, msg_type, sender, target, ts, raw, archived_at
                     FROM messages WHERE session_id = ?1 AND direction = ?2 AND seq = ?3;",
                    rusqlite::params![session_id, direction.as_str(), seq],
                    row_to_message,
                )
                .optional()
            })
            .await
            .map_err(backend_err)
    }

    async fn range(
        &self,
        session_id: &str,
        direction: Direction,
        from: u32,
        to: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, direction, seq, msg_type, sender, target, ts, raw, archived_at
                     FROM messages WHERE session_id = ?1 AND direction = ?2 AND seq BETWEEN ?3 AND ?4
                     ORDER BY seq ASC;",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![session_id, direction.as_str(), from, to],
                    row_to_message,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await
            .map_err(backend_err)
    }

    async fn last_seq(&self, session_id: &str, direction: Direction) -> Result<u32, StoreError> {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT COALESCE(MAX(seq), 0) FROM messages
                     WHERE session_id = ?1 AND direction = ?2;",
                    rusqlite::params![session_id, direction.as_str()],
                    |row| row.get::<usize, u32>(0),
                )
            })
            .await
            .map_err(backend_err)
    }

    async fn append_audit(&self, record: AuditRecord) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO audit (session_id, ts, event, msg_type, raw, direction, peer, text)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
                    rusqlite::params![
                        record.session_id,
                        format_ts(record.ts),
                        record.event.as_str(),
                        record.msg_type.map(|c| c.to_string()),
                        record.raw,
                        record.direction.map(|d| d.as_str()),
                        record.peer,
                        record.text,
                    ],
                )
                .map(|_| ())
            })
            .await
            .map_err(backend_err)
    }

    async fn audit_range(
        &self,
        session_id: &str,
        from_ts: DateTime<Utc>,
        to_ts: DateTime<Utc>,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, ts, event, msg_type, raw, direction, peer, text
                     FROM audit WHERE session_id = ?1 AND ts BETWEEN ?2 AND ?3 ORDER BY id ASC;",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![session_id, format_ts(from_ts), format_ts(to_ts)],
                    |row| {
                        let event: String = row.get(3)?;
                        let msg_type: Option<String> = row.get(4)?;
                        let direction: Option<String> = row.get(6)?;
                        Ok(AuditRecord {
                            id: row.get(0)?,
                            session_id: row.get(1)?,
                            ts: read_ts(row.get(2)?),
                            event: event.parse().unwrap_or(AuditEvent::SystemError),
                            msg_type: msg_type.and_then(|s| s.chars().next()),
                            raw: row.get(5)?,
                            direction: direction
                                .and_then(|s| Direction::try_from(s.as_str()).ok()),
                            peer: row.get(7)?,
                            text: row.get(8)?,
                        })
                    },
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await
            .map_err(backend_err)
    }

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT session_id FROM sessions ORDER BY session_id;")?;
                let rows = stmt.query_map([], |row| row.get::<usize, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await
            .map_err(backend_err)
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT session_id, sender, target, status, in_seq, out_seq, last_hb,
                            start_time, hb_interval, total_in, total_out
                     FROM sessions WHERE session_id = ?1;",
                    rusqlite::params![session_id],
                    |row| {
                        let last_hb: Option<NaiveDateTime> = row.get(6)?;
                        let start_time: Option<NaiveDateTime> = row.get(7)?;
                        Ok(SessionRecord {
                            session_id: row.get(0)?,
                            sender_comp_id: row.get(1)?,
                            target_comp_id: row.get(2)?,
                            status: row.get(3)?,
                            incoming_next: row.get(4)?,
                            outgoing_next: row.get(5)?,
                            last_heartbeat_at: last_hb.map(read_ts),
                            start_time: start_time.map(read_ts),
                            heartbeat_interval: row.get(8)?,
                            total_in: row.get(9)?,
                            total_out: row.get(10)?,
                        })
                    },
                )
                .optional()
            })
            .await
            .map_err(backend_err)
    }

    async fn save_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    SQL_UPSERT_SESSION,
                    rusqlite::params![
                        record.session_id,
                        record.sender_comp_id,
                        record.target_comp_id,
                        record.status,
                        record.incoming_next,
                        record.outgoing_next,
                        record.last_heartbeat_at.map(format_ts),
                        record.start_time.map(format_ts),
                        record.heartbeat_interval,
                        record.total_in,
                        record.total_out,
                    ],
                )
                .map(|_| ())
            })
            .await
            .map_err(backend_err)
    }

    async fn reset_session(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM messages WHERE session_id = ?1;",
                    rusqlite::params![session_id],
                )
                .map(|_| ())
            })
            .await
            .map_err(backend_err)
    }

    async fn archive_before(&self, session_id: &str, ts: DateTime<Utc>) -> Result<u64, StoreError> {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE messages SET archived_at = ?1
                     WHERE session_id = ?2 AND ts < ?3 AND archived_at IS NULL;",
                    rusqlite::params![format_ts(Utc::now()), session_id, format_ts(ts)],
                )
                .map(|n| n as u64)
            })
            .await
            .map_err(backend_err)
    }

    async fn delete_archived_before(&self, ts: DateTime<Utc>) -> Result<u64, StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM messages WHERE archived_at IS NOT NULL AND archived_at < ?1;",
                    rusqlite::params![format_ts(ts)],
                )
                .map(|n| n as u64)
            })
            .await
            .map_err(backend_err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Duration;

    fn message(seq: u32, direction: Direction) -> StoredMessage {
        StoredMessage {
            session_id: "CLIENT-SERVER".to_string(),
            direction,
            seq,
            msg_type: '8',
            sender_comp_id: "SERVER".to_string(),
            target_comp_id: "CLIENT".to_string(),
            ts: Utc::now(),
            raw: format!("frame-{seq}").into_bytes(),
            archived_at: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for seq in 1..=4 {
            assert_eq!(
                store.append(message(seq, Direction::Outgoing)).await.unwrap(),
                seq
            );
        }

        let got = store
            .get("CLIENT-SERVER", Direction::Outgoing, 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.raw, b"frame-2".to_vec());
        assert_eq!(got.msg_type, '8');

        let range = store
            .range("CLIENT-SERVER", Direction::Outgoing, 2, 3)
            .await
            .unwrap();
        assert_eq!(range.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(
            store
                .last_seq("CLIENT-SERVER", Direction::Outgoing)
                .await
                .unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_primary_key_blocks_duplicates() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.append(message(1, Direction::Incoming)).await.unwrap();
        assert!(store.append(message(1, Direction::Incoming)).await.is_err());
        // same seq on the other direction is a distinct row
        assert!(store.append(message(1, Direction::Outgoing)).await.is_ok());
    }

    #[tokio::test]
    async fn test_session_persistence() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let mut record = SessionRecord {
            session_id: "CLIENT-SERVER".to_string(),
            sender_comp_id: "CLIENT".to_string(),
            target_comp_id: "SERVER".to_string(),
            status: "LoggedOn".to_string(),
            incoming_next: 2,
            outgoing_next: 2,
            last_heartbeat_at: None,
            start_time: None,
            heartbeat_interval: 30,
            total_in: 1,
            total_out: 1,
        };
        store.save_session(record.clone()).await.unwrap();
        record.incoming_next = 7;
        store.save_session(record.clone()).await.unwrap();

        let loaded = store
            .load_session("CLIENT-SERVER")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.incoming_next, 7);
        assert_eq!(
            store.list_sessions().await.unwrap(),
            vec!["CLIENT-SERVER".to_string()]
        );
    }

    #[tokio::test]
    async fn test_audit_round_trip() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .append_audit(
                AuditRecord::new("CLIENT-SERVER", AuditEvent::AuthFailure)
                    .with_text("bad password")
                    .with_peer("10.0.0.9"),
            )
            .await
            .unwrap();

        let records = store
            .audit_range(
                "CLIENT-SERVER",
                Utc::now() - Duration::seconds(60),
                Utc::now() + Duration::seconds(60),
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, AuditEvent::AuthFailure);
        assert_eq!(records[0].peer.as_deref(), Some("10.0.0.9"));
    }

    #[tokio::test]
    async fn test_archive_then_delete() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for seq in 1..=3 {
            store.append(message(seq, Direction::Incoming)).await.unwrap();
        }
        let stamped = store
            .archive_before("CLIENT-SERVER", Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stamped, 3);

        let removed = store
            .delete_archived_before(Utc::now() + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(
            store
                .last_seq("CLIENT-SERVER", Direction::Incoming)
                .await
                .unwrap(),
            0
        );
    }
}
