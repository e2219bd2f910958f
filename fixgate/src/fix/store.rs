//! Durable message store interface.
//!
//! Every accepted inbound and every sent outbound message is appended here,
//! keyed by `(session, direction, seq)`; the same backend persists session
//! counters for crash recovery and an audit trail of session events.
//! Two implementations exist: [`VecStore`] keeps everything in memory (tests
//! and ephemeral deployments), [`SqliteStore`] provides transactional
//! durability.
//!
//! [`VecStore`]: crate::fix::vec_store::VecStore
//! [`SqliteStore`]: crate::fix::sqlite_store::SqliteStore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("sequence {seq} already appended for {session_id}/{direction}")]
    DuplicateSeq {
        session_id: String,
        direction: Direction,
        seq: u32,
    },
}

/// Which side of the wire a stored message traveled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "in",
            Direction::Outgoing => "out",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Direction {
    type Error = String;
    fn try_from(s: &str) -> Result<Direction, String> {
        match s {
            "in" => Ok(Direction::Incoming),
            "out" => Ok(Direction::Outgoing),
            other => Err(format!("unknown direction {other:?}")),
        }
    }
}

/// An immutable stored frame. Rows are never rewritten after append; they
/// may later be stamped `archived_at` and eventually deleted by retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub session_id: String,
    pub direction: Direction,
    pub seq: u32,
    pub msg_type: char,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub ts: DateTime<Utc>,
    pub raw: Vec<u8>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// Session lifecycle events kept for the auditors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    SessionCreated,
    Logon,
    Logout,
    Timeout,
    MsgReceived,
    MsgSent,
    MsgRejected,
    SeqReset,
    FatalSeqError,
    HeartbeatTimeout,
    TestReqSent,
    ResendReq,
    AuthFailure,
    ProtocolError,
    SystemError,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::SessionCreated => "SessionCreated",
            AuditEvent::Logon => "Logon",
            AuditEvent::Logout => "Logout",
            AuditEvent::Timeout => "Timeout",
            AuditEvent::MsgReceived => "MsgReceived",
            AuditEvent::MsgSent => "MsgSent",
            AuditEvent::MsgRejected => "MsgRejected",
            AuditEvent::SeqReset => "SeqReset",
            AuditEvent::FatalSeqError => "FatalSeqError",
            AuditEvent::HeartbeatTimeout => "HeartbeatTimeout",
            AuditEvent::TestReqSent => "TestReqSent",
            AuditEvent::ResendReq => "ResendReq",
            AuditEvent::AuthFailure => "AuthFailure",
            AuditEvent::ProtocolError => "ProtocolError",
            AuditEvent::SystemError => "SystemError",
        }
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditEvent {
    type Err = String;
    fn from_str(s: &str) -> Result<AuditEvent, String> {
        let event = match s {
            "SessionCreated" => AuditEvent::SessionCreated,
            "Logon" => AuditEvent::Logon,
            "Logout" => AuditEvent::Logout,
            "Timeout" => AuditEvent::Timeout,
            "MsgReceived" => AuditEvent::MsgReceived,
            "MsgSent" => AuditEvent::MsgSent,
            "MsgRejected" => AuditEvent::MsgRejected,
            "SeqReset" => AuditEvent::SeqReset,
            "FatalSeqError" => AuditEvent::FatalSeqError,
            "HeartbeatTimeout" => AuditEvent::HeartbeatTimeout,
            "TestReqSent" => AuditEvent::TestReqSent,
            "ResendReq" => AuditEvent::ResendReq,
            "AuthFailure" => AuditEvent::AuthFailure,
            "ProtocolError" => AuditEvent::ProtocolError,
            "SystemError" => AuditEvent::SystemError,
            other => return Err(format!("unknown audit event {other:?}")),
        };
        Ok(event)
    }
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: Option<i64>,
    pub session_id: String,
    pub ts: DateTime<Utc>,
    pub event: AuditEvent,
    pub msg_type: Option<char>,
    pub raw: Option<Vec<u8>>,
    pub direction: Option<Direction>,
    pub peer: Option<String>,
    pub text: Option<String>,
}

impl AuditRecord {
    pub fn new(session_id: impl Into<String>, event: AuditEvent) -> AuditRecord {
        AuditRecord {
            id: None,
            session_id: session_id.into(),
            ts: Utc::now(),
            event,
            msg_type: None,
            raw: None,
            direction: None,
            peer: None,
            text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> AuditRecord {
        self.text = Some(text.into());
        self
    }

    pub fn with_msg(mut self, msg_type: char, direction: Direction, raw: &[u8]) -> AuditRecord {
        self.msg_type = Some(msg_type);
        self.direction = Some(direction);
        self.raw = Some(raw.to_vec());
        self
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> AuditRecord {
        self.peer = Some(peer.into());
        self
    }
}

/// Persisted session state, reloaded on reconnect and after restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub status: String,
    pub incoming_next: u32,
    pub outgoing_next: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub heartbeat_interval: u32,
    pub total_in: u64,
    pub total_out: u64,
}

/// Persistence seam shared by every session.
///
/// Implementations serialize writes per `(session, direction)` so sequence
/// monotonicity survives concurrent sessions, and make appended rows
/// observable to readers once `append` returns. `append_audit` is invoked
/// from a funnel task and may be lossy under overload; protocol-path callers
/// never see its errors.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message already carrying its assigned seq. Returns the seq.
    async fn append(&self, msg: StoredMessage) -> Result<u32, StoreError>;

    async fn get(
        &self,
        session_id: &str,
        direction: Direction,
        seq: u32,
    ) -> Result<Option<StoredMessage>, StoreError>;

    /// Messages with `from <= seq <= to`, ascending by seq.
    async fn range(
        &self,
        session_id: &str,
        direction: Direction,
        from: u32,
        to: u32,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Highest appended seq, 0 if none.
    async fn last_seq(&self, session_id: &str, direction: Direction) -> Result<u32, StoreError>;

    async fn append_audit(&self, record: AuditRecord) -> Result<(), StoreError>;

    async fn audit_range(
        &self,
        session_id: &str,
        from_ts: DateTime<Utc>,
        to_ts: DateTime<Utc>,
    ) -> Result<Vec<AuditRecord>, StoreError>;

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError>;

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn save_session(&self, record: SessionRecord) -> Result<(), StoreError>;

    /// Drops a session's message history in both directions. Invoked when a
    /// sequence reset is honored on logon, so restarted sequence numbers
    /// cannot collide with historical rows.
    async fn reset_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// Stamps `archived_at` on messages of `session_id` older than `ts`.
    /// Returns how many rows were stamped.
    async fn archive_before(&self, session_id: &str, ts: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Deletes messages archived before `ts` across all sessions. Returns
    /// how many rows were removed.
    async fn delete_archived_before(&self, ts: DateTime<Utc>) -> Result<u64, StoreError>;
}
