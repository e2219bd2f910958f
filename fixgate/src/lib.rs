//! A server-side FIX session engine.
//!
//! fixgate accepts long-lived FIX 4.4 / 5.0 sessions from trading
//! counterparties, validates and sequences every inbound message, persists
//! the full bidirectional message flow for replay and crash recovery, and
//! hands validated application messages to registered business handlers.
//!
//! ## Terminology
//! * `FIX Connection` -- one transport connection from a counterparty. The
//!   engine never owns sockets: the transport announces connections and
//!   pushes their bytes in, and receives outbound bytes through a
//!   [`TransportSink`].
//! * `FIX Session` -- the durable, sequenced relationship with one
//!   counterparty, identified by its comp-id pair. A session outlives its
//!   connections: sequence numbers and message history are persisted, so a
//!   reconnecting peer resumes exactly where it left off.
//! * `Engine` -- the container that routes connections to sessions, runs one
//!   task per session, and exposes the administrative surface.
//!
//! ## Example
//! ```no_run
//! use fixgate::{
//!     ApplicationRouter, ConnId, Engine, EngineConfig, StoreBackend, TransportSink,
//! };
//! use fixgate::fix::vec_store::VecStore;
//! use std::sync::Arc;
//!
//! struct StdoutSink;
//!
//! #[async_trait::async_trait]
//! impl TransportSink for StdoutSink {
//!     async fn send(&self, conn: ConnId, bytes: Vec<u8>) -> std::io::Result<()> {
//!         println!("conn {conn}: {} bytes out", bytes.len());
//!         Ok(())
//!     }
//!     async fn close(&self, _conn: ConnId) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::builder()
//!         .with_comp_id("EXCH")
//!         .with_store_backend(StoreBackend::Memory)
//!         .build()?;
//!
//!     let engine = Engine::new(config, Arc::new(VecStore::new()), Arc::new(StdoutSink))
//!         .with_router(ApplicationRouter::new());
//!     let handle = engine.start();
//!
//!     // the transport collaborator drives these:
//!     handle.deliver_connect(1, Some("10.0.0.9:55100".into())).await?;
//!     handle.deliver_bytes(1, b"8=FIX.4.4\x01...").await?;
//!
//!     handle.stop(std::time::Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

pub mod fix;

use fix::audit::Auditor;
use fix::encode::MessageBuilder;
use fix::message::Message;
use fix::registry::{AuthThrottle, Registry};
use fix::store::{AuditRecord, Direction, MessageStore, StoreError, StoredMessage};
use fix::stream::{FrameBuffer, FrameEvent};
use fix::{run_session, SessionContext, SessionEvent};

pub use fix::fields::BusinessRejectReason;
pub use fix::{DisconnectReason, SessionInfo, SessionKey, SessionStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// Opaque transport connection identifier, assigned by the transport.
pub type ConnId = u64;

/// Errors surfaced by the engine's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("setting `{0}` is required")]
    SettingRequired(String),
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnId),
    #[error("connection {0} is already registered")]
    ConnectionExists(ConnId),
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("session is not logged on")]
    NotLoggedOn,
    #[error("session closed")]
    SessionClosed,
    #[error("engine is stopped")]
    EngineStopped,
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Which FIX protocol version sessions speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FixVersion {
    #[serde(rename = "4.4")]
    V44,
    #[serde(rename = "5.0")]
    V50,
}

impl FixVersion {
    /// The `BeginString(8)` stamped on every frame.
    pub fn begin_string(&self) -> &'static str {
        match self {
            FixVersion::V44 => "FIX.4.4",
            FixVersion::V50 => "FIXT.1.1",
        }
    }
}

/// Message persistence backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sql { path: PathBuf },
}

impl StoreBackend {
    pub fn label(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Sql { .. } => "sql",
        }
    }
}

/// What to do with `ResetSeqNumFlag(141)=Y` on an inbound Logon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetOnLogonPolicy {
    /// Honor the flag: both counters restart at 1.
    Accept,
    /// Proceed with the logon but keep the counters.
    Ignore,
    /// Refuse logons that carry the flag.
    Never,
}

/// A collection of settings configuring the engine.
///
/// `EngineConfig` can be constructed with the [`EngineConfigBuilder`] or
/// deserialized by an external configuration loader.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The engine's own comp id, stamped as `SenderCompID(49)` on outbound.
    pub comp_id: String,
    pub fix_version: FixVersion,
    pub max_sessions: u32,
    pub max_frame_bytes: u32,
    pub default_heartbeat_secs: u32,
    pub logon_timeout_secs: u32,
    pub inbound_queue_depth: u32,
    pub outbound_queue_depth: u32,
    pub resend_buffer_window: u32,
    pub store_backend: StoreBackend,
    pub audit_retention_days: u32,
    pub reset_on_logon_policy: ResetOnLogonPolicy,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            comp_id: String::new(),
            fix_version: FixVersion::V44,
            max_sessions: 10_000,
            max_frame_bytes: 8_192,
            default_heartbeat_secs: 30,
            logon_timeout_secs: 30,
            inbound_queue_depth: 4_096,
            outbound_queue_depth: 4_096,
            resend_buffer_window: 1_024,
            store_backend: StoreBackend::Memory,
            audit_retention_days: 90,
            reset_on_logon_policy: ResetOnLogonPolicy::Accept,
        }
    }
}

impl EngineConfig {
    /// Creates a new [`EngineConfigBuilder`].
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

/// A builder for easily configuring all the fields of an [`EngineConfig`].
///
/// Only the comp id is required.
#[derive(Default)]
pub struct EngineConfigBuilder {
    comp_id: Option<String>,
    fix_version: Option<FixVersion>,
    max_sessions: Option<u32>,
    max_frame_bytes: Option<u32>,
    default_heartbeat_secs: Option<u32>,
    logon_timeout_secs: Option<u32>,
    inbound_queue_depth: Option<u32>,
    outbound_queue_depth: Option<u32>,
    resend_buffer_window: Option<u32>,
    store_backend: Option<StoreBackend>,
    audit_retention_days: Option<u32>,
    reset_on_logon_policy: Option<ResetOnLogonPolicy>,
}

impl EngineConfigBuilder {
    pub fn new() -> EngineConfigBuilder {
        Default::default()
    }

    /// The comp id this engine answers to; inbound Logons must address it
    /// in `TargetCompID(56)`.
    pub fn with_comp_id(mut self, comp_id: &str) -> Self {
        self.set_comp_id(comp_id);
        self
    }
    pub fn set_comp_id(&mut self, comp_id: &str) {
        self.comp_id = Some(comp_id.to_string());
    }

    pub fn with_fix_version(mut self, fix_version: FixVersion) -> Self {
        self.fix_version = Some(fix_version);
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: u32) -> Self {
        self.max_sessions = Some(max_sessions);
        self
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u32) -> Self {
        self.max_frame_bytes = Some(max_frame_bytes);
        self
    }

    pub fn with_default_heartbeat_secs(mut self, secs: u32) -> Self {
        self.default_heartbeat_secs = Some(secs);
        self
    }

    pub fn with_logon_timeout_secs(mut self, secs: u32) -> Self {
        self.logon_timeout_secs = Some(secs);
        self
    }

    pub fn with_inbound_queue_depth(mut self, depth: u32) -> Self {
        self.inbound_queue_depth = Some(depth);
        self
    }

    pub fn with_outbound_queue_depth(mut self, depth: u32) -> Self {
        self.outbound_queue_depth = Some(depth);
        self
    }

    pub fn with_resend_buffer_window(mut self, window: u32) -> Self {
        self.resend_buffer_window = Some(window);
        self
    }

    pub fn with_store_backend(mut self, backend: StoreBackend) -> Self {
        self.store_backend = Some(backend);
        self
    }

    pub fn with_audit_retention_days(mut self, days: u32) -> Self {
        self.audit_retention_days = Some(days);
        self
    }

    pub fn with_reset_on_logon_policy(mut self, policy: ResetOnLogonPolicy) -> Self {
        self.reset_on_logon_policy = Some(policy);
        self
    }

    /// Build the [`EngineConfig`].
    ///
    /// Returns `Err(EngineError::SettingRequired)` if the comp id was not
    /// set.
    pub fn build(self) -> Result<EngineConfig, EngineError> {
        let comp_id = self
            .comp_id
            .filter(|id| !id.is_empty())
            .ok_or(EngineError::SettingRequired(String::from("comp_id")))?;
        let defaults = EngineConfig::default();
        Ok(EngineConfig {
            comp_id,
            fix_version: self.fix_version.unwrap_or(defaults.fix_version),
            max_sessions: self.max_sessions.unwrap_or(defaults.max_sessions),
            max_frame_bytes: self.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
            default_heartbeat_secs: self
                .default_heartbeat_secs
                .unwrap_or(defaults.default_heartbeat_secs),
            logon_timeout_secs: self
                .logon_timeout_secs
                .unwrap_or(defaults.logon_timeout_secs),
            inbound_queue_depth: self
                .inbound_queue_depth
                .unwrap_or(defaults.inbound_queue_depth),
            outbound_queue_depth: self
                .outbound_queue_depth
                .unwrap_or(defaults.outbound_queue_depth),
            resend_buffer_window: self
                .resend_buffer_window
                .unwrap_or(defaults.resend_buffer_window),
            store_backend: self.store_backend.unwrap_or(defaults.store_backend),
            audit_retention_days: self
                .audit_retention_days
                .unwrap_or(defaults.audit_retention_days),
            reset_on_logon_policy: self
                .reset_on_logon_policy
                .unwrap_or(defaults.reset_on_logon_policy),
        })
    }
}

/// Outbound half of the byte transport. The engine pushes formatted frames
/// here; socket lifecycle, TLS and flushing are the transport's concern.
#[async_trait]
pub trait TransportSink: Send + Sync {
    async fn send(&self, conn: ConnId, bytes: Vec<u8>) -> std::io::Result<()>;
    async fn close(&self, conn: ConnId);
}

/// Credentials carried by an inbound Logon, as seen by the engine.
#[derive(Debug, Clone, Copy)]
pub struct LogonCredentials<'a> {
    /// The peer's comp id (its `SenderCompID(49)`).
    pub sender_comp_id: &'a str,
    /// The engine's comp id the logon addressed.
    pub target_comp_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub peer_addr: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(String),
}

/// Pluggable logon credential check.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: LogonCredentials<'_>) -> AuthDecision;
}

/// Accepts every logon. The default when no authenticator is configured.
pub struct AllowAllAuthenticator;

#[async_trait]
impl Authenticator for AllowAllAuthenticator {
    async fn authenticate(&self, _credentials: LogonCredentials<'_>) -> AuthDecision {
        AuthDecision::Allow
    }
}

/// A business-layer refusal, answered on the wire with
/// BusinessMessageReject(j).
#[derive(Debug, Clone)]
pub struct BusinessReject {
    pub reason: BusinessRejectReason,
    pub text: String,
}

impl BusinessReject {
    pub fn new(reason: BusinessRejectReason, text: impl Into<String>) -> BusinessReject {
        BusinessReject {
            reason,
            text: text.into(),
        }
    }
}

/// Business callback for one or more application message types. Invoked in
/// strict sequence order within a session.
///
/// Returned builders are emitted on the same session immediately after the
/// delivery completes, in order, through the normal outbound path. For
/// asynchronous or cross-session output use [`EngineHandle::send`] from a
/// separate task; awaiting it inside `on_message` for the delivering
/// session would wait on the session's own queue.
#[async_trait]
pub trait ApplicationHandler: Send + Sync {
    async fn on_message(
        &self,
        session_id: &str,
        msg: Message,
    ) -> Result<Vec<MessageBuilder>, BusinessReject>;
}

/// Routes validated application messages to handlers by MsgType. Messages
/// with no registered handler are answered with BusinessMessageReject.
#[derive(Default)]
pub struct ApplicationRouter {
    handlers: HashMap<char, Arc<dyn ApplicationHandler>>,
}

impl ApplicationRouter {
    pub fn new() -> ApplicationRouter {
        Default::default()
    }

    pub fn register(mut self, msg_type: char, handler: Arc<dyn ApplicationHandler>) -> Self {
        self.handlers.insert(msg_type, handler);
        self
    }

    pub(crate) fn handler_for(&self, msg_type: char) -> Option<&Arc<dyn ApplicationHandler>> {
        self.handlers.get(&msg_type)
    }
}

/// Engine health snapshot for the admin surface.
#[derive(Debug, Clone)]
pub struct Health {
    pub uptime: std::time::Duration,
    pub live_sessions: usize,
    pub known_sessions: usize,
    pub store_backend: &'static str,
}

struct ConnEntry {
    framer: Arc<Mutex<FrameBuffer>>,
    tx: mpsc::Sender<SessionEvent>,
    task: Option<tokio::task::JoinHandle<()>>,
}

struct EngineInner {
    config: Arc<EngineConfig>,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn TransportSink>,
    authenticator: Arc<dyn Authenticator>,
    router: Arc<ApplicationRouter>,
    auditor: Auditor,
    registry: Arc<Registry>,
    throttle: Arc<AuthThrottle>,
    conns: Mutex<HashMap<ConnId, ConnEntry>>,
    started_at: tokio::time::Instant,
    running: AtomicBool,
}

/// The engine, assembled from its explicit dependencies. [`Engine::start`]
/// turns it into a cloneable [`EngineHandle`].
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn TransportSink>,
    authenticator: Arc<dyn Authenticator>,
    router: Arc<ApplicationRouter>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn TransportSink>,
    ) -> Engine {
        Engine {
            config,
            store,
            transport,
            authenticator: Arc::new(AllowAllAuthenticator),
            router: Arc::new(ApplicationRouter::new()),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Engine {
        self.authenticator = authenticator;
        self
    }

    pub fn with_router(mut self, router: ApplicationRouter) -> Engine {
        self.router = Arc::new(router);
        self
    }

    /// Starts the engine. Must be called inside a tokio runtime.
    pub fn start(self) -> EngineHandle {
        let auditor = Auditor::spawn(self.store.clone());
        let registry = Arc::new(Registry::new(self.config.max_sessions as usize));
        info!(
            comp_id = %self.config.comp_id,
            fix_version = self.config.fix_version.begin_string(),
            "engine started"
        );
        EngineHandle {
            inner: Arc::new(EngineInner {
                config: Arc::new(self.config),
                store: self.store,
                transport: self.transport,
                authenticator: self.authenticator,
                router: self.router,
                auditor,
                registry,
                throttle: Arc::new(AuthThrottle::new()),
                conns: Mutex::new(HashMap::new()),
                started_at: tokio::time::Instant::now(),
                running: AtomicBool::new(true),
            }),
        }
    }
}

/// A handle on a running engine. Clones share the same engine.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

impl EngineHandle {
    /// Announces a new transport connection and spawns its session task.
    pub async fn deliver_connect(
        &self,
        conn: ConnId,
        peer_addr: Option<String>,
    ) -> Result<(), EngineError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(EngineError::EngineStopped);
        }
        {
            let conns = self.inner.conns.lock().unwrap();
            if conns.contains_key(&conn) {
                return Err(EngineError::ConnectionExists(conn));
            }
        }

        let (tx, rx) = mpsc::channel(self.inner.config.inbound_queue_depth as usize);
        let ctx = SessionContext {
            conn_id: conn,
            peer_addr,
            config: self.inner.config.clone(),
            store: self.inner.store.clone(),
            auditor: self.inner.auditor.clone(),
            transport: self.inner.transport.clone(),
            authenticator: self.inner.authenticator.clone(),
            router: self.inner.router.clone(),
            registry: self.inner.registry.clone(),
            throttle: self.inner.throttle.clone(),
            self_tx: tx.clone(),
        };
        let task = tokio::spawn(run_session(ctx, rx));
        let framer = Arc::new(Mutex::new(FrameBuffer::new(
            self.inner.config.fix_version.begin_string(),
            self.inner.config.max_frame_bytes as usize,
        )));

        let mut conns = self.inner.conns.lock().unwrap();
        conns.insert(
            conn,
            ConnEntry {
                framer,
                tx,
                task: Some(task),
            },
        );
        Ok(())
    }

    /// Feeds transport bytes into a connection's framer and routes complete
    /// frames to the session task. Suspends while the session's bounded
    /// inbound queue is full, which is how backpressure reaches the
    /// transport.
    pub async fn deliver_bytes(&self, conn: ConnId, bytes: &[u8]) -> Result<(), EngineError> {
        let (framer, tx) = {
            let conns = self.inner.conns.lock().unwrap();
            let entry = conns
                .get(&conn)
                .ok_or(EngineError::UnknownConnection(conn))?;
            (entry.framer.clone(), entry.tx.clone())
        };

        let mut events = Vec::new();
        {
            let mut framer = framer.lock().unwrap();
            framer.extend(bytes);
            while let Some(event) = framer.next_event() {
                events.push(event);
            }
        }

        for event in events {
            let session_event = match event {
                FrameEvent::Frame(frame) => SessionEvent::Frame(frame),
                FrameEvent::Garbled(reason) => SessionEvent::Garbled(reason),
            };
            if tx.send(session_event).await.is_err() {
                self.remove_conn(conn);
                return Err(EngineError::SessionClosed);
            }
        }
        Ok(())
    }

    /// The transport lost the connection.
    pub async fn deliver_disconnect(&self, conn: ConnId) {
        if let Some(entry) = self.remove_conn(conn) {
            let _ = entry.tx.send(SessionEvent::TransportClosed).await;
        }
    }

    /// Emits an outbound application message on a session. Resolves once
    /// the message is stamped with its seq, formatted and store-appended;
    /// transport flush is asynchronous.
    pub async fn send(
        &self,
        session_id: &str,
        builder: MessageBuilder,
    ) -> Result<u32, EngineError> {
        let tx = self
            .inner
            .registry
            .sender_for(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
        let (done, done_rx) = oneshot::channel();
        tx.send(SessionEvent::Send { builder, done })
            .await
            .map_err(|_| EngineError::SessionClosed)?;
        done_rx.await.map_err(|_| EngineError::SessionClosed)?
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.inner.registry.list()
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.inner.registry.get(session_id)
    }

    /// Asks a session to log out gracefully and close.
    pub async fn disconnect_session(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        let tx = self
            .inner
            .registry
            .sender_for(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
        tx.send(SessionEvent::Disconnect {
            text: reason.to_string(),
            reason: DisconnectReason::AdminRequest(reason.to_string()),
        })
        .await
        .map_err(|_| EngineError::SessionClosed)
    }

    /// Stored outbound messages in `[from, to]`; `to = 0` means through the
    /// latest.
    pub async fn replay(
        &self,
        session_id: &str,
        from: u32,
        to: u32,
    ) -> Result<Vec<StoredMessage>, EngineError> {
        let to = if to == 0 {
            self.inner
                .store
                .last_seq(session_id, Direction::Outgoing)
                .await?
        } else {
            to
        };
        Ok(self
            .inner
            .store
            .range(session_id, Direction::Outgoing, from, to)
            .await?)
    }

    pub async fn get_audit(
        &self,
        session_id: &str,
        from_ts: DateTime<Utc>,
        to_ts: DateTime<Utc>,
    ) -> Result<Vec<AuditRecord>, EngineError> {
        Ok(self.inner.store.audit_range(session_id, from_ts, to_ts).await?)
    }

    pub fn health(&self) -> Health {
        Health {
            uptime: self.inner.started_at.elapsed(),
            live_sessions: self.inner.registry.live_count(),
            known_sessions: self.inner.registry.known_count(),
            store_backend: self.inner.config.store_backend.label(),
        }
    }

    /// On-demand retention: archives a session's messages older than `ts`.
    pub async fn archive_before(
        &self,
        session_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        Ok(self.inner.store.archive_before(session_id, ts).await?)
    }

    /// On-demand retention: deletes messages archived longer ago than the
    /// configured retention period.
    pub async fn apply_retention(&self) -> Result<u64, EngineError> {
        let cutoff =
            Utc::now() - chrono::Duration::days(self.inner.config.audit_retention_days as i64);
        Ok(self.inner.store.delete_archived_before(cutoff).await?)
    }

    /// Graceful shutdown: every session gets a Logout and a chance to
    /// persist its counters while inbound bytes keep flowing; after
    /// `deadline` the remaining transports are force-closed.
    pub async fn stop(&self, deadline: std::time::Duration) {
        self.inner.running.store(false, Ordering::SeqCst);

        let targets: Vec<(ConnId, mpsc::Sender<SessionEvent>)> = {
            let conns = self.inner.conns.lock().unwrap();
            conns.iter().map(|(id, e)| (*id, e.tx.clone())).collect()
        };
        for (_, tx) in &targets {
            let _ = tx
                .send(SessionEvent::Disconnect {
                    text: String::from("Engine shutting down"),
                    reason: DisconnectReason::EngineShutdown,
                })
                .await;
        }

        let tasks: Vec<(ConnId, tokio::task::JoinHandle<()>)> = {
            let mut conns = self.inner.conns.lock().unwrap();
            conns
                .iter_mut()
                .filter_map(|(id, e)| e.task.take().map(|t| (*id, t)))
                .collect()
        };
        let deadline_at = tokio::time::Instant::now() + deadline;
        for (conn, task) in tasks {
            if tokio::time::timeout_at(deadline_at, task).await.is_err() {
                // graceful steps remain, but the deadline wins
                self.inner.transport.close(conn).await;
                let tx = {
                    let conns = self.inner.conns.lock().unwrap();
                    conns.get(&conn).map(|e| e.tx.clone())
                };
                if let Some(tx) = tx {
                    let _ = tx.try_send(SessionEvent::TransportClosed);
                }
            }
        }
        self.inner.conns.lock().unwrap().clear();
        info!("engine stopped");
    }

    fn remove_conn(&self, conn: ConnId) -> Option<ConnEntry> {
        let mut conns = self.inner.conns.lock().unwrap();
        conns.remove(&conn)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_builder_requires_comp_id() {
        assert!(matches!(
            EngineConfig::builder().build(),
            Err(EngineError::SettingRequired(_))
        ));
        let config = EngineConfig::builder().with_comp_id("EXCH").build().unwrap();
        assert_eq!(config.comp_id, "EXCH");
        assert_eq!(config.max_sessions, 10_000);
        assert_eq!(config.max_frame_bytes, 8_192);
        assert_eq!(config.default_heartbeat_secs, 30);
        assert_eq!(config.resend_buffer_window, 1_024);
        assert_eq!(config.reset_on_logon_policy, ResetOnLogonPolicy::Accept);
    }

    #[test]
    fn test_begin_strings() {
        assert_eq!(FixVersion::V44.begin_string(), "FIX.4.4");
        assert_eq!(FixVersion::V50.begin_string(), "FIXT.1.1");
    }

    #[test]
    fn test_config_deserializes() {
        let json = r#"{
            "comp_id": "EXCH",
            "fix_version": "5.0",
            "max_sessions": 64,
            "store_backend": { "sql": { "path": "/var/lib/fixgate/store.db" } },
            "reset_on_logon_policy": "never"
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.comp_id, "EXCH");
        assert_eq!(config.fix_version, FixVersion::V50);
        assert_eq!(config.max_sessions, 64);
        assert_eq!(config.store_backend.label(), "sql");
        assert_eq!(config.reset_on_logon_policy, ResetOnLogonPolicy::Never);
        // unset keys take their defaults
        assert_eq!(config.logon_timeout_secs, 30);
    }
}
