//! The set of known counterparty sessions.
//!
//! Sessions are keyed by the comp-id pair seen from the server's side and
//! survive disconnects: a slot keeps its identity and info snapshot after
//! the connection goes away, and a later logon from the same pair claims it
//! again (sequence counters come back from the store). A single mutation
//! lock guards create/claim/release; reads clone snapshots out.

use crate::fix::session::{DisconnectReason, SessionStatus};
use crate::fix::SessionEvent;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Identifies one counterparty relationship, server view: `sender` is the
/// engine's own comp id (stamped on outbound), `target` is the peer's.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub sender_comp_id: String,
    pub target_comp_id: String,
}

impl SessionKey {
    pub fn new(sender_comp_id: impl Into<String>, target_comp_id: impl Into<String>) -> SessionKey {
        SessionKey {
            sender_comp_id: sender_comp_id.into(),
            target_comp_id: target_comp_id.into(),
        }
    }

    /// The peer's comp id.
    pub fn peer(&self) -> &str {
        &self.target_comp_id
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.sender_comp_id, self.target_comp_id)
    }
}

/// Point-in-time view of a session for the admin surface.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub key: SessionKey,
    pub status: SessionStatus,
    pub connected: bool,
    pub incoming_next: u32,
    pub outgoing_next: u32,
    pub heartbeat_secs: u32,
    pub fix_version: String,
    pub peer_addr: Option<String>,
    pub start_time: DateTime<Utc>,
    pub total_in: u64,
    pub total_out: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ClaimError {
    /// Another live connection already owns this comp-id pair.
    AlreadyActive,
    /// The engine-wide session cap is reached.
    CapacityExceeded,
}

struct Slot {
    tx: Option<mpsc::Sender<SessionEvent>>,
    conn_id: Option<u64>,
    info: SessionInfo,
}

pub(crate) struct Registry {
    max_sessions: usize,
    inner: Mutex<HashMap<SessionKey, Slot>>,
}

impl Registry {
    pub(crate) fn new(max_sessions: usize) -> Registry {
        Registry {
            max_sessions,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Binds a connection to the session for `key`, creating the slot on
    /// first logon. Returns whether the slot was newly created.
    pub(crate) fn claim(
        &self,
        key: &SessionKey,
        conn_id: u64,
        tx: mpsc::Sender<SessionEvent>,
        info: SessionInfo,
    ) -> Result<bool, ClaimError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.get_mut(key) {
            if slot.tx.is_some() {
                return Err(ClaimError::AlreadyActive);
            }
            slot.tx = Some(tx);
            slot.conn_id = Some(conn_id);
            slot.info = info;
            return Ok(false);
        }
        if inner.len() >= self.max_sessions {
            return Err(ClaimError::CapacityExceeded);
        }
        inner.insert(
            key.clone(),
            Slot {
                tx: Some(tx),
                conn_id: Some(conn_id),
                info,
            },
        );
        Ok(true)
    }

    /// Unbinds `conn_id` from its slot; the slot itself survives for the
    /// next logon. A stale release (connection superseded) is a no-op.
    pub(crate) fn release(&self, key: &SessionKey, conn_id: u64, reason: &DisconnectReason) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.get_mut(key) {
            if slot.conn_id == Some(conn_id) {
                slot.tx = None;
                slot.conn_id = None;
                slot.info.connected = false;
                slot.info.status = SessionStatus::Disconnected;
                slot.info.last_error = Some(reason.to_string());
            }
        }
    }

    pub(crate) fn update_info(&self, key: &SessionKey, apply: impl FnOnce(&mut SessionInfo)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.get_mut(key) {
            apply(&mut slot.info);
        }
    }

    pub(crate) fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().unwrap();
        let mut infos: Vec<SessionInfo> = inner.values().map(|s| s.info.clone()).collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    pub(crate) fn get(&self, session_id: &str) -> Option<SessionInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .values()
            .find(|s| s.info.session_id == session_id)
            .map(|s| s.info.clone())
    }

    pub(crate) fn sender_for(&self, session_id: &str) -> Option<mpsc::Sender<SessionEvent>> {
        let inner = self.inner.lock().unwrap();
        inner
            .values()
            .find(|s| s.info.session_id == session_id)
            .and_then(|s| s.tx.clone())
    }

    pub(crate) fn live_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.values().filter(|s| s.tx.is_some()).count()
    }

    pub(crate) fn known_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

const AUTH_FAILURE_LIMIT: usize = 3;
const AUTH_FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Tracks failed logons per peer address and imposes a cool-down once a
/// peer has failed too often inside the window.
#[derive(Default)]
pub(crate) struct AuthThrottle {
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl AuthThrottle {
    pub(crate) fn new() -> AuthThrottle {
        AuthThrottle::default()
    }

    pub(crate) fn is_blocked(&self, peer: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(peer) {
            Some(window) => {
                let now = Instant::now();
                while let Some(front) = window.front() {
                    if now.duration_since(*front) > AUTH_FAILURE_WINDOW {
                        window.pop_front();
                    } else {
                        break;
                    }
                }
                window.len() >= AUTH_FAILURE_LIMIT
            }
            None => false,
        }
    }

    pub(crate) fn record_failure(&self, peer: &str) {
        let mut failures = self.failures.lock().unwrap();
        failures
            .entry(peer.to_string())
            .or_default()
            .push_back(Instant::now());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(key: &SessionKey) -> SessionInfo {
        SessionInfo {
            session_id: key.to_string(),
            key: key.clone(),
            status: SessionStatus::LoggedOn,
            connected: true,
            incoming_next: 1,
            outgoing_next: 1,
            heartbeat_secs: 30,
            fix_version: "FIX.4.4".to_string(),
            peer_addr: None,
            start_time: Utc::now(),
            total_in: 0,
            total_out: 0,
            last_error: None,
        }
    }

    fn channel() -> mpsc::Sender<SessionEvent> {
        mpsc::channel(8).0
    }

    #[test]
    fn test_claim_create_rebind_and_conflict() {
        let registry = Registry::new(10);
        let key = SessionKey::new("SERVER", "CLIENT");

        assert_eq!(registry.claim(&key, 1, channel(), info(&key)), Ok(true));
        // the pair is live on conn 1, a second connection is refused
        assert_eq!(
            registry.claim(&key, 2, channel(), info(&key)),
            Err(ClaimError::AlreadyActive)
        );

        registry.release(&key, 1, &DisconnectReason::TransportClosed);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.known_count(), 1);

        // reconnect claims the surviving slot
        assert_eq!(registry.claim(&key, 3, channel(), info(&key)), Ok(false));
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn test_capacity_cap() {
        let registry = Registry::new(1);
        let first = SessionKey::new("SERVER", "A");
        let second = SessionKey::new("SERVER", "B");
        assert!(registry.claim(&first, 1, channel(), info(&first)).is_ok());
        assert_eq!(
            registry.claim(&second, 2, channel(), info(&second)),
            Err(ClaimError::CapacityExceeded)
        );
    }

    #[test]
    fn test_stale_release_ignored() {
        let registry = Registry::new(10);
        let key = SessionKey::new("SERVER", "CLIENT");
        registry.claim(&key, 1, channel(), info(&key)).unwrap();
        registry.release(&key, 1, &DisconnectReason::TransportClosed);
        registry.claim(&key, 2, channel(), info(&key)).unwrap();

        // a late release from the dead connection must not unbind conn 2
        registry.release(&key, 1, &DisconnectReason::TransportClosed);
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn test_info_snapshots() {
        let registry = Registry::new(10);
        let key = SessionKey::new("SERVER", "CLIENT");
        registry.claim(&key, 1, channel(), info(&key)).unwrap();
        registry.update_info(&key, |i| i.total_in = 42);

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].total_in, 42);
        assert_eq!(
            registry.get("SERVER-CLIENT").map(|i| i.total_in),
            Some(42)
        );
        assert!(registry.get("SERVER-NOBODY").is_none());
    }

    #[tokio::test]
    async fn test_auth_throttle() {
        let throttle = AuthThrottle::new();
        assert!(!throttle.is_blocked("10.0.0.9"));
        for _ in 0..3 {
            throttle.record_failure("10.0.0.9");
        }
        assert!(throttle.is_blocked("10.0.0.9"));
        assert!(!throttle.is_blocked("10.0.0.8"));
    }
}
