//! In-memory [`MessageStore`]: same ordering guarantees as the durable
//! backend, no persistence. Used by tests and ephemeral deployments.

use crate::fix::store::{
    AuditRecord, Direction, MessageStore, SessionRecord, StoreError, StoredMessage,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct Db {
    messages: HashMap<(String, Direction), BTreeMap<u32, StoredMessage>>,
    sessions: HashMap<String, SessionRecord>,
    audit: Vec<AuditRecord>,
    next_audit_id: i64,
}

#[derive(Default)]
pub struct VecStore {
    db: Mutex<Db>,
}

impl VecStore {
    pub fn new() -> VecStore {
        VecStore {
            db: Mutex::new(Db::default()),
        }
    }
}

#[async_trait]
impl MessageStore for VecStore {
    async fn append(&self, msg: StoredMessage) -> Result<u32, StoreError> {
        let mut db = self.db.lock().unwrap();
        let key = (msg.session_id.clone(), msg.direction);
        let seqs = db.messages.entry(key).or_default();
        if seqs.contains_key(&msg.seq) {
            return Err(StoreError::DuplicateSeq {
                session_id: msg.session_id,
                direction: msg.direction,
                seq: msg.seq,
            });
        }
        let seq = msg.seq;
        seqs.insert(seq, msg);
        Ok(seq)
    }

    async fn get(
        &self,
        session_id: &str,
        direction: Direction,
        seq: u32,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(db
            .messages
            .get(&(session_id.to_string(), direction))
            .and_then(|seqs| seqs.get(&seq))
            .cloned())
    }

    async fn range(
        &self,
        session_id: &str,
        direction: Direction,
        from: u32,
        to: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(db
            .messages
            .get(&(session_id.to_string(), direction))
            .map(|seqs| seqs.range(from..=to).map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn last_seq(&self, session_id: &str, direction: Direction) -> Result<u32, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(db
            .messages
            .get(&(session_id.to_string(), direction))
            .and_then(|seqs| seqs.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn append_audit(&self, mut record: AuditRecord) -> Result<(), StoreError> {
        let mut db = self.db.lock().unwrap();
        db.next_audit_id += 1;
        record.id = Some(db.next_audit_id);
        db.audit.push(record);
        Ok(())
    }

    async fn audit_range(
        &self,
        session_id: &str,
        from_ts: DateTime<Utc>,
        to_ts: DateTime<Utc>,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(db
            .audit
            .iter()
            .filter(|r| r.session_id == session_id && r.ts >= from_ts && r.ts <= to_ts)
            .cloned()
            .collect())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let db = self.db.lock().unwrap();
        let mut ids: Vec<String> = db.sessions.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(db.sessions.get(session_id).cloned())
    }

    async fn save_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut db = self.db.lock().unwrap();
        db.sessions.insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn reset_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut db = self.db.lock().unwrap();
        for direction in [Direction::Incoming, Direction::Outgoing] {
            db.messages.remove(&(session_id.to_string(), direction));
        }
        Ok(())
    }

    async fn archive_before(&self, session_id: &str, ts: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut db = self.db.lock().unwrap();
        let now = Utc::now();
        let mut stamped = 0;
        for direction in [Direction::Incoming, Direction::Outgoing] {
            if let Some(seqs) = db.messages.get_mut(&(session_id.to_string(), direction)) {
                for msg in seqs.values_mut() {
                    if msg.ts < ts && msg.archived_at.is_none() {
                        msg.archived_at = Some(now);
                        stamped += 1;
                    }
                }
            }
        }
        Ok(stamped)
    }

    async fn delete_archived_before(&self, ts: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut db = self.db.lock().unwrap();
        let mut removed = 0;
        for seqs in db.messages.values_mut() {
            let before = seqs.len();
            seqs.retain(|_, m| !matches!(m.archived_at, Some(at) if at < ts));
            removed += (before - seqs.len()) as u64;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Duration;

    fn message(session_id: &str, direction: Direction, seq: u32) -> StoredMessage {
        StoredMessage {
            session_id: session_id.to_string(),
            direction,
            seq,
            msg_type: 'D',
            sender_comp_id: "CLIENT".to_string(),
            target_comp_id: "SERVER".to_string(),
            ts: Utc::now(),
            raw: format!("fake-frame-{seq}").into_bytes(),
            archived_at: None,
        }
    }

    #[tokio::test]
    async fn test_append_get_range() {
        let store = VecStore::new();
        for seq in 1..=5 {
            store
                .append(message("CLIENT-SERVER", Direction::Outgoing, seq))
                .await
                .unwrap();
        }

        assert_eq!(
            store
                .last_seq("CLIENT-SERVER", Direction::Outgoing)
                .await
                .unwrap(),
            5
        );
        assert_eq!(
            store
                .last_seq("CLIENT-SERVER", Direction::Incoming)
                .await
                .unwrap(),
            0
        );

        let got = store
            .get("CLIENT-SERVER", Direction::Outgoing, 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.seq, 3);

        let range = store
            .range("CLIENT-SERVER", Direction::Outgoing, 2, 4)
            .await
            .unwrap();
        assert_eq!(range.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_duplicate_append_refused() {
        let store = VecStore::new();
        store
            .append(message("S", Direction::Incoming, 1))
            .await
            .unwrap();
        assert!(matches!(
            store.append(message("S", Direction::Incoming, 1)).await,
            Err(StoreError::DuplicateSeq { seq: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let store = VecStore::new();
        assert!(store.load_session("S").await.unwrap().is_none());
        let record = SessionRecord {
            session_id: "S".to_string(),
            sender_comp_id: "CLIENT".to_string(),
            target_comp_id: "SERVER".to_string(),
            status: "LoggedOn".to_string(),
            incoming_next: 4,
            outgoing_next: 9,
            last_heartbeat_at: None,
            start_time: Some(Utc::now()),
            heartbeat_interval: 30,
            total_in: 3,
            total_out: 8,
        };
        store.save_session(record.clone()).await.unwrap();
        assert_eq!(store.load_session("S").await.unwrap(), Some(record));
        assert_eq!(store.list_sessions().await.unwrap(), vec!["S".to_string()]);
    }

    #[tokio::test]
    async fn test_archive_and_retention() {
        let store = VecStore::new();
        for seq in 1..=3 {
            store
                .append(message("S", Direction::Incoming, seq))
                .await
                .unwrap();
        }
        let cutoff = Utc::now() + Duration::seconds(1);
        assert_eq!(store.archive_before("S", cutoff).await.unwrap(), 3);
        // second pass finds nothing unarchived
        assert_eq!(store.archive_before("S", cutoff).await.unwrap(), 0);

        let removed = store
            .delete_archived_before(Utc::now() + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.last_seq("S", Direction::Incoming).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_audit_range() {
        let store = VecStore::new();
        store
            .append_audit(AuditRecord::new("S", crate::fix::store::AuditEvent::Logon))
            .await
            .unwrap();
        store
            .append_audit(
                AuditRecord::new("S", crate::fix::store::AuditEvent::Logout).with_text("bye"),
            )
            .await
            .unwrap();

        let records = store
            .audit_range(
                "S",
                Utc::now() - Duration::seconds(60),
                Utc::now() + Duration::seconds(60),
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, Some(1));
        assert_eq!(records[1].text.as_deref(), Some("bye"));
    }
}
