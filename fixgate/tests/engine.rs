//! End-to-end engine scenarios driven through the public API, with an
//! in-memory store and a channel-backed transport standing in for the
//! network.

use fixgate::fix::decode::parse_message;
use fixgate::fix::encode::MessageBuilder;
use fixgate::fix::fields::Tags;
use fixgate::fix::message::Message;
use fixgate::fix::store::{AuditEvent, Direction, MessageStore};
use fixgate::fix::vec_store::VecStore;
use fixgate::{
    ApplicationHandler, ApplicationRouter, AuthDecision, Authenticator, BusinessReject, ConnId,
    Engine, EngineConfig, EngineHandle, LogonCredentials, SessionStatus, TransportSink,
};

use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

struct ChannelSink {
    tx: mpsc::UnboundedSender<(ConnId, Vec<u8>)>,
}

#[async_trait::async_trait]
impl TransportSink for ChannelSink {
    async fn send(&self, conn: ConnId, bytes: Vec<u8>) -> std::io::Result<()> {
        self.tx
            .send((conn, bytes))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sink closed"))
    }
    async fn close(&self, _conn: ConnId) {}
}

struct Collector {
    delivered: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait::async_trait]
impl ApplicationHandler for Collector {
    async fn on_message(
        &self,
        session_id: &str,
        msg: Message,
    ) -> Result<Vec<MessageBuilder>, BusinessReject> {
        let cl_ord_id = msg.get_str(Tags::ClOrdID).unwrap_or("").to_string();
        self.delivered
            .lock()
            .unwrap()
            .push((session_id.to_string(), cl_ord_id));
        Ok(Vec::new())
    }
}

struct Harness {
    handle: EngineHandle,
    out: mpsc::UnboundedReceiver<(ConnId, Vec<u8>)>,
    store: Arc<VecStore>,
    delivered: Arc<Mutex<Vec<(String, String)>>>,
}

fn start_engine_with(store: Arc<VecStore>, config: EngineConfig) -> Harness {
    let (tx, out) = mpsc::unbounded_channel();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let router = ApplicationRouter::new().register(
        'D',
        Arc::new(Collector {
            delivered: delivered.clone(),
        }),
    );
    let handle = Engine::new(config, store.clone(), Arc::new(ChannelSink { tx }))
        .with_router(router)
        .start();
    Harness {
        handle,
        out,
        store,
        delivered,
    }
}

fn start_engine() -> Harness {
    let config = EngineConfig::builder().with_comp_id("EXCH").build().unwrap();
    start_engine_with(Arc::new(VecStore::new()), config)
}

impl Harness {
    /// Next outbound frame, bounded by a real-time timeout.
    async fn expect_frame(&mut self) -> (ConnId, Message) {
        let (conn, bytes) = timeout(Duration::from_secs(2), self.out.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("transport channel closed");
        let msg = parse_message(&bytes).expect("engine emitted an unparseable frame");
        (conn, msg)
    }

    /// Next outbound frame without a timeout, for paused-clock tests where
    /// the runtime auto-advances to the session timers.
    async fn next_frame(&mut self) -> (ConnId, Message) {
        let (conn, bytes) = self.out.recv().await.expect("transport channel closed");
        let msg = parse_message(&bytes).expect("engine emitted an unparseable frame");
        (conn, msg)
    }

    async fn wait_for_info(
        &self,
        session_id: &str,
        predicate: impl Fn(&fixgate::SessionInfo) -> bool,
    ) -> fixgate::SessionInfo {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(info) = self.handle.session_info(session_id) {
                if predicate(&info) {
                    return info;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session {session_id} never reached the expected state"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_audit(&self, session_id: &str, event: AuditEvent) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let records = self
                .store
                .audit_range(
                    session_id,
                    Utc::now() - chrono::Duration::seconds(300),
                    Utc::now() + chrono::Duration::seconds(300),
                )
                .await
                .unwrap();
            if records.iter().any(|r| r.event == event) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "audit never recorded {event:?} for {session_id}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn client_frame(comp_id: &str, msg_type: char, seq: u32, fields: &[(u32, &[u8])]) -> Vec<u8> {
    let mut builder = MessageBuilder::new("FIX.4.4", msg_type);
    for (tag, value) in fields {
        builder.push_mut(*tag, value);
    }
    let mut buf = Vec::new();
    builder
        .build(&mut buf, seq, comp_id, "EXCH", Utc::now())
        .unwrap();
    buf
}

fn logon_frame(comp_id: &str, seq: u32) -> Vec<u8> {
    client_frame(comp_id, 'A', seq, &[(98, b"0"), (108, b"30")])
}

fn order_frame(seq: u32, cl_ord_id: &[u8]) -> Vec<u8> {
    client_frame(
        "CLIENT",
        'D',
        seq,
        &[
            (11, cl_ord_id),
            (55, b"MSFT"),
            (54, b"1"),
            (38, b"100"),
            (40, b"1"),
        ],
    )
}

fn resent_order_frame(seq: u32, cl_ord_id: &[u8]) -> Vec<u8> {
    let orig = format!("{}", Utc::now().format("%Y%m%d-%H:%M:%S%.3f"));
    client_frame(
        "CLIENT",
        'D',
        seq,
        &[
            (11, cl_ord_id),
            (55, b"MSFT"),
            (54, b"1"),
            (38, b"100"),
            (40, b"1"),
            (43, b"Y"),
            (122, orig.as_bytes()),
        ],
    )
}

fn get_u32(msg: &Message, tag: u32) -> u32 {
    msg.get_parsed::<u32>(tag).unwrap_or(0)
}

// A valid logon establishes the session and echoes the negotiated
// heartbeat interval.
#[tokio::test]
async fn test_logon_handshake() {
    let mut h = start_engine();
    h.handle.deliver_connect(1, Some("10.0.0.9:55100".into())).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();

    let (conn, reply) = h.expect_frame().await;
    assert_eq!(conn, 1);
    assert_eq!(reply.msg_type(), Some('A'));
    assert_eq!(reply.sender_comp_id(), Some("EXCH"));
    assert_eq!(reply.target_comp_id(), Some("CLIENT"));
    assert_eq!(reply.msg_seq_num(), Some(1));
    assert_eq!(reply.get(Tags::EncryptMethod), Some(&b"0"[..]));
    assert_eq!(reply.get(Tags::HeartBtInt), Some(&b"30"[..]));

    let info = h
        .wait_for_info("EXCH-CLIENT", |i| i.status == SessionStatus::LoggedOn)
        .await;
    assert_eq!(info.incoming_next, 2);
    assert_eq!(info.outgoing_next, 2);
    assert_eq!(info.peer_addr.as_deref(), Some("10.0.0.9:55100"));

    assert_eq!(h.handle.health().live_sessions, 1);
}

// A quiet session heartbeats after one interval of outbound silence and
// test-requests after 1.2 intervals of inbound silence.
#[tokio::test(start_paused = true)]
async fn test_heartbeat_then_test_request() {
    let mut h = start_engine();
    h.handle.deliver_connect(1, None).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();
    let (_, reply) = h.next_frame().await;
    assert_eq!(reply.msg_type(), Some('A'));

    // t = 30s of outbound silence
    let (_, heartbeat) = h.next_frame().await;
    assert_eq!(heartbeat.msg_type(), Some('0'));
    assert_eq!(heartbeat.msg_seq_num(), Some(2));

    // t = 36s of inbound silence
    let (_, test_request) = h.next_frame().await;
    assert_eq!(test_request.msg_type(), Some('1'));
    assert_eq!(test_request.msg_seq_num(), Some(3));
    assert_eq!(test_request.get(Tags::TestReqID), Some(&b"TR-1"[..]));
}

// A peer that stays silent past 2.4 intervals is declared dead.
#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_disconnects() {
    let mut h = start_engine();
    h.handle.deliver_connect(1, None).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();
    let (_, reply) = h.next_frame().await;
    assert_eq!(reply.msg_type(), Some('A'));

    let mut saw_logout = false;
    for _ in 0..8 {
        let (_, msg) = h.next_frame().await;
        if msg.msg_type() == Some('5') {
            assert_eq!(msg.get_str(Tags::Text), Some("Heartbeat timeout"));
            saw_logout = true;
            break;
        }
    }
    assert!(saw_logout, "no Logout among the first frames");
    h.wait_for_audit("EXCH-CLIENT", AuditEvent::HeartbeatTimeout).await;
}

// A ResendRequest replays stored application messages as possible
// duplicates, collapsing the administrative prefix into a gap-fill.
#[tokio::test]
async fn test_resend_replays_with_gap_fill() {
    let mut h = start_engine();
    h.handle.deliver_connect(1, None).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();
    let (_, reply) = h.expect_frame().await;
    assert_eq!(reply.msg_type(), Some('A'));

    for exec_id in ["e-1", "e-2"] {
        let builder = MessageBuilder::new("FIX.4.4", '8')
            .push(Tags::OrderID, b"o-1")
            .push(Tags::ExecID, exec_id.as_bytes())
            .push(Tags::ExecType, b"0")
            .push(Tags::OrdStatus, b"0")
            .push(Tags::LeavesQty, b"100")
            .push(Tags::CumQty, b"0");
        let seq = h.handle.send("EXCH-CLIENT", builder).await.unwrap();
        let (_, sent) = h.expect_frame().await;
        assert_eq!(sent.msg_seq_num(), Some(seq));
    }

    // everything from seq 1: the Logon reply collapses into a gap-fill
    h.handle
        .deliver_bytes(1, &client_frame("CLIENT", '2', 2, &[(7, b"1"), (16, b"0")]))
        .await
        .unwrap();

    let (_, gap_fill) = h.expect_frame().await;
    assert_eq!(gap_fill.msg_type(), Some('4'));
    assert_eq!(gap_fill.msg_seq_num(), Some(1));
    assert_eq!(gap_fill.get(Tags::GapFillFlag), Some(&b"Y"[..]));
    assert_eq!(get_u32(&gap_fill, Tags::NewSeqNo.into()), 2);
    assert!(gap_fill.poss_dup());

    for expected_seq in [2u32, 3] {
        let (_, replayed) = h.expect_frame().await;
        assert_eq!(replayed.msg_type(), Some('8'));
        assert_eq!(replayed.msg_seq_num(), Some(expected_seq));
        assert!(replayed.poss_dup());
        assert!(replayed.get(Tags::OrigSendingTime).is_some());
    }

    // replay never consumes sequence numbers
    let info = h
        .wait_for_info("EXCH-CLIENT", |i| i.incoming_next == 3)
        .await;
    assert_eq!(info.outgoing_next, 4);
}

// A sequence gap triggers one ResendRequest; out-of-order frames are
// buffered and delivered in order once the gap closes.
#[tokio::test]
async fn test_gap_detection_and_ordered_delivery() {
    let mut h = start_engine();
    h.handle.deliver_connect(1, None).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();
    let (_, reply) = h.expect_frame().await;
    assert_eq!(reply.msg_type(), Some('A'));

    // seq 4 while 2 is expected
    h.handle.deliver_bytes(1, &order_frame(4, b"C")).await.unwrap();
    let (_, resend_request) = h.expect_frame().await;
    assert_eq!(resend_request.msg_type(), Some('2'));
    assert_eq!(resend_request.get(Tags::BeginSeqNo), Some(&b"2"[..]));
    assert_eq!(resend_request.get(Tags::EndSeqNo), Some(&b"0"[..]));

    // nothing delivered while the gap is open
    assert!(h.delivered.lock().unwrap().is_empty());

    h.handle.deliver_bytes(1, &resent_order_frame(2, b"A")).await.unwrap();
    h.handle.deliver_bytes(1, &resent_order_frame(3, b"B")).await.unwrap();
    h.handle.deliver_bytes(1, &resent_order_frame(4, b"C")).await.unwrap();

    let info = h
        .wait_for_info("EXCH-CLIENT", |i| i.incoming_next == 5)
        .await;
    assert_eq!(info.status, SessionStatus::LoggedOn);

    let delivered = h.delivered.lock().unwrap().clone();
    let cl_ord_ids: Vec<&str> = delivered.iter().map(|(_, c)| c.as_str()).collect();
    assert_eq!(cl_ord_ids, vec!["A", "B", "C"]);

    // the persisted inbound stream is contiguous from 1
    assert_eq!(
        h.store.last_seq("EXCH-CLIENT", Direction::Incoming).await.unwrap(),
        4
    );
    let range = h
        .store
        .range("EXCH-CLIENT", Direction::Incoming, 1, 4)
        .await
        .unwrap();
    assert_eq!(range.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
}

// A sequence number below expectations without PossDupFlag is fatal.
#[tokio::test]
async fn test_seq_too_low_disconnects() {
    let mut h = start_engine();
    h.handle.deliver_connect(1, None).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();
    let (_, reply) = h.expect_frame().await;
    assert_eq!(reply.msg_type(), Some('A'));

    let mut low = order_frame(1, b"LATE");
    // PossDupFlag=N explicitly
    low = {
        let msg = parse_message(&low).unwrap();
        let mut rebuilt = fixgate::fix::message::Message::new();
        for f in msg.fields() {
            rebuilt.push(f.tag, f.value.clone());
            if f.tag == 34 {
                rebuilt.push(43u32, &b"N"[..]);
            }
        }
        fixgate::fix::encode::encode_message(&rebuilt).unwrap()
    };
    h.handle.deliver_bytes(1, &low).await.unwrap();

    let (_, logout) = h.expect_frame().await;
    assert_eq!(logout.msg_type(), Some('5'));
    assert_eq!(
        logout.get_str(Tags::Text),
        Some("MsgSeqNum too low, expecting 2 but received 1")
    );

    h.wait_for_audit("EXCH-CLIENT", AuditEvent::FatalSeqError).await;

    // counters survive the disconnect; the final snapshot lands when the
    // session task finishes
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(record) = h.store.load_session("EXCH-CLIENT").await.unwrap() {
            if record.status == "Disconnected" {
                assert_eq!(record.incoming_next, 2);
                assert_eq!(record.outgoing_next, 3);
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "final counters were never persisted"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// A possible duplicate below expectations is dropped silently and never
// re-delivered to the application.
#[tokio::test]
async fn test_poss_dup_not_redelivered() {
    let mut h = start_engine();
    h.handle.deliver_connect(1, None).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();
    let (_, reply) = h.expect_frame().await;
    assert_eq!(reply.msg_type(), Some('A'));

    h.handle.deliver_bytes(1, &order_frame(2, b"ONCE")).await.unwrap();
    h.wait_for_info("EXCH-CLIENT", |i| i.incoming_next == 3).await;

    h.handle.deliver_bytes(1, &resent_order_frame(2, b"ONCE")).await.unwrap();
    // the session is still healthy afterwards and nothing was re-delivered
    h.handle.deliver_bytes(1, &order_frame(3, b"NEXT")).await.unwrap();
    h.wait_for_info("EXCH-CLIENT", |i| i.incoming_next == 4).await;

    let delivered = h.delivered.lock().unwrap().clone();
    let cl_ord_ids: Vec<&str> = delivered.iter().map(|(_, c)| c.as_str()).collect();
    assert_eq!(cl_ord_ids, vec!["ONCE", "NEXT"]);
}

// Application messages without a registered handler get a
// BusinessMessageReject, and session state is unaffected.
#[tokio::test]
async fn test_unhandled_msg_type_business_reject() {
    let mut h = start_engine();
    h.handle.deliver_connect(1, None).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();
    let (_, reply) = h.expect_frame().await;
    assert_eq!(reply.msg_type(), Some('A'));

    // a quote request; nothing is registered for it
    h.handle
        .deliver_bytes(1, &client_frame("CLIENT", 'R', 2, &[(58, b"ignored")]))
        .await
        .unwrap();

    let (_, reject) = h.expect_frame().await;
    assert_eq!(reject.msg_type(), Some('j'));
    assert_eq!(reject.get(Tags::RefMsgType), Some(&b"R"[..]));
    assert_eq!(reject.get(Tags::BusinessRejectReason), Some(&b"3"[..]));
    assert_eq!(get_u32(&reject, Tags::RefSeqNum.into()), 2);

    let info = h
        .wait_for_info("EXCH-CLIENT", |i| i.incoming_next == 3)
        .await;
    assert_eq!(info.status, SessionStatus::LoggedOn);
}

// Wrong comp ids after logon: session Reject then Logout.
#[tokio::test]
async fn test_comp_id_mismatch_rejected() {
    let mut h = start_engine();
    h.handle.deliver_connect(1, None).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();
    let (_, reply) = h.expect_frame().await;
    assert_eq!(reply.msg_type(), Some('A'));

    let mut bad = MessageBuilder::new("FIX.4.4", 'D');
    for (tag, value) in [
        (11u32, &b"x"[..]),
        (55, b"MSFT"),
        (54, b"1"),
        (38, b"1"),
        (40, b"1"),
    ] {
        bad.push_mut(tag, value);
    }
    let mut buf = Vec::new();
    bad.build(&mut buf, 2, "IMPOSTOR", "EXCH", Utc::now()).unwrap();
    h.handle.deliver_bytes(1, &buf).await.unwrap();

    let (_, reject) = h.expect_frame().await;
    assert_eq!(reject.msg_type(), Some('3'));
    assert_eq!(reject.get(Tags::SessionRejectReason), Some(&b"9"[..]));
    let (_, logout) = h.expect_frame().await;
    assert_eq!(logout.msg_type(), Some('5'));
}

// Logons beyond max_sessions are refused with a Reject.
#[tokio::test]
async fn test_session_limit_reached() {
    let config = EngineConfig::builder()
        .with_comp_id("EXCH")
        .with_max_sessions(1)
        .build()
        .unwrap();
    let mut h = start_engine_with(Arc::new(VecStore::new()), config);

    h.handle.deliver_connect(1, None).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();
    let (_, reply) = h.expect_frame().await;
    assert_eq!(reply.msg_type(), Some('A'));

    h.handle.deliver_connect(2, None).await.unwrap();
    h.handle.deliver_bytes(2, &logon_frame("OTHER", 1)).await.unwrap();
    let (conn, refusal) = h.expect_frame().await;
    assert_eq!(conn, 2);
    assert_eq!(refusal.msg_type(), Some('3'));
    assert_eq!(refusal.get_str(Tags::Text), Some("Session limit reached"));
}

// Denied credentials: Logout with the reason, audit trail records the
// failure.
#[tokio::test]
async fn test_auth_denied() {
    struct DenyAll;
    #[async_trait::async_trait]
    impl Authenticator for DenyAll {
        async fn authenticate(&self, _credentials: LogonCredentials<'_>) -> AuthDecision {
            AuthDecision::Deny(String::from("unknown counterparty"))
        }
    }

    let (tx, out) = mpsc::unbounded_channel();
    let store = Arc::new(VecStore::new());
    let config = EngineConfig::builder().with_comp_id("EXCH").build().unwrap();
    let handle = Engine::new(config, store.clone(), Arc::new(ChannelSink { tx }))
        .with_authenticator(Arc::new(DenyAll))
        .start();
    let mut h = Harness {
        handle,
        out,
        store,
        delivered: Arc::new(Mutex::new(Vec::new())),
    };

    h.handle.deliver_connect(1, Some("10.0.0.7:4000".into())).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();

    let (_, logout) = h.expect_frame().await;
    assert_eq!(logout.msg_type(), Some('5'));
    assert_eq!(
        logout.get_str(Tags::Text),
        Some("Logon rejected: unknown counterparty")
    );
    h.wait_for_audit("EXCH-CLIENT", AuditEvent::AuthFailure).await;
    assert!(h.handle.session_info("EXCH-CLIENT").is_none());
}

// Graceful shutdown logs every session out, persists counters, and a
// restarted engine resumes the sequence numbers.
#[tokio::test]
async fn test_graceful_shutdown_and_recovery() {
    let store = Arc::new(VecStore::new());
    let config = EngineConfig::builder().with_comp_id("EXCH").build().unwrap();
    let mut h = start_engine_with(store.clone(), config);

    for (conn, client) in [(1u64, "CLIENT1"), (2, "CLIENT2"), (3, "CLIENT3")] {
        h.handle.deliver_connect(conn, None).await.unwrap();
        h.handle.deliver_bytes(conn, &logon_frame(client, 1)).await.unwrap();
        let (reply_conn, reply) = h.expect_frame().await;
        assert_eq!(reply_conn, conn);
        assert_eq!(reply.msg_type(), Some('A'));
    }

    let stopper = h.handle.clone();
    let stop_task = tokio::spawn(async move {
        stopper.stop(std::time::Duration::from_secs(5)).await;
    });

    // each client receives the Logout and confirms it
    for _ in 0..3 {
        let (conn, logout) = h.expect_frame().await;
        assert_eq!(logout.msg_type(), Some('5'));
        let client = format!("CLIENT{conn}");
        h.handle
            .deliver_bytes(conn, &client_frame(&client, '5', 2, &[]))
            .await
            .unwrap();
    }
    timeout(Duration::from_secs(5), stop_task)
        .await
        .expect("shutdown exceeded its deadline")
        .unwrap();

    for client in ["CLIENT1", "CLIENT2", "CLIENT3"] {
        let record = store
            .load_session(&format!("EXCH-{client}"))
            .await
            .unwrap()
            .expect("counters were not persisted");
        assert_eq!(record.incoming_next, 3);
        assert_eq!(record.outgoing_next, 3);
    }

    // a new engine over the same store resumes where the old one stopped
    let config = EngineConfig::builder().with_comp_id("EXCH").build().unwrap();
    let mut h2 = start_engine_with(store, config);
    h2.handle.deliver_connect(10, None).await.unwrap();
    h2.handle.deliver_bytes(10, &logon_frame("CLIENT1", 3)).await.unwrap();
    let (_, reply) = h2.expect_frame().await;
    assert_eq!(reply.msg_type(), Some('A'));
    assert_eq!(reply.msg_seq_num(), Some(3));

    let info = h2
        .wait_for_info("EXCH-CLIENT1", |i| i.status == SessionStatus::LoggedOn)
        .await;
    assert_eq!(info.incoming_next, 4);
    assert_eq!(info.outgoing_next, 4);
}

// ResetSeqNumFlag=Y on logon restarts both counters under the default
// policy.
#[tokio::test]
async fn test_reset_on_logon() {
    let store = Arc::new(VecStore::new());
    let config = EngineConfig::builder().with_comp_id("EXCH").build().unwrap();
    let mut h = start_engine_with(store.clone(), config);

    h.handle.deliver_connect(1, None).await.unwrap();
    h.handle.deliver_bytes(1, &logon_frame("CLIENT", 1)).await.unwrap();
    let (_, reply) = h.expect_frame().await;
    assert_eq!(reply.msg_type(), Some('A'));
    for seq in 2..=4u32 {
        h.handle
            .deliver_bytes(1, &order_frame(seq, format!("o-{seq}").as_bytes()))
            .await
            .unwrap();
    }
    h.wait_for_info("EXCH-CLIENT", |i| i.incoming_next == 5).await;
    h.handle
        .deliver_bytes(1, &client_frame("CLIENT", '5', 5, &[]))
        .await
        .unwrap();
    let (_, logout) = h.expect_frame().await;
    assert_eq!(logout.msg_type(), Some('5'));
    h.wait_for_info("EXCH-CLIENT", |i| !i.connected).await;

    // reconnect with a reset: counters restart at 1 despite history
    h.handle.deliver_connect(2, None).await.unwrap();
    h.handle
        .deliver_bytes(
            2,
            &client_frame("CLIENT", 'A', 1, &[(98, b"0"), (108, b"30"), (141, b"Y")]),
        )
        .await
        .unwrap();
    let (conn, reply) = h.expect_frame().await;
    assert_eq!(conn, 2);
    assert_eq!(reply.msg_type(), Some('A'));
    assert_eq!(reply.msg_seq_num(), Some(1));
    assert_eq!(reply.get(Tags::ResetSeqNumFlag), Some(&b"Y"[..]));
}
