//! Per-session protocol state: status, sequence counters, the outbox of
//! queued responses, and the gap buffer used during resend recovery.
//!
//! The machine is synchronous and pure with respect to I/O: the session task
//! feeds it events and flushes its outbox; persistence and transport happen
//! outside. Each session is owned by exactly one task, so nothing here is
//! shared or locked.

use crate::fix::encode::{MessageBuilder, SerializedInt};
use crate::fix::fields::{MsgType, SessionRejectReason, Tags};
use crate::fix::mem::MsgBuf;
use crate::fix::stopwatch::TimerEvent;

use std::collections::{BTreeMap, VecDeque};
use tokio::time::{Duration, Instant};

const PROTOCOL_ERROR_LIMIT: usize = 10;
const PROTOCOL_ERROR_WINDOW: Duration = Duration::from_secs(60);

/// Externally visible session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    LogonSent,
    LogonReceived,
    LoggedOn,
    LogoutSent,
    Disconnecting,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected => "Disconnected",
            SessionStatus::Connecting => "Connecting",
            SessionStatus::LogonSent => "LogonSent",
            SessionStatus::LogonReceived => "LogonReceived",
            SessionStatus::LoggedOn => "LoggedOn",
            SessionStatus::LogoutSent => "LogoutSent",
            SessionStatus::Disconnecting => "Disconnecting",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended; audited and surfaced through `session_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    PeerLogout,
    AuthDenied(String),
    SessionLimit,
    SeqTooLow { expected: u32, received: u32 },
    HeartbeatTimeout,
    LogonTimeout,
    LogoutTimeout,
    PersistenceFailure,
    RepeatedProtocolErrors,
    ProtocolViolation(String),
    AdminRequest(String),
    EngineShutdown,
    TransportClosed,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::PeerLogout => write!(f, "peer logout"),
            DisconnectReason::AuthDenied(text) => write!(f, "authentication denied: {text}"),
            DisconnectReason::SessionLimit => write!(f, "session limit reached"),
            DisconnectReason::SeqTooLow { expected, received } => {
                write!(f, "MsgSeqNum too low, expecting {expected} but received {received}")
            }
            DisconnectReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            DisconnectReason::LogonTimeout => write!(f, "logon timeout"),
            DisconnectReason::LogoutTimeout => write!(f, "logout unanswered"),
            DisconnectReason::PersistenceFailure => write!(f, "persistence failure"),
            DisconnectReason::RepeatedProtocolErrors => write!(f, "repeated protocol errors"),
            DisconnectReason::ProtocolViolation(text) => write!(f, "protocol violation: {text}"),
            DisconnectReason::AdminRequest(text) => write!(f, "administrative disconnect: {text}"),
            DisconnectReason::EngineShutdown => write!(f, "engine shutdown"),
            DisconnectReason::TransportClosed => write!(f, "transport closed"),
        }
    }
}

/// Monotone per-direction sequence counters, owned by the session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sequences {
    incoming_next: u32,
    outgoing_next: u32,
}

impl Sequences {
    pub(crate) fn new(incoming_next: u32, outgoing_next: u32) -> Sequences {
        Sequences {
            incoming_next,
            outgoing_next,
        }
    }
    pub(crate) fn next_outgoing(&mut self) -> u32 {
        let seq = self.outgoing_next;
        self.outgoing_next += 1;
        seq
    }
    pub(crate) fn incr_incoming(&mut self) {
        self.incoming_next += 1;
    }
    pub(crate) fn peek_incoming(&self) -> u32 {
        self.incoming_next
    }
    pub(crate) fn peek_outgoing(&self) -> u32 {
        self.outgoing_next
    }
    pub(crate) fn reset_incoming(&mut self, new: u32) -> Result<(), &'static str> {
        if new < self.incoming_next {
            return Err("NewSeqNo is lower than the expected sequence");
        }
        self.incoming_next = new;
        Ok(())
    }
    pub(crate) fn reset_both(&mut self) {
        *self = Sequences::new(1, 1);
    }
}

/// How an inbound sequence number relates to the expected one.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SeqDisposition {
    /// Matches expectations: persist and dispatch.
    InOrder,
    /// Ahead of expectations: a ResendRequest is (or already was) queued,
    /// the frame should be buffered.
    Gap,
    /// Behind expectations with PossDupFlag=Y: already processed, drop.
    DuplicateIgnore,
    /// Behind expectations without PossDupFlag: fatal, Logout queued.
    FatalLow { expected: u32, received: u32 },
}

/// Everything needed to answer a protocol failure with a session Reject.
#[derive(Debug, Clone)]
pub(crate) struct RejectPlan {
    pub ref_seq: u32,
    pub ref_tag: Option<u32>,
    pub ref_msg_type: Option<char>,
    pub reason: Option<SessionRejectReason>,
    pub text: String,
}

struct GapState {
    buffered: BTreeMap<u32, MsgBuf>,
}

pub(crate) struct SessionMachine {
    status: SessionStatus,
    pub(crate) sequences: Sequences,
    outbox: VecDeque<MessageBuilder>,
    begin_string: String,
    gap: Option<GapState>,
    resend_window: usize,
    heartbeat_secs: u32,
    pending_test_req_id: Option<Vec<u8>>,
    test_req_counter: u64,
    protocol_errors: VecDeque<Instant>,
    pending_disconnect: Option<DisconnectReason>,
    termination: Option<DisconnectReason>,
}

impl SessionMachine {
    pub(crate) fn new(
        begin_string: &str,
        sequences: Sequences,
        resend_window: usize,
        default_heartbeat_secs: u32,
    ) -> SessionMachine {
        SessionMachine {
            status: SessionStatus::Connecting,
            sequences,
            outbox: VecDeque::new(),
            begin_string: begin_string.to_string(),
            gap: None,
            resend_window,
            heartbeat_secs: default_heartbeat_secs,
            pending_test_req_id: None,
            test_req_counter: 0,
            protocol_errors: VecDeque::new(),
            pending_disconnect: None,
            termination: None,
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.status
    }

    pub(crate) fn heartbeat_secs(&self) -> u32 {
        self.heartbeat_secs
    }

    pub(crate) fn should_disconnect(&self) -> bool {
        matches!(self.status, SessionStatus::Disconnecting)
    }

    pub(crate) fn termination(&self) -> Option<&DisconnectReason> {
        self.termination.as_ref()
    }

    pub(crate) fn outbox_push(&mut self, builder: MessageBuilder) {
        self.outbox.push_back(builder);
    }

    pub(crate) fn outbox_pop(&mut self) -> Option<MessageBuilder> {
        self.outbox.pop_front()
    }

    pub(crate) fn outbox_is_empty(&self) -> bool {
        self.outbox.is_empty()
    }

    fn disconnect(&mut self, reason: DisconnectReason) {
        if self.termination.is_none() {
            self.termination = Some(reason);
        }
        self.status = SessionStatus::Disconnecting;
    }

    // ---- logon -----------------------------------------------------------

    /// Valid, authenticated Logon. The reply echoes EncryptMethod=0 and the
    /// client's HeartBtInt; `reset_seq` reflects an honored
    /// ResetSeqNumFlag=Y, which zeroes both counters before the logon's own
    /// seq is examined by the caller.
    pub(crate) fn on_logon(&mut self, heartbeat_secs: u32, reset_seq: bool) {
        if reset_seq {
            self.sequences.reset_both();
        }
        if heartbeat_secs > 0 {
            self.heartbeat_secs = heartbeat_secs;
        }
        let mut builder = MessageBuilder::new(&self.begin_string, MsgType::LOGON)
            .push(Tags::EncryptMethod, b"0")
            .push(
                Tags::HeartBtInt,
                SerializedInt::from(self.heartbeat_secs).as_bytes(),
            );
        if reset_seq {
            builder = builder.push(Tags::ResetSeqNumFlag, b"Y");
        }
        self.outbox_push(builder);
        self.status = SessionStatus::LoggedOn;
    }

    /// Sends a Logout carrying `text` and tears the session down without
    /// waiting for a reply. Used for refused logons, comp-id violations and
    /// other non-recoverable failures.
    pub(crate) fn abort_with_logout(&mut self, text: &str, reason: DisconnectReason) {
        self.outbox_push(build_logout_message_with_text(
            &self.begin_string,
            text.as_bytes(),
        ));
        self.disconnect(reason);
    }

    /// Tears the session down without any farewell message.
    pub(crate) fn force_disconnect(&mut self, reason: DisconnectReason) {
        self.disconnect(reason);
    }

    // ---- sequence handling ----------------------------------------------

    pub(crate) fn classify_inbound(&mut self, seq: u32, poss_dup: bool) -> SeqDisposition {
        let expected = self.sequences.peek_incoming();
        if seq == expected {
            return SeqDisposition::InOrder;
        }
        if seq > expected {
            if self.gap.is_none() {
                self.gap = Some(GapState {
                    buffered: BTreeMap::new(),
                });
                let builder = MessageBuilder::new(&self.begin_string, MsgType::RESEND_REQUEST)
                    .push(Tags::BeginSeqNo, SerializedInt::from(expected).as_bytes())
                    .push(Tags::EndSeqNo, SerializedInt::from(0u32).as_bytes());
                self.outbox_push(builder);
            }
            return SeqDisposition::Gap;
        }
        if poss_dup {
            return SeqDisposition::DuplicateIgnore;
        }
        self.outbox_push(build_logout_message_with_text(
            &self.begin_string,
            format!("MsgSeqNum too low, expecting {expected} but received {seq}").as_bytes(),
        ));
        self.disconnect(DisconnectReason::SeqTooLow {
            expected,
            received: seq,
        });
        SeqDisposition::FatalLow {
            expected,
            received: seq,
        }
    }

    /// The frame at the expected seq was persisted; advance expectations.
    pub(crate) fn accept_inbound(&mut self) {
        self.sequences.incr_incoming();
    }

    /// Buffers an out-of-order frame while a gap is being refilled. `false`
    /// means the window is full and the frame was dropped.
    pub(crate) fn buffer_out_of_order(&mut self, seq: u32, frame: MsgBuf) -> bool {
        let window = self.resend_window;
        match self.gap.as_mut() {
            Some(gap) => {
                if gap.buffered.len() >= window && !gap.buffered.contains_key(&seq) {
                    return false;
                }
                gap.buffered.insert(seq, frame);
                true
            }
            None => false,
        }
    }

    /// Next buffered frame that has become deliverable, if any. Stale
    /// entries below the expectation are discarded; once the buffer drains
    /// the gap is considered closed.
    pub(crate) fn take_buffered_ready(&mut self) -> Option<MsgBuf> {
        let expected = self.sequences.peek_incoming();
        let gap = self.gap.as_mut()?;
        while let Some((&seq, _)) = gap.buffered.first_key_value() {
            if seq < expected {
                gap.buffered.pop_first();
            } else {
                break;
            }
        }
        let frame = match gap.buffered.first_key_value() {
            Some((&seq, _)) if seq == expected => gap.buffered.pop_first().map(|(_, f)| f),
            _ => None,
        };
        if gap.buffered.is_empty() {
            self.gap = None;
        }
        frame
    }

    /// SequenceReset: gap-fill mode only moves expectations forward, reset
    /// mode is accepted unconditionally.
    pub(crate) fn on_sequence_reset(&mut self, msg_seq_num: u32, gap_fill: bool, new_seq_no: u32) {
        if gap_fill {
            if let Err(text) = self.sequences.reset_incoming(new_seq_no) {
                self.push_reject(&RejectPlan {
                    ref_seq: msg_seq_num,
                    ref_tag: Some(Tags::NewSeqNo.into()),
                    ref_msg_type: Some(MsgType::SEQUENCE_RESET.into()),
                    reason: Some(SessionRejectReason::VALUE_IS_INCORRECT),
                    text: text.to_string(),
                });
            }
        } else {
            self.sequences = Sequences::new(new_seq_no, self.sequences.peek_outgoing());
        }
    }

    // ---- session-layer traffic ------------------------------------------

    pub(crate) fn on_heartbeat(&mut self, test_req_id: Option<&[u8]>) {
        if let (Some(pending), Some(echoed)) = (self.pending_test_req_id.as_deref(), test_req_id) {
            if pending == echoed {
                self.pending_test_req_id = None;
            }
        }
    }

    pub(crate) fn has_pending_test_request(&self) -> bool {
        self.pending_test_req_id.is_some()
    }

    pub(crate) fn on_test_request(&mut self, test_req_id: &[u8]) {
        let builder = MessageBuilder::new(&self.begin_string, MsgType::HEARTBEAT)
            .push(Tags::TestReqID, test_req_id);
        self.outbox_push(builder);
    }

    pub(crate) fn on_logout(&mut self) {
        let reason = self
            .pending_disconnect
            .take()
            .unwrap_or(DisconnectReason::PeerLogout);
        if self.status != SessionStatus::LogoutSent {
            // peer initiated: echo the Logout before closing
            self.outbox_push(build_logout_message(&self.begin_string));
        }
        self.disconnect(reason);
    }

    /// Engine-initiated logout (admin disconnect or shutdown).
    pub(crate) fn initiate_logout(&mut self, text: &str, reason: DisconnectReason) {
        if self.status == SessionStatus::LogoutSent || self.should_disconnect() {
            return;
        }
        let builder = if text.is_empty() {
            build_logout_message(&self.begin_string)
        } else {
            build_logout_message_with_text(&self.begin_string, text.as_bytes())
        };
        self.outbox_push(builder);
        self.pending_disconnect = Some(reason);
        self.status = SessionStatus::LogoutSent;
    }

    pub(crate) fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::SendHeartbeat => {
                if self.status == SessionStatus::LoggedOn {
                    self.outbox_push(MessageBuilder::new(&self.begin_string, MsgType::HEARTBEAT));
                }
            }
            TimerEvent::SendTestRequest => {
                if self.status == SessionStatus::LoggedOn && self.pending_test_req_id.is_none() {
                    self.test_req_counter += 1;
                    let id = format!("TR-{}", self.test_req_counter).into_bytes();
                    let builder = MessageBuilder::new(&self.begin_string, MsgType::TEST_REQUEST)
                        .push(Tags::TestReqID, &id);
                    self.outbox_push(builder);
                    self.pending_test_req_id = Some(id);
                }
            }
            TimerEvent::PeerTimedOut => {
                if self.status == SessionStatus::LoggedOn {
                    self.outbox_push(build_logout_message_with_text(
                        &self.begin_string,
                        b"Heartbeat timeout",
                    ));
                }
                self.disconnect(DisconnectReason::HeartbeatTimeout);
            }
            TimerEvent::LogonExpired => {
                if self.status == SessionStatus::Connecting {
                    self.disconnect(DisconnectReason::LogonTimeout);
                }
            }
            TimerEvent::LogoutExpired => {
                if self.status == SessionStatus::LogoutSent {
                    self.disconnect(DisconnectReason::LogoutTimeout);
                }
            }
        }
    }

    pub(crate) fn on_transport_closed(&mut self) {
        self.disconnect(DisconnectReason::TransportClosed);
    }

    pub(crate) fn on_store_failure(&mut self) {
        self.outbox_push(build_logout_message_with_text(
            &self.begin_string,
            b"Persistence failure",
        ));
        self.disconnect(DisconnectReason::PersistenceFailure);
    }

    // ---- rejects ---------------------------------------------------------

    /// Answers a protocol failure with a session Reject; repeated failures
    /// inside the window escalate to disconnect.
    pub(crate) fn on_protocol_error(&mut self, plan: &RejectPlan) {
        self.push_reject(plan);

        let now = Instant::now();
        self.protocol_errors.push_back(now);
        while let Some(front) = self.protocol_errors.front() {
            if now.duration_since(*front) > PROTOCOL_ERROR_WINDOW {
                self.protocol_errors.pop_front();
            } else {
                break;
            }
        }
        if self.protocol_errors.len() >= PROTOCOL_ERROR_LIMIT {
            self.outbox_push(build_logout_message_with_text(
                &self.begin_string,
                b"Too many protocol errors",
            ));
            self.disconnect(DisconnectReason::RepeatedProtocolErrors);
        }
    }

    fn push_reject(&mut self, plan: &RejectPlan) {
        let mut builder = MessageBuilder::new(&self.begin_string, MsgType::REJECT)
            .push(Tags::RefSeqNum, SerializedInt::from(plan.ref_seq).as_bytes())
            .push(Tags::Text, plan.text.as_bytes());
        if let Some(tag) = plan.ref_tag {
            builder = builder.push(Tags::RefTagID, SerializedInt::from(tag).as_bytes());
        }
        if let Some(msg_type) = plan.ref_msg_type {
            builder = builder.push(Tags::RefMsgType, msg_type.to_string().as_bytes());
        }
        if let Some(reason) = &plan.reason {
            builder = builder.push(
                Tags::SessionRejectReason,
                SerializedInt::from(u32::from(reason)).as_bytes(),
            );
        }
        self.outbox_push(builder);
    }

    pub(crate) fn push_business_reject(
        &mut self,
        ref_seq: u32,
        ref_msg_type: char,
        reason: u32,
        text: &str,
    ) {
        let builder = MessageBuilder::new(&self.begin_string, MsgType::BUSINESS_MESSAGE_REJECT)
            .push(Tags::RefSeqNum, SerializedInt::from(ref_seq).as_bytes())
            .push(Tags::RefMsgType, ref_msg_type.to_string().as_bytes())
            .push(
                Tags::BusinessRejectReason,
                SerializedInt::from(reason).as_bytes(),
            )
            .push(Tags::Text, text.as_bytes());
        self.outbox_push(builder);
    }
}

pub(crate) fn build_logout_message_with_text(begin_string: &str, text: &[u8]) -> MessageBuilder {
    MessageBuilder::new(begin_string, MsgType::LOGOUT).push(Tags::Text, text)
}

pub(crate) fn build_logout_message(begin_string: &str) -> MessageBuilder {
    MessageBuilder::new(begin_string, MsgType::LOGOUT)
}
