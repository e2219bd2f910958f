//! Protocol core: framing, codec, validation, per-session state and the
//! session task driver.
//!
//! Every accepted connection gets one task running [`run_session`]: it owns
//! the session's [`SessionMachine`], consumes a bounded queue of events
//! (frames from the framer, send requests from the application, transport
//! and admin signals) in arrival order, and flushes the machine's outbox
//! after every event. Cross-session parallelism is free; within a session,
//! strict ordering falls out of the queue.

use crate::fix::audit::Auditor;
use crate::fix::decode::parse_message;
use crate::fix::encode::MessageBuilder;
use crate::fix::fields::{BusinessRejectReason, GapFillFlag, SessionRejectReason, Tags};
use crate::fix::mem::MsgBuf;
use crate::fix::message::Message;
use crate::fix::registry::{AuthThrottle, ClaimError, Registry};
use crate::fix::resend::{gap_fill_frame, plan_replay, transform_for_resend, ReplaySegment};
use crate::fix::session::{RejectPlan, SeqDisposition, SessionMachine, Sequences};
use crate::fix::stopwatch::{FixTimeouts, TimerEvent};
use crate::fix::store::{
    AuditEvent, AuditRecord, Direction, MessageStore, SessionRecord, StoredMessage,
};
use crate::fix::validate::{
    validate_comp_ids, validate_message, validate_poss_dup, validate_sending_time_accuracy,
    ValidationError,
};
use crate::{
    ApplicationRouter, AuthDecision, Authenticator, EngineConfig, EngineError, LogonCredentials,
    ResetOnLogonPolicy, TransportSink,
};

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

pub mod decode;
pub mod encode;
pub mod fields;
pub mod mem;
pub mod message;
pub mod store;
pub mod validate;
pub mod vec_store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub(crate) mod audit;
pub(crate) mod registry;
pub(crate) mod session;
pub(crate) mod stream;

mod checksum;
mod resend;
mod stopwatch;

pub use registry::{SessionInfo, SessionKey};
pub use session::{DisconnectReason, SessionStatus};

/// How many times an outbound store append is retried in-process before the
/// session is declared broken.
const OUTBOUND_STORE_ATTEMPTS: u32 = 3;

/// Window for the ±SendingTime accuracy check.
const SENDING_TIME_WINDOW_SECS: i64 = 10;

/// Events consumed by a session task, in arrival order.
pub(crate) enum SessionEvent {
    /// A complete frame from the framer.
    Frame(MsgBuf),
    /// The framer discarded bytes; carries the reason.
    Garbled(String),
    /// Application-originated outbound message. Resolved once the message
    /// is stamped, formatted and store-appended.
    Send {
        builder: MessageBuilder,
        done: oneshot::Sender<Result<u32, EngineError>>,
    },
    /// Graceful logout (admin disconnect or engine shutdown).
    Disconnect {
        text: String,
        reason: DisconnectReason,
    },
    /// The transport lost the connection.
    TransportClosed,
}

/// Immutable dependencies handed to each session task.
pub(crate) struct SessionContext {
    pub conn_id: u64,
    pub peer_addr: Option<String>,
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn MessageStore>,
    pub auditor: Auditor,
    pub transport: Arc<dyn TransportSink>,
    pub authenticator: Arc<dyn Authenticator>,
    pub router: Arc<ApplicationRouter>,
    pub registry: Arc<Registry>,
    pub throttle: Arc<AuthThrottle>,
    pub self_tx: mpsc::Sender<SessionEvent>,
}

#[derive(Clone)]
struct Bound {
    key: SessionKey,
    session_id: String,
}

struct TaskState {
    bound: Option<Bound>,
    /// Best-effort peer comp id for farewell messages before logon binds.
    peer_hint: Option<String>,
    transport_up: bool,
    total_in: u64,
    total_out: u64,
    start_time: DateTime<Utc>,
}

impl TaskState {
    fn audit_id(&self, ctx: &SessionContext) -> String {
        match &self.bound {
            Some(bound) => bound.session_id.clone(),
            None => format!("conn-{}", ctx.conn_id),
        }
    }
}

/// Drives one connection from accept to close.
pub(crate) async fn run_session(ctx: SessionContext, mut queue: mpsc::Receiver<SessionEvent>) {
    let begin_string = ctx.config.fix_version.begin_string();
    let mut machine = SessionMachine::new(
        begin_string,
        Sequences::new(1, 1),
        ctx.config.resend_buffer_window as usize,
        ctx.config.default_heartbeat_secs,
    );
    let mut timeouts = FixTimeouts::new(
        Duration::from_secs(ctx.config.default_heartbeat_secs as u64),
        Duration::from_secs(ctx.config.logon_timeout_secs as u64),
    );
    let mut state = TaskState {
        bound: None,
        peer_hint: None,
        transport_up: true,
        total_in: 0,
        total_out: 0,
        start_time: Utc::now(),
    };

    debug!(conn = ctx.conn_id, peer = ?ctx.peer_addr, "connection task started");

    loop {
        flush_outbox(&ctx, &mut machine, &mut timeouts, &mut state).await;
        publish_info(&ctx, &machine, &state);
        if machine.should_disconnect() {
            break;
        }

        let (sleep_fut, timer_event) = timeouts.next_expiring_timeout().timeout();

        tokio::select! {
            biased;

            maybe_event = queue.recv() => match maybe_event {
                None => machine.on_transport_closed(),
                Some(SessionEvent::Frame(frame)) => {
                    handle_frame(&ctx, &mut machine, &mut timeouts, &mut state, frame).await;
                }
                Some(SessionEvent::Garbled(reason)) => {
                    warn!(conn = ctx.conn_id, %reason, "dropped garbled bytes");
                    ctx.auditor.record(
                        AuditRecord::new(state.audit_id(&ctx), AuditEvent::ProtocolError)
                            .with_text(reason),
                    );
                }
                Some(SessionEvent::Send { builder, done }) => {
                    let result = if machine.status() == SessionStatus::LoggedOn {
                        let sent = send_one(&ctx, &mut machine, &mut state, builder).await;
                        if sent.is_ok() {
                            timeouts.reset_heartbeat();
                        }
                        sent
                    } else {
                        Err(EngineError::NotLoggedOn)
                    };
                    let _ = done.send(result);
                }
                Some(SessionEvent::Disconnect { text, reason }) => {
                    machine.initiate_logout(&text, reason);
                    timeouts.start_logout_timeout();
                }
                Some(SessionEvent::TransportClosed) => machine.on_transport_closed(),
            },

            _ = sleep_fut => {
                match timer_event {
                    TimerEvent::SendHeartbeat => timeouts.reset_heartbeat(),
                    TimerEvent::SendTestRequest => {
                        timeouts.reset_test_request();
                        if machine.status() == SessionStatus::LoggedOn
                            && !machine.has_pending_test_request()
                        {
                            ctx.auditor.record(AuditRecord::new(
                                state.audit_id(&ctx),
                                AuditEvent::TestReqSent,
                            ));
                        }
                    }
                    TimerEvent::PeerTimedOut => {
                        ctx.auditor.record(AuditRecord::new(
                            state.audit_id(&ctx),
                            AuditEvent::HeartbeatTimeout,
                        ));
                    }
                    TimerEvent::LogonExpired => {
                        ctx.auditor.record(
                            AuditRecord::new(state.audit_id(&ctx), AuditEvent::AuthFailure)
                                .with_text("no Logon within the timeout"),
                        );
                    }
                    TimerEvent::LogoutExpired => {
                        ctx.auditor.record(AuditRecord::new(
                            state.audit_id(&ctx),
                            AuditEvent::Timeout,
                        ));
                    }
                }
                machine.on_timer(timer_event);
            }
        }
    }

    finalize(&ctx, &mut machine, &mut state, &mut queue).await;
}

async fn finalize(
    ctx: &SessionContext,
    machine: &mut SessionMachine,
    state: &mut TaskState,
    queue: &mut mpsc::Receiver<SessionEvent>,
) {
    let reason = machine
        .termination()
        .cloned()
        .unwrap_or(DisconnectReason::TransportClosed);

    // drain whatever the transport had already queued, for the audit trail
    queue.close();
    let mut dropped = 0usize;
    while let Ok(event) = queue.try_recv() {
        match event {
            SessionEvent::Frame(_) | SessionEvent::Garbled(_) => dropped += 1,
            SessionEvent::Send { done, .. } => {
                let _ = done.send(Err(EngineError::SessionClosed));
            }
            _ => {}
        }
    }
    if dropped > 0 {
        ctx.auditor.record(
            AuditRecord::new(state.audit_id(ctx), AuditEvent::ProtocolError)
                .with_text(format!("{dropped} inbound frames dropped at disconnect")),
        );
    }

    if let Some(bound) = &state.bound {
        let record = SessionRecord {
            session_id: bound.session_id.clone(),
            sender_comp_id: bound.key.sender_comp_id.clone(),
            target_comp_id: bound.key.target_comp_id.clone(),
            status: SessionStatus::Disconnected.to_string(),
            incoming_next: machine.sequences.peek_incoming(),
            outgoing_next: machine.sequences.peek_outgoing(),
            last_heartbeat_at: Some(Utc::now()),
            start_time: Some(state.start_time),
            heartbeat_interval: machine.heartbeat_secs(),
            total_in: state.total_in,
            total_out: state.total_out,
        };
        if let Err(e) = ctx.store.save_session(record).await {
            error!(session = %bound.session_id, error = %e, "failed to persist final counters");
        }
        ctx.registry.release(&bound.key, ctx.conn_id, &reason);
        ctx.auditor.record(
            AuditRecord::new(bound.session_id.clone(), AuditEvent::Logout)
                .with_text(reason.to_string()),
        );
        info!(session = %bound.session_id, %reason, "session closed");
    } else {
        info!(conn = ctx.conn_id, %reason, "connection closed before logon");
    }

    ctx.transport.close(ctx.conn_id).await;
}

fn publish_info(ctx: &SessionContext, machine: &SessionMachine, state: &TaskState) {
    if let Some(bound) = &state.bound {
        let status = machine.status();
        let (incoming, outgoing) = (
            machine.sequences.peek_incoming(),
            machine.sequences.peek_outgoing(),
        );
        let heartbeat = machine.heartbeat_secs();
        let (total_in, total_out) = (state.total_in, state.total_out);
        let last_error = machine.termination().map(|r| r.to_string());
        ctx.registry.update_info(&bound.key, |info| {
            info.status = status;
            info.incoming_next = incoming;
            info.outgoing_next = outgoing;
            info.heartbeat_secs = heartbeat;
            info.total_in = total_in;
            info.total_out = total_out;
            if last_error.is_some() {
                info.last_error = last_error;
            }
        });
    }
}

// ---- outbound ------------------------------------------------------------

async fn flush_outbox(
    ctx: &SessionContext,
    machine: &mut SessionMachine,
    timeouts: &mut FixTimeouts,
    state: &mut TaskState,
) {
    if !machine.outbox_is_empty() {
        timeouts.reset_heartbeat();
    }
    while let Some(builder) = machine.outbox_pop() {
        let _ = send_one(ctx, machine, state, builder).await;
    }
}

/// Stamps, formats, persists and transmits one outbound message. Returns
/// the assigned seq. Store failures are retried a bounded number of times,
/// then poison the session; the farewell Logout of an already-poisoned
/// session skips persistence so it can still reach the peer.
async fn send_one(
    ctx: &SessionContext,
    machine: &mut SessionMachine,
    state: &mut TaskState,
    builder: MessageBuilder,
) -> Result<u32, EngineError> {
    let (sender_comp, target_comp) = match &state.bound {
        Some(bound) => (
            bound.key.sender_comp_id.clone(),
            bound.key.target_comp_id.clone(),
        ),
        None => (
            ctx.config.comp_id.clone(),
            state.peer_hint.clone().unwrap_or_else(|| String::from("UNKNOWN")),
        ),
    };

    let msg_type = builder.msg_type();
    let seq = machine.sequences.next_outgoing();
    let now = Utc::now();
    let mut buf = Vec::with_capacity(1024);
    builder
        .build(&mut buf, seq, &sender_comp, &target_comp, now)
        .map_err(|e| EngineError::SendFailed(e.to_string()))?;

    let persist = state.bound.is_some()
        && machine.termination() != Some(&DisconnectReason::PersistenceFailure);
    if persist {
        let bound = state.bound.as_ref().unwrap();
        let stored = StoredMessage {
            session_id: bound.session_id.clone(),
            direction: Direction::Outgoing,
            seq,
            msg_type,
            sender_comp_id: sender_comp,
            target_comp_id: target_comp,
            ts: now,
            raw: buf.clone(),
            archived_at: None,
        };
        let mut attempt = 1;
        loop {
            match ctx.store.append(stored.clone()).await {
                Ok(_) => break,
                Err(e) if attempt < OUTBOUND_STORE_ATTEMPTS => {
                    warn!(
                        session = %bound.session_id,
                        seq,
                        attempt,
                        error = %e,
                        "outbound append failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    error!(session = %bound.session_id, seq, error = %e, "outbound append failed");
                    ctx.auditor.record(
                        AuditRecord::new(bound.session_id.clone(), AuditEvent::SystemError)
                            .with_text(format!("outbound append of seq {seq} failed: {e}")),
                    );
                    machine.on_store_failure();
                    return Err(EngineError::Store(e));
                }
            }
        }
        ctx.auditor.record(
            AuditRecord::new(bound.session_id.clone(), AuditEvent::MsgSent).with_msg(
                msg_type,
                Direction::Outgoing,
                &buf,
            ),
        );
        state.total_out += 1;
    }

    if state.transport_up {
        if let Err(e) = ctx.transport.send(ctx.conn_id, buf).await {
            warn!(conn = ctx.conn_id, error = %e, "transport write failed");
            state.transport_up = false;
            machine.on_transport_closed();
        }
    }
    Ok(seq)
}

// ---- inbound -------------------------------------------------------------

async fn handle_frame(
    ctx: &SessionContext,
    machine: &mut SessionMachine,
    timeouts: &mut FixTimeouts,
    state: &mut TaskState,
    frame: MsgBuf,
) {
    timeouts.reset_inbound();

    let mut pending: VecDeque<MsgBuf> = VecDeque::new();
    pending.push_back(frame);
    while let Some(raw) = pending.pop_front() {
        process_one(ctx, machine, timeouts, state, raw).await;
        if machine.should_disconnect() {
            break;
        }
        // a gap may have closed; buffered frames resume in seq order
        while let Some(buffered) = machine.take_buffered_ready() {
            pending.push_back(buffered);
        }
    }
}

async fn process_one(
    ctx: &SessionContext,
    machine: &mut SessionMachine,
    timeouts: &mut FixTimeouts,
    state: &mut TaskState,
    raw: MsgBuf,
) {
    let msg = match parse_message(&raw.0) {
        Ok(msg) => msg,
        Err(e) => {
            ctx.auditor.record(
                AuditRecord::new(state.audit_id(ctx), AuditEvent::ProtocolError)
                    .with_text(e.to_string()),
            );
            if state.bound.is_none() {
                machine.abort_with_logout(
                    "Malformed logon",
                    DisconnectReason::ProtocolViolation(e.to_string()),
                );
            } else {
                machine.on_protocol_error(&RejectPlan {
                    ref_seq: peek_seq(&raw.0).unwrap_or(0),
                    ref_tag: None,
                    ref_msg_type: None,
                    reason: None,
                    text: e.to_string(),
                });
            }
            return;
        }
    };

    if let Some(sender) = msg.sender_comp_id() {
        state.peer_hint = Some(sender.to_string());
    }

    if let Err(errors) = validate_message(&msg) {
        reject_invalid(ctx, machine, state, &msg, &errors[0]);
        return;
    }

    // presence guaranteed by the validator
    let msg_type = match msg.msg_type() {
        Some(t) => t,
        None => return,
    };
    let seq = msg.msg_seq_num().unwrap_or(0);

    if state.bound.is_none() {
        if msg_type != 'A' {
            ctx.auditor.record(
                AuditRecord::new(state.audit_id(ctx), AuditEvent::ProtocolError)
                    .with_text(format!("first message was {msg_type}, expected Logon")),
            );
            machine.abort_with_logout(
                "Logon expected",
                DisconnectReason::ProtocolViolation(String::from("first message was not a Logon")),
            );
            return;
        }
        handle_logon(ctx, machine, timeouts, state, &msg, &raw, seq).await;
        return;
    }
    let bound = state.bound.clone().unwrap();

    if let Err(err) = validate_comp_ids(&msg, bound.key.peer(), &bound.key.sender_comp_id) {
        machine.on_protocol_error(&plan_from_validation(&msg, &err));
        machine.abort_with_logout(
            "CompID problem",
            DisconnectReason::ProtocolViolation(String::from("CompID mismatch")),
        );
        ctx.auditor.record(
            AuditRecord::new(bound.session_id.clone(), AuditEvent::ProtocolError)
                .with_text("CompID mismatch"),
        );
        return;
    }
    if let Err(err) = validate_sending_time_accuracy(
        &msg,
        Utc::now(),
        chrono::Duration::seconds(SENDING_TIME_WINDOW_SECS),
    ) {
        machine.on_protocol_error(&plan_from_validation(&msg, &err));
        machine.abort_with_logout(
            "SendingTime accuracy problem",
            DisconnectReason::ProtocolViolation(String::from("SendingTime out of tolerance")),
        );
        return;
    }
    if let Err(err) = validate_poss_dup(&msg) {
        machine.on_protocol_error(&plan_from_validation(&msg, &err));
        return;
    }

    // SequenceReset moves expectations directly instead of passing through
    // the ordinary ordering check
    if msg_type == '4' {
        let gap_fill = msg
            .get_char(Tags::GapFillFlag)
            .and_then(|c| GapFillFlag::try_from(c).ok())
            == Some(GapFillFlag::YES);
        let new_seq_no = match msg.get_parsed::<u32>(Tags::NewSeqNo) {
            Some(n) => n,
            None => return,
        };
        machine.on_sequence_reset(seq, gap_fill, new_seq_no);
        ctx.auditor.record(
            AuditRecord::new(bound.session_id.clone(), AuditEvent::SeqReset)
                .with_text(format!("NewSeqNo {new_seq_no}, gap_fill {gap_fill}")),
        );
        return;
    }

    match machine.classify_inbound(seq, msg.poss_dup()) {
        SeqDisposition::InOrder => {
            accept_and_dispatch(ctx, machine, state, &bound, msg, raw, msg_type, seq).await;
        }
        SeqDisposition::Gap => {
            if !machine.buffer_out_of_order(seq, raw) {
                ctx.auditor.record(
                    AuditRecord::new(bound.session_id.clone(), AuditEvent::ProtocolError)
                        .with_text(format!("resend buffer full, dropped seq {seq}")),
                );
            }
        }
        SeqDisposition::DuplicateIgnore => {
            debug!(session = %bound.session_id, seq, "ignoring possible duplicate");
        }
        SeqDisposition::FatalLow { expected, received } => {
            ctx.auditor.record(
                AuditRecord::new(bound.session_id.clone(), AuditEvent::FatalSeqError).with_text(
                    format!("MsgSeqNum too low, expecting {expected} but received {received}"),
                ),
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_and_dispatch(
    ctx: &SessionContext,
    machine: &mut SessionMachine,
    state: &mut TaskState,
    bound: &Bound,
    msg: Message,
    raw: MsgBuf,
    msg_type: char,
    seq: u32,
) {
    let stored = StoredMessage {
        session_id: bound.session_id.clone(),
        direction: Direction::Incoming,
        seq,
        msg_type,
        sender_comp_id: msg.sender_comp_id().unwrap_or_default().to_string(),
        target_comp_id: msg.target_comp_id().unwrap_or_default().to_string(),
        ts: Utc::now(),
        raw: raw.0.clone(),
        archived_at: None,
    };
    if let Err(e) = ctx.store.append(stored).await {
        error!(session = %bound.session_id, seq, error = %e, "inbound append failed");
        ctx.auditor.record(
            AuditRecord::new(bound.session_id.clone(), AuditEvent::SystemError)
                .with_text(format!("inbound append of seq {seq} failed: {e}")),
        );
        machine.on_store_failure();
        return;
    }
    machine.accept_inbound();
    state.total_in += 1;
    ctx.auditor.record(
        AuditRecord::new(bound.session_id.clone(), AuditEvent::MsgReceived).with_msg(
            msg_type,
            Direction::Incoming,
            &raw.0,
        ),
    );

    match msg_type {
        '0' => machine.on_heartbeat(msg.get(Tags::TestReqID)),
        '1' => {
            if let Some(id) = msg.get(Tags::TestReqID) {
                let id = id.to_vec();
                machine.on_test_request(&id);
            }
        }
        '2' => handle_resend_request(ctx, machine, state, bound, &msg).await,
        '3' => {
            warn!(
                session = %bound.session_id,
                text = msg.get_str(Tags::Text).unwrap_or(""),
                "peer rejected one of our messages"
            );
        }
        '5' => machine.on_logout(),
        'A' => {
            machine.on_protocol_error(&RejectPlan {
                ref_seq: seq,
                ref_tag: Some(Tags::MsgType.into()),
                ref_msg_type: Some('A'),
                reason: Some(SessionRejectReason::VALUE_IS_INCORRECT),
                text: String::from("Already logged on"),
            });
        }
        _ => deliver_app(ctx, machine, bound, msg, msg_type, seq).await,
    }
}

async fn deliver_app(
    ctx: &SessionContext,
    machine: &mut SessionMachine,
    bound: &Bound,
    msg: Message,
    msg_type: char,
    seq: u32,
) {
    match ctx.router.handler_for(msg_type) {
        Some(handler) => match handler.on_message(&bound.session_id, msg).await {
            Ok(replies) => {
                for reply in replies {
                    machine.outbox_push(reply);
                }
            }
            Err(reject) => {
                ctx.auditor.record(
                    AuditRecord::new(bound.session_id.clone(), AuditEvent::MsgRejected)
                        .with_text(reject.text.clone()),
                );
                machine.push_business_reject(
                    seq,
                    msg_type,
                    u32::from(&reject.reason),
                    &reject.text,
                );
            }
        },
        None => {
            ctx.auditor.record(
                AuditRecord::new(bound.session_id.clone(), AuditEvent::MsgRejected)
                    .with_text(format!("no handler for MsgType {msg_type}")),
            );
            machine.push_business_reject(
                seq,
                msg_type,
                u32::from(&BusinessRejectReason::UNSUPPORTED_MESSAGE_TYPE),
                "Unsupported MsgType",
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_logon(
    ctx: &SessionContext,
    machine: &mut SessionMachine,
    timeouts: &mut FixTimeouts,
    state: &mut TaskState,
    msg: &Message,
    raw: &MsgBuf,
    seq: u32,
) {
    let peer_comp = msg.sender_comp_id().unwrap_or_default().to_string();
    let our_comp = msg.target_comp_id().unwrap_or_default().to_string();

    if our_comp != ctx.config.comp_id {
        ctx.auditor.record(
            AuditRecord::new(state.audit_id(ctx), AuditEvent::ProtocolError)
                .with_text(format!("logon addressed to {our_comp:?}")),
        );
        machine.abort_with_logout(
            "CompID problem",
            DisconnectReason::ProtocolViolation(String::from("unknown TargetCompID")),
        );
        return;
    }

    let key = SessionKey::new(our_comp, peer_comp.clone());
    let session_id = key.to_string();
    let peer_label = ctx
        .peer_addr
        .clone()
        .unwrap_or_else(|| peer_comp.clone());

    if ctx.throttle.is_blocked(&peer_label) {
        ctx.auditor.record(
            AuditRecord::new(session_id.clone(), AuditEvent::AuthFailure)
                .with_peer(peer_label)
                .with_text("refused during authentication cool-down"),
        );
        machine.abort_with_logout(
            "Logon refused",
            DisconnectReason::AuthDenied(String::from("authentication cool-down")),
        );
        return;
    }

    let decision = ctx
        .authenticator
        .authenticate(LogonCredentials {
            sender_comp_id: &peer_comp,
            target_comp_id: &ctx.config.comp_id,
            username: msg.get_str(Tags::Username),
            password: msg.get_str(Tags::Password),
            peer_addr: ctx.peer_addr.as_deref(),
        })
        .await;
    if let AuthDecision::Deny(text) = decision {
        ctx.throttle.record_failure(&peer_label);
        ctx.auditor.record(
            AuditRecord::new(session_id.clone(), AuditEvent::AuthFailure)
                .with_peer(peer_label)
                .with_text(text.clone()),
        );
        machine.abort_with_logout(
            &format!("Logon rejected: {text}"),
            DisconnectReason::AuthDenied(text),
        );
        return;
    }

    let reset_requested = msg.get_char(Tags::ResetSeqNumFlag) == Some('Y');
    let reset = match (reset_requested, ctx.config.reset_on_logon_policy) {
        (true, ResetOnLogonPolicy::Accept) => true,
        (true, ResetOnLogonPolicy::Ignore) => false,
        (true, ResetOnLogonPolicy::Never) => {
            machine.abort_with_logout(
                "Sequence reset not permitted",
                DisconnectReason::ProtocolViolation(String::from("ResetSeqNumFlag refused")),
            );
            return;
        }
        (false, _) => false,
    };

    // Counters come from the durable record of appended messages, so a
    // crash between appends and the session snapshot cannot fork them.
    let rehydrated = async {
        let last_in = ctx.store.last_seq(&session_id, Direction::Incoming).await?;
        let last_out = ctx.store.last_seq(&session_id, Direction::Outgoing).await?;
        let record = ctx.store.load_session(&session_id).await?;
        let incoming = (last_in + 1).max(record.as_ref().map(|r| r.incoming_next).unwrap_or(1));
        let outgoing = (last_out + 1).max(record.as_ref().map(|r| r.outgoing_next).unwrap_or(1));
        Ok::<Sequences, crate::fix::store::StoreError>(Sequences::new(incoming, outgoing))
    }
    .await;
    machine.sequences = match rehydrated {
        Ok(sequences) => sequences,
        Err(e) => {
            error!(session = %session_id, error = %e, "failed to rehydrate session state");
            ctx.auditor.record(
                AuditRecord::new(session_id.clone(), AuditEvent::SystemError)
                    .with_text(e.to_string()),
            );
            machine.on_store_failure();
            return;
        }
    };
    if reset {
        // history is dropped so restarted sequence numbers cannot collide
        // with persisted rows
        if let Err(e) = ctx.store.reset_session(&session_id).await {
            error!(session = %session_id, error = %e, "failed to reset session history");
            machine.on_store_failure();
            return;
        }
        machine.sequences.reset_both();
        ctx.auditor.record(
            AuditRecord::new(session_id.clone(), AuditEvent::SeqReset)
                .with_text("counters reset to 1 on logon"),
        );
    }

    // fatal check before replying, so a stale logon gets Logout only
    let expected = machine.sequences.peek_incoming();
    if seq < expected && !msg.poss_dup() {
        ctx.auditor.record(
            AuditRecord::new(session_id.clone(), AuditEvent::FatalSeqError).with_text(format!(
                "logon MsgSeqNum too low, expecting {expected} but received {seq}"
            )),
        );
        machine.abort_with_logout(
            &format!("MsgSeqNum too low, expecting {expected} but received {seq}"),
            DisconnectReason::SeqTooLow {
                expected,
                received: seq,
            },
        );
        return;
    }

    let info = SessionInfo {
        session_id: session_id.clone(),
        key: key.clone(),
        status: SessionStatus::LogonReceived,
        connected: true,
        incoming_next: machine.sequences.peek_incoming(),
        outgoing_next: machine.sequences.peek_outgoing(),
        heartbeat_secs: machine.heartbeat_secs(),
        fix_version: ctx.config.fix_version.begin_string().to_string(),
        peer_addr: ctx.peer_addr.clone(),
        start_time: state.start_time,
        total_in: 0,
        total_out: 0,
        last_error: None,
    };
    let created = match ctx
        .registry
        .claim(&key, ctx.conn_id, ctx.self_tx.clone(), info)
    {
        Ok(created) => created,
        Err(ClaimError::AlreadyActive) => {
            ctx.auditor.record(
                AuditRecord::new(session_id.clone(), AuditEvent::AuthFailure)
                    .with_text("comp-id pair already has a live connection"),
            );
            machine.abort_with_logout(
                "Session already active",
                DisconnectReason::ProtocolViolation(String::from("duplicate session")),
            );
            return;
        }
        Err(ClaimError::CapacityExceeded) => {
            ctx.auditor.record(
                AuditRecord::new(session_id.clone(), AuditEvent::AuthFailure)
                    .with_text("session limit reached"),
            );
            machine.on_protocol_error(&RejectPlan {
                ref_seq: seq,
                ref_tag: None,
                ref_msg_type: Some('A'),
                reason: None,
                text: String::from("Session limit reached"),
            });
            machine.force_disconnect(DisconnectReason::SessionLimit);
            return;
        }
    };

    let heartbeat = msg
        .get_parsed::<u32>(Tags::HeartBtInt)
        .unwrap_or(ctx.config.default_heartbeat_secs);
    machine.on_logon(heartbeat, reset);
    state.bound = Some(Bound {
        key: key.clone(),
        session_id: session_id.clone(),
    });
    timeouts.logged_on(Duration::from_secs(machine.heartbeat_secs() as u64));

    if created {
        ctx.auditor.record(
            AuditRecord::new(session_id.clone(), AuditEvent::SessionCreated)
                .with_peer(peer_comp.clone()),
        );
    }
    ctx.auditor.record(
        AuditRecord::new(session_id.clone(), AuditEvent::Logon)
            .with_peer(peer_comp.clone())
            .with_msg('A', Direction::Incoming, &raw.0),
    );
    info!(session = %session_id, heartbeat, reset, "logon accepted");

    // the logon's own seq: in order → persist; ahead → the classify call
    // queues a ResendRequest behind the logon reply
    let bound = state.bound.clone().unwrap();
    match machine.classify_inbound(seq, msg.poss_dup()) {
        SeqDisposition::InOrder => {
            let stored = StoredMessage {
                session_id: bound.session_id.clone(),
                direction: Direction::Incoming,
                seq,
                msg_type: 'A',
                sender_comp_id: peer_comp,
                target_comp_id: ctx.config.comp_id.clone(),
                ts: Utc::now(),
                raw: raw.0.clone(),
                archived_at: None,
            };
            if let Err(e) = ctx.store.append(stored).await {
                error!(session = %bound.session_id, error = %e, "logon append failed");
                machine.on_store_failure();
                return;
            }
            machine.accept_inbound();
            state.total_in += 1;
        }
        SeqDisposition::Gap => {
            debug!(session = %bound.session_id, seq, "logon ahead of expectations");
        }
        SeqDisposition::DuplicateIgnore | SeqDisposition::FatalLow { .. } => {}
    }

    // an early snapshot so a crash before the first disconnect still leaves
    // a session row behind
    let record = SessionRecord {
        session_id: bound.session_id.clone(),
        sender_comp_id: bound.key.sender_comp_id.clone(),
        target_comp_id: bound.key.target_comp_id.clone(),
        status: machine.status().to_string(),
        incoming_next: machine.sequences.peek_incoming(),
        outgoing_next: machine.sequences.peek_outgoing(),
        last_heartbeat_at: Some(Utc::now()),
        start_time: Some(state.start_time),
        heartbeat_interval: machine.heartbeat_secs(),
        total_in: state.total_in,
        total_out: state.total_out,
    };
    if let Err(e) = ctx.store.save_session(record).await {
        warn!(session = %bound.session_id, error = %e, "failed to snapshot session after logon");
    }
}

async fn handle_resend_request(
    ctx: &SessionContext,
    machine: &mut SessionMachine,
    state: &mut TaskState,
    bound: &Bound,
    msg: &Message,
) {
    let begin = msg.get_parsed::<u32>(Tags::BeginSeqNo).unwrap_or(1);
    let mut end = msg.get_parsed::<u32>(Tags::EndSeqNo).unwrap_or(0);
    let last = machine.sequences.peek_outgoing().saturating_sub(1);
    if end == 0 || end > last {
        end = last;
    }
    ctx.auditor.record(
        AuditRecord::new(bound.session_id.clone(), AuditEvent::ResendReq)
            .with_text(format!("peer requested {begin}..={end}")),
    );
    if begin > end {
        return;
    }

    let stored = match ctx
        .store
        .range(&bound.session_id, Direction::Outgoing, begin, end)
        .await
    {
        Ok(stored) => stored,
        Err(e) => {
            error!(session = %bound.session_id, error = %e, "replay range read failed");
            ctx.auditor.record(
                AuditRecord::new(bound.session_id.clone(), AuditEvent::SystemError)
                    .with_text(e.to_string()),
            );
            return;
        }
    };

    let now = Utc::now();
    for segment in plan_replay(&stored) {
        let frame = match segment {
            ReplaySegment::App { index } => transform_for_resend(&stored[index].raw, now),
            ReplaySegment::GapFill { at_seq, new_seq_no } => gap_fill_frame(
                ctx.config.fix_version.begin_string(),
                &bound.key.sender_comp_id,
                &bound.key.target_comp_id,
                at_seq,
                new_seq_no,
                now,
            ),
        };
        match frame {
            Ok(bytes) => {
                if let Err(e) = ctx.transport.send(ctx.conn_id, bytes).await {
                    warn!(conn = ctx.conn_id, error = %e, "transport write failed during replay");
                    state.transport_up = false;
                    machine.on_transport_closed();
                    return;
                }
            }
            Err(e) => {
                warn!(session = %bound.session_id, error = %e, "skipping unreplayable frame");
            }
        }
    }
}

// ---- small helpers -------------------------------------------------------

fn reject_invalid(
    ctx: &SessionContext,
    machine: &mut SessionMachine,
    state: &mut TaskState,
    msg: &Message,
    error: &ValidationError,
) {
    ctx.auditor.record(
        AuditRecord::new(state.audit_id(ctx), AuditEvent::MsgRejected).with_text(format!(
            "tag {}: {}",
            error.tag,
            String::from(&error.reason)
        )),
    );
    if state.bound.is_none() {
        machine.abort_with_logout(
            "Invalid logon",
            DisconnectReason::ProtocolViolation(format!(
                "tag {}: {}",
                error.tag,
                String::from(&error.reason)
            )),
        );
    } else {
        machine.on_protocol_error(&plan_from_validation(msg, error));
    }
}

fn plan_from_validation(msg: &Message, error: &ValidationError) -> RejectPlan {
    RejectPlan {
        ref_seq: msg.msg_seq_num().unwrap_or(0),
        ref_tag: Some(error.tag),
        ref_msg_type: msg.msg_type(),
        reason: Some(error.reason),
        text: String::from(&error.reason),
    }
}

/// Best-effort MsgSeqNum extraction from a frame that failed to parse, so
/// the Reject can still reference it.
fn peek_seq(raw: &[u8]) -> Option<u32> {
    let at = raw.windows(4).position(|w| w == b"\x0134=")? + 4;
    let end = raw[at..].iter().position(|b| *b == b'\x01')? + at;
    crate::fix::decode::parse_field::<u32>(&raw[at..end]).ok()
}
