//! Replay of stored outbound messages in answer to a ResendRequest.
//!
//! Application messages are re-emitted verbatim apart from the duplicate
//! stamps: PossDupFlag(43)=Y, OrigSendingTime(122) carrying the original
//! SendingTime, and a refreshed SendingTime(52). Administrative messages are
//! never replayed; each contiguous run of them collapses into a single
//! SequenceReset gap-fill covering its span. Replay never consumes new
//! outbound sequence numbers.

use crate::fix::encode::{encode_message, TIME_FORMAT};
use crate::fix::fields::{is_session_message, MsgType, Tags};
use crate::fix::message::Message;
use crate::fix::store::StoredMessage;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

/// One step of a replay: either re-send the stored application frame at
/// `index` in the input, or emit a gap-fill jumping the peer's expectation
/// from `at_seq` to `new_seq_no`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplaySegment {
    App { index: usize },
    GapFill { at_seq: u32, new_seq_no: u32 },
}

/// Collapses administrative messages into gap-fills. `stored` must be
/// ascending by seq (as returned by the store's range query).
pub(crate) fn plan_replay(stored: &[StoredMessage]) -> Vec<ReplaySegment> {
    let mut plan = Vec::new();
    let mut admin_span_start: Option<u32> = None;

    for (index, msg) in stored.iter().enumerate() {
        if is_session_message(msg.msg_type) {
            admin_span_start.get_or_insert(msg.seq);
            continue;
        }
        if let Some(at_seq) = admin_span_start.take() {
            plan.push(ReplaySegment::GapFill {
                at_seq,
                new_seq_no: msg.seq,
            });
        }
        plan.push(ReplaySegment::App { index });
    }

    if let (Some(at_seq), Some(last)) = (admin_span_start, stored.last()) {
        plan.push(ReplaySegment::GapFill {
            at_seq,
            new_seq_no: last.seq + 1,
        });
    }
    plan
}

/// Re-stamps a stored frame as a possible duplicate.
pub(crate) fn transform_for_resend(raw: &[u8], now: DateTime<Utc>) -> Result<Vec<u8>> {
    let msg = crate::fix::decode::parse_message(raw)?;
    let orig_sending_time = msg
        .sending_time_raw()
        .ok_or(anyhow!("stored frame has no SendingTime"))?
        .to_vec();

    let mut out = Message::new();
    for field in msg.fields() {
        match Tags::try_from(field.tag) {
            Ok(Tags::PossDupFlag) | Ok(Tags::OrigSendingTime) => continue,
            Ok(Tags::SendingTime) => {
                out.push(Tags::PossDupFlag, &b"Y"[..]);
                out.push(
                    Tags::SendingTime,
                    format!("{}", now.format(TIME_FORMAT)).into_bytes(),
                );
                out.push(Tags::OrigSendingTime, orig_sending_time.clone());
            }
            _ => out.push(field.tag, field.value.clone()),
        }
    }
    Ok(encode_message(&out)?)
}

/// Builds the gap-fill SequenceReset frame emitted in place of a span of
/// administrative messages.
pub(crate) fn gap_fill_frame(
    begin_string: &str,
    sender_comp_id: &str,
    target_comp_id: &str,
    at_seq: u32,
    new_seq_no: u32,
    now: DateTime<Utc>,
) -> Result<Vec<u8>> {
    let mut msg = Message::new();
    msg.push(Tags::BeginString, begin_string.as_bytes().to_vec());
    msg.push(Tags::BodyLength, &b"0"[..]);
    msg.push(Tags::MsgType, <&[u8]>::from(MsgType::SEQUENCE_RESET));
    msg.push(Tags::MsgSeqNum, at_seq.to_string().into_bytes());
    msg.push(Tags::SenderCompID, sender_comp_id.as_bytes().to_vec());
    msg.push(Tags::TargetCompID, target_comp_id.as_bytes().to_vec());
    msg.push(Tags::PossDupFlag, &b"Y"[..]);
    msg.push(
        Tags::SendingTime,
        format!("{}", now.format(TIME_FORMAT)).into_bytes(),
    );
    msg.push(Tags::GapFillFlag, &b"Y"[..]);
    msg.push(Tags::NewSeqNo, new_seq_no.to_string().into_bytes());
    msg.push(Tags::CheckSum, &b"000"[..]);
    Ok(encode_message(&msg)?)
}
