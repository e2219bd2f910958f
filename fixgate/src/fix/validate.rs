//! Message validation: header completeness, per-MsgType required fields and
//! field formats. Session-context checks (comp ids, SendingTime accuracy,
//! PossDup hygiene) live here too but take the expected values as arguments.

use crate::fix::decode::{parse_field, parse_timestamp};
use crate::fix::fields::{SessionRejectReason, Tags};
use crate::fix::message::Message;

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

/// One failed check: the offending tag and the session reject reason the
/// engine should answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub tag: u32,
    pub reason: SessionRejectReason,
}

impl ValidationError {
    fn new(tag: impl Into<u32>, reason: SessionRejectReason) -> ValidationError {
        ValidationError {
            tag: tag.into(),
            reason,
        }
    }
}

const HEADER_REQUIRED: [Tags; 6] = [
    Tags::BeginString,
    Tags::MsgType,
    Tags::SenderCompID,
    Tags::TargetCompID,
    Tags::MsgSeqNum,
    Tags::SendingTime,
];

lazy_static! {
    /// Required body fields by MsgType. Message types missing from this
    /// table get header validation only.
    static ref REQUIRED_BY_MSG_TYPE: HashMap<char, &'static [u32]> = {
        let mut m: HashMap<char, &'static [u32]> = HashMap::new();
        m.insert('A', &[98, 108]);
        m.insert('5', &[]);
        m.insert('0', &[]);
        m.insert('1', &[112]);
        m.insert('2', &[7, 16]);
        m.insert('3', &[45]);
        m.insert('4', &[36]);
        m.insert('D', &[11, 55, 54, 38, 40]);
        m.insert('8', &[37, 17, 150, 39, 151, 14]);
        m
    };
    static ref INT_TAGS: Vec<u32> = vec![7, 9, 14, 16, 34, 36, 38, 45, 98, 108, 151, 371, 373, 380];
    static ref BOOL_TAGS: Vec<u32> = vec![43, 123, 141];
    static ref SENDING_TIME_RE: Regex =
        Regex::new(r"^\d{8}-\d{2}:\d{2}:\d{2}(\.\d{3})?$").unwrap();
}

/// Validates a parsed message against the static tables. All failures are
/// collected; the session answers with a Reject referencing the first.
pub fn validate_message(msg: &Message) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for tag in HEADER_REQUIRED {
        if msg.get(tag).is_none() {
            errors.push(ValidationError::new(
                tag,
                SessionRejectReason::REQUIRED_TAG_MISSING,
            ));
        }
    }

    if let Some(raw) = msg.get(Tags::MsgSeqNum) {
        match parse_field::<u32>(raw) {
            Ok(0) => errors.push(ValidationError::new(
                Tags::MsgSeqNum,
                SessionRejectReason::VALUE_IS_INCORRECT,
            )),
            Ok(_) => {}
            Err(_) => errors.push(ValidationError::new(
                Tags::MsgSeqNum,
                SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE,
            )),
        }
    }

    if let Some(raw) = msg.sending_time_raw() {
        if !sending_time_well_formed(raw) {
            errors.push(ValidationError::new(
                Tags::SendingTime,
                SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE,
            ));
        }
    }

    if let Some(msg_type) = msg.msg_type() {
        if let Some(required) = REQUIRED_BY_MSG_TYPE.get(&msg_type) {
            for tag in required.iter() {
                if msg.get(*tag).is_none() {
                    errors.push(ValidationError::new(
                        *tag,
                        SessionRejectReason::REQUIRED_TAG_MISSING,
                    ));
                }
            }
        }
        // limit orders carry a price
        if msg_type == 'D'
            && msg.get(Tags::OrdType) == Some(&b"2"[..])
            && msg.get(Tags::Price).is_none()
        {
            errors.push(ValidationError::new(
                Tags::Price,
                SessionRejectReason::REQUIRED_TAG_MISSING,
            ));
        }
    }

    for field in msg.fields() {
        if INT_TAGS.contains(&field.tag) && parse_field::<u64>(&field.value).is_err() {
            errors.push(ValidationError::new(
                field.tag,
                SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE,
            ));
        }
        if BOOL_TAGS.contains(&field.tag) && !matches!(field.value.as_slice(), b"Y" | b"N") {
            errors.push(ValidationError::new(
                field.tag,
                SessionRejectReason::VALUE_IS_INCORRECT,
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn sending_time_well_formed(raw: &[u8]) -> bool {
    match std::str::from_utf8(raw) {
        Ok(s) => SENDING_TIME_RE.is_match(s) && parse_timestamp(raw).is_ok(),
        Err(_) => false,
    }
}

/// The peer's SenderCompID must be our expected counterparty and its
/// TargetCompID must be us.
pub(crate) fn validate_comp_ids(
    msg: &Message,
    expected_sender: &str,
    expected_target: &str,
) -> Result<(), ValidationError> {
    if msg.sender_comp_id() != Some(expected_sender) {
        return Err(ValidationError::new(
            Tags::SenderCompID,
            SessionRejectReason::COMPID_PROBLEM,
        ));
    }
    if msg.target_comp_id() != Some(expected_target) {
        return Err(ValidationError::new(
            Tags::TargetCompID,
            SessionRejectReason::COMPID_PROBLEM,
        ));
    }
    Ok(())
}

/// SendingTime must be within `window` of server time, either direction.
pub(crate) fn validate_sending_time_accuracy(
    msg: &Message,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<(), ValidationError> {
    let raw = match msg.sending_time_raw() {
        Some(raw) => raw,
        None => return Ok(()),
    };
    let sending_time = match parse_timestamp(raw) {
        Ok(t) => t,
        Err(_) => return Ok(()),
    };
    if now - sending_time < window && sending_time - now < window {
        Ok(())
    } else {
        Err(ValidationError::new(
            Tags::SendingTime,
            SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM,
        ))
    }
}

/// A possible duplicate must carry OrigSendingTime(122), and it must not be
/// newer than SendingTime(52).
pub(crate) fn validate_poss_dup(msg: &Message) -> Result<(), ValidationError> {
    if !msg.poss_dup() {
        return Ok(());
    }
    let orig = match msg.get(Tags::OrigSendingTime) {
        Some(raw) => raw,
        None => {
            return Err(ValidationError::new(
                Tags::OrigSendingTime,
                SessionRejectReason::REQUIRED_TAG_MISSING,
            ))
        }
    };
    if let (Ok(orig), Ok(sending)) = (
        parse_timestamp(orig),
        parse_timestamp(msg.sending_time_raw().unwrap_or_default()),
    ) {
        if orig > sending {
            return Err(ValidationError::new(
                Tags::OrigSendingTime,
                SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM,
            ));
        }
    }
    Ok(())
}
