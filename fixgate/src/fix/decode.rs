//! Frame prefix peeking and tag=value parsing.
//!
//! A [`MsgBuf`] fresh off the transport is first sized with
//! [`parse_frame_prefix`] (the framer uses this to know how many bytes a
//! frame occupies) and then turned into a structured [`Message`] with
//! [`parse_message`], which also verifies the BodyLength and CheckSum
//! invariants.
//!
//! [`MsgBuf`]: crate::fix::mem::MsgBuf
//! [`Message`]: crate::fix::message::Message

use crate::fix::checksum::{calc_checksum, parse_checksum};
use crate::fix::fields::Tags;
use crate::fix::message::{Field, Message};

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

const TIME_FORMAT_SHORT: &str = "%Y%m%d-%H:%M:%S";
const TIME_FORMAT_LONG: &str = "%Y%m%d-%H:%M:%S%.3f";

/// Largest tag number the parser accepts.
pub const MAX_TAG: u32 = 9_999_999;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("field at byte {at} has no '=' separator")]
    MalformedField { at: usize },
    #[error("invalid tag {raw:?}")]
    InvalidTag { raw: String },
    #[error("BodyLength declares {declared} but body spans {actual} bytes")]
    BadBodyLength { declared: usize, actual: usize },
    #[error("CheckSum declares {declared} but frame sums to {computed}")]
    BadChecksum { declared: u32, computed: u32 },
    #[error("garbled frame: {0}")]
    Garbled(String),
}

/// Byte geometry of a frame, derived from the fixed `8=..<SOH>9=<len><SOH>`
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePrefix {
    /// Declared BodyLength(9) value.
    pub body_length: usize,
    /// Offset of the first byte counted by BodyLength.
    pub body_start: usize,
    /// Total frame size: prefix + body + `10=NNN<SOH>` trailer.
    pub frame_length: usize,
}

/// Reads the frame prefix out of `buf`. Returns `Ok(None)` when more bytes
/// are needed to decide, and `Err` when the prefix can never form a valid
/// frame (wrong BeginString, non-numeric or oversized BodyLength).
pub fn parse_frame_prefix(
    buf: &[u8],
    begin_string: &str,
    max_body: usize,
) -> Result<Option<FramePrefix>, DecodeError> {
    let expected = format!("8={begin_string}\x019=");
    let expected = expected.as_bytes();

    let check_len = std::cmp::min(buf.len(), expected.len());
    if buf[..check_len] != expected[..check_len] {
        if buf.len() >= 2 && &buf[..2] == b"8=" {
            return Err(DecodeError::Garbled(String::from("unexpected BeginString")));
        }
        return Err(DecodeError::Garbled(String::from("frame does not start with 8=")));
    }
    if buf.len() < expected.len() {
        return Ok(None);
    }

    let mut body_length: usize = 0;
    let mut at = expected.len();
    let mut saw_end = false;
    for c in &buf[expected.len()..] {
        at += 1;
        match *c {
            b'0'..=b'9' => {
                body_length = body_length * 10 + (c - b'0') as usize;
                if body_length > max_body {
                    return Err(DecodeError::Garbled(format!(
                        "BodyLength exceeds maximum of {max_body}"
                    )));
                }
            }
            b'\x01' => {
                saw_end = true;
                break;
            }
            _ => {
                return Err(DecodeError::Garbled(String::from(
                    "illegal character in BodyLength",
                )));
            }
        }
    }
    if !saw_end {
        return Ok(None);
    }

    // BodyLength counts every byte after its own SOH up to and including the
    // SOH preceding the checksum field; the trailer is always 7 bytes.
    Ok(Some(FramePrefix {
        body_length,
        body_start: at,
        frame_length: at + body_length + 7,
    }))
}

/// Splits a complete frame into fields and verifies its framing invariants:
/// leading 8/9, trailing 10, declared BodyLength and CheckSum.
pub fn parse_message(buf: &[u8]) -> Result<Message, DecodeError> {
    let fields = split_fields(buf)?;

    if fields.len() < 3 {
        return Err(DecodeError::Garbled(String::from("too few fields")));
    }
    if fields[0].tag != u32::from(Tags::BeginString) || fields[1].tag != u32::from(Tags::BodyLength)
    {
        return Err(DecodeError::Garbled(String::from(
            "frame must start with BeginString then BodyLength",
        )));
    }
    if fields[fields.len() - 1].tag != u32::from(Tags::CheckSum) {
        return Err(DecodeError::Garbled(String::from(
            "frame must end with CheckSum",
        )));
    }

    let msg = Message::from_fields(fields);
    verify_body_length(buf, &msg)?;
    verify_checksum(buf)?;
    Ok(msg)
}

fn split_fields(buf: &[u8]) -> Result<Vec<Field>, DecodeError> {
    let mut fields = Vec::with_capacity(16);
    let mut at = 0;
    while at < buf.len() {
        let end = buf[at..]
            .iter()
            .position(|b| *b == b'\x01')
            .map(|p| at + p)
            .ok_or(DecodeError::Garbled(String::from(
                "frame does not end on a field boundary",
            )))?;
        let token = &buf[at..end];
        let eq = token
            .iter()
            .position(|b| *b == b'=')
            .ok_or(DecodeError::MalformedField { at })?;
        let tag = parse_tag(&token[..eq])?;
        fields.push(Field::new(tag, token[eq + 1..].to_vec()));
        at = end + 1;
    }
    Ok(fields)
}

fn parse_tag(raw: &[u8]) -> Result<u32, DecodeError> {
    let invalid = || DecodeError::InvalidTag {
        raw: String::from_utf8_lossy(raw).into_owned(),
    };
    if raw.is_empty() {
        return Err(invalid());
    }
    let mut accum: u32 = 0;
    for b in raw {
        if !b.is_ascii_digit() {
            return Err(invalid());
        }
        accum = accum
            .checked_mul(10)
            .and_then(|a| a.checked_add((b - b'0') as u32))
            .ok_or_else(invalid)?;
    }
    if accum == 0 || accum > MAX_TAG {
        return Err(invalid());
    }
    Ok(accum)
}

fn verify_body_length(buf: &[u8], msg: &Message) -> Result<(), DecodeError> {
    let declared = msg
        .body_length()
        .ok_or(DecodeError::Garbled(String::from("unreadable BodyLength")))?;
    // Locate the SOH that closes field 9; the counted region runs from the
    // next byte through the SOH before "10=".
    let mut soh_seen = 0;
    let mut body_start = 0;
    for (i, b) in buf.iter().enumerate() {
        if *b == b'\x01' {
            soh_seen += 1;
            if soh_seen == 2 {
                body_start = i + 1;
                break;
            }
        }
    }
    let actual = buf.len().saturating_sub(7).saturating_sub(body_start);
    if declared != actual {
        return Err(DecodeError::BadBodyLength { declared, actual });
    }
    Ok(())
}

fn verify_checksum(buf: &[u8]) -> Result<(), DecodeError> {
    let declared = parse_checksum(buf).ok_or(DecodeError::Garbled(String::from(
        "unreadable CheckSum trailer",
    )))?;
    let computed = calc_checksum(&buf[..buf.len() - 7]);
    if declared != computed {
        return Err(DecodeError::BadChecksum { declared, computed });
    }
    Ok(())
}

/// Attempts to parse a FIX value into any type that `impl`'s [`FromStr`].
///
/// [`FromStr`]: std::str::FromStr
pub fn parse_field<T>(field: &[u8]) -> Result<T>
where
    T: std::str::FromStr,
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::str::from_utf8(field)?
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{e:?}"))
}

/// Parses a FIX UTC timestamp, with or without milliseconds.
pub fn parse_timestamp(bytes: &[u8]) -> Result<DateTime<Utc>> {
    let s = std::str::from_utf8(bytes)?;
    let naive = NaiveDateTime::parse_from_str(s, TIME_FORMAT_SHORT)
        .or(NaiveDateTime::parse_from_str(s, TIME_FORMAT_LONG))?;
    Ok(naive.and_utc())
}
