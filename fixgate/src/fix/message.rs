//! Structured view of a FIX frame: an ordered list of tag/value fields.
//!
//! Field order is preserved exactly as parsed, so repeating groups survive a
//! parse/format round trip without the engine understanding their layout.

use crate::fix::decode::parse_field;
use crate::fix::fields::{PossDupFlag, Tags};

/// A single `tag=value` pair. Values are raw ASCII bytes without the SOH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub tag: u32,
    pub value: Vec<u8>,
}

impl Field {
    pub fn new(tag: u32, value: impl Into<Vec<u8>>) -> Field {
        Field {
            tag,
            value: value.into(),
        }
    }
}

/// An ordered collection of fields making up one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: Vec<Field>,
}

impl Message {
    pub fn new() -> Message {
        Message { fields: Vec::new() }
    }

    pub(crate) fn from_fields(fields: Vec<Field>) -> Message {
        Message { fields }
    }

    pub fn push(&mut self, tag: impl Into<u32>, value: impl Into<Vec<u8>>) {
        self.fields.push(Field::new(tag.into(), value));
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// First value for `tag`, in field order.
    pub fn get(&self, tag: impl Into<u32>) -> Option<&[u8]> {
        let tag = tag.into();
        self.fields
            .iter()
            .find(|f| f.tag == tag)
            .map(|f| f.value.as_slice())
    }

    pub fn get_str(&self, tag: impl Into<u32>) -> Option<&str> {
        self.get(tag).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_parsed<T>(&self, tag: impl Into<u32>) -> Option<T>
    where
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Debug,
    {
        self.get(tag).and_then(|v| parse_field::<T>(v).ok())
    }

    /// Single-character value, e.g. MsgType or the Y/N flags.
    pub fn get_char(&self, tag: impl Into<u32>) -> Option<char> {
        match self.get(tag) {
            Some(v) if v.len() == 1 => Some(v[0] as char),
            _ => None,
        }
    }

    pub fn begin_string(&self) -> Option<&str> {
        self.get_str(Tags::BeginString)
    }

    pub fn body_length(&self) -> Option<usize> {
        self.get_parsed::<usize>(Tags::BodyLength)
    }

    pub fn msg_type(&self) -> Option<char> {
        self.get_char(Tags::MsgType)
    }

    pub fn msg_seq_num(&self) -> Option<u32> {
        self.get_parsed::<u32>(Tags::MsgSeqNum)
    }

    pub fn sender_comp_id(&self) -> Option<&str> {
        self.get_str(Tags::SenderCompID)
    }

    pub fn target_comp_id(&self) -> Option<&str> {
        self.get_str(Tags::TargetCompID)
    }

    pub fn sending_time_raw(&self) -> Option<&[u8]> {
        self.get(Tags::SendingTime)
    }

    pub fn checksum_raw(&self) -> Option<&[u8]> {
        self.get(Tags::CheckSum)
    }

    pub fn poss_dup(&self) -> bool {
        self.get_char(Tags::PossDupFlag)
            .and_then(|c| PossDupFlag::try_from(c).ok())
            == Some(PossDupFlag::YES)
    }
}
