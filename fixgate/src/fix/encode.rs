//! Message building and encoding.
//!
//! Outbound messages are assembled with a [`MessageBuilder`]: the session
//! stamps the sequence number, comp ids and SendingTime at flush time, so
//! builders carry only the message type and body fields. Do **not** push any
//! of the following, they are written automatically:
//!
//! * `BodyLength(9)`
//! * `MsgSeqNum(34)`
//! * `SenderCompID(49)`
//! * `TargetCompID(56)`
//! * `SendingTime(52)`
//! * `CheckSum(10)`
//!
//! [`encode_message`] re-encodes an already-parsed [`Message`] byte-for-byte
//! (recomputing BodyLength and CheckSum), which backs replay and the
//! parse/format round-trip guarantee.
//!
//! [`Message`]: crate::fix::message::Message

use crate::fix::checksum::ChecksumWriter;
use crate::fix::fields::Tags;
use crate::fix::message::Message;

use chrono::{DateTime, Utc};
use std::io::Write;

/// The FIX timestamp format in [chrono format syntax]
///
/// [chrono format syntax]: https://docs.rs/chrono/latest/chrono/format/strftime/index.html
pub const TIME_FORMAT: &str = "%Y%m%d-%H:%M:%S%.3f";

pub(super) const SOH: &[u8] = &[b'\x01'];

/// Returns the current time in [`TIME_FORMAT`]
pub fn formatted_time() -> String {
    format!("{}", Utc::now().format(TIME_FORMAT))
}

/// A struct for building outbound FIX messages.
///
/// Values are not checked against the dictionary; pushing an invalid value
/// for a field produces an invalid message on the wire.
#[derive(Debug)]
pub struct MessageBuilder {
    begin_string: String,
    msg_type: char,
    body: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(begin_string: &str, msg_type: impl Into<char>) -> Self {
        MessageBuilder {
            begin_string: begin_string.to_string(),
            msg_type: msg_type.into(),
            body: Vec::with_capacity(256),
        }
    }

    /// Adds a `tag=value` pair to the message body.
    pub fn push(mut self, tag: impl Into<u32>, value: &[u8]) -> Self {
        self.push_mut(tag, value);
        self
    }

    pub fn push_mut(&mut self, tag: impl Into<u32>, value: &[u8]) {
        let tag: u32 = tag.into();
        let _ = write!(self.body, "{tag}=");
        let _ = self.body.write_all(value);
        let _ = self.body.write_all(SOH);
    }

    /// Gets the `MsgType(35)` of this builder.
    pub fn msg_type(&self) -> char {
        self.msg_type
    }

    /// Serializes the complete frame, stamping the session header fields.
    /// Identical inputs produce identical bytes.
    pub fn build(
        &self,
        sink: &mut Vec<u8>,
        msg_seq_num: u32,
        sender_comp_id: &str,
        target_comp_id: &str,
        sending_time: DateTime<Utc>,
    ) -> std::io::Result<()> {
        let mut counted = Vec::with_capacity(self.body.len() + 96);
        write!(counted, "35={}\x01", self.msg_type)?;
        write!(counted, "34={msg_seq_num}\x01")?;
        write!(counted, "49={sender_comp_id}\x01")?;
        write!(counted, "56={target_comp_id}\x01")?;
        write!(counted, "52={}\x01", sending_time.format(TIME_FORMAT))?;
        counted.write_all(&self.body)?;

        let mut writer = ChecksumWriter::new(sink);
        write!(writer, "8={}\x01", self.begin_string)?;
        write!(writer, "9={}\x01", counted.len())?;
        writer.write_all(&counted)?;
        let checksum = writer.checksum();
        write!(writer, "10={checksum:0>3}\x01")?;
        Ok(())
    }
}

/// Re-encodes a parsed [`Message`]: `8`, then a freshly computed `9`, then
/// `35` and every remaining field in insertion order, then a freshly
/// computed `10`. For a message that came off the wire intact this
/// reproduces the original bytes.
pub fn encode_message(msg: &Message) -> std::io::Result<Vec<u8>> {
    let begin_string = msg.begin_string().unwrap_or_default().as_bytes().to_vec();

    let mut counted: Vec<u8> = Vec::with_capacity(256);
    let mut wrote_msg_type = false;
    let skip = [
        u32::from(Tags::BeginString),
        u32::from(Tags::BodyLength),
        u32::from(Tags::CheckSum),
    ];
    if let Some(mt) = msg.get(Tags::MsgType) {
        write_field(&mut counted, Tags::MsgType.into(), mt)?;
        wrote_msg_type = true;
    }
    let mut skipped_msg_type = false;
    for field in msg.fields() {
        if skip.contains(&field.tag) {
            continue;
        }
        if field.tag == u32::from(Tags::MsgType) && wrote_msg_type && !skipped_msg_type {
            skipped_msg_type = true;
            continue;
        }
        write_field(&mut counted, field.tag, &field.value)?;
    }

    let mut out = Vec::with_capacity(counted.len() + 32);
    let mut writer = ChecksumWriter::new(&mut out);
    write_field(&mut writer, Tags::BeginString.into(), &begin_string)?;
    write!(writer, "9={}\x01", counted.len())?;
    writer.write_all(&counted)?;
    let checksum = writer.checksum();
    write!(writer, "10={checksum:0>3}\x01")?;
    Ok(out)
}

fn write_field<W: Write>(w: &mut W, tag: u32, value: &[u8]) -> std::io::Result<()> {
    write!(w, "{tag}=")?;
    w.write_all(value)?;
    w.write_all(SOH)
}

/// A [`u64`]/[`u32`] wrapper that can convert an int to its ASCII
/// representation without allocating.
///
/// ## Example
///
/// ```rust
/// # use fixgate::fix::encode::SerializedInt;
/// let num = SerializedInt::from(15u32);
/// assert_eq!(num.as_bytes(), b"15");
/// ```
#[derive(Default)]
pub struct SerializedInt([u8; 32], usize);

impl SerializedInt {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[self.0.len() - self.1..]
    }
}

impl From<u32> for SerializedInt {
    fn from(u: u32) -> Self {
        Self::from(u as u64)
    }
}

impl From<u64> for SerializedInt {
    fn from(u: u64) -> Self {
        let mut ser: SerializedInt = Default::default();
        if u == 0 {
            ser.0[ser.0.len() - 1] = b'0';
            ser.1 = 1;
            return ser;
        }
        let mut n = u;
        let mut cursor = 0;
        while n > 0 {
            let at = ser.0.len() - 1 - cursor;
            ser.0[at] = b'0' + (n % 10) as u8;
            n /= 10;
            cursor += 1;
        }
        ser.1 = cursor;
        ser
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fix::decode::parse_message;
    use crate::fix::fields::MsgType;

    #[test]
    fn test_serialized_int() {
        let tests = vec![(1u32, "1"), (1918230917, "1918230917"), (0, "0")];
        for (num, s) in tests.into_iter() {
            let si: SerializedInt = num.into();
            assert_eq!(si.as_bytes(), s.as_bytes());
        }
    }

    #[test]
    fn test_builder_deterministic() {
        let when = std::time::UNIX_EPOCH.into();
        let build = || {
            let builder = MessageBuilder::new("FIX.4.4", MsgType::LOGON)
                .push(Tags::EncryptMethod, b"0")
                .push(Tags::HeartBtInt, b"30");
            let mut buf = Vec::new();
            builder.build(&mut buf, 1, "SERVER", "CLIENT", when).unwrap();
            buf
        };
        let first = build();
        assert_eq!(first, build());
        assert_eq!(
            String::from_utf8(first).unwrap(),
            "8=FIX.4.4\x019=67\x0135=A\x0134=1\x0149=SERVER\x0156=CLIENT\x0152=19700101-00:00:00.000\x0198=0\x01108=30\x0110=124\x01"
        );
    }

    #[test]
    fn test_built_frames_parse_clean() {
        let builder = MessageBuilder::new("FIX.4.4", MsgType::ORDER_SINGLE)
            .push(Tags::ClOrdID, b"ord-1")
            .push(Tags::Symbol, b"MSFT")
            .push(Tags::Side, b"1")
            .push(Tags::OrderQty, b"100")
            .push(Tags::OrdType, b"1");
        let mut buf = Vec::new();
        builder
            .build(&mut buf, 7, "SERVER", "CLIENT", Utc::now())
            .unwrap();

        let msg = parse_message(&buf).expect("built frame must parse");
        assert_eq!(msg.msg_type(), Some('D'));
        assert_eq!(msg.msg_seq_num(), Some(7));
        assert_eq!(msg.get(Tags::Symbol), Some(&b"MSFT"[..]));
    }

    #[test]
    fn test_round_trip() {
        let builder = MessageBuilder::new("FIX.4.4", MsgType::EXECUTION_REPORT)
            .push(Tags::OrderID, b"o-42")
            .push(Tags::ExecID, b"e-42")
            .push(Tags::ExecType, b"0")
            .push(Tags::OrdStatus, b"0")
            .push(Tags::LeavesQty, b"10")
            .push(Tags::CumQty, b"0");
        let mut wire = Vec::new();
        builder
            .build(&mut wire, 3, "SERVER", "CLIENT", Utc::now())
            .unwrap();

        let parsed = parse_message(&wire).unwrap();
        let rewire = encode_message(&parsed).unwrap();
        assert_eq!(wire, rewire);
        assert_eq!(parse_message(&rewire).unwrap(), parsed);
    }
}
