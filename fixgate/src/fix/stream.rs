//! Incremental frame extraction.
//!
//! The engine does not own sockets; the transport pushes byte chunks in
//! whatever sizes the network produced. A [`FrameBuffer`] accumulates them
//! and yields complete frames. Garbled input (wrong BeginString, unreadable
//! or oversized BodyLength, a body that does not end in a checksum trailer)
//! is dropped and the buffer resynchronizes by scanning forward to the next
//! plausible `8=F`.

use crate::fix::decode::parse_frame_prefix;
use crate::fix::mem::MsgBuf;

const MESSAGE_BEGINNING: &[u8] = b"8=F";

#[derive(Debug)]
pub(crate) enum FrameEvent {
    Frame(MsgBuf),
    /// Bytes were discarded; carries the reason for the audit trail.
    Garbled(String),
}

pub(crate) struct FrameBuffer {
    buf: Vec<u8>,
    begin_string: String,
    max_body: usize,
}

impl FrameBuffer {
    pub(crate) fn new(begin_string: impl Into<String>, max_body: usize) -> FrameBuffer {
        FrameBuffer {
            buf: Vec::with_capacity(4096),
            begin_string: begin_string.into(),
            max_body,
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame or garble notice; `None` means more bytes are
    /// needed. Call in a loop after each `extend`.
    pub(crate) fn next_event(&mut self) -> Option<FrameEvent> {
        if self.buf.is_empty() {
            return None;
        }

        let prefix = match parse_frame_prefix(&self.buf, &self.begin_string, self.max_body) {
            Ok(Some(prefix)) => prefix,
            Ok(None) => return None,
            Err(e) => {
                let reason = e.to_string();
                self.resync();
                return Some(FrameEvent::Garbled(reason));
            }
        };

        if self.buf.len() < prefix.frame_length {
            return None;
        }

        let end = prefix.frame_length;
        if &self.buf[end - 7..end - 4] != b"10=" || self.buf[end - 1] != b'\x01' {
            self.resync();
            return Some(FrameEvent::Garbled(String::from(
                "BodyLength does not land on the checksum trailer",
            )));
        }

        let frame: Vec<u8> = self.buf.drain(..end).collect();
        Some(FrameEvent::Frame(frame.into()))
    }

    /// Bytes currently buffered but not yet framed.
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.buf.len()
    }

    // The head of the buffer is garbled: drop its first byte, then discard
    // everything up to the next full or partial `8=F`.
    fn resync(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        self.buf.remove(0);
        let keep_from = position_or_partial_match(&self.buf, MESSAGE_BEGINNING)
            .unwrap_or(self.buf.len());
        self.buf.drain(..keep_from);
    }
}

// Finds the position of the longest, if any, prefix of `target` that is also
// a suffix of `buf`.
//
// Examples: a prefix of "8=F" exists in "xxx8=F", "xxx8=" and "xxx8", but one
// does not exist in "xxx8=x", or "xxxx8x".
fn partial_match_in_suffix(buf: &[u8], target: &[u8]) -> Option<usize> {
    let largest_match_len = std::cmp::min(target.len(), buf.len());
    for prefix_len in (1..=largest_match_len).rev() {
        let suffix_begin = buf.len() - prefix_len;
        if buf[suffix_begin..] == target[..prefix_len] {
            return Some(suffix_begin);
        }
    }
    None
}

// Exact match of `target` anywhere in `buf`, falling back to a prefix of
// `target` in the suffix of `buf`. Brute force is fine: this only runs on
// garbled input.
fn position_or_partial_match(buf: &[u8], target: &[u8]) -> Option<usize> {
    buf.windows(target.len())
        .position(|window| window == target)
        .or_else(|| partial_match_in_suffix(buf, target))
}
