use std::io::Write;

/// Accumulates the FIX checksum of everything written through it.
pub struct ChecksumWriter<W>(W, usize);

impl<W> Write for ChecksumWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for c in buf {
            self.1 += (*c) as usize;
        }
        self.0.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl<W> ChecksumWriter<W> {
    pub fn new(w: W) -> Self {
        ChecksumWriter(w, 0)
    }
    pub fn checksum(&self) -> usize {
        self.1 % 256
    }
}

pub fn calc_checksum(bytes: &[u8]) -> u32 {
    bytes.iter().map(|c| *c as u32).sum::<u32>() % 256
}

/// Reads the declared value out of a `10=NNN<SOH>` trailer.
pub(super) fn parse_checksum(msg_buf: &[u8]) -> Option<u32> {
    if msg_buf.len() < 7 {
        return None;
    }
    let tail = &msg_buf[msg_buf.len() - 7..];
    if &tail[0..3] != b"10="
        || !tail[3..6].iter().all(|&byte| byte.is_ascii_digit())
        || tail[6] != b'\x01'
    {
        return None;
    }

    std::str::from_utf8(&tail[3..6]).unwrap_or("").parse().ok()
}
