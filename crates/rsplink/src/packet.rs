use std::io::{self, Read};

use crate::codec::CSUM_LEN;

/// Leading frame byte of an RSP packet.
pub(crate) const PACKET_START: u8 = b'$';
/// Separator between the payload and the checksum trailer.
pub(crate) const PACKET_END: u8 = b'#';

/// Granularity of one `fill_from` read.
const READ_CHUNK: usize = 4096;

/// One complete `$<payload>#<cc>` frame popped out of a [`PacketBuf`].
#[derive(Debug)]
pub(crate) struct Packet {
    data: Vec<u8>,
}

impl Packet {
    /// Raw frame bytes, `$` through the final checksum digit.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Payload between `$` and `#`. Empty for a bare `$#00`.
    pub fn body(&self) -> &[u8] {
        &self.data[1..self.data.len() - CSUM_LEN - 1]
    }

    /// The two trailing checksum digits.
    pub fn csum_digits(&self) -> &[u8] {
        &self.data[self.data.len() - CSUM_LEN..]
    }
}

/// Reassembles the inbound byte stream into discrete RSP frames.
///
/// Bytes are appended by [`fill_from`](Self::fill_from); once
/// [`is_complete`](Self::is_complete) reports a full frame,
/// [`pop`](Self::pop) splits it off and left-shifts the remainder so
/// offset 0 is the next unconsumed byte.
pub(crate) struct PacketBuf {
    data: Vec<u8>,
    /// Index of the final checksum digit of the first complete frame.
    end_pos: Option<usize>,
}

impl PacketBuf {
    pub fn new() -> Self {
        Self { data: Vec::with_capacity(READ_CHUNK), end_pos: None }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Appends one bounded read from `source`. Zero-byte reads (peer EOF)
    /// and errors are surfaced untouched; the caller decides what counts
    /// as a disconnect.
    pub fn fill_from<R: Read>(&mut self, source: &mut R) -> io::Result<usize> {
        let len = self.data.len();
        self.data.resize(len + READ_CHUNK, 0);
        match source.read(&mut self.data[len..]) {
            Ok(read) => {
                self.data.truncate(len + read);
                Ok(read)
            }
            Err(err) => {
                self.data.truncate(len);
                Err(err)
            }
        }
    }

    /// True when the buffer holds at least one full `$…#cc` frame.
    ///
    /// Garbage before `$` (client acks, line noise) is discarded. A buffer
    /// with no `$` at all resets to empty, which is the resync point for a
    /// desynchronized stream.
    pub fn is_complete(&mut self) -> bool {
        if self.end_pos.is_some() {
            return true;
        }
        match self.data.iter().position(|&b| b == PACKET_START) {
            Some(0) => {}
            Some(start) => {
                self.data.drain(..start);
            }
            None => {
                self.data.clear();
                return false;
            }
        }
        if let Some(hash) = self.data.iter().position(|&b| b == PACKET_END) {
            let end = hash + CSUM_LEN;
            if end < self.data.len() {
                self.end_pos = Some(end);
                return true;
            }
        }
        false
    }

    /// Splits off the first complete frame, or `None` when no frame has
    /// been seen yet.
    pub fn pop(&mut self) -> Option<Packet> {
        let end = self.end_pos.take()?;
        let rest = self.data.split_off(end + 1);
        let frame = std::mem::replace(&mut self.data, rest);
        Some(Packet { data: frame })
    }

    /// Drops everything buffered, framed or not.
    pub fn reset(&mut self) {
        self.data.clear();
        self.end_pos = None;
    }
}
