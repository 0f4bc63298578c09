//! Frame encoding and stream framing
//!
//! Every exchange is a fixed 3-byte frame in both directions:
//! - request: `[opcode, address, data]`
//! - response: `[value, 0, 0]` or one of the error sentinels

use bytes::BytesMut;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::codec::Decoder;
use tracing::debug;

use super::{Opcode, FRAME_LEN};

/// An outgoing 3-byte protocol frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    /// Build a frame from its three fields
    pub fn new(opcode: Opcode, address: u8, data: u8) -> Self {
        Self([opcode.byte(), address, data])
    }

    /// Wrap raw bytes as a frame
    pub fn from_bytes(bytes: [u8; FRAME_LEN]) -> Self {
        Self(bytes)
    }

    /// Decoded opcode, if the first byte is a known command
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_byte(self.0[0])
    }

    /// Address byte
    pub fn address(&self) -> u8 {
        self.0[1]
    }

    /// Data byte
    pub fn data(&self) -> u8 {
        self.0[2]
    }

    /// Raw bytes as written to the wire
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x} {:02x} {:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// Splits an incoming byte stream into response frames
///
/// Serial reads arrive in arbitrary chunks, so bytes are buffered until a full
/// frame is available. Two things keep a bad reply from shifting every later
/// frame:
/// - the driver raises the shared stale flag before each write and on timeout,
///   and bytes buffered before that point are dropped on the next decode;
/// - the reader hands a partial frame up through [`flush`](Self::flush) once the
///   line goes quiet, where it classifies as malformed.
///
/// Bytes left over when the stream ends are handed out as a short frame too.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    /// Bytes in the buffer that predate the latest read
    held: usize,
    stale: Option<Arc<AtomicBool>>,
}

impl ResponseDecoder {
    /// Decoder that honours a stale-input flag shared with the writer side
    pub fn with_stale_flag(stale: Arc<AtomicBool>) -> Self {
        Self { held: 0, stale: Some(stale) }
    }

    fn take_stale(&self) -> bool {
        self.stale
            .as_ref()
            .is_some_and(|flag| flag.swap(false, Ordering::AcqRel))
    }

    /// Take whatever partial frame is buffered
    ///
    /// Returns `None` if the buffer is empty or its bytes were marked stale.
    pub fn flush(&mut self, src: &mut BytesMut) -> Option<Vec<u8>> {
        let stale = self.take_stale();
        self.held = 0;
        if src.is_empty() {
            return None;
        }
        let tail = src.split();
        if stale {
            debug!(bytes = ?&tail[..], "dropping stale partial response");
            return None;
        }
        Some(tail.to_vec())
    }
}

impl Decoder for ResponseDecoder {
    type Item = Vec<u8>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.take_stale() && self.held > 0 {
            let dropped = src.split_to(self.held.min(src.len()));
            debug!(bytes = ?&dropped[..], "dropping stale input");
        }
        if src.len() < FRAME_LEN {
            self.held = src.len();
            return Ok(None);
        }
        let frame = src.split_to(FRAME_LEN).to_vec();
        self.held = src.len();
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        Ok(self.flush(src))
    }
}
