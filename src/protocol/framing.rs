//! Stateful codec for the exchange wire format.
//!
//! A connection starts in the identify phase, where the codec reads or
//! writes exactly one newline-terminated identification line. It then
//! shifts to the envelope phase, where every frame is a 4-byte big-endian
//! length prefix followed by a JSON envelope body:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Body             |
//! +----------------------------+------------------+
//! ```
//!
//! The frame length is validated against the configured maximum before any
//! allocation occurs, and the identification phase enforces its own much
//! smaller bound, so a hostile peer cannot make either phase allocate
//! unbounded memory.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{MAX_FRAME_SIZE, MAX_IDENTIFICATION_LINE, ProtocolError, ProtocolResult};
use crate::messages::Envelope;
use crate::protocol::identification::RemoteIdentity;

/// Length of the envelope frame header.
const HEADER_LEN: usize = 4;

/// One frame on the wire.
#[derive(Debug, Clone)]
pub enum Frame {
    /// The opening identification line.
    Identification(RemoteIdentity),
    /// A request or response envelope.
    Envelope(Envelope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Identify,
    Envelopes,
}

/// Codec driving both phases of the exchange wire format.
///
/// The phase advances when an identification frame is encoded (dialing
/// side) or decoded (listening side); each side passes through the
/// identify phase exactly once.
#[derive(Debug)]
pub struct ExchangeCodec {
    phase: Phase,
    max_frame_size: usize,
}

impl ExchangeCodec {
    /// Creates a codec in the identify phase.
    ///
    /// # Panics
    ///
    /// Panics if `max_frame_size` exceeds [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        assert!(
            max_frame_size <= MAX_FRAME_SIZE,
            "max_frame_size {max_frame_size} exceeds protocol limit {MAX_FRAME_SIZE}"
        );
        Self {
            phase: Phase::Identify,
            max_frame_size,
        }
    }

    fn decode_identification(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Frame>> {
        let Some(terminator) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > MAX_IDENTIFICATION_LINE {
                return Err(ProtocolError::IdentificationTooLong {
                    max: MAX_IDENTIFICATION_LINE,
                });
            }
            return Ok(None);
        };
        if terminator + 1 > MAX_IDENTIFICATION_LINE {
            return Err(ProtocolError::IdentificationTooLong {
                max: MAX_IDENTIFICATION_LINE,
            });
        }

        let line = src.split_to(terminator + 1);
        let text = std::str::from_utf8(&line[..terminator]).map_err(|_| {
            ProtocolError::BadIdentification {
                line: String::from_utf8_lossy(&line[..terminator]).into_owned(),
            }
        })?;
        let identity = RemoteIdentity::parse_line(text)?;
        self.phase = Phase::Envelopes;
        Ok(Some(Frame::Identification(identity)))
    }

    fn decode_envelope(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Length is validated before any allocation.
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(length);
        let envelope: Envelope = serde_json::from_slice(&body)?;
        Ok(Some(Frame::Envelope(envelope)))
    }
}

impl Decoder for ExchangeCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Frame>> {
        match self.phase {
            Phase::Identify => self.decode_identification(src),
            Phase::Envelopes => self.decode_envelope(src),
        }
    }
}

impl Encoder<Frame> for ExchangeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> ProtocolResult<()> {
        match frame {
            Frame::Identification(identity) => {
                dst.extend_from_slice(identity.to_line().as_bytes());
                self.phase = Phase::Envelopes;
                Ok(())
            }
            Frame::Envelope(envelope) => {
                let body = serde_json::to_vec(&envelope)?;
                if body.len() > self.max_frame_size {
                    return Err(ProtocolError::FrameTooLarge {
                        size: body.len(),
                        max: self.max_frame_size,
                    });
                }
                dst.reserve(HEADER_LEN + body.len());
                #[allow(clippy::cast_possible_truncation)] // validated above
                dst.put_u32(body.len() as u32);
                dst.extend_from_slice(&body);
                Ok(())
            }
        }
    }
}
