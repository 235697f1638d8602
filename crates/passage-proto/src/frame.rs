//! Multiplexer frame format.
//!
//! Every frame carries a fixed 10-byte big-endian header followed by the
//! payload:
//!
//! ```text
//! 0        4     5     6        10
//! +--------+-----+-----+--------+-------------+
//! | stream | typ | flg | length | payload ... |
//! |  u32   | u8  | u8  |  u32   |             |
//! +--------+-----+-----+--------+-------------+
//! ```
//!
//! Stream 0 is reserved for connection-level frames. Client-opened
//! streams use odd IDs, server-opened streams even IDs.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Stream identifier.
pub type StreamId = u32;

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    WindowUpdate = 1,
    Ping = 2,
    GoAway = 3,
    Fin = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::WindowUpdate),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::GoAway),
            4 => Ok(FrameType::Fin),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags.
///
/// `SYN` marks the first frame of a new stream, `ACK` marks a ping
/// reply, `RST` aborts a stream without draining.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const SYN: u8 = 0b0000_0001;
    pub const ACK: u8 = 0b0000_0010;
    pub const RST: u8 = 0b0000_0100;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_syn(mut self) -> Self {
        self.0 |= Self::SYN;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// A multiplexer frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Header size: stream_id (4) + type (1) + flags (1) + length (4).
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    /// Window update crediting `delta` bytes to the sender.
    pub fn window_update(stream_id: StreamId, delta: u32) -> Self {
        Self::new(
            stream_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&delta.to_be_bytes()),
        )
    }

    /// Ping with an opaque sequence number, sent on stream 0.
    pub fn ping(seq: u64) -> Self {
        Self::new(
            crate::CONTROL_STREAM_ID,
            FrameType::Ping,
            Bytes::copy_from_slice(&seq.to_be_bytes()),
        )
    }

    pub fn go_away() -> Self {
        Self::new(crate::CONTROL_STREAM_ID, FrameType::GoAway, Bytes::new())
    }

    pub fn fin(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Fin, Bytes::new())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Decode the 4-byte big-endian window delta of a `WindowUpdate`.
    pub fn window_delta(&self) -> Result<u32, FrameError> {
        if self.payload.len() != 4 {
            return Err(FrameError::Malformed("window update payload"));
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.payload);
        Ok(u32::from_be_bytes(buf))
    }

    /// Decode the 8-byte big-endian sequence number of a `Ping`.
    pub fn ping_seq(&self) -> Result<u64, FrameError> {
        if self.payload.len() != 8 {
            return Err(FrameError::Malformed("ping payload"));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.payload);
        Ok(u64::from_be_bytes(buf))
    }

    /// Encode this frame into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_PAYLOAD as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        buf.reserve(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());
        Ok(())
    }

    /// Encode this frame into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Incremental frame decoder over a byte stream.
///
/// Feed raw bytes into [`FrameDecoder::buffer`] and call
/// [`FrameDecoder::decode`] until it returns `None`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// The internal accumulation buffer. Append incoming bytes here.
    pub fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Try to decode one complete frame. Returns `None` when more bytes
    /// are needed.
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &self.buf[..Frame::HEADER_SIZE];
        let stream_id = header.get_u32();
        let type_byte = header.get_u8();
        let flag_byte = header.get_u8();
        let length = header.get_u32();

        if length > crate::MAX_FRAME_PAYLOAD {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        if self.buf.len() < Frame::HEADER_SIZE + length as usize {
            return Ok(None);
        }

        // Validate the type only once the full frame is buffered so a
        // decode error always consumes the offending frame.
        self.buf.advance(Frame::HEADER_SIZE);
        let payload = self.buf.split_to(length as usize).freeze();
        let frame_type = FrameType::try_from(type_byte)?;

        Ok(Some(Frame {
            stream_id,
            frame_type,
            flags: FrameFlags::from_u8(flag_byte),
            payload,
        }))
    }
}
