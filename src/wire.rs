//! # Wire Encoding
//!
//! Every message starts with a one-byte type tag followed by its fields.
//! Variable-length fields carry a big-endian `u16` length prefix bounded by
//! the configured maximum field length.
//!
//! ## Field Format
//!
//! ```text
//! +----------+-----------+
//! | Length   | Bytes     |
//! | 2 bytes  | <= max    |
//! +----------+-----------+
//! ```
//!
//! Decoding is incremental: a reader over a partial buffer returns `Ok(None)`
//! until the whole message is present, and an oversized length prefix is
//! rejected as soon as it is visible.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::MAX_FIELD_LEN;

/// Size of a field length prefix
pub const FIELD_LEN_SIZE: usize = 2;

/// Message types in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client opens the handshake
    AuthStart = 0x01,
    /// Server answer with key share, certificate and signature
    AuthServerAns = 0x02,
    /// Client signature over the transcript
    AuthClientFinish = 0x03,
    /// Rename a file
    RenameReq = 0x10,
    /// Rename outcome
    RenameAns = 0x11,
    /// End the session
    LogoutReq = 0x20,
    /// Logout acknowledgement
    LogoutAns = 0x21,
}

impl MessageType {
    /// Whether this type travels inside an encrypted channel frame
    pub fn is_application(self) -> bool {
        !matches!(
            self,
            MessageType::AuthStart | MessageType::AuthServerAns | MessageType::AuthClientFinish
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::AuthStart),
            0x02 => Ok(MessageType::AuthServerAns),
            0x03 => Ok(MessageType::AuthClientFinish),
            0x10 => Ok(MessageType::RenameReq),
            0x11 => Ok(MessageType::RenameAns),
            0x20 => Ok(MessageType::LogoutReq),
            0x21 => Ok(MessageType::LogoutAns),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Cursor over a possibly incomplete receive buffer
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
    max_field_len: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8], max_field_len: usize) -> Self {
        Self {
            data,
            pos: 0,
            max_field_len: max_field_len.min(u16::MAX as usize),
        }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn u64(&mut self) -> Option<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Some(u64::from_be_bytes(raw))
    }

    pub fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    /// Read the type tag and require it to be `expected`
    pub fn expect_type(&mut self, expected: MessageType) -> ProtocolResult<Option<()>> {
        let Some(tag) = self.u8() else {
            return Ok(None);
        };
        let actual = MessageType::try_from(tag)?;
        if actual != expected {
            return Err(ProtocolError::UnexpectedMessage { expected, actual });
        }
        Ok(Some(()))
    }

    /// Read a length-prefixed field
    pub fn field(&mut self) -> ProtocolResult<Option<&'a [u8]>> {
        let Some(prefix) = self.array::<FIELD_LEN_SIZE>() else {
            return Ok(None);
        };
        let len = u16::from_be_bytes(prefix) as usize;
        if len > self.max_field_len {
            return Err(ProtocolError::FieldTooLarge {
                size: len,
                max: self.max_field_len,
            });
        }
        Ok(self.take(len))
    }

    /// Read a length-prefixed field that must have exactly `N` bytes
    pub fn fixed_field<const N: usize>(&mut self, what: &str) -> ProtocolResult<Option<[u8; N]>> {
        let Some(bytes) = self.field()? else {
            return Ok(None);
        };
        if bytes.len() != N {
            return Err(ProtocolError::MalformedMessage(format!(
                "{} must be {} bytes, got {}",
                what,
                N,
                bytes.len()
            )));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(Some(out))
    }
}

/// Encoder writing messages into an outgoing buffer
pub struct WireWriter<'a> {
    buf: &'a mut BytesMut,
    max_field_len: usize,
}

impl<'a> WireWriter<'a> {
    pub fn new(buf: &'a mut BytesMut, max_field_len: usize) -> Self {
        Self {
            buf,
            max_field_len: max_field_len.min(u16::MAX as usize),
        }
    }

    pub fn put_type(&mut self, message_type: MessageType) {
        self.buf.put_u8(message_type as u8);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write a length-prefixed field. Oversized fields are a fatal error,
    /// they are never truncated.
    pub fn put_field(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        if bytes.len() > self.max_field_len {
            return Err(ProtocolError::FieldTooLarge {
                size: bytes.len(),
                max: self.max_field_len,
            });
        }
        self.buf.put_u16(bytes.len() as u16);
        self.buf.put_slice(bytes);
        Ok(())
    }
}

/// A message with a wire representation
pub trait WireMessage: Sized {
    fn encode(&self, w: &mut WireWriter<'_>) -> ProtocolResult<()>;

    /// Decode one message, or `Ok(None)` when more bytes are needed
    fn decode(r: &mut WireReader<'_>) -> ProtocolResult<Option<Self>>;

    /// Encode into a fresh buffer
    fn to_bytes(&self, max_field_len: usize) -> ProtocolResult<BytesMut> {
        let mut buf = BytesMut::new();
        self.encode(&mut WireWriter::new(&mut buf, max_field_len))?;
        Ok(buf)
    }

    /// Decode from a complete buffer
    fn from_bytes(data: &[u8], max_field_len: usize) -> ProtocolResult<Self> {
        let mut reader = WireReader::new(data, max_field_len);
        let msg = Self::decode(&mut reader)?
            .ok_or_else(|| ProtocolError::MalformedMessage("Truncated message".to_string()))?;
        if reader.position() != data.len() {
            return Err(ProtocolError::MalformedMessage(format!(
                "{} trailing bytes",
                data.len() - reader.position()
            )));
        }
        Ok(msg)
    }
}

/// Message decoder for streaming reads
pub struct MessageDecoder {
    buffer: BytesMut,
    max_field_len: usize,
}

impl MessageDecoder {
    /// Create a new decoder
    pub fn new(max_field_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_field_len * 2),
            max_field_len,
        }
    }

    /// Add data to the buffer
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next message, consuming its bytes only on success
    pub fn decode<M: WireMessage>(&mut self) -> ProtocolResult<Option<M>> {
        let mut reader = WireReader::new(&self.buffer, self.max_field_len);
        match M::decode(&mut reader)? {
            Some(msg) => {
                let consumed = reader.position();
                self.buffer.advance(consumed);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Peek at the type tag of the next buffered message
    pub fn peek_type(&self) -> ProtocolResult<Option<MessageType>> {
        match self.buffer.first() {
            Some(&tag) => MessageType::try_from(tag).map(Some),
            None => Ok(None),
        }
    }

    /// Get remaining buffered data length
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(MAX_FIELD_LEN)
    }
}
