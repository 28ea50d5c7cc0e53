//! Wire framing for the batch operation language.
//!
//! Frame format: [call_id varint][kind byte][length varint][payload bytes]
//! Kinds: HEADERS(1), MESSAGE(2), CLOSE(3), TRAILERS(4), CANCEL(5)
//!
//! A client-to-server HEADERS payload is a [`RequestHead`]; a server-to-client
//! HEADERS payload is a bare metadata block. TRAILERS carry a [`Trailers`]
//! payload. CLOSE and CANCEL are empty.

use crate::error::WeftError;
use crate::metadata::{is_binary_key, Metadata, MetadataValue};
use crate::status::{Code, Status};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame payload size (4MB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Frame kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Headers = 1,
    Message = 2,
    Close = 3,
    Trailers = 4,
    Cancel = 5,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(FrameKind::Headers),
            2 => Ok(FrameKind::Message),
            3 => Ok(FrameKind::Close),
            4 => Ok(FrameKind::Trailers),
            5 => Ok(FrameKind::Cancel),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// A frame on a weft connection, addressed to one call.
#[derive(Debug, Clone)]
pub struct Frame {
    pub call_id: u32,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn headers(call_id: u32, payload: Bytes) -> Self {
        Self {
            call_id,
            kind: FrameKind::Headers,
            payload,
        }
    }

    pub fn message(call_id: u32, payload: Bytes) -> Self {
        Self {
            call_id,
            kind: FrameKind::Message,
            payload,
        }
    }

    pub fn close(call_id: u32) -> Self {
        Self {
            call_id,
            kind: FrameKind::Close,
            payload: Bytes::new(),
        }
    }

    pub fn trailers(call_id: u32, payload: Bytes) -> Self {
        Self {
            call_id,
            kind: FrameKind::Trailers,
            payload,
        }
    }

    pub fn cancel(call_id: u32) -> Self {
        Self {
            call_id,
            kind: FrameKind::Cancel,
            payload: Bytes::new(),
        }
    }

    /// Encode this frame to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 12);
        encode_varint(self.call_id as u64, &mut buf);
        buf.put_u8(self.kind as u8);
        encode_varint(self.payload.len() as u64, &mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Incremental frame parser fed from a byte stream.
pub struct FrameParser {
    buffer: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Add data to the parser buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to parse a complete frame from the buffer.
    pub fn parse_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut cursor = std::io::Cursor::new(&self.buffer[..]);

        let call_id = match decode_varint(&mut cursor) {
            Some(id) => id as u32,
            None => return Ok(None), // Need more data
        };

        if !cursor.has_remaining() {
            return Ok(None);
        }
        let kind = FrameKind::from_u8(cursor.get_u8())?;

        let payload_len = match decode_varint(&mut cursor) {
            Some(len) => len as usize,
            None => return Ok(None),
        };
        if payload_len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        let header_len = cursor.position() as usize;
        let total_len = header_len + payload_len;
        if self.buffer.len() < total_len {
            return Ok(None); // Need more data
        }

        self.buffer.advance(header_len);
        let payload = self.buffer.split_to(payload_len).freeze();

        Ok(Some(Frame {
            call_id,
            kind,
            payload,
        }))
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("truncated frame payload")]
    Truncated,

    #[error("invalid metadata entry: {0}")]
    InvalidMetadata(String),

    #[error("invalid UTF-8 in text field")]
    InvalidUtf8,
}

/// Head of a client-to-server call: method path, authority, relative timeout
/// (0 = no deadline), and initial metadata.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub path: String,
    pub authority: String,
    pub timeout_ms: u64,
    pub metadata: Metadata,
}

impl RequestHead {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&self.path, &mut buf);
        put_string(&self.authority, &mut buf);
        encode_varint(self.timeout_ms, &mut buf);
        encode_metadata(&self.metadata, &mut buf);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, FrameError> {
        let path = take_string(&mut payload)?;
        let authority = take_string(&mut payload)?;
        let timeout_ms = decode_varint(&mut payload).ok_or(FrameError::Truncated)?;
        let metadata = decode_metadata(&mut payload)?;
        Ok(Self {
            path,
            authority,
            timeout_ms,
            metadata,
        })
    }
}

/// Terminal frame payload: status code, details, trailing metadata.
#[derive(Debug, Clone)]
pub struct Trailers {
    pub code: Code,
    pub details: String,
    pub metadata: Metadata,
}

impl Trailers {
    pub fn from_status(status: &Status) -> Self {
        Self {
            code: status.code(),
            details: status.details().to_string(),
            metadata: status.metadata().clone(),
        }
    }

    pub fn into_status(self) -> Status {
        Status::new(self.code, self.details).with_metadata(self.metadata)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        encode_varint(self.code as u64, &mut buf);
        put_string(&self.details, &mut buf);
        encode_metadata(&self.metadata, &mut buf);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, FrameError> {
        let code = Code::from_u32(decode_varint(&mut payload).ok_or(FrameError::Truncated)? as u32);
        let details = take_string(&mut payload)?;
        let metadata = decode_metadata(&mut payload)?;
        Ok(Self {
            code,
            details,
            metadata,
        })
    }
}

/// Encode a metadata block: entry count, then length-prefixed key and value
/// bytes per entry.
pub fn encode_metadata(metadata: &Metadata, buf: &mut BytesMut) {
    encode_varint(metadata.len() as u64, buf);
    for (key, value) in metadata.iter() {
        put_string(key, buf);
        encode_varint(value.as_bytes().len() as u64, buf);
        buf.put_slice(value.as_bytes());
    }
}

/// Decode a metadata block. Value typing follows the `-bin` key suffix.
pub fn decode_metadata(buf: &mut impl Buf) -> Result<Metadata, FrameError> {
    let count = decode_varint(buf).ok_or(FrameError::Truncated)?;
    let mut metadata = Metadata::new();
    for _ in 0..count {
        let key = take_string(buf)?;
        let value_bytes = take_bytes(buf)?;
        let value = if is_binary_key(&key) {
            MetadataValue::Binary(value_bytes)
        } else {
            MetadataValue::Text(
                String::from_utf8(value_bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8)?,
            )
        };
        metadata
            .add(key, value)
            .map_err(|e: WeftError| FrameError::InvalidMetadata(e.to_string()))?;
    }
    Ok(metadata)
}

/// Encode a bare metadata block as a frame payload (server-side HEADERS).
pub fn encode_metadata_payload(metadata: &Metadata) -> Bytes {
    let mut buf = BytesMut::new();
    encode_metadata(metadata, &mut buf);
    buf.freeze()
}

/// Decode a bare metadata block frame payload.
pub fn decode_metadata_payload(mut payload: Bytes) -> Result<Metadata, FrameError> {
    decode_metadata(&mut payload)
}

fn put_string(value: &str, buf: &mut BytesMut) {
    encode_varint(value.len() as u64, buf);
    buf.put_slice(value.as_bytes());
}

fn take_string(buf: &mut impl Buf) -> Result<String, FrameError> {
    let bytes = take_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8)
}

fn take_bytes(buf: &mut impl Buf) -> Result<Bytes, FrameError> {
    let len = decode_varint(buf).ok_or(FrameError::Truncated)? as usize;
    if buf.remaining() < len {
        return Err(FrameError::Truncated);
    }
    Ok(buf.copy_to_bytes(len))
}

/// Encode a u64 as a varint.
fn encode_varint(mut value: u64, buf: &mut BytesMut) {
    loop {
        if value < 0x80 {
            buf.put_u8(value as u8);
            break;
        } else {
            buf.put_u8(((value & 0x7F) | 0x80) as u8);
            value >>= 7;
        }
    }
}

/// Decode a varint. Returns `None` when the buffer runs out mid-value.
fn decode_varint<B: Buf>(buf: &mut B) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return None;
        }

        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;

        if byte < 0x80 {
            return Some(value);
        }

        shift += 7;
        if shift >= 64 {
            return None; // Overflow
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 150, 300, u32::MAX as u64] {
            let mut buf = BytesMut::new();
            encode_varint(value, &mut buf);
            let mut cursor = std::io::Cursor::new(&buf[..]);
            assert_eq!(decode_varint(&mut cursor), Some(value));
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let original = Frame::message(7, Bytes::from("hello"));
        let encoded = original.encode();

        let mut parser = FrameParser::new();
        parser.feed(&encoded);

        let decoded = parser.parse_frame().unwrap().unwrap();
        assert_eq!(decoded.call_id, 7);
        assert_eq!(decoded.kind, FrameKind::Message);
        assert_eq!(decoded.payload, original.payload);
        assert!(parser.parse_frame().unwrap().is_none());
    }

    #[test]
    fn test_partial_feed() {
        let encoded = Frame::message(1, Bytes::from("split across reads")).encode();
        let mut parser = FrameParser::new();

        parser.feed(&encoded[..3]);
        assert!(parser.parse_frame().unwrap().is_none());

        parser.feed(&encoded[3..]);
        let frame = parser.parse_frame().unwrap().unwrap();
        assert_eq!(frame.payload, Bytes::from("split across reads"));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = BytesMut::new();
        encode_varint(1, &mut buf); // call id
        buf.put_u8(99); // bogus kind
        encode_varint(0, &mut buf);

        let mut parser = FrameParser::new();
        parser.feed(&buf);
        assert!(matches!(
            parser.parse_frame(),
            Err(FrameError::UnknownKind(99))
        ));
    }

    #[test]
    fn test_request_head_roundtrip() {
        let mut metadata = Metadata::new();
        metadata.add("x-tag", "value").unwrap();
        metadata.add("x-blob-bin", vec![1u8, 2, 3]).unwrap();

        let head = RequestHead {
            path: "test.TestService/UnaryCall".to_string(),
            authority: "example.test:50051".to_string(),
            timeout_ms: 2500,
            metadata,
        };

        let decoded = RequestHead::decode(head.encode()).unwrap();
        assert_eq!(decoded.path, head.path);
        assert_eq!(decoded.authority, head.authority);
        assert_eq!(decoded.timeout_ms, 2500);
        assert_eq!(decoded.metadata.first("x-tag").unwrap().as_text(), Some("value"));
        assert_eq!(
            decoded.metadata.first("x-blob-bin").unwrap().as_bytes(),
            &[1, 2, 3]
        );
    }

    #[test]
    fn test_trailers_roundtrip() {
        let mut trailing = Metadata::new();
        trailing.add("x-echo-bin", vec![0xab_u8, 0xab, 0xab]).unwrap();
        let status = Status::new(Code::ResourceExhausted, "too big").with_metadata(trailing);

        let decoded = Trailers::decode(Trailers::from_status(&status).encode()).unwrap();
        assert_eq!(decoded.code, Code::ResourceExhausted);
        assert_eq!(decoded.details, "too big");
        let restored = decoded.into_status();
        assert_eq!(
            restored.metadata().first("x-echo-bin").unwrap().as_bytes(),
            &[0xab, 0xab, 0xab]
        );
    }

    #[test]
    fn test_truncated_payload() {
        let head = RequestHead {
            path: "a.B/C".to_string(),
            authority: String::new(),
            timeout_ms: 0,
            metadata: Metadata::new(),
        };
        let encoded = head.encode();
        let truncated = encoded.slice(..encoded.len() - 1);
        assert!(RequestHead::decode(truncated).is_err());
    }
}
