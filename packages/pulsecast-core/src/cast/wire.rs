//! Cast v2 wire format.
//!
//! Each direction of the control channel is a stream of frames: a 4-byte
//! big-endian length followed by that many bytes of a protobuf-encoded
//! `CastMessage`. The envelope uses six fields and is simple enough that it
//! is encoded and decoded by hand:
//!
//! | field | type   | content                      |
//! |-------|--------|------------------------------|
//! | 1     | varint | protocol version (CASTV2_1_0) |
//! | 2     | string | source id                    |
//! | 3     | string | destination id               |
//! | 4     | string | namespace                    |
//! | 5     | varint | payload type (0 STRING, 1 BINARY) |
//! | 6     | string | UTF-8 payload                |
//! | 7     | bytes  | binary payload               |

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame body. Anything larger is a protocol violation.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

/// CASTV2_1_0, the only protocol version in use.
const PROTOCOL_VERSION: u64 = 0;

/// Payload kind carried by a [`CastMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadType {
    /// UTF-8 JSON payload. The daemon only ever uses this.
    #[default]
    String,
    /// Raw binary payload. Accepted on the wire, never produced.
    Binary,
}

/// The protobuf envelope every control-channel frame carries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CastMessage {
    pub source_id: String,
    pub destination_id: String,
    pub namespace: String,
    pub payload_type: PayloadType,
    pub payload_utf8: String,
    pub payload_binary: Vec<u8>,
}

impl CastMessage {
    /// Builds a STRING-payload message.
    pub fn string(
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        namespace: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload_type: PayloadType::String,
            payload_utf8: payload.into(),
            payload_binary: Vec::new(),
        }
    }

    /// Encodes the envelope to protobuf bytes (without the length prefix).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            16 + self.source_id.len()
                + self.destination_id.len()
                + self.namespace.len()
                + self.payload_utf8.len()
                + self.payload_binary.len(),
        );
        put_varint_field(&mut out, 1, PROTOCOL_VERSION);
        put_bytes_field(&mut out, 2, self.source_id.as_bytes());
        put_bytes_field(&mut out, 3, self.destination_id.as_bytes());
        put_bytes_field(&mut out, 4, self.namespace.as_bytes());
        let payload_type = match self.payload_type {
            PayloadType::String => 0,
            PayloadType::Binary => 1,
        };
        put_varint_field(&mut out, 5, payload_type);
        match self.payload_type {
            PayloadType::String => put_bytes_field(&mut out, 6, self.payload_utf8.as_bytes()),
            PayloadType::Binary => put_bytes_field(&mut out, 7, &self.payload_binary),
        }
        out
    }

    /// Decodes a protobuf envelope. Unknown fields are skipped.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut message = CastMessage::default();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            let key = read_varint(bytes, &mut cursor).ok_or(WireError::Truncated)?;
            let field = (key >> 3) as u32;
            let wire_type = (key & 0x07) as u8;
            match wire_type {
                0 => {
                    let value = read_varint(bytes, &mut cursor).ok_or(WireError::Truncated)?;
                    if field == 5 {
                        message.payload_type = match value {
                            0 => PayloadType::String,
                            1 => PayloadType::Binary,
                            other => return Err(WireError::BadPayloadType(other)),
                        };
                    }
                }
                2 => {
                    let len =
                        read_varint(bytes, &mut cursor).ok_or(WireError::Truncated)? as usize;
                    let end = cursor.checked_add(len).ok_or(WireError::Truncated)?;
                    if end > bytes.len() {
                        return Err(WireError::Truncated);
                    }
                    let data = &bytes[cursor..end];
                    cursor = end;
                    match field {
                        2 => message.source_id = utf8(data)?,
                        3 => message.destination_id = utf8(data)?,
                        4 => message.namespace = utf8(data)?,
                        6 => message.payload_utf8 = utf8(data)?,
                        7 => message.payload_binary = data.to_vec(),
                        _ => {}
                    }
                }
                other => return Err(WireError::UnsupportedWireType(other)),
            }
        }
        Ok(message)
    }
}

/// Envelope decoding failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated protobuf envelope")]
    Truncated,
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("unsupported protobuf wire type {0}")]
    UnsupportedWireType(u8),
    #[error("unknown payload type {0}")]
    BadPayloadType(u64),
}

fn utf8(data: &[u8]) -> Result<String, WireError> {
    String::from_utf8(data.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn put_varint_field(out: &mut Vec<u8>, field: u32, value: u64) {
    put_varint(out, u64::from(field) << 3);
    put_varint(out, value);
}

fn put_bytes_field(out: &mut Vec<u8>, field: u32, data: &[u8]) {
    put_varint(out, (u64::from(field) << 3) | 2);
    put_varint(out, data.len() as u64);
    out.extend_from_slice(data);
}

fn read_varint(bytes: &[u8], cursor: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    while *cursor < bytes.len() && shift <= 63 {
        let byte = bytes[*cursor];
        *cursor += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}

/// Outcome of reading one frame.
#[derive(Debug)]
pub enum FrameRead {
    /// A complete frame was read and decoded.
    Message(CastMessage),
    /// The peer closed the stream (TCP EOF or TLS truncation).
    PeerClosed,
}

/// Fatal framing failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The announced body length exceeds [`MAX_FRAME_LEN`]. The body is not
    /// read.
    #[error("received too big message: {0} bytes")]
    Oversized(u32),
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame decode failed: {0}")]
    Decode(#[from] WireError),
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &CastMessage,
) -> std::io::Result<()> {
    let body = message.encode();
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame.
///
/// EOF anywhere (at the header boundary or mid-body) reports
/// [`FrameRead::PeerClosed`]; the TLS layer surfaces a truncated close the
/// same way, and both mean the peer went away rather than a local fault.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<FrameRead, FrameError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if is_peer_close(&e) => return Ok(FrameRead::PeerClosed),
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_be_bytes(header);
    if length > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(length));
    }

    let mut body = vec![0u8; length as usize];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if is_peer_close(&e) => return Ok(FrameRead::PeerClosed),
        Err(e) => return Err(e.into()),
    }
    Ok(FrameRead::Message(CastMessage::decode(&body)?))
}

fn is_peer_close(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn ping() -> CastMessage {
        CastMessage::string(
            "sender-0",
            "receiver-0",
            "urn:x-cast:com.google.cast.tp.heartbeat",
            "{\"type\":\"PING\"}",
        )
    }

    #[test]
    fn envelope_roundtrip() {
        let message = ping();
        let decoded = CastMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn envelope_skips_unknown_fields() {
        let mut bytes = ping().encode();
        // Field 9, varint 7 - something a newer sender might add.
        bytes.extend_from_slice(&[0x48, 0x07]);
        let decoded = CastMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, ping());
    }

    #[test]
    fn truncated_envelope_is_an_error() {
        let bytes = ping().encode();
        assert_eq!(
            CastMessage::decode(&bytes[..bytes.len() - 3]),
            Err(WireError::Truncated)
        );
    }

    #[tokio::test]
    async fn frame_roundtrip_over_loopback() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let message = ping();
        write_frame(&mut a, &message).await.unwrap();
        match read_frame(&mut b).await.unwrap() {
            FrameRead::Message(decoded) => assert_eq!(decoded, message),
            other => panic!("unexpected read result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_length_frame_is_accepted() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&0u32.to_be_bytes()).await.unwrap();
        match read_frame(&mut b).await.unwrap() {
            FrameRead::Message(message) => assert_eq!(message, CastMessage::default()),
            other => panic!("unexpected read result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_reading_body() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // 2 MiB announced, no body bytes at all.
        a.write_all(&0x0020_0000u32.to_be_bytes()).await.unwrap();
        match read_frame(&mut b).await {
            Err(FrameError::Oversized(len)) => assert_eq!(len, 0x0020_0000),
            other => panic!("unexpected read result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_at_header_boundary_is_peer_close() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        match read_frame(&mut b).await.unwrap() {
            FrameRead::PeerClosed => {}
            other => panic!("unexpected read result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_mid_body_is_peer_close() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0x0a, 0x02]).await.unwrap();
        drop(a);
        match read_frame(&mut b).await.unwrap() {
            FrameRead::PeerClosed => {}
            other => panic!("unexpected read result: {other:?}"),
        }
    }

    #[test]
    fn varint_roundtrip_multi_byte() {
        let mut out = Vec::new();
        put_varint(&mut out, 623453);
        let mut cursor = 0;
        assert_eq!(read_varint(&out, &mut cursor), Some(623453));
        assert_eq!(cursor, out.len());
    }
}
