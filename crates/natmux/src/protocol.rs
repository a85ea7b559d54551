//! Binary frame protocol spoken on the control connection
//!
//! Frame format (big-endian):
//! ```text
//! +----------------+---------+---------------+------------+------------+
//! | FrameLength(4) | Type(1) | HeadLength(4) | Head bytes | Data bytes |
//! +----------------+---------+---------------+------------+------------+
//! ```
//!
//! `FrameLength` counts everything after itself: `1 + 4 + head + data`.
//! Session-scoped messages carry `tunnel_id(8) + session_id(8)` in the head.

use crate::error::{Result, TunnelError};
use crate::request::TunnelRequest;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the leading frame length field
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Type byte plus head length field
pub const FRAME_HEADER_SIZE: usize = 5;

/// Largest accepted `FrameLength` (4 MiB)
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Head length of every session-scoped message
pub const SESSION_HEAD_SIZE: usize = 16;

/// Frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Liveness check
    HeartbeatPing,
    /// Liveness answer
    HeartbeatPong,
    /// Client asks for a tunnel
    Request,
    /// Server accepts or rejects a tunnel
    Response,
    /// Payload for one session
    Transfer,
    /// Server saw a new public connection
    RemoteConnected,
    /// Server saw a public connection close
    RemoteDisconnect,
    /// Client dialed the local service
    LocalConnected,
    /// Client saw the local service close
    LocalDisconnect,
    /// Type byte this build does not know; dropped by handlers
    Unknown(u8),
}

impl MessageType {
    /// Convert to wire format byte
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::HeartbeatPing => 0x01,
            Self::HeartbeatPong => 0x02,
            Self::Request => 0x03,
            Self::Response => 0x04,
            Self::Transfer => 0x05,
            Self::RemoteConnected => 0x06,
            Self::RemoteDisconnect => 0x07,
            Self::LocalConnected => 0x08,
            Self::LocalDisconnect => 0x09,
            Self::Unknown(byte) => byte,
        }
    }

    /// Parse a wire byte; never fails
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::HeartbeatPing,
            0x02 => Self::HeartbeatPong,
            0x03 => Self::Request,
            0x04 => Self::Response,
            0x05 => Self::Transfer,
            0x06 => Self::RemoteConnected,
            0x07 => Self::RemoteDisconnect,
            0x08 => Self::LocalConnected,
            0x09 => Self::LocalDisconnect,
            other => Self::Unknown(other),
        }
    }
}

impl From<u8> for MessageType {
    fn from(byte: u8) -> Self {
        Self::from_byte(byte)
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> Self {
        kind.to_byte()
    }
}

// =============================================================================
// Frame
// =============================================================================

/// Untyped wire unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Type byte
    pub kind: MessageType,
    /// Fixed-purpose header bytes
    pub head: Bytes,
    /// Payload
    pub data: Bytes,
}

impl Frame {
    /// Create a frame
    #[must_use]
    pub fn new(kind: MessageType, head: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            head: head.into(),
            data: data.into(),
        }
    }

    /// Total bytes on the wire, length field included
    #[must_use]
    pub fn wire_len(&self) -> usize {
        LENGTH_FIELD_SIZE + FRAME_HEADER_SIZE + self.head.len() + self.data.len()
    }

    /// Append the encoded frame to `dst`
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode_into(&self, dst: &mut BytesMut) {
        let frame_len = FRAME_HEADER_SIZE + self.head.len() + self.data.len();
        dst.reserve(LENGTH_FIELD_SIZE + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_u8(self.kind.to_byte());
        dst.put_u32(self.head.len() as u32);
        dst.put_slice(&self.head);
        dst.put_slice(&self.data);
    }

    /// Encode to a standalone buffer
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode one frame from the front of `bytes`
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the frame and
    /// the number of bytes it occupied. Input is never consumed partially.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the declared lengths are inconsistent or
    /// exceed [`MAX_FRAME_LENGTH`].
    pub fn decode(bytes: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some((kind, head_len, total)) = parse_header(bytes)? else {
            return Ok(None);
        };
        let head_start = LENGTH_FIELD_SIZE + FRAME_HEADER_SIZE;
        let data_start = head_start + head_len;
        let frame = Self {
            kind,
            head: Bytes::copy_from_slice(&bytes[head_start..data_start]),
            data: Bytes::copy_from_slice(&bytes[data_start..total]),
        };
        Ok(Some((frame, total)))
    }

    /// Decode one frame by splitting it off `src` without copying
    ///
    /// # Errors
    ///
    /// Same as [`Frame::decode`].
    pub fn decode_from(src: &mut BytesMut) -> Result<Option<Self>> {
        let Some((kind, head_len, total)) = parse_header(src)? else {
            src.reserve(LENGTH_FIELD_SIZE + FRAME_HEADER_SIZE);
            return Ok(None);
        };
        let mut frame = src.split_to(total);
        frame.advance(LENGTH_FIELD_SIZE + FRAME_HEADER_SIZE);
        let head = frame.split_to(head_len).freeze();
        Ok(Some(Self {
            kind,
            head,
            data: frame.freeze(),
        }))
    }
}

/// Validate the fixed header; `None` means the frame is not complete yet
fn parse_header(bytes: &[u8]) -> Result<Option<(MessageType, usize, usize)>> {
    if bytes.len() < LENGTH_FIELD_SIZE {
        return Ok(None);
    }
    let frame_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if frame_len < FRAME_HEADER_SIZE {
        return Err(TunnelError::protocol(format!(
            "frame length {frame_len} smaller than header size {FRAME_HEADER_SIZE}"
        )));
    }
    if frame_len > MAX_FRAME_LENGTH {
        return Err(TunnelError::protocol(format!(
            "frame too large: {frame_len} bytes, max {MAX_FRAME_LENGTH}"
        )));
    }
    let total = LENGTH_FIELD_SIZE + frame_len;
    if bytes.len() < total {
        return Ok(None);
    }
    let kind = MessageType::from_byte(bytes[4]);
    let head_len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
    if head_len > frame_len - FRAME_HEADER_SIZE {
        return Err(TunnelError::protocol(format!(
            "head length {head_len} overruns frame of {frame_len} bytes"
        )));
    }
    Ok(Some((kind, head_len, total)))
}

// =============================================================================
// Typed messages
// =============================================================================

/// Control connection message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Heartbeat check (bidirectional)
    HeartbeatPing,
    /// Heartbeat answer (bidirectional)
    HeartbeatPong,
    /// Tunnel request (C->S)
    Request(TunnelRequest),
    /// Successful RESPONSE carrying the final request (S->C)
    Accepted {
        /// Server-assigned tunnel id
        tunnel_id: u64,
        /// Request as accepted, after interceptor rewrites
        request: TunnelRequest,
    },
    /// Failed RESPONSE (S->C)
    Rejected {
        /// Human readable reason
        reason: String,
    },
    /// Session payload (bidirectional)
    Transfer {
        /// Tunnel the session belongs to
        tunnel_id: u64,
        /// Session within the tunnel
        session_id: u64,
        /// Raw bytes
        data: Bytes,
    },
    /// Public connection opened (S->C)
    RemoteConnected {
        /// Tunnel id
        tunnel_id: u64,
        /// Session id
        session_id: u64,
    },
    /// Public connection closed (S->C)
    RemoteDisconnect {
        /// Tunnel id
        tunnel_id: u64,
        /// Session id
        session_id: u64,
    },
    /// Local service dialed (C->S)
    LocalConnected {
        /// Tunnel id
        tunnel_id: u64,
        /// Session id
        session_id: u64,
    },
    /// Local service connection closed (C->S)
    LocalDisconnect {
        /// Tunnel id
        tunnel_id: u64,
        /// Session id
        session_id: u64,
    },
    /// Frame with a type byte this build does not know
    Unknown {
        /// Raw type byte
        kind: u8,
    },
}

impl Message {
    /// Get the frame type for this message
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::HeartbeatPing => MessageType::HeartbeatPing,
            Self::HeartbeatPong => MessageType::HeartbeatPong,
            Self::Request(_) => MessageType::Request,
            Self::Accepted { .. } | Self::Rejected { .. } => MessageType::Response,
            Self::Transfer { .. } => MessageType::Transfer,
            Self::RemoteConnected { .. } => MessageType::RemoteConnected,
            Self::RemoteDisconnect { .. } => MessageType::RemoteDisconnect,
            Self::LocalConnected { .. } => MessageType::LocalConnected,
            Self::LocalDisconnect { .. } => MessageType::LocalDisconnect,
            Self::Unknown { kind } => MessageType::Unknown(*kind),
        }
    }

    /// `(tunnel_id, session_id)` for session-scoped messages
    #[must_use]
    pub const fn session_key(&self) -> Option<(u64, u64)> {
        match *self {
            Self::Transfer {
                tunnel_id,
                session_id,
                ..
            }
            | Self::RemoteConnected {
                tunnel_id,
                session_id,
            }
            | Self::RemoteDisconnect {
                tunnel_id,
                session_id,
            }
            | Self::LocalConnected {
                tunnel_id,
                session_id,
            }
            | Self::LocalDisconnect {
                tunnel_id,
                session_id,
            } => Some((tunnel_id, session_id)),
            _ => None,
        }
    }

    /// Bytes this message occupies on the wire
    #[must_use]
    pub fn wire_len(&self) -> usize {
        let body = match self {
            Self::HeartbeatPing | Self::HeartbeatPong | Self::Unknown { .. } => 0,
            Self::Request(request) => request.encode().len(),
            Self::Accepted { request, .. } => 9 + request.encode().len(),
            Self::Rejected { reason } => 1 + reason.len(),
            Self::Transfer { data, .. } => SESSION_HEAD_SIZE + data.len(),
            Self::RemoteConnected { .. }
            | Self::RemoteDisconnect { .. }
            | Self::LocalConnected { .. }
            | Self::LocalDisconnect { .. } => SESSION_HEAD_SIZE,
        };
        LENGTH_FIELD_SIZE + FRAME_HEADER_SIZE + body
    }

    /// Lower to an untyped frame
    #[must_use]
    pub fn into_frame(self) -> Frame {
        let kind = self.message_type();
        match self {
            Self::HeartbeatPing | Self::HeartbeatPong | Self::Unknown { .. } => {
                Frame::new(kind, Bytes::new(), Bytes::new())
            }
            Self::Request(request) => Frame::new(kind, Bytes::new(), request.encode()),
            Self::Accepted { tunnel_id, request } => {
                let mut head = BytesMut::with_capacity(9);
                head.put_u8(1);
                head.put_u64(tunnel_id);
                Frame::new(kind, head.freeze(), request.encode())
            }
            Self::Rejected { reason } => {
                Frame::new(kind, Bytes::from_static(&[0]), Bytes::from(reason))
            }
            Self::Transfer {
                tunnel_id,
                session_id,
                data,
            } => Frame::new(kind, session_head(tunnel_id, session_id), data),
            Self::RemoteConnected {
                tunnel_id,
                session_id,
            }
            | Self::RemoteDisconnect {
                tunnel_id,
                session_id,
            }
            | Self::LocalConnected {
                tunnel_id,
                session_id,
            }
            | Self::LocalDisconnect {
                tunnel_id,
                session_id,
            } => Frame::new(kind, session_head(tunnel_id, session_id), Bytes::new()),
        }
    }

    /// Encode the message to its wire bytes
    #[must_use]
    pub fn encode(self) -> Bytes {
        self.into_frame().encode()
    }

    /// Interpret an untyped frame
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the head does not have the size the
    /// frame type requires or the payload cannot be parsed.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let Frame { kind, head, data } = frame;
        match kind {
            MessageType::HeartbeatPing => Ok(Self::HeartbeatPing),
            MessageType::HeartbeatPong => Ok(Self::HeartbeatPong),
            MessageType::Request => Ok(Self::Request(TunnelRequest::decode(&data)?)),
            MessageType::Response => Self::decode_response(&head, &data),
            MessageType::Transfer => {
                let (tunnel_id, session_id) = read_session_head(kind, &head)?;
                Ok(Self::Transfer {
                    tunnel_id,
                    session_id,
                    data,
                })
            }
            MessageType::RemoteConnected => {
                let (tunnel_id, session_id) = read_session_head(kind, &head)?;
                Ok(Self::RemoteConnected {
                    tunnel_id,
                    session_id,
                })
            }
            MessageType::RemoteDisconnect => {
                let (tunnel_id, session_id) = read_session_head(kind, &head)?;
                Ok(Self::RemoteDisconnect {
                    tunnel_id,
                    session_id,
                })
            }
            MessageType::LocalConnected => {
                let (tunnel_id, session_id) = read_session_head(kind, &head)?;
                Ok(Self::LocalConnected {
                    tunnel_id,
                    session_id,
                })
            }
            MessageType::LocalDisconnect => {
                let (tunnel_id, session_id) = read_session_head(kind, &head)?;
                Ok(Self::LocalDisconnect {
                    tunnel_id,
                    session_id,
                })
            }
            MessageType::Unknown(kind) => Ok(Self::Unknown { kind }),
        }
    }

    fn decode_response(head: &[u8], data: &Bytes) -> Result<Self> {
        match head {
            [1, rest @ ..] => {
                let id: [u8; 8] = rest.try_into().map_err(|_| {
                    TunnelError::protocol(format!(
                        "RESPONSE: success head must be 9 bytes, got {}",
                        head.len()
                    ))
                })?;
                Ok(Self::Accepted {
                    tunnel_id: u64::from_be_bytes(id),
                    request: TunnelRequest::decode(data)?,
                })
            }
            [0] => Ok(Self::Rejected {
                reason: String::from_utf8_lossy(data).into_owned(),
            }),
            _ => Err(TunnelError::protocol("RESPONSE: malformed head")),
        }
    }
}

fn session_head(tunnel_id: u64, session_id: u64) -> Bytes {
    let mut head = BytesMut::with_capacity(SESSION_HEAD_SIZE);
    head.put_u64(tunnel_id);
    head.put_u64(session_id);
    head.freeze()
}

fn read_session_head(kind: MessageType, head: &[u8]) -> Result<(u64, u64)> {
    if head.len() != SESSION_HEAD_SIZE {
        return Err(TunnelError::protocol(format!(
            "{kind:?}: head must be {SESSION_HEAD_SIZE} bytes, got {}",
            head.len()
        )));
    }
    let mut buf = head;
    Ok((buf.get_u64(), buf.get_u64()))
}

// =============================================================================
// Stream codec
// =============================================================================

/// `tokio-util` codec turning a byte stream into [`Message`]s and back
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match Frame::decode_from(src)? {
            Some(frame) => Message::from_frame(frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = TunnelError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        item.into_frame().encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to test encode/decode roundtrip
    fn roundtrip(msg: Message) {
        let expected_len = msg.wire_len();
        let encoded = msg.clone().encode();
        assert_eq!(encoded.len(), expected_len, "wire_len mismatch");
        let (frame, consumed) = Frame::decode(&encoded).unwrap().expect("complete frame");
        assert_eq!(consumed, encoded.len(), "consumed bytes mismatch");
        assert_eq!(Message::from_frame(frame).unwrap(), msg, "roundtrip mismatch");
    }

    #[test]
    fn test_message_roundtrips() {
        roundtrip(Message::HeartbeatPing);
        roundtrip(Message::HeartbeatPong);
        roundtrip(Message::Request(
            TunnelRequest::tcp("127.0.0.1", 8080)
                .with_remote_port(10080)
                .with_token("tk1"),
        ));
        roundtrip(Message::Accepted {
            tunnel_id: 1,
            request: TunnelRequest::http("localhost", 80).with_vhost("a.example.com"),
        });
        roundtrip(Message::Rejected {
            reason: "bindPort: 10080".to_string(),
        });
        roundtrip(Message::Transfer {
            tunnel_id: u64::MAX,
            session_id: 7,
            data: Bytes::from_static(b"ping"),
        });
        roundtrip(Message::RemoteDisconnect {
            tunnel_id: 3,
            session_id: 4,
        });
        roundtrip(Message::LocalConnected {
            tunnel_id: 3,
            session_id: 4,
        });
    }

    #[test]
    fn test_transfer_wire_layout() {
        let encoded = Message::Transfer {
            tunnel_id: 1,
            session_id: 2,
            data: Bytes::from_static(b"hi"),
        }
        .encode();

        let mut expected = vec![0, 0, 0, 23, 0x05, 0, 0, 0, 16];
        expected.extend_from_slice(&1u64.to_be_bytes());
        expected.extend_from_slice(&2u64.to_be_bytes());
        expected.extend_from_slice(b"hi");
        assert_eq!(&encoded[..], &expected[..]);
    }

    #[test]
    fn test_response_heads() {
        let frame = Message::Rejected {
            reason: "vhost(a.example.com) already used".to_string(),
        }
        .into_frame();
        assert_eq!(&frame.head[..], &[0]);
        assert_eq!(&frame.data[..], b"vhost(a.example.com) already used");

        let frame = Message::Accepted {
            tunnel_id: 9,
            request: TunnelRequest::tcp("h", 1),
        }
        .into_frame();
        assert_eq!(frame.head.len(), 9);
        assert_eq!(frame.head[0], 1);
    }

    #[test]
    fn test_partial_buffers_are_incomplete() {
        let encoded = Message::Transfer {
            tunnel_id: 1,
            session_id: 1,
            data: Bytes::from_static(b"partial frame payload"),
        }
        .encode();

        for cut in 0..encoded.len() {
            assert!(
                Frame::decode(&encoded[..cut]).unwrap().is_none(),
                "prefix of {cut} bytes decoded"
            );
        }
        assert!(Frame::decode(&encoded).unwrap().is_some());
    }

    #[test]
    fn test_decode_from_leaves_incomplete_input() {
        let encoded = Message::HeartbeatPing.encode();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode_from(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), encoded.len() - 1);
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let frame = Frame::new(MessageType::from_byte(0x7f), Bytes::new(), "x");
        let encoded = frame.encode();
        let (decoded, _) = Frame::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded.kind, MessageType::Unknown(0x7f));
        assert_eq!(
            Message::from_frame(decoded).unwrap(),
            Message::Unknown { kind: 0x7f }
        );
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        // frame length below the fixed header
        assert!(Frame::decode(&[0, 0, 0, 4, 1, 0, 0, 0]).is_err());
        // head length overruns frame
        assert!(Frame::decode(&[0, 0, 0, 5, 1, 0, 0, 0, 1]).is_err());
        // oversized
        assert!(Frame::decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_session_head_size_enforced() {
        let frame = Frame::new(MessageType::Transfer, vec![0u8; 8], "x");
        assert!(Message::from_frame(frame).is_err());
    }

    #[test]
    fn test_message_type_bytes() {
        for byte in 0x01..=0x09u8 {
            let kind = MessageType::from_byte(byte);
            assert!(!matches!(kind, MessageType::Unknown(_)));
            assert_eq!(u8::from(kind), byte);
        }
        assert_eq!(MessageType::from(0), MessageType::Unknown(0));
    }

    #[test]
    fn test_codec_multiple_messages_in_buffer() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::HeartbeatPing, &mut buf).unwrap();
        codec
            .encode(
                Message::LocalDisconnect {
                    tunnel_id: 1,
                    session_id: 2,
                },
                &mut buf,
            )
            .unwrap();
        let tail = buf.split_off(buf.len() - 3);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::HeartbeatPing)
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.unsplit(tail);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::LocalDisconnect {
                tunnel_id: 1,
                session_id: 2
            })
        );
        assert!(buf.is_empty());
    }
}
