//! Wire protocol for serving `GetLatestBuild` over a byte stream.
//!
//! Each message is a fixed header followed by a bincode payload: one
//! request, one reply, optional heartbeats.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{BuildSyncError, Result};
use crate::request::{BuildRequest, BuildResponse};
use crate::service::BuildResolver;

/// Protocol magic bytes: "BSYN"
pub const PROTOCOL_MAGIC: [u8; 4] = *b"BSYN";

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload size (64 MB). Full manifests of large builds are big.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Protocol message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Latest build request.
    GetLatestBuild = 0x01,
    /// Latest build response.
    LatestBuild = 0x02,
    /// Error message.
    Error = 0x03,
    /// Heartbeat ping.
    Ping = 0x04,
    /// Heartbeat pong.
    Pong = 0x05,
}

impl MessageType {
    /// Convert from u8.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the value is invalid.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::GetLatestBuild),
            0x02 => Ok(Self::LatestBuild),
            0x03 => Ok(Self::Error),
            0x04 => Ok(Self::Ping),
            0x05 => Ok(Self::Pong),
            _ => Err(BuildSyncError::ProtocolError(format!(
                "Invalid message type: {value:#x}"
            ))),
        }
    }
}

/// Protocol frame header.
///
/// ```text
/// ┌─────────┬─────────┬─────────┬─────────┬─────────┐
/// │  MAGIC  │ LENGTH  │  TYPE   │ VERSION │  FLAGS  │
/// │ 4 bytes │ 4 bytes │ 1 byte  │ 1 byte  │ 2 bytes │
/// └─────────┴─────────┴─────────┴─────────┴─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Magic bytes: "BSYN".
    pub magic: [u8; 4],
    /// Payload length (little-endian).
    pub length: u32,
    /// Message type.
    pub msg_type: MessageType,
    /// Protocol version.
    pub version: u8,
    /// Reserved flags.
    pub flags: u16,
}

impl FrameHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 12;

    /// Create a new frame header.
    #[must_use]
    pub const fn new(msg_type: MessageType, payload_len: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            length: payload_len,
            msg_type,
            version: PROTOCOL_VERSION,
            flags: 0,
        }
    }

    /// Validate the header.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.magic != PROTOCOL_MAGIC {
            return Err(BuildSyncError::ProtocolError(format!(
                "Invalid magic: expected {PROTOCOL_MAGIC:?}, got {:?}",
                self.magic
            )));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(BuildSyncError::ProtocolError(format!(
                "Unsupported version: expected {PROTOCOL_VERSION}, got {}",
                self.version
            )));
        }
        if self.length > MAX_PAYLOAD_SIZE {
            return Err(BuildSyncError::ProtocolError(format!(
                "Payload too large: {} > {MAX_PAYLOAD_SIZE}",
                self.length
            )));
        }
        Ok(())
    }

    /// Encode header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8] = self.msg_type as u8;
        buf[9] = self.version;
        buf[10..12].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    /// Decode and validate a header.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the header is malformed.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Result<Self> {
        let [m0, m1, m2, m3, l0, l1, l2, l3, msg_type, version, f0, f1] = *buf;
        let header = Self {
            magic: [m0, m1, m2, m3],
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            msg_type: MessageType::from_u8(msg_type)?,
            version,
            flags: u16::from_le_bytes([f0, f1]),
        };
        header.validate()?;
        Ok(header)
    }

    /// Read header from a reader.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or decoding fails.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        reader.read_exact(&mut buf)?;
        Self::decode(&buf)
    }

    /// Write header to a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }
}

/// Protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Ask for the latest build.
    GetLatestBuild(BuildRequest),
    /// Successful answer.
    LatestBuild(BuildResponse),
    /// Error response.
    Error {
        /// Error code, see [`BuildSyncError::code`].
        code: u32,
        /// Error message.
        message: String,
    },
    /// Heartbeat ping.
    Ping {
        /// Sequence number.
        seq: u64,
    },
    /// Heartbeat pong.
    Pong {
        /// Sequence number (echoed from ping).
        seq: u64,
    },
}

impl Message {
    /// Get the message type.
    #[must_use]
    pub const fn msg_type(&self) -> MessageType {
        match self {
            Self::GetLatestBuild(_) => MessageType::GetLatestBuild,
            Self::LatestBuild(_) => MessageType::LatestBuild,
            Self::Error { .. } => MessageType::Error,
            Self::Ping { .. } => MessageType::Ping,
            Self::Pong { .. } => MessageType::Pong,
        }
    }

    /// Error message carrying an error's wire code.
    #[must_use]
    pub fn from_error(err: &BuildSyncError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    /// Interpret a reply to `GetLatestBuild`.
    ///
    /// # Errors
    ///
    /// Returns `Remote` for an error reply and `ProtocolError` for any other
    /// unexpected message.
    pub fn into_response(self) -> Result<BuildResponse> {
        match self {
            Self::LatestBuild(response) => Ok(response),
            Self::Error { code, message } => Err(BuildSyncError::Remote { code, message }),
            other => Err(BuildSyncError::ProtocolError(format!(
                "Unexpected reply: {:?}",
                other.msg_type()
            ))),
        }
    }

    /// Encode message to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| {
            BuildSyncError::ProtocolError(format!("Failed to encode message: {e}"))
        })
    }

    /// Decode message from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| {
            BuildSyncError::ProtocolError(format!("Failed to decode message: {e}"))
        })
    }

    /// Encode into a complete frame, header included.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if encoding fails or the payload is too large.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let payload = self.encode()?;
        let payload_len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or_else(|| {
                BuildSyncError::ProtocolError(format!(
                    "Payload exceeds maximum size: {} > {MAX_PAYLOAD_SIZE}",
                    payload.len()
                ))
            })?;

        let mut frame = Vec::with_capacity(FrameHeader::SIZE + payload.len());
        frame.extend_from_slice(&FrameHeader::new(self.msg_type(), payload_len).encode());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a payload, checking it against its header.
    fn from_frame(header: &FrameHeader, payload: &[u8]) -> Result<Self> {
        let message = Self::decode(payload)?;
        if message.msg_type() != header.msg_type {
            return Err(BuildSyncError::ProtocolError(format!(
                "Header type {:?} does not match payload {:?}",
                header.msg_type,
                message.msg_type()
            )));
        }
        Ok(message)
    }
}

/// Protocol codec for reading/writing framed messages.
#[derive(Debug, Default)]
pub struct Codec {
    /// Buffer for partial reads.
    read_buf: Vec<u8>,
}

impl Codec {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self {
            read_buf: Vec::with_capacity(4096),
        }
    }

    /// Write a message to a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn write_message<W: Write>(&self, writer: &mut W, message: &Message) -> Result<()> {
        writer.write_all(&message.to_frame()?)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a message from a reader.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or decoding fails.
    pub fn read_message<R: Read>(&mut self, reader: &mut R) -> Result<Message> {
        let header = FrameHeader::read_from(reader)?;

        self.read_buf.resize(header.length as usize, 0);
        reader.read_exact(&mut self.read_buf)?;

        Message::from_frame(&header, &self.read_buf)
    }

    /// Send a request and wait for its reply on a blocking stream.
    ///
    /// # Errors
    ///
    /// Returns `Remote` if the server answered with an error.
    pub fn call<S: Read + Write>(
        &mut self,
        stream: &mut S,
        request: &BuildRequest,
    ) -> Result<BuildResponse> {
        self.write_message(stream, &Message::GetLatestBuild(request.clone()))?;
        self.read_message(stream)?.into_response()
    }
}

/// Read one framed message from an async reader.
///
/// # Errors
///
/// Returns an error if reading or decoding fails.
#[cfg(feature = "async")]
pub async fn read_message_async<R>(reader: &mut R) -> Result<Message>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut buf).await?;
    let header = FrameHeader::decode(&buf)?;

    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await?;
    Message::from_frame(&header, &payload)
}

/// Write one framed message to an async writer.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
#[cfg(feature = "async")]
pub async fn write_message_async<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    writer.write_all(&message.to_frame()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Produce the reply to one incoming message.
///
/// Resolution failures become `Error` messages with the error's wire code,
/// so a connection survives a failed request.
pub fn respond<R: BuildResolver + ?Sized>(resolver: &R, message: Message) -> Message {
    match message {
        Message::GetLatestBuild(request) => match resolver.get_latest_build(&request) {
            Ok(response) => Message::LatestBuild(response),
            Err(err) => {
                if err.is_retryable() {
                    tracing::warn!(branch = %request.branch_id, error = %err, "resolution failed");
                } else {
                    tracing::debug!(branch = %request.branch_id, error = %err, "request rejected");
                }
                Message::from_error(&err)
            }
        },
        Message::Ping { seq } => Message::Pong { seq },
        other => Message::Error {
            code: BuildSyncError::CODE_INVALID_REQUEST,
            message: format!("Unexpected message: {:?}", other.msg_type()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ManifestChecksum;
    use crate::manifest::Manifest;
    use crate::request::BuildPayload;
    use crate::service::BuildResolutionService;
    use crate::store::InMemoryStore;
    use crate::types::{BranchId, BuildId, Target};
    use std::io::Cursor;
    use std::sync::Arc;

    fn request() -> BuildRequest {
        BuildRequest::new(BranchId::new(1), [Target::WindowsX64])
            .with_local_build(BuildId::new(vec![3]))
    }

    fn response() -> BuildResponse {
        let manifest = Manifest::new(4096).unwrap();
        BuildResponse {
            build_id: BuildId::new(vec![4]),
            manifest_checksum: ManifestChecksum::compute(&manifest),
            payload: BuildPayload::Manifest(Arc::new(manifest)),
        }
    }

    fn resolver() -> BuildResolutionService<InMemoryStore> {
        let store = InMemoryStore::new();
        store
            .publish(
                BranchId::new(1),
                Target::WindowsX64,
                BuildId::new(vec![4]),
                Manifest::new(4096).unwrap(),
            )
            .unwrap();
        BuildResolutionService::new(store)
    }

    // ==========================================================================
    // MESSAGE TYPE TESTS
    // ==========================================================================

    #[test]
    fn message_type_from_u8_valid() {
        assert_eq!(MessageType::from_u8(0x01).unwrap(), MessageType::GetLatestBuild);
        assert_eq!(MessageType::from_u8(0x02).unwrap(), MessageType::LatestBuild);
        assert_eq!(MessageType::from_u8(0x03).unwrap(), MessageType::Error);
        assert_eq!(MessageType::from_u8(0x04).unwrap(), MessageType::Ping);
        assert_eq!(MessageType::from_u8(0x05).unwrap(), MessageType::Pong);
    }

    #[test]
    fn message_type_from_u8_invalid() {
        assert!(MessageType::from_u8(0x00).is_err());
        assert!(MessageType::from_u8(0x06).is_err());
        assert!(MessageType::from_u8(0xFF).is_err());
    }

    // ==========================================================================
    // FRAME HEADER TESTS
    // ==========================================================================

    #[test]
    fn frame_header_encode_decode() {
        let header = FrameHeader::new(MessageType::LatestBuild, 12345);
        let encoded = header.encode();
        assert_eq!(&encoded[0..4], b"BSYN");

        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn frame_header_validate_invalid_magic() {
        let mut header = FrameHeader::new(MessageType::Ping, 100);
        header.magic = *b"COPA";
        assert!(header.validate().is_err());
    }

    #[test]
    fn frame_header_validate_invalid_version() {
        let mut header = FrameHeader::new(MessageType::Ping, 100);
        header.version = 99;
        assert!(header.validate().is_err());
    }

    #[test]
    fn frame_header_validate_payload_too_large() {
        let header = FrameHeader::new(MessageType::LatestBuild, MAX_PAYLOAD_SIZE + 1);
        assert!(header.validate().is_err());
    }

    #[test]
    fn frame_header_read_write() {
        let header = FrameHeader::new(MessageType::GetLatestBuild, 500);
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();

        let read_header = FrameHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(header, read_header);
    }

    // ==========================================================================
    // MESSAGE TESTS
    // ==========================================================================

    #[test]
    fn message_types_match_variants() {
        assert_eq!(Message::GetLatestBuild(request()).msg_type(), MessageType::GetLatestBuild);
        assert_eq!(Message::LatestBuild(response()).msg_type(), MessageType::LatestBuild);
        assert_eq!(Message::Ping { seq: 1 }.msg_type(), MessageType::Ping);
        assert_eq!(Message::Pong { seq: 1 }.msg_type(), MessageType::Pong);
    }

    #[test]
    fn message_encode_decode_request() {
        let msg = Message::GetLatestBuild(request());
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn message_from_error_uses_code() {
        let msg = Message::from_error(&BuildSyncError::InvalidRequest("no targets".to_string()));
        match msg {
            Message::Error { code, message } => {
                assert_eq!(code, 400);
                assert!(message.contains("no targets"));
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn into_response_variants() {
        assert_eq!(Message::LatestBuild(response()).into_response().unwrap(), response());

        let err = Message::Error {
            code: 404,
            message: "none".to_string(),
        }
        .into_response()
        .unwrap_err();
        assert!(err.is_not_found());

        assert!(matches!(
            Message::Pong { seq: 0 }.into_response(),
            Err(BuildSyncError::ProtocolError(_))
        ));
    }

    // ==========================================================================
    // CODEC TESTS
    // ==========================================================================

    #[test]
    fn codec_write_read_message() {
        let codec = Codec::new();
        let msg = Message::LatestBuild(response());

        let mut buf = Vec::new();
        codec.write_message(&mut buf, &msg).unwrap();

        let mut reader = Codec::new();
        assert_eq!(reader.read_message(&mut Cursor::new(buf)).unwrap(), msg);
    }

    #[test]
    fn codec_multiple_messages() {
        let codec = Codec::new();
        let messages = vec![
            Message::Ping { seq: 1 },
            Message::GetLatestBuild(request()),
            Message::Pong { seq: 1 },
            Message::Error {
                code: 503,
                message: String::new(),
            },
        ];

        let mut buf = Vec::new();
        for msg in &messages {
            codec.write_message(&mut buf, msg).unwrap();
        }

        let mut reader = Codec::new();
        let mut cursor = Cursor::new(buf);
        for expected in &messages {
            assert_eq!(expected, &reader.read_message(&mut cursor).unwrap());
        }
    }

    #[test]
    fn codec_rejects_mismatched_header_type() {
        let mut frame = Message::Ping { seq: 9 }.to_frame().unwrap();
        frame[8] = MessageType::Pong as u8;

        let err = Codec::new().read_message(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, BuildSyncError::ProtocolError(_)));
    }

    #[test]
    fn codec_truncated_payload_is_io_error() {
        let mut frame = Message::GetLatestBuild(request()).to_frame().unwrap();
        frame.truncate(frame.len() - 1);

        let err = Codec::new().read_message(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, BuildSyncError::Io(_)));
    }

    // ==========================================================================
    // RESPOND
    // ==========================================================================

    #[test]
    fn respond_resolves_requests() {
        let reply = respond(&resolver(), Message::GetLatestBuild(request()));
        let response = reply.into_response().unwrap();
        assert_eq!(response.build_id, BuildId::new(vec![4]));
        assert!(response.manifest().is_some());
    }

    #[test]
    fn respond_maps_not_found() {
        let missing = BuildRequest::new(BranchId::new(2), [Target::LinuxX64]);
        match respond(&resolver(), Message::GetLatestBuild(missing)) {
            Message::Error { code, .. } => assert_eq!(code, BuildSyncError::CODE_NOT_FOUND),
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn respond_answers_ping() {
        assert_eq!(
            respond(&resolver(), Message::Ping { seq: 77 }),
            Message::Pong { seq: 77 }
        );
    }

    #[test]
    fn respond_rejects_unexpected_messages() {
        match respond(&resolver(), Message::LatestBuild(response())) {
            Message::Error { code, .. } => assert_eq!(code, 400),
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn codec_call_over_duplex_buffer() {
        struct Loopback {
            input: Cursor<Vec<u8>>,
            output: Vec<u8>,
        }

        impl Read for Loopback {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.input.read(buf)
            }
        }

        impl Write for Loopback {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.output.write(buf)
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let reply = respond(&resolver(), Message::GetLatestBuild(request()));
        let mut stream = Loopback {
            input: Cursor::new(reply.to_frame().unwrap()),
            output: Vec::new(),
        };

        let response = Codec::new().call(&mut stream, &request()).unwrap();
        assert_eq!(response.build_id, BuildId::new(vec![4]));

        let sent = Codec::new()
            .read_message(&mut Cursor::new(stream.output))
            .unwrap();
        assert_eq!(sent, Message::GetLatestBuild(request()));
    }
}
