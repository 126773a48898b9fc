//! Wire protocol between the hub and its agents.
//!
//! Framed wire format: `[type: u8][length: u32 big-endian][payload: bytes]`
//!
//! The raw mode speaks the legacy unframed protocol: the identity is whatever
//! the first read returns, outputs are whatever each read returns, and
//! commands are written as bare UTF-8. Raw reads are fragments, not messages.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame type byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Agent → hub: declared identity, sent once after connecting.
    Hello = 0x01,
    /// Hub → agent: a command line to execute.
    Command = 0x02,
    /// Agent → hub: command output.
    Output = 0x03,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Command),
            0x03 => Some(Self::Output),
            _ => None,
        }
    }
}

/// Maximum frame payload size (16 MiB). Prevents OOM on malformed data.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// How messages are delimited on the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireMode {
    /// Length-prefixed frames in both directions.
    #[default]
    Framed,
    /// Unframed byte stream, compatible with legacy agents.
    Raw,
}

/// A protocol frame with a type tag and payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Create a frame carrying UTF-8 text.
    pub fn text(frame_type: FrameType, text: &str) -> Self {
        Self::new(frame_type, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Encode this frame into bytes.
    ///
    /// The payload must fit in a frame; see [`Frame::fits`].
    pub fn encode(&self) -> Bytes {
        debug_assert!(Self::fits(self.payload.len()), "frame payload too large");
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.as_ref());
        buf.freeze()
    }

    /// Write this frame to an async writer in a single `write_all`.
    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(
        &self,
        writer: &mut W,
    ) -> io::Result<()> {
        if !Self::fits(self.payload.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame payload too large: {} bytes", self.payload.len()),
            ));
        }
        let encoded = self.encode();
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    /// Read a frame from an async reader.
    ///
    /// Returns `Ok(None)` when the peer closes exactly at a frame boundary.
    /// EOF anywhere inside a frame is an `UnexpectedEof` error.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(
        reader: &mut R,
    ) -> io::Result<Option<Self>> {
        Self::read_from_bounded(reader, MAX_PAYLOAD_SIZE).await
    }

    /// Like [`Frame::read_from`], but rejects any frame whose declared length
    /// exceeds `max` before allocating or reading its payload.
    pub async fn read_from_bounded<R: AsyncRead + Unpin + ?Sized>(
        reader: &mut R,
        max: u32,
    ) -> io::Result<Option<Self>> {
        let mut type_byte = [0u8; 1];
        if reader.read(&mut type_byte).await? == 0 {
            return Ok(None);
        }
        let frame_type = FrameType::from_u8(type_byte[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame type: 0x{:02x}", type_byte[0]),
            )
        })?;

        let length = reader.read_u32().await?;
        let max = max.min(MAX_PAYLOAD_SIZE);
        if length > max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes (max {})", length, max),
            ));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        Ok(Some(Self {
            frame_type,
            payload: Bytes::from(payload),
        }))
    }

    /// Whether the payload fits in a single frame.
    pub fn fits(payload_len: usize) -> bool {
        payload_len <= MAX_PAYLOAD_SIZE as usize
    }

    /// Payload decoded as text; invalid sequences become U+FFFD.
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Fail with `InvalidData` unless this frame has the expected type.
    pub fn expect_type(self, expected: FrameType) -> io::Result<Self> {
        if self.frame_type == expected {
            Ok(self)
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {:?} frame, got {:?}", expected, self.frame_type),
            ))
        }
    }
}

// ── Mode-aware helpers ─────────────────────────────────────────────

/// Read the agent's identity message.
///
/// Returns `Ok(None)` if the peer closed before sending anything. The
/// identity is decoded lossily and trimmed; callers reject empty results.
pub async fn read_identity<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    mode: WireMode,
    limit: usize,
) -> io::Result<Option<String>> {
    match mode {
        WireMode::Raw => {
            let mut buf = vec![0u8; limit];
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            Ok(Some(String::from_utf8_lossy(&buf[..n]).trim().to_string()))
        }
        WireMode::Framed => {
            let max = u32::try_from(limit).unwrap_or(MAX_PAYLOAD_SIZE);
            match Frame::read_from_bounded(reader, max).await? {
                Some(frame) => {
                    let frame = frame.expect_type(FrameType::Hello)?;
                    Ok(Some(frame.text_lossy().trim().to_string()))
                }
                None => Ok(None),
            }
        }
    }
}

/// Read one unit of agent output.
///
/// In framed mode this is one `Output` frame; in raw mode it is whatever a
/// single read of up to `buf.len()` bytes returns. `Ok(None)` is a graceful
/// close.
pub async fn read_output<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    mode: WireMode,
    buf: &mut [u8],
) -> io::Result<Option<String>> {
    match mode {
        WireMode::Raw => {
            let n = reader.read(buf).await?;
            if n == 0 {
                return Ok(None);
            }
            Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned()))
        }
        WireMode::Framed => match Frame::read_from(reader).await? {
            Some(frame) => Ok(Some(frame.expect_type(FrameType::Output)?.text_lossy())),
            None => Ok(None),
        },
    }
}

/// Encode a hub → agent command for the given mode.
///
/// Framed commands must fit in one frame; callers check [`Frame::fits`].
pub fn encode_command(command: &str, mode: WireMode) -> Bytes {
    match mode {
        WireMode::Raw => Bytes::copy_from_slice(command.as_bytes()),
        WireMode::Framed => Frame::text(FrameType::Command, command).encode(),
    }
}
