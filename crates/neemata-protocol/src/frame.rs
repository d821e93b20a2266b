// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for the supervisor/worker channel.
//!
//! Each frame on the channel carries one message with the following format:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message kind
//! - N bytes: JSON payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum frame size (16 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes kind)
pub const HEADER_SIZE: usize = 6;

/// Effective maximum frame size.
///
/// `NEEMATA_MAX_FRAME_SIZE` (bytes) overrides the default; the value is
/// read once per process.
pub fn max_frame_size() -> usize {
    static LIMIT: OnceCell<usize> = OnceCell::new();
    *LIMIT.get_or_init(|| {
        std::env::var("NEEMATA_MAX_FRAME_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    })
}

/// Message kinds for the worker channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageKind {
    /// Worker finished initialization and can serve
    Ready = 1,
    /// Supervisor orders the worker to start serving
    Start = 2,
    /// Supervisor orders the worker to stop gracefully
    Stop = 3,
    /// Task execution request routed through the supervisor
    ExecuteInvoke = 4,
    /// Task execution outcome routed back to the originator
    ExecuteResult = 5,
    /// Best-effort cancellation of an in-flight task execution
    ExecuteAbort = 6,
}

impl TryFrom<u16> for MessageKind {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(MessageKind::Ready),
            2 => Ok(MessageKind::Start),
            3 => Ok(MessageKind::Stop),
            4 => Ok(MessageKind::ExecuteInvoke),
            5 => Ok(MessageKind::ExecuteResult),
            6 => Ok(MessageKind::ExecuteAbort),
            _ => Err(FrameError::InvalidMessageKind(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("invalid message kind: {0}")]
    InvalidMessageKind(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("channel closed")]
    ChannelClosed,
}

/// A framed message with kind and payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given kind and serializable payload
    pub fn new<M: Serialize>(kind: MessageKind, msg: &M) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(msg)?;
        let limit = max_frame_size();
        if payload.len() > limit {
            return Err(FrameError::FrameTooLarge(payload.len(), limit));
        }
        Ok(Self {
            kind,
            payload: Bytes::from(payload),
        })
    }

    /// Create a frame with no payload
    pub fn bare(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    /// Decode the payload as a typed message
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.kind as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let kind = MessageKind::try_from(bytes.get_u16())?;

        let limit = max_frame_size();
        if length > limit {
            return Err(FrameError::FrameTooLarge(length, limit));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self { kind, payload })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ChannelClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let kind = MessageKind::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    let limit = max_frame_size();
    if length > limit {
        return Err(FrameError::FrameTooLarge(length, limit));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        kind,
        payload: Bytes::from(payload),
    })
}

/// Framed codec for reading/writing frames on a byte channel
pub struct FramedChannel<S> {
    stream: S,
}

impl<S> FramedChannel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedChannel<S> {
    /// Read the next frame from the channel
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }
}

impl<S: AsyncWrite + Unpin> FramedChannel<S> {
    /// Write a frame to the channel
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_round_trip() {
        for &kind in &[
            MessageKind::Ready,
            MessageKind::Start,
            MessageKind::Stop,
            MessageKind::ExecuteInvoke,
            MessageKind::ExecuteResult,
            MessageKind::ExecuteAbort,
        ] {
            let value = kind as u16;
            let decoded = MessageKind::try_from(value).unwrap();
            assert_eq!(kind, decoded);
        }
    }

    #[test]
    fn test_unknown_message_kind_rejected() {
        let err = MessageKind::try_from(99).unwrap_err();
        assert!(matches!(err, FrameError::InvalidMessageKind(99)));
    }

    #[test]
    fn test_frame_encode_decode() {
        let frame = Frame::new(MessageKind::ExecuteInvoke, &serde_json::json!({"a": 1})).unwrap();
        let encoded = frame.encode();
        let decoded = Frame::decode_from_bytes(encoded).unwrap();

        assert_eq!(frame.kind, decoded.kind);
        assert_eq!(frame.payload, decoded.payload);
    }

    #[test]
    fn test_bare_frame_has_empty_payload() {
        let frame = Frame::bare(MessageKind::Ready);
        assert!(frame.payload.is_empty());

        let decoded = Frame::decode_from_bytes(frame.encode()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Ready);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_max_frame_size_defaults_without_override() {
        // NEEMATA_MAX_FRAME_SIZE is unset in the test environment; the
        // limit is cached on first use, so this also pins later reads.
        assert_eq!(max_frame_size(), DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_truncated_header_rejected() {
        let err = Frame::decode_from_bytes(Bytes::from_static(&[0, 0])).unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_u16(MessageKind::Ready as u16);
        buf.put_slice(b"abc");
        let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[tokio::test]
    async fn test_read_write_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame = Frame::new(MessageKind::ExecuteResult, &serde_json::json!({"ok": true}))
            .unwrap();
        write_frame(&mut client, &frame).await.unwrap();

        let read = read_frame(&mut server).await.unwrap();
        assert_eq!(read.kind, MessageKind::ExecuteResult);
        assert_eq!(read.payload, frame.payload);
    }

    #[tokio::test]
    async fn test_read_frame_on_closed_channel() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::ChannelClosed));
    }
}
