// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Framing on a plugin's stdin/stdout.
//!
//! ```text
//! ┌──────────────┬────────────┬──────────────────┐
//! │ len: u32 BE  │ kind: u16  │ JSON payload     │
//! └──────────────┴────────────┴──────────────────┘
//! ```
//!
//! The host writes `Request` frames; the plugin writes one `Handshake`
//! frame and then `Response` frames.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted payload (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix plus message type.
pub const HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    Handshake = 3,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        Ok(match value {
            1 => Self::Request,
            2 => Self::Response,
            3 => Self::Handshake,
            other => return Err(FrameError::InvalidMessageType(other)),
        })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("expected a different frame, got {0:?}")]
    UnexpectedMessageType(MessageType),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer closed its end, possibly mid-frame.
    #[error("connection closed")]
    ConnectionClosed,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new<M: Serialize>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: payload.into(),
        })
    }

    pub fn request<M: Serialize>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Request, msg)
    }

    pub fn response<M: Serialize>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, msg)
    }

    pub fn handshake<M: Serialize>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Handshake, msg)
    }

    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decode the payload of a frame that must be of type `expected`.
    pub fn decode_as<M: DeserializeOwned>(&self, expected: MessageType) -> Result<M, FrameError> {
        if self.message_type != expected {
            return Err(FrameError::UnexpectedMessageType(self.message_type));
        }
        self.decode()
    }

    /// Header and payload as one buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Write one frame and flush; child pipes are buffered.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. EOF anywhere inside it is `ConnectionClosed`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    fill(reader, &mut header).await?;

    let [l0, l1, l2, l3, t0, t1] = header;
    let length = u32::from_be_bytes([l0, l1, l2, l3]) as usize;
    let message_type = MessageType::try_from(u16::from_be_bytes([t0, t1]))?;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    fill(reader, &mut payload).await?;
    Ok(Frame {
        message_type,
        payload: payload.into(),
    })
}

async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn test_message_type_wire_values() {
        for (kind, value) in [
            (MessageType::Request, 1u16),
            (MessageType::Response, 2),
            (MessageType::Handshake, 3),
        ] {
            assert_eq!(kind as u16, value);
            assert_eq!(MessageType::try_from(value).unwrap(), kind);
        }
        assert!(matches!(
            MessageType::try_from(9u16),
            Err(FrameError::InvalidMessageType(9))
        ));
    }

    #[test]
    fn test_header_layout() {
        let encoded = Frame::request(&Ping { n: 7 }).unwrap().encode();
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - HEADER_SIZE);
        assert_eq!(u16::from_be_bytes([encoded[4], encoded[5]]), 1);
        assert_eq!(&encoded[HEADER_SIZE..], br#"{"n":7}"#);
    }

    #[test]
    fn test_decode_as_checks_type() {
        let frame = Frame::handshake(&Ping { n: 1 }).unwrap();
        assert!(matches!(
            frame.decode_as::<Ping>(MessageType::Response),
            Err(FrameError::UnexpectedMessageType(MessageType::Handshake))
        ));
        assert_eq!(
            frame.decode_as::<Ping>(MessageType::Handshake).unwrap(),
            Ping { n: 1 }
        );
    }

    #[tokio::test]
    async fn test_frames_cross_a_pipe() {
        let (mut host, mut plugin) = tokio::io::duplex(1024);
        write_frame(&mut host, &Frame::request(&Ping { n: 42 }).unwrap())
            .await
            .unwrap();
        write_frame(&mut host, &Frame::request(&Ping { n: 43 }).unwrap())
            .await
            .unwrap();
        for n in [42, 43] {
            let frame = read_frame(&mut plugin).await.unwrap();
            assert_eq!(frame.message_type, MessageType::Request);
            assert_eq!(frame.decode::<Ping>().unwrap(), Ping { n });
        }
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let (mut host, mut plugin) = tokio::io::duplex(64);
        let mut header = Vec::new();
        header.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        header.extend_from_slice(&2u16.to_be_bytes());
        host.write_all(&header).await.unwrap();
        assert!(matches!(
            read_frame(&mut plugin).await,
            Err(FrameError::FrameTooLarge(n)) if n == MAX_FRAME_SIZE + 1
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_connection_closed() {
        let (mut host, mut plugin) = tokio::io::duplex(64);
        let encoded = Frame::response(&Ping { n: 1 }).unwrap().encode();
        host.write_all(&encoded[..encoded.len() - 2]).await.unwrap();
        drop(host);
        assert!(matches!(
            read_frame(&mut plugin).await,
            Err(FrameError::ConnectionClosed)
        ));
    }
}
