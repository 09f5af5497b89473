//! Wire codec for the action protocol.
//!
//! Every frame is a length-prefixed body (4-byte big-endian length, via
//! [`LengthDelimitedCodec`]). The body starts with one [`FrameKind`] byte
//! followed by the protobuf encoding of the message that kind carries:
//!
//! | kind | direction       | message          |
//! |------|-----------------|------------------|
//! | 1    | client → server | [`RpcRequest`]   |
//! | 2    | server → client | [`Action`]       |
//! | 3    | server → client | [`RpcError`]     |
//!
//! Use [`FrameCodec`] with [`tokio_util::codec::Framed`] on either end.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::model::{Action, RpcError, RpcRequest};

/// Largest frame body accepted in either direction (4 MiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Leading byte of every frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Call = 1,
    Action = 2,
    Rejection = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, FrameError> {
        match byte {
            1 => Ok(FrameKind::Call),
            2 => Ok(FrameKind::Action),
            3 => Ok(FrameKind::Rejection),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame exceeds {MAX_FRAME_SIZE} bytes")]
    TooLarge,

    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("frame body is empty")]
    Empty,

    #[error("unexpected {0:?} frame")]
    UnexpectedKind(FrameKind),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// The peer sent bytes that do not form a valid frame. The stream is
    /// still writable, so a rejection can be sent before closing.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::TooLarge | Self::UnknownKind(_) | Self::Empty | Self::Decode(_)
        )
    }
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(RpcRequest),
    Action(Action),
    Rejection(RpcError),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Call(_) => FrameKind::Call,
            Self::Action(_) => FrameKind::Action,
            Self::Rejection(_) => FrameKind::Rejection,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Call(m) => m.encoded_len(),
            Self::Action(m) => m.encoded_len(),
            Self::Rejection(m) => m.encoded_len(),
        }
    }
}

/// Length-delimited codec that reads and writes typed [`Frame`]s.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX)
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.inner.decode(src).map_err(map_length_error)? {
            Some(body) => decode_body(body).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let mut body = BytesMut::with_capacity(1 + frame.encoded_len());
        body.put_u8(frame.kind() as u8);
        // Encoding into a BytesMut only fails when the buffer cannot grow.
        let encoded = match &frame {
            Frame::Call(m) => m.encode(&mut body),
            Frame::Action(m) => m.encode(&mut body),
            Frame::Rejection(m) => m.encode(&mut body),
        };
        encoded.map_err(|e| FrameError::Io(std::io::Error::other(e)))?;
        self.inner
            .encode(body.freeze(), dst)
            .map_err(map_length_error)
    }
}

/// Wrap a byte stream in the frame codec.
pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, FrameCodec> {
    Framed::new(io, FrameCodec::new())
}

fn decode_body(mut body: BytesMut) -> Result<Frame, FrameError> {
    if !body.has_remaining() {
        return Err(FrameError::Empty);
    }
    let kind = FrameKind::try_from(body.get_u8())?;
    Ok(match kind {
        FrameKind::Call => Frame::Call(RpcRequest::decode(body)?),
        FrameKind::Action => Frame::Action(Action::decode(body)?),
        FrameKind::Rejection => Frame::Rejection(RpcError::decode(body)?),
    })
}

fn map_length_error(e: std::io::Error) -> FrameError {
    if e
        .get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
    {
        FrameError::TooLarge
    } else {
        FrameError::Io(e)
    }
}
