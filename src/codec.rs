//! Length-prefixed frame codec.
//!
//! Splits a byte stream into frame bodies. Each frame on the wire is
//! `[u16 LE length][body]`, where `length` counts the body only. The codec
//! knows nothing about patterns; see [`crate::frame`] for that layer.
//!
//! Parsing is a two-state machine:
//! - `Length`: need 2 bytes, consume them once available
//! - `Body(n)`: need `n` more bytes, consume nothing until all are buffered

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{MsgError, LENGTH_PREFIX_SIZE, MAX_FRAME_BODY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Length,
    Body(usize),
}

/// tokio-util codec producing one [`Bytes`] body per frame.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Length,
        }
    }

    /// True when no partially read frame is pending.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = MsgError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.state {
            DecodeState::Length => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let len = src.get_u16_le() as usize;
                self.state = DecodeState::Body(len);
                len
            }
            DecodeState::Body(len) => len,
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.state = DecodeState::Length;
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(body) = self.decode(src)? {
            return Ok(Some(body));
        }

        match self.state {
            DecodeState::Length if src.is_empty() => Ok(None),
            DecodeState::Length => Err(MsgError::Truncated {
                buffered: src.len(),
                expected: LENGTH_PREFIX_SIZE,
            }),
            DecodeState::Body(expected) => Err(MsgError::Truncated {
                buffered: src.len(),
                expected,
            }),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = MsgError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if body.len() > MAX_FRAME_BODY {
            return Err(MsgError::FrameTooLarge(body.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u16_le(body.len() as u16);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
