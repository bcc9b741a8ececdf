//! Pattern-level frame encoding and decoding.
//!
//! A frame body is `[u8 version][u8 pattern][fixed fields][payload]`. The
//! fixed fields depend on the pattern:
//!
//! | Pattern  | Fixed fields                         |
//! |----------|--------------------------------------|
//! | Push     | none                                 |
//! | Request  | serial: u16                          |
//! | Response | serial: u16, en: i16                 |
//! | Ping     | serial: u8                           |
//! | Pong     | serial: u8                           |
//! | Sub      | subject, NUL terminated              |
//! | Unsub    | none                                 |
//! | Pub      | subject, NUL terminated, then body   |
//!
//! All multi-byte integers are little-endian.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::FrameCodec;
use crate::types::{MsgError, Pattern, FRAME_VERSION, MAX_FRAME_BODY};

/// A decoded message, one variant per pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Push { body: Bytes },
    Request { serial: u16, body: Bytes },
    Response { serial: u16, en: i16, body: Bytes },
    Ping { serial: u8 },
    Pong { serial: u8 },
    Sub { subject: String },
    Unsub,
    Pub { subject: String, body: Bytes },
}

impl Message {
    pub fn pattern(&self) -> Pattern {
        match self {
            Message::Push { .. } => Pattern::Push,
            Message::Request { .. } => Pattern::Request,
            Message::Response { .. } => Pattern::Response,
            Message::Ping { .. } => Pattern::Ping,
            Message::Pong { .. } => Pattern::Pong,
            Message::Sub { .. } => Pattern::Sub,
            Message::Unsub => Pattern::Unsub,
            Message::Pub { .. } => Pattern::Pub,
        }
    }

    /// Size of the fixed fields plus payload, excluding version and pattern.
    fn content_len(&self) -> usize {
        match self {
            Message::Push { body } => body.len(),
            Message::Request { body, .. } => 2 + body.len(),
            Message::Response { body, .. } => 4 + body.len(),
            Message::Ping { .. } | Message::Pong { .. } => 1,
            Message::Sub { subject } => subject.len() + 1,
            Message::Unsub => 0,
            Message::Pub { subject, body } => subject.len() + 1 + body.len(),
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub message: Message,
}

impl Frame {
    pub fn new(message: Message) -> Self {
        Self {
            version: FRAME_VERSION,
            message,
        }
    }

    pub fn pattern(&self) -> Pattern {
        self.message.pattern()
    }

    /// Value of the length prefix for this frame.
    pub fn body_len(&self) -> usize {
        2 + self.message.content_len()
    }

    /// Encode version, pattern, fixed fields and payload.
    pub fn encode_body(&self) -> Result<Bytes, MsgError> {
        let len = self.body_len();
        if len > MAX_FRAME_BODY {
            return Err(MsgError::FrameTooLarge(len));
        }

        if let Message::Sub { subject } | Message::Pub { subject, .. } = &self.message {
            if subject.as_bytes().contains(&0) {
                return Err(MsgError::Malformed {
                    pattern: self.pattern(),
                    reason: "subject contains NUL",
                });
            }
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.version);
        buf.put_u8(self.pattern().as_u8());

        match &self.message {
            Message::Push { body } => buf.extend_from_slice(body),
            Message::Request { serial, body } => {
                buf.put_u16_le(*serial);
                buf.extend_from_slice(body);
            }
            Message::Response { serial, en, body } => {
                buf.put_u16_le(*serial);
                buf.put_i16_le(*en);
                buf.extend_from_slice(body);
            }
            Message::Ping { serial } | Message::Pong { serial } => buf.put_u8(*serial),
            Message::Sub { subject } => put_subject(&mut buf, subject),
            Message::Unsub => {}
            Message::Pub { subject, body } => {
                put_subject(&mut buf, subject);
                buf.extend_from_slice(body);
            }
        }

        debug_assert_eq!(buf.len(), len);
        Ok(buf.freeze())
    }

    /// Decode a frame body as produced by [`FrameCodec`].
    pub fn decode(body: Bytes) -> Result<Frame, MsgError> {
        if body.len() < 2 {
            return Err(MsgError::MissingHeader);
        }

        let version = body[0];
        let pattern = Pattern::try_from(body[1])?;
        let mut rdr = Cursor::new(&body[2..]);
        let malformed = |reason| MsgError::Malformed { pattern, reason };

        let message = match pattern {
            Pattern::Push => Message::Push {
                body: body.slice(2..),
            },
            Pattern::Request => {
                let serial = rdr
                    .read_u16::<LittleEndian>()
                    .map_err(|_| malformed("missing serial"))?;
                Message::Request {
                    serial,
                    body: body.slice(4..),
                }
            }
            Pattern::Response => {
                let serial = rdr
                    .read_u16::<LittleEndian>()
                    .map_err(|_| malformed("missing serial"))?;
                let en = rdr
                    .read_i16::<LittleEndian>()
                    .map_err(|_| malformed("missing error code"))?;
                Message::Response {
                    serial,
                    en,
                    body: body.slice(6..),
                }
            }
            Pattern::Ping | Pattern::Pong => {
                let serial = rdr.read_u8().map_err(|_| malformed("missing serial"))?;
                if body.len() != 3 {
                    return Err(malformed("trailing bytes"));
                }
                if pattern == Pattern::Ping {
                    Message::Ping { serial }
                } else {
                    Message::Pong { serial }
                }
            }
            Pattern::Sub => {
                let (subject, rest) = split_subject(&body[2..])
                    .ok_or_else(|| malformed("unterminated subject"))?;
                if rest != body.len() {
                    return Err(malformed("trailing bytes"));
                }
                Message::Sub {
                    subject: subject.map_err(|_| malformed("subject is not UTF-8"))?,
                }
            }
            Pattern::Unsub => {
                if body.len() != 2 {
                    return Err(malformed("trailing bytes"));
                }
                Message::Unsub
            }
            Pattern::Pub => {
                let (subject, rest) = split_subject(&body[2..])
                    .ok_or_else(|| malformed("unterminated subject"))?;
                Message::Pub {
                    subject: subject.map_err(|_| malformed("subject is not UTF-8"))?,
                    body: body.slice(rest..),
                }
            }
        };

        Ok(Frame { version, message })
    }
}

fn put_subject(buf: &mut BytesMut, subject: &str) {
    buf.extend_from_slice(subject.as_bytes());
    buf.put_u8(0);
}

/// Returns the subject and the offset in the frame body right after its NUL.
fn split_subject(src: &[u8]) -> Option<(Result<String, std::string::FromUtf8Error>, usize)> {
    let nul = src.iter().position(|b| *b == 0)?;
    Some((String::from_utf8(src[..nul].to_vec()), 2 + nul + 1))
}

/// Encode a frame including its length prefix.
pub fn encode_frame(frame: &Frame) -> Result<Bytes, MsgError> {
    let body = frame.encode_body()?;
    let mut dst = BytesMut::with_capacity(body.len() + 2);
    FrameCodec::new().encode(body, &mut dst)?;
    Ok(dst.freeze())
}

/// Try to decode one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` without consuming anything when the frame is not
/// complete yet.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, MsgError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return Ok(None);
    }

    match FrameCodec::new().decode(buf)? {
        Some(body) => Frame::decode(body).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_messages() -> Vec<Message> {
        vec![
            Message::Push {
                body: Bytes::from_static(b"push body"),
            },
            Message::Push { body: Bytes::new() },
            Message::Request {
                serial: 0xBEEF,
                body: Bytes::from_static(b"req"),
            },
            Message::Response {
                serial: 7,
                en: -92,
                body: Bytes::from_static(b"resp"),
            },
            Message::Ping { serial: 200 },
            Message::Pong { serial: 3 },
            Message::Sub {
                subject: "prices.eu".to_string(),
            },
            Message::Unsub,
            Message::Pub {
                subject: "prices.eu".to_string(),
                body: Bytes::from_static(b"\x00\x01binary"),
            },
        ]
    }

    #[test]
    fn test_length_prefix_matches_encoded_size() {
        for message in all_messages() {
            let frame = Frame::new(message);
            let wire = encode_frame(&frame).unwrap();
            let len = u16::from_le_bytes([wire[0], wire[1]]) as usize;
            assert_eq!(len, wire.len() - 2, "{:?}", frame.pattern());
            assert_eq!(len, frame.body_len());
        }
    }

    #[test]
    fn test_every_pattern_decodes_back() {
        for message in all_messages() {
            let frame = Frame::new(message);
            let mut buf = BytesMut::from(&encode_frame(&frame).unwrap()[..]);
            let decoded = try_decode_frame(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_wire_layout() {
        let frame = Frame::new(Message::Response {
            serial: 0x0102,
            en: -2,
            body: Bytes::from_static(b"ok"),
        });
        let wire = encode_frame(&frame).unwrap();
        assert_eq!(
            &wire[..],
            &[0x08, 0x00, 0x01, 0x02, 0x02, 0x01, 0xFE, 0xFF, b'o', b'k']
        );

        let ping = encode_frame(&Frame::new(Message::Ping { serial: 9 })).unwrap();
        assert_eq!(&ping[..], &[0x03, 0x00, 0x01, 0x03, 0x09]);
    }

    #[test]
    fn test_push_frame_from_raw_bytes() {
        let body = Bytes::from_static(&[0x01, 0x00, 1, 2, 3, 4, 5, 6]);
        let frame = Frame::decode(body).unwrap();
        assert_eq!(frame.version, 1);
        assert_eq!(
            frame.message,
            Message::Push {
                body: Bytes::from_static(&[1, 2, 3, 4, 5, 6])
            }
        );
    }

    #[test]
    fn test_unknown_pattern() {
        let err = Frame::decode(Bytes::from_static(&[0x01, 0x2A, 0x00])).unwrap_err();
        assert!(matches!(err, MsgError::UnknownPattern(0x2A)));
    }

    #[test]
    fn test_short_frames_are_malformed() {
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0x01])),
            Err(MsgError::MissingHeader)
        ));
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0x01, 0x01, 0x05])),
            Err(MsgError::Malformed {
                pattern: Pattern::Request,
                ..
            })
        ));
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0x01, 0x02, 0x05, 0x00, 0x01])),
            Err(MsgError::Malformed {
                pattern: Pattern::Response,
                ..
            })
        ));
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0x01, 0x03])),
            Err(MsgError::Malformed {
                pattern: Pattern::Ping,
                ..
            })
        ));
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0x01, 0x04, 0x01, 0x02])),
            Err(MsgError::Malformed {
                pattern: Pattern::Pong,
                ..
            })
        ));
    }

    #[test]
    fn test_subject_must_be_terminated() {
        let err = Frame::decode(Bytes::from_static(b"\x01\x07topic")).unwrap_err();
        assert!(matches!(
            err,
            MsgError::Malformed {
                pattern: Pattern::Pub,
                reason: "unterminated subject"
            }
        ));
    }

    #[test]
    fn test_subject_with_nul_is_not_encoded() {
        let frame = Frame::new(Message::Sub {
            subject: "a\0b".to_string(),
        });
        assert!(matches!(
            frame.encode_body(),
            Err(MsgError::Malformed {
                pattern: Pattern::Sub,
                ..
            })
        ));
    }

    #[test]
    fn test_pub_body_may_contain_nul() {
        let frame = Frame::decode(Bytes::from_static(b"\x01\x07a.b\x00x\x00y")).unwrap();
        assert_eq!(
            frame.message,
            Message::Pub {
                subject: "a.b".to_string(),
                body: Bytes::from_static(b"x\x00y"),
            }
        );
    }

    #[test]
    fn test_every_ping_serial() {
        for k in 0..=u8::MAX {
            let body = Frame::new(Message::Ping { serial: k }).encode_body().unwrap();
            assert_eq!(Frame::decode(body).unwrap().message, Message::Ping { serial: k });
        }
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let frame = Frame::new(Message::Request {
            serial: 1,
            body: Bytes::from(vec![0; MAX_FRAME_BODY - 3]),
        });
        assert!(matches!(frame.encode_body(), Err(MsgError::FrameTooLarge(_))));

        let fits = Frame::new(Message::Request {
            serial: 1,
            body: Bytes::from(vec![0; MAX_FRAME_BODY - 4]),
        });
        assert_eq!(fits.encode_body().unwrap().len(), MAX_FRAME_BODY);
    }

    #[test]
    fn test_incomplete_buffer_is_left_untouched() {
        let wire = encode_frame(&Frame::new(Message::Push {
            body: Bytes::from_static(b"abc"),
        }))
        .unwrap();
        let mut buf = BytesMut::from(&wire[..4]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);
    }
}
