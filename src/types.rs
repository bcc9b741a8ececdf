//! Core protocol types: patterns, error codes, replies and the crate error.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Frame version byte written by this implementation.
pub const FRAME_VERSION: u8 = 1;

/// Size of the little-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest value the length prefix can carry.
pub const MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Process-local session identifier.
///
/// `0` is reserved for the session a client dials out; servers hand out
/// increasing positive ids to accepted connections.
pub type SessionId = u32;

/// Identifier of the session owned by a client.
pub const CLIENT_SESSION_ID: SessionId = 0;

/// Semantic type of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pattern {
    Push = 0,
    Request = 1,
    Response = 2,
    Ping = 3,
    Pong = 4,
    Sub = 5,
    Unsub = 6,
    Pub = 7,
}

impl Pattern {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Pattern {
    type Error = MsgError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Pattern::Push),
            1 => Ok(Pattern::Request),
            2 => Ok(Pattern::Response),
            3 => Ok(Pattern::Ping),
            4 => Ok(Pattern::Pong),
            5 => Ok(Pattern::Sub),
            6 => Ok(Pattern::Unsub),
            7 => Ok(Pattern::Pub),
            other => Err(MsgError::UnknownPattern(other)),
        }
    }
}

/// Error codes carried on the wire in Response frames and returned by the
/// session API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum NetError {
    Success = 0,
    /// The request handler panicked.
    ExceptionCatched = -99,
    Write = -98,
    Read = -97,
    RequestDataIsEmpty = -96,
    SerialConflict = -95,
    NoHandler = -94,
    ReadErrorNo = -93,
    SessionClosed = -92,
    PushDataIsEmpty = -91,
    /// The encoded message would not fit in a single frame.
    DataTooLarge = -90,
}

impl NetError {
    pub fn code(self) -> i16 {
        self as i16
    }

    /// Map a raw code back to a known variant.
    pub fn from_code(code: i16) -> Option<Self> {
        let err = match code {
            0 => NetError::Success,
            -99 => NetError::ExceptionCatched,
            -98 => NetError::Write,
            -97 => NetError::Read,
            -96 => NetError::RequestDataIsEmpty,
            -95 => NetError::SerialConflict,
            -94 => NetError::NoHandler,
            -93 => NetError::ReadErrorNo,
            -92 => NetError::SessionClosed,
            -91 => NetError::PushDataIsEmpty,
            -90 => NetError::DataTooLarge,
            _ => return None,
        };
        Some(err)
    }

    pub fn is_success(self) -> bool {
        self == NetError::Success
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Outcome of a request: an error code plus an opaque payload.
///
/// `en == 0` means success. Any other value is an application or protocol
/// failure code, see [`NetError`] for the ones this crate produces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub en: i16,
    pub data: Bytes,
}

impl Reply {
    pub fn new(en: i16, data: impl Into<Bytes>) -> Self {
        Self {
            en,
            data: data.into(),
        }
    }

    /// A successful reply carrying `data`.
    pub fn ok(data: impl Into<Bytes>) -> Self {
        Self::new(0, data)
    }

    /// A failed reply with no payload.
    pub fn error(err: NetError) -> Self {
        Self {
            en: err.code(),
            data: Bytes::new(),
        }
    }

    pub fn succeed(&self) -> bool {
        self.en == 0
    }

    /// The error code as a known [`NetError`], if it is one.
    pub fn net_error(&self) -> Option<NetError> {
        NetError::from_code(self.en)
    }
}

/// Main error type for tcpmsg operations.
#[derive(Debug, Error)]
pub enum MsgError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame body of {0} bytes exceeds the 65535 byte limit")]
    FrameTooLarge(usize),

    #[error("stream ended inside a frame ({buffered} bytes buffered, {expected} expected)")]
    Truncated { buffered: usize, expected: usize },

    #[error("malformed {pattern:?} frame: {reason}")]
    Malformed {
        pattern: Pattern,
        reason: &'static str,
    },

    #[error("frame shorter than version and pattern bytes")]
    MissingHeader,

    #[error("unknown pattern byte {0:#04x}")]
    UnknownPattern(u8),

    #[error("session closed")]
    SessionClosed,

    #[error("actor serializer stopped")]
    ActorStopped,

    #[error("node stopped")]
    NodeStopped,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MsgError {
    /// Whether the error means the peer sent bytes that violate the protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            MsgError::Truncated { .. }
                | MsgError::Malformed { .. }
                | MsgError::MissingHeader
                | MsgError::UnknownPattern(_)
        )
    }

    /// The wire-level code reported to callers for this error.
    pub fn net_error(&self) -> NetError {
        match self {
            MsgError::Io(_) => NetError::Write,
            MsgError::FrameTooLarge(_) => NetError::DataTooLarge,
            MsgError::Truncated { .. }
            | MsgError::Malformed { .. }
            | MsgError::MissingHeader
            | MsgError::UnknownPattern(_) => NetError::Read,
            MsgError::SessionClosed | MsgError::ActorStopped | MsgError::NodeStopped => {
                NetError::SessionClosed
            }
            MsgError::Config(_) | MsgError::Json(_) => NetError::ExceptionCatched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_bytes() {
        for b in 0u8..=7 {
            let pattern = Pattern::try_from(b).unwrap();
            assert_eq!(pattern.as_u8(), b);
        }
        assert!(matches!(
            Pattern::try_from(8),
            Err(MsgError::UnknownPattern(8))
        ));
    }

    #[test]
    fn test_net_error_codes_are_stable() {
        assert_eq!(NetError::Success.code(), 0);
        assert_eq!(NetError::ExceptionCatched.code(), -99);
        assert_eq!(NetError::SessionClosed.code(), -92);
        assert_eq!(NetError::PushDataIsEmpty.code(), -91);

        for code in -99..=-90 {
            assert_eq!(NetError::from_code(code).unwrap().code(), code);
        }
        assert_eq!(NetError::from_code(7), None);
    }

    #[test]
    fn test_reply_helpers() {
        let ok = Reply::ok(&b"hello"[..]);
        assert!(ok.succeed());
        assert_eq!(ok.net_error(), Some(NetError::Success));

        let failed = Reply::error(NetError::NoHandler);
        assert!(!failed.succeed());
        assert!(failed.data.is_empty());
        assert_eq!(failed.net_error(), Some(NetError::NoHandler));
    }

    #[test]
    fn test_error_taxonomy() {
        assert!(MsgError::UnknownPattern(9).is_protocol());
        assert!(!MsgError::SessionClosed.is_protocol());
        assert_eq!(MsgError::FrameTooLarge(70_000).net_error(), NetError::DataTooLarge);
        assert_eq!(MsgError::ActorStopped.net_error(), NetError::SessionClosed);
    }
}
