//! # tcpmsg
//!
//! A lightweight bidirectional messaging protocol over TCP. Either end of a
//! connection can:
//!
//! * **Push** a one-way message
//! * **Request** and asynchronously await a correlated **Response**
//! * **Ping** the other side to keep the connection alive
//!
//! ## Quick Start
//!
//! ```rust
//! use bytes::{Bytes, BytesMut};
//! use tcpmsg::{Frame, Message};
//!
//! let frame = Frame::new(Message::Request {
//!     serial: 1,
//!     body: Bytes::from_static(b"hello"),
//! });
//!
//! let encoded = tcpmsg::encode_frame(&frame)?;
//!
//! let mut buf = BytesMut::from(&encoded[..]);
//! let decoded = tcpmsg::try_decode_frame(&mut buf)?.unwrap();
//!
//! assert_eq!(frame, decoded);
//! # Ok::<(), tcpmsg::MsgError>(())
//! ```
//!
//! ## Wire Format
//!
//! Every frame is a length-prefixed body:
//!
//! - LEN (2B LE): length of everything after this field
//! - VER (1B): frame version (`0x01`)
//! - PATTERN (1B): frame type
//! - pattern specific fields, then the payload
//!
//! | Pattern | Name     | Fields                         |
//! |---------|----------|--------------------------------|
//! | 0       | PUSH     | payload                        |
//! | 1       | REQUEST  | serial (u16 LE), payload       |
//! | 2       | RESPONSE | serial (u16 LE), en (i16 LE), payload |
//! | 3       | PING     | serial (u8)                    |
//! | 4       | PONG     | serial (u8)                    |
//! | 5       | SUB      | subject, NUL                   |
//! | 6       | UNSUB    |                                |
//! | 7       | PUB      | subject, NUL, payload          |
//!
//! ## Runtime Model
//!
//! Each [`Client`] or [`Server`] owns one actor task ([`sta::Sta`]) that
//! serializes push delivery, request dispatch and response correlation for
//! all of its sessions. Request handlers run on their own tasks and hand
//! their replies back through a bounded queue.

pub mod codec;
pub mod config;
pub mod frame;
pub mod handler;
pub mod node;
pub mod session;
pub mod sta;
pub mod tcp;
pub mod types;

// Re-export main types for convenience
pub use types::{
    MsgError, NetError, Pattern, Reply, SessionId, CLIENT_SESSION_ID, FRAME_VERSION,
    MAX_FRAME_BODY,
};

pub use codec::FrameCodec;
pub use config::{ClientConfig, NodeConfig, ServerConfig};
pub use frame::{encode_frame, try_decode_frame, Frame, Message};
pub use handler::Handler;
pub use node::{IoCounters, KeepAlivePolicy, SessionSource, SweepReport};
pub use session::Session;
pub use sta::{ResponseToken, Sta, StaHandle};
pub use tcp::{Client, ClientState, Server};
