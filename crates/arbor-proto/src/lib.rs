//! # Arbor Protocol: Wire Format
//!
//! This crate implements the message codec for the Arbor overlay fabric.
//!
//! ## Protocol Design
//!
//! A message travels as a sequence of variable-length frames:
//!
//! ```text
//! [route id]          zero or more, topmost last (iff ROUTE flag)
//! [route delimiter]   empty frame                (iff ROUTE flag)
//! [topic]                                        (iff TOPIC flag)
//! [payload]                                      (iff PAYLOAD flag)
//! [proto]             fixed 20 bytes, always last
//! ```
//!
//! On the byte stream each frame carries a length prefix: a single byte
//! when the frame is shorter than `0xff`, otherwise `0xff` followed by a
//! big-endian `u32`.
//!
//! ## Implementation Notes
//!
//! - **Zero-Copy Proto Frame**: The fixed-layout proto frame is parsed with
//!   [`zerocopy`](https://docs.rs/zerocopy), casting untrusted bytes to a
//!   validated structure without copying.
//!
//! - **Cheap Message Sharing**: Payloads live behind [`bytes::Bytes`], so
//!   cloning a decoded message for multicast is an Arc increment, not a
//!   copy. Message contents are immutable after send.
//!
//! - **JSON Payloads**: Structured payloads are NUL-terminated compact JSON
//!   objects; the routing layers never parse them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod flags;
pub mod matcher;
pub mod message;
pub mod proto;
pub mod route;
pub mod types;

pub use errors::{ProtocolError, Result};
pub use flags::{MsgFlags, RoleMask};
pub use matcher::MsgMatch;
pub use message::Message;
pub use proto::ProtoFrame;
pub use types::{KeepaliveStatus, MsgType, TypeMask};

/// Nodeid wildcard: the request is handled by the local broker.
pub const NODEID_ANY: u32 = u32::MAX;

/// Userid of a message whose origin has not been authenticated.
pub const USERID_UNKNOWN: u32 = u32::MAX;

/// Matchtag reserved for uncorrelated messages; never routes to a future.
pub const MATCHTAG_NONE: u32 = 0;
