//! Protocol layer for the line-oriented chat server
//!
//! This module provides:
//! - `\r\n`-terminated frame decoding
//! - Request parsing and reply encoding

pub mod frame;
pub mod messages;

// Re-export commonly used types
pub use frame::{DEFAULT_MAX_FRAME_LEN, FRAME_DELIMITER, Frame, FrameCodec, InboundFrame};
pub use messages::{
    Command, MAX_LOGS_LIMIT, ProtocolError, ProtocolErrorKind, Reply, Request, broadcast_frame,
};
