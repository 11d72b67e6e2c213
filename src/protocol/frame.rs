//! Delimiter-terminated text frames
//!
//! Frame format:
//! ```text
//! <line>\n<line>\n...<line>\r\n
//! ```
//!
//! `\n` separates lines inside a frame and `\r\n` ends the frame. The same
//! framing is used in both directions.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

/// End-of-frame delimiter
pub const FRAME_DELIMITER: &[u8] = b"\r\n";

/// Separator between lines of one frame
pub const LINE_SEPARATOR: char = '\n';

/// Default upper bound for a single inbound frame (64 KiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// A single frame payload, delimiter stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from a payload that does not contain the delimiter
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Build a frame by joining lines with the line separator
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut payload = String::new();
        for (i, line) in lines.into_iter().enumerate() {
            if i > 0 {
                payload.push(LINE_SEPARATOR);
            }
            payload.push_str(line.as_ref());
        }
        Self::new(payload)
    }

    /// Payload as UTF-8 text
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    /// Total size on the wire
    pub fn encoded_size(&self) -> usize {
        self.payload.len() + FRAME_DELIMITER.len()
    }

    /// Encode this frame, delimiter included
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(FRAME_DELIMITER);
        buf.freeze()
    }
}

/// What the decoder hands to the session for each inbound unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A complete, delimiter-terminated frame
    Frame(Frame),
    /// A frame that exceeded the size limit; its bytes were discarded
    Oversized { discarded: usize },
    /// Bytes left over when the peer closed before sending the delimiter
    Truncated(Bytes),
}

/// Streaming decoder for `\r\n`-terminated frames
///
/// Frames larger than `max_frame_len` are skipped up to the next delimiter
/// and reported once as [`InboundFrame::Oversized`], so a bad frame never
/// desynchronises the stream.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_len: usize,
    /// Where to resume scanning for the delimiter
    next_index: usize,
    /// Bytes dropped so far while skipping an oversized frame
    discarding: Option<usize>,
}

impl FrameCodec {
    /// Create a codec with the default size limit
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Create a codec with a custom frame size limit
    pub fn with_max_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            next_index: 0,
            discarding: None,
        }
    }

    /// Configured size limit
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn find_delimiter(&self, buf: &[u8]) -> Option<usize> {
        // Back up one byte so a delimiter split across reads is still found
        let start = self.next_index.saturating_sub(1);
        buf[start..]
            .windows(FRAME_DELIMITER.len())
            .position(|w| w == FRAME_DELIMITER)
            .map(|pos| start + pos)
    }

    /// Drop everything but a trailing `\r`, which may start the delimiter
    fn discard_pending(buf: &mut BytesMut) -> usize {
        let keep = usize::from(buf.last() == Some(&b'\r'));
        let dropped = buf.len() - keep;
        let _ = buf.split_to(dropped);
        dropped
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = InboundFrame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<InboundFrame>> {
        if let Some(discarded) = self.discarding {
            self.next_index = 0;
            return match self.find_delimiter(buf) {
                Some(pos) => {
                    let _ = buf.split_to(pos + FRAME_DELIMITER.len());
                    self.discarding = None;
                    Ok(Some(InboundFrame::Oversized {
                        discarded: discarded + pos,
                    }))
                }
                None => {
                    let dropped = Self::discard_pending(buf);
                    self.discarding = Some(discarded + dropped);
                    Ok(None)
                }
            };
        }

        match self.find_delimiter(buf) {
            Some(pos) if pos > self.max_frame_len => {
                let _ = buf.split_to(pos + FRAME_DELIMITER.len());
                self.next_index = 0;
                Ok(Some(InboundFrame::Oversized { discarded: pos }))
            }
            Some(pos) => {
                let mut frame = buf.split_to(pos + FRAME_DELIMITER.len());
                frame.truncate(pos);
                self.next_index = 0;
                Ok(Some(InboundFrame::Frame(Frame::new(frame.freeze()))))
            }
            // A full-size payload may be followed by a lone '\r'
            None if buf.len() > self.max_frame_len + 1 => {
                let dropped = Self::discard_pending(buf);
                self.discarding = Some(dropped);
                self.next_index = 0;
                Ok(None)
            }
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<InboundFrame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        self.next_index = 0;
        if let Some(discarded) = self.discarding.take() {
            let rest = buf.len();
            buf.clear();
            return Ok(Some(InboundFrame::Oversized {
                discarded: discarded + rest,
            }));
        }

        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(InboundFrame::Truncated(buf.split().freeze())))
        }
    }
}
