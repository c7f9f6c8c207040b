//! Fast frame codec.
//!
//! Wire layout, all integers big-endian:
//!
//! ```text
//! +-------+----------+-------+---------+-------------------------+------+
//! | magic | length   | flags | id      | api_len | api (request) | body |
//! | 1 B   | 4 B      | 1 B   | 8 B     | 2 B     | api_len B     | ...  |
//! +-------+----------+-------+---------+-------------------------+------+
//!          \________ length covers everything after this field ________/
//! ```
//!
//! Response frames omit the api fields and correlate purely by id.

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// First byte of every frame. Not an ASCII letter, so an HTTP request line
/// can never be mistaken for a frame.
pub const FRAME_MAGIC: u8 = 0xFA;

/// Magic byte plus length field.
pub const PREFIX_LEN: usize = 5;

/// Flags plus id: the smallest valid value of the length field.
pub const MIN_FRAME_LEN: u32 = 9;

/// Default upper bound on the length field.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 8 * 1024 * 1024;

const FLAG_REQUEST: u8 = 0b01;
const FLAG_EXCEPTION: u8 = 0b10;

/// One Fast protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Operation name; empty on responses.
    pub api: String,
    /// Correlation id, unique among this connection's outstanding calls.
    pub id: u64,
    /// Set on requests (the `isFromClient` bit), clear on responses.
    pub is_request: bool,
    /// Response carries an error message instead of a result.
    pub is_exception: bool,
    /// Serializer-defined payload.
    pub body: Bytes,
}

impl Frame {
    /// Create a request frame.
    pub fn request(api: impl Into<String>, id: u64, body: impl Into<Bytes>) -> Frame {
        Frame {
            api: api.into(),
            id,
            is_request: true,
            is_exception: false,
            body: body.into(),
        }
    }

    /// Create a successful response frame.
    pub fn response(id: u64, body: impl Into<Bytes>) -> Frame {
        Frame {
            api: String::new(),
            id,
            is_request: false,
            is_exception: false,
            body: body.into(),
        }
    }

    /// Create an exception response carrying a UTF-8 message.
    pub fn exception(id: u64, message: &str) -> Frame {
        Frame {
            api: String::new(),
            id,
            is_request: false,
            is_exception: true,
            body: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    /// The message of an exception frame.
    pub fn exception_message(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_request {
            flags |= FLAG_REQUEST;
        }
        if self.is_exception {
            flags |= FLAG_EXCEPTION;
        }
        flags
    }

    /// Value of the length field for this frame.
    fn frame_len(&self) -> usize {
        let api = if self.is_request { 2 + self.api.len() } else { 0 };
        MIN_FRAME_LEN as usize + api + self.body.len()
    }

    /// Total encoded size including magic and length field.
    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN + self.frame_len()
    }

    /// Encode a frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Encode a frame into an existing buffer.
    ///
    /// Api names longer than `u16::MAX` bytes are truncated at a char boundary.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let api = truncate_api(&self.api);
        let api_len = if self.is_request { 2 + api.len() } else { 0 };
        let frame_len = MIN_FRAME_LEN as usize + api_len + self.body.len();

        buf.reserve(PREFIX_LEN + frame_len);
        buf.put_u8(FRAME_MAGIC);
        buf.put_u32(frame_len as u32);
        buf.put_u8(self.flags());
        buf.put_u64(self.id);
        if self.is_request {
            buf.put_u16(api.len() as u16);
            buf.put_slice(api.as_bytes());
        }
        buf.put_slice(&self.body);
    }
}

fn truncate_api(api: &str) -> &str {
    let max = u16::MAX as usize;
    if api.len() <= max {
        return api;
    }
    let mut end = max;
    while !api.is_char_boundary(end) {
        end -= 1;
    }
    &api[..end]
}

/// Parse result
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed a frame with bytes consumed
    Complete(Frame, usize),
    /// Need more data
    Incomplete,
    /// The stream is corrupt
    Error(FrameError),
}

/// Parse one frame from the front of `buffer` without consuming it.
pub fn parse(buffer: &[u8], max_frame_len: u32) -> ParseResult {
    if buffer.is_empty() {
        return ParseResult::Incomplete;
    }
    if buffer[0] != FRAME_MAGIC {
        return ParseResult::Error(FrameError::BadMagic(buffer[0]));
    }
    if buffer.len() < PREFIX_LEN {
        return ParseResult::Incomplete;
    }

    let mut header = &buffer[1..PREFIX_LEN];
    let frame_len = header.get_u32();
    if frame_len < MIN_FRAME_LEN {
        return ParseResult::Error(FrameError::TooShort(frame_len));
    }
    if frame_len > max_frame_len {
        return ParseResult::Error(FrameError::TooLarge {
            len: frame_len,
            max: max_frame_len,
        });
    }

    let total = PREFIX_LEN + frame_len as usize;
    if buffer.len() < total {
        return ParseResult::Incomplete;
    }

    match decode_payload(&buffer[PREFIX_LEN..total]) {
        Ok(frame) => ParseResult::Complete(frame, total),
        Err(e) => ParseResult::Error(e),
    }
}

/// Decode the bytes covered by the length field.
fn decode_payload(mut payload: &[u8]) -> Result<Frame, FrameError> {
    let flags = payload.get_u8();
    if flags & !(FLAG_REQUEST | FLAG_EXCEPTION) != 0 {
        return Err(FrameError::ReservedFlags(flags));
    }
    let id = payload.get_u64();
    let is_request = flags & FLAG_REQUEST != 0;

    let api = if is_request {
        if payload.len() < 2 {
            return Err(FrameError::ApiOverrun(0));
        }
        let api_len = payload.get_u16();
        if payload.len() < api_len as usize {
            return Err(FrameError::ApiOverrun(api_len));
        }
        let (name, rest) = payload.split_at(api_len as usize);
        payload = rest;
        std::str::from_utf8(name)
            .map_err(|_| FrameError::InvalidApi)?
            .to_string()
    } else {
        String::new()
    };

    Ok(Frame {
        api,
        id,
        is_request,
        is_exception: flags & FLAG_EXCEPTION != 0,
        body: Bytes::copy_from_slice(payload),
    })
}

/// Extract every complete frame from the front of `buffer`.
///
/// Consumed bytes are removed; a trailing partial frame stays for the next
/// receive.
pub fn extract(buffer: &mut BytesMut, max_frame_len: u32) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    loop {
        match parse(buffer, max_frame_len) {
            ParseResult::Complete(frame, consumed) => {
                buffer.advance(consumed);
                frames.push(frame);
            }
            ParseResult::Incomplete => return Ok(frames),
            ParseResult::Error(e) => return Err(e),
        }
    }
}
