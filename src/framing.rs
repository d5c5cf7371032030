//! Client-facing frame boundaries.
//!
//! Two framings are supported:
//!
//! ```text
//! line:    {"@type":"getMe"}\n
//! length:  17\r\n{"@type":"getMe"}
//! ```
//!
//! Replies are written back in the same framing as the requests.

use bytes::{Buf, BytesMut};
use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error;

/// Longest accepted length header, digits only.
const MAX_LENGTH_DIGITS: usize = 20;

/// How request and reply boundaries are marked on a client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// One payload per `\n`-terminated line.
    #[default]
    Line,
    /// `<length>\r\n` header followed by exactly `length` bytes.
    Length,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },
    #[error("invalid length header: {0}")]
    InvalidLength(String),
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl Framing {
    /// Take the next complete frame off the front of `buffer`.
    ///
    /// Returns `Ok(None)` when more data is needed. Consumed bytes are
    /// removed from the buffer; partial frames are left in place.
    pub fn decode(self, buffer: &mut BytesMut, max: usize) -> Result<Option<BytesMut>, FrameError> {
        match self {
            Framing::Line => decode_line(buffer, max),
            Framing::Length => decode_length(buffer, max),
        }
    }

    /// Append `payload` to `output` as one reply frame.
    pub fn encode(self, payload: &[u8], output: &mut BytesMut) {
        match self {
            Framing::Line => {
                output.reserve(payload.len() + 1);
                output.extend_from_slice(payload);
                output.extend_from_slice(b"\n");
            }
            Framing::Length => {
                let header = format!("{}\r\n", payload.len());
                output.reserve(header.len() + payload.len());
                output.extend_from_slice(header.as_bytes());
                output.extend_from_slice(payload);
            }
        }
    }
}

fn decode_line(buffer: &mut BytesMut, max: usize) -> Result<Option<BytesMut>, FrameError> {
    loop {
        let Some(end) = buffer.iter().position(|&b| b == b'\n') else {
            if buffer.len() > max {
                return Err(FrameError::Oversized {
                    len: buffer.len(),
                    max,
                });
            }
            return Ok(None);
        };

        let mut line = buffer.split_to(end + 1);
        line.truncate(end);
        if line.last() == Some(&b'\r') {
            line.truncate(end - 1);
        }

        if line.len() > max {
            return Err(FrameError::Oversized {
                len: line.len(),
                max,
            });
        }

        // Skip blank lines
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        return Ok(Some(line));
    }
}

fn decode_length(buffer: &mut BytesMut, max: usize) -> Result<Option<BytesMut>, FrameError> {
    let Some(line_end) = find_crlf(buffer) else {
        if buffer.len() > MAX_LENGTH_DIGITS {
            return Err(FrameError::InvalidLength(
                String::from_utf8_lossy(&buffer[..MAX_LENGTH_DIGITS]).into_owned(),
            ));
        }
        return Ok(None);
    };

    let header = std::str::from_utf8(&buffer[..line_end])
        .map_err(|_| FrameError::InvalidLength("non-utf8 header".to_string()))?
        .trim();

    let length: usize = header
        .parse()
        .map_err(|_| FrameError::InvalidLength(header.to_string()))?;

    if length > max {
        return Err(FrameError::Oversized { len: length, max });
    }

    let header_len = line_end + 2;
    if buffer.len() < header_len + length {
        buffer.reserve(header_len + length - buffer.len());
        return Ok(None);
    }

    buffer.advance(header_len);
    Ok(Some(buffer.split_to(length)))
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
