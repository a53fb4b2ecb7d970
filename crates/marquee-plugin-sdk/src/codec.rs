//! Newline-delimited JSON framing for [`Frame`]s.
//!
//! A line that does not decode is a protocol violation and ends the stream;
//! plugins must keep stdout for frames and log to stderr.

use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::wire::Frame;

/// Upper bound for a single encoded frame.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    TooLong,
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<LinesCodecError> for CodecError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => CodecError::TooLong,
            LinesCodecError::Io(err) => CodecError::Io(err),
        }
    }
}

#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
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
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        while let Some(line) = self.lines.decode(src)? {
            if let Some(frame) = parse_line(&line)? {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        while let Some(line) = self.lines.decode_eof(src)? {
            if let Some(frame) = parse_line(&line)? {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

fn parse_line(line: &str) -> Result<Option<Frame>, CodecError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(trimmed)?))
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let line = serde_json::to_string(&frame)?;
        self.lines.encode(line, dst)?;
        Ok(())
    }
}
