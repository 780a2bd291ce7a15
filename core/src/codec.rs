//! Newline-delimited JSON framing for the worker protocol.
//!
//! Worker output arrives in arbitrary chunks. [`FrameDecoder`] accumulates
//! bytes until a `\n` and only then decodes the line, so a frame split over
//! several reads or several frames packed into one read both come out whole
//! and exactly once.

use kernelhub_protocol::InboundFrame;
use kernelhub_protocol::OutboundFrame;
use serde_json::Value;

use crate::error::CodecError;

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Frame(InboundFrame),
    /// Valid JSON with a `type` this supervisor does not understand.
    Unrecognized { frame_type: String },
}

#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
    /// Set after an oversized partial line was dropped; bytes are discarded
    /// until the next newline.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
            discarding: false,
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feeds one chunk and returns every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<DecodedFrame, CodecError>> {
        let mut decoded = Vec::new();
        let mut rest = chunk;
        while !rest.is_empty() {
            let Some(newline) = rest.iter().position(|byte| *byte == b'\n') else {
                if self.discarding {
                    break;
                }
                if self.buffer.len() + rest.len() > self.max_frame_bytes {
                    self.buffer.clear();
                    self.discarding = true;
                    decoded.push(Err(self.too_large()));
                } else {
                    self.buffer.extend_from_slice(rest);
                }
                break;
            };

            let (line, tail) = rest.split_at(newline);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if self.buffer.len() + line.len() > self.max_frame_bytes {
                self.buffer.clear();
                decoded.push(Err(self.too_large()));
                continue;
            }

            self.buffer.extend_from_slice(line);
            let line = std::mem::take(&mut self.buffer);
            if let Some(frame) = decode_line(&line) {
                decoded.push(frame);
            }
        }
        decoded
    }

    fn too_large(&self) -> CodecError {
        CodecError::FrameTooLarge {
            limit: self.max_frame_bytes,
        }
    }
}

fn decode_line(line: &[u8]) -> Option<Result<DecodedFrame, CodecError>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    Some(decode_json(line))
}

fn decode_json(line: &[u8]) -> Result<DecodedFrame, CodecError> {
    let value: Value =
        serde_json::from_slice(line).map_err(|source| CodecError::Malformed { source })?;
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?
        .to_string();
    if !InboundFrame::is_known_type(&frame_type) {
        return Ok(DecodedFrame::Unrecognized { frame_type });
    }
    serde_json::from_value(value)
        .map(DecodedFrame::Frame)
        .map_err(|source| CodecError::InvalidFrame { frame_type, source })
}

/// Serialises one command as a single newline-terminated line.
pub fn encode(frame: &OutboundFrame) -> Result<Vec<u8>, CodecError> {
    let mut bytes = serde_json::to_vec(frame).map_err(|source| CodecError::Encode { source })?;
    bytes.push(b'\n');
    Ok(bytes)
}
