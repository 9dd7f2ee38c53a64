//! Length-delimited envelope framing.
//!
//! Two wire encodings are supported:
//! - legacy: `u32` big-endian payload length, then the JSON payload
//! - modern: `u32` big-endian payload length, a one-byte payload format, then
//!   the payload (format `0` is JSON, the only one this build speaks)
//!
//! The decoder is streaming: `push` accepts arbitrary byte slices, returns
//! every complete envelope, and keeps leftover bytes for the next call.

use crate::protocol::{Envelope, FramingMode};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the length prefix shared by both encodings
pub const LEGACY_HEADER_LEN: usize = 4;
/// Length prefix plus format byte
pub const MODERN_HEADER_LEN: usize = 5;
/// Default upper bound on a single frame payload
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

const FORMAT_JSON: u8 = 0;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("unsupported payload format {0}")]
    UnsupportedFormat(u8),
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("truncated frame: {buffered} bytes buffered without a complete frame")]
    Truncated { buffered: usize },
}

/// Streaming encoder/decoder for envelopes
#[derive(Debug)]
pub struct FrameCodec {
    mode: FramingMode,
    max_frame_bytes: usize,
    buffer: BytesMut,
}

impl FrameCodec {
    pub fn new(mode: FramingMode) -> Self {
        Self::with_max_frame(mode, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame(mode: FramingMode, max_frame_bytes: usize) -> Self {
        Self {
            mode,
            max_frame_bytes,
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Switch encodings. Buffered bytes are kept and decoded with the new mode.
    pub fn set_mode(&mut self, mode: FramingMode) {
        self.mode = mode;
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn set_max_frame_bytes(&mut self, max: usize) {
        self.max_frame_bytes = max;
    }

    /// Bytes received but not yet part of a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame, e.g. when a new transport connection starts.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Encode one envelope into a complete frame.
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, CodecError> {
        let payload = serde_json::to_vec(envelope)?;
        if payload.len() > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_bytes,
            });
        }

        let header_len = match self.mode {
            FramingMode::Legacy => LEGACY_HEADER_LEN,
            FramingMode::Modern => MODERN_HEADER_LEN,
        };
        let mut frame = BytesMut::with_capacity(header_len + payload.len());
        frame.put_u32(payload.len() as u32);
        if self.mode == FramingMode::Modern {
            frame.put_u8(FORMAT_JSON);
        }
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Feed received bytes and return every envelope completed by them.
    ///
    /// On error the buffered bytes are discarded; the caller is expected to
    /// drop the connection since the stream position is no longer trustworthy.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Envelope>, CodecError> {
        self.buffer.extend_from_slice(data);

        let mut envelopes = Vec::new();
        loop {
            match self.decode_next() {
                Ok(Some(env)) => envelopes.push(env),
                Ok(None) => break,
                Err(e) => {
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
        Ok(envelopes)
    }

    /// Report leftover bytes as a truncated frame (called on EOF or read timeout).
    pub fn finish(&mut self) -> Result<(), CodecError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buffered = self.buffer.len();
        self.buffer.clear();
        Err(CodecError::Truncated { buffered })
    }

    fn decode_next(&mut self) -> Result<Option<Envelope>, CodecError> {
        let header_len = match self.mode {
            FramingMode::Legacy => LEGACY_HEADER_LEN,
            FramingMode::Modern => MODERN_HEADER_LEN,
        };
        if self.buffer.len() < header_len {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if len == 0 {
            return Err(CodecError::Malformed("zero-length frame"));
        }
        if len > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_frame_bytes,
            });
        }
        if self.mode == FramingMode::Modern && self.buffer[4] != FORMAT_JSON {
            return Err(CodecError::UnsupportedFormat(self.buffer[4]));
        }
        if self.buffer.len() < header_len + len {
            return Ok(None);
        }

        self.buffer.advance(header_len);
        let payload = self.buffer.split_to(len);
        let envelope = serde_json::from_slice(&payload)?;
        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameType, PayloadMeta, SendPayload};

    fn sample() -> Envelope {
        Envelope::new(FrameType::Send, SendPayload::message("hello there"))
            .with_to("Bob")
            .with_from("Alice")
            .with_meta(PayloadMeta {
                importance: Some(2),
                ..Default::default()
            })
    }

    #[test]
    fn test_legacy_header_layout() {
        let codec = FrameCodec::new(FramingMode::Legacy);
        let frame = codec.encode(&sample()).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - LEGACY_HEADER_LEN);
        assert_eq!(frame[4], b'{');
    }

    #[test]
    fn test_modern_header_layout() {
        let codec = FrameCodec::new(FramingMode::Modern);
        let frame = codec.encode(&sample()).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - MODERN_HEADER_LEN);
        assert_eq!(frame[4], FORMAT_JSON);
    }

    #[test]
    fn test_split_frame_across_pushes() {
        for mode in [FramingMode::Legacy, FramingMode::Modern] {
            let env = sample();
            let frame = FrameCodec::new(mode).encode(&env).unwrap();
            for split in [1, 3, 4, 5, frame.len() / 2, frame.len() - 1] {
                let mut codec = FrameCodec::new(mode);
                let first = codec.push(&frame[..split]).unwrap();
                assert!(first.is_empty());
                assert!(codec.buffered() > 0);
                let second = codec.push(&frame[split..]).unwrap();
                assert_eq!(second, vec![env.clone()]);
                assert_eq!(codec.buffered(), 0);
            }
        }
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut codec = FrameCodec::new(FramingMode::Legacy);
        let a = sample();
        let b = Envelope::new(FrameType::Ping, serde_json::json!({"nonce": 7}));
        let mut bytes = codec.encode(&a).unwrap().to_vec();
        bytes.extend_from_slice(&codec.encode(&b).unwrap());
        // Half of a third frame stays buffered
        let c = codec.encode(&sample()).unwrap();
        bytes.extend_from_slice(&c[..6]);

        let decoded = codec.push(&bytes).unwrap();
        assert_eq!(decoded, vec![a, b]);
        assert_eq!(codec.buffered(), 6);
    }

    #[test]
    fn test_oversize_length_is_error() {
        let mut codec = FrameCodec::with_max_frame(FramingMode::Legacy, 16);
        let err = codec.push(&[0, 0, 1, 0, b'{']).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { size: 256, max: 16 }));
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_zero_length_is_error() {
        let mut codec = FrameCodec::new(FramingMode::Legacy);
        assert!(matches!(
            codec.push(&[0, 0, 0, 0]),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_format_is_error() {
        let mut codec = FrameCodec::new(FramingMode::Modern);
        assert!(matches!(
            codec.push(&[0, 0, 0, 2, 9, b'{', b'}']),
            Err(CodecError::UnsupportedFormat(9))
        ));
    }

    #[test]
    fn test_invalid_json_is_error() {
        let mut codec = FrameCodec::new(FramingMode::Legacy);
        assert!(matches!(
            codec.push(&[0, 0, 0, 3, b'n', b'o', b'p']),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_finish_reports_truncation() {
        let mut codec = FrameCodec::new(FramingMode::Legacy);
        assert!(codec.finish().is_ok());
        codec.push(&[0, 0, 0, 9, b'{']).unwrap();
        assert!(matches!(
            codec.finish(),
            Err(CodecError::Truncated { buffered: 5 })
        ));
        assert_eq!(codec.buffered(), 0);
    }
}
