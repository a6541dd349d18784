//! Length-prefixed framing for the TCP simulation link
//!
//! A BLE characteristic write is message oriented; over TCP each command is
//! framed as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: command payload ]
//! ```
//!
//! The peer answers every frame with a single ack byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::limits::MAX_PAYLOAD_LEN;

/// Ack byte for an accepted write
pub const ACK_OK: u8 = 0x06;

/// Ack byte for a rejected write
pub const ACK_REJECTED: u8 = 0x15;

/// Errors that can occur during framing
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max: {MAX_PAYLOAD_LEN})")]
    FrameTooLarge(usize),

    #[error("Invalid frame length prefix: {0}")]
    InvalidLength(u32),
}

/// Frame a payload into a length-prefixed buffer
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Try to split one complete frame off the front of `buf`
///
/// Returns:
/// - `Ok(Some(payload))` if a complete frame was decoded
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the length prefix is invalid
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    // Peek at the length prefix without consuming
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len as usize > MAX_PAYLOAD_LEN {
        return Err(FrameError::InvalidLength(len));
    }

    let total_len = 4 + len as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    buf.advance(4);
    Ok(Some(buf.split_to(len as usize).freeze()))
}

/// Streaming frame decoder
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Add received bytes to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Call repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Bytes>, FrameError> {
        decode_frame(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefix() {
        let framed = encode_frame(b"running$ running:true").expect("encode failed");
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]);
        assert_eq!(len as usize, framed.len() - 4);
    }

    #[test]
    fn test_partial_frame() {
        let framed = encode_frame(b"movement$ X:90,Y:0").expect("encode failed");

        let mut buf = BytesMut::from(&framed[..5]);
        assert!(decode_frame(&mut buf).expect("decode error").is_none());
        // Nothing consumed
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_decoder_chunks_and_multiple_frames() {
        let a = encode_frame(b"first").expect("encode failed");
        let b = encode_frame(b"second").expect("encode failed");

        let mut decoder = FrameDecoder::new();
        decoder.extend(&a[..3]);
        assert!(decoder.decode_next().expect("decode error").is_none());
        decoder.extend(&a[3..]);
        decoder.extend(&b);

        assert_eq!(decoder.decode_next().unwrap().unwrap().as_ref(), b"first");
        assert_eq!(decoder.decode_next().unwrap().unwrap().as_ref(), b"second");
        assert!(decoder.decode_next().unwrap().is_none());
    }

    #[test]
    fn test_oversized_frames() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(encode_frame(&payload), Err(FrameError::FrameTooLarge(_))));

        let mut buf = BytesMut::new();
        buf.put_u32(MAX_PAYLOAD_LEN as u32 + 1);
        buf.put_bytes(0, 16);
        assert!(matches!(decode_frame(&mut buf), Err(FrameError::InvalidLength(_))));
    }
}
