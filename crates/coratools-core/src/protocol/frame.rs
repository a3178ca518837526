//! Stream framing for messages carried over a byte-stream transport
//!
//! Frame layout: `u4 body_len | u4 session_no | u4 message_type | body | u4 crc32`.
//! The checksum covers session number, message type and body.

use crate::errors::MessageError;
use crate::protocol::message::Message;
use crate::types::SessionNo;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Bytes preceding the body
pub const FRAME_HEADER_LEN: usize = 12;

/// Bytes following the body
pub const FRAME_TRAILER_LEN: usize = 4;

/// Largest body accepted from the wire
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

fn frame_checksum(session_no: u32, message_type: u32, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&session_no.to_be_bytes());
    hasher.update(&message_type.to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}

/// Encode a message into a single frame
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, MessageError> {
    if message.body.len() > MAX_FRAME_LEN {
        return Err(MessageError::FrameTooLarge {
            len: message.body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let session_no = message.session_no.value();
    let mut bytes =
        Vec::with_capacity(FRAME_HEADER_LEN + message.body.len() + FRAME_TRAILER_LEN);
    bytes.extend_from_slice(&(message.body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&session_no.to_be_bytes());
    bytes.extend_from_slice(&message.message_type.to_be_bytes());
    bytes.extend_from_slice(&message.body);
    let checksum = frame_checksum(session_no, message.message_type, &message.body);
    bytes.extend_from_slice(&checksum.to_be_bytes());
    Ok(bytes)
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

/// Incremental frame decoder fed with whatever the transport read
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame, if one is buffered
    ///
    /// A corrupt or oversized frame is an error; the decoder should not be
    /// used afterwards because stream synchronization is lost.
    pub fn next_message(&mut self) -> Result<Option<Message>, MessageError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let body_len = read_u32(&self.buffer[0..4]) as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(MessageError::FrameTooLarge {
                len: body_len,
                max: MAX_FRAME_LEN,
            });
        }

        let total = FRAME_HEADER_LEN + body_len + FRAME_TRAILER_LEN;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let session_no = read_u32(&self.buffer[4..8]);
        let message_type = read_u32(&self.buffer[8..12]);
        let body_end = FRAME_HEADER_LEN + body_len;
        let body = self.buffer[FRAME_HEADER_LEN..body_end].to_vec();
        let expected = read_u32(&self.buffer[body_end..total]);
        self.buffer.drain(..total);

        let actual = frame_checksum(session_no, message_type, &body);
        if actual != expected {
            return Err(MessageError::ChecksumMismatch { expected, actual });
        }

        Ok(Some(Message::new(
            SessionNo::new(session_no),
            message_type,
            body,
        )))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut array = [0u8; 4];
    array.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(array)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new(SessionNo::new(9), 0x103, b"payload".to_vec())
    }

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let frame = encode_frame(&sample()).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&frame[..5]);
        assert_eq!(decoder.next_message().unwrap(), None);

        decoder.extend(&frame[5..]);
        assert_eq!(decoder.next_message().unwrap(), Some(sample()));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_yields_back_to_back_frames() {
        let first = sample();
        let second = Message::new(SessionNo::new(10), 0x104, Vec::new());
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(&first).unwrap());
        decoder.extend(&encode_frame(&second).unwrap());

        assert_eq!(decoder.next_message().unwrap(), Some(first));
        assert_eq!(decoder.next_message().unwrap(), Some(second));
        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn test_corrupt_body_fails_checksum() {
        let mut frame = encode_frame(&sample()).unwrap();
        frame[FRAME_HEADER_LEN] ^= 0xff;
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        assert!(matches!(
            decoder.next_message(),
            Err(MessageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_length_rejected_before_buffering() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&u32::MAX.to_be_bytes());
        decoder.extend(&[0u8; 8]);
        assert!(matches!(
            decoder.next_message(),
            Err(MessageError::FrameTooLarge { .. })
        ));
    }
}
