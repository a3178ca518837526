//! Message model and body field codec
//!
//! Every request and response is a [`Message`]: a session number, a message
//! type code and a body of primitive fields read and written in a fixed order
//! per message type. Integers are big-endian; strings and byte blobs carry a
//! `u4` length prefix.

use serde::{Deserialize, Serialize};

use crate::errors::MessageError;
use crate::types::{LgrDate, SessionNo, TransactionNo};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Largest string or blob field accepted by the reader
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// A tagged protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub session_no: SessionNo,
    pub message_type: u32,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(session_no: SessionNo, message_type: u32, body: Vec<u8>) -> Self {
        Self {
            session_no,
            message_type,
            body,
        }
    }

    /// Reader positioned at the start of the body
    pub fn reader(&self) -> MessageReader<'_> {
        MessageReader::new(&self.body)
    }

    /// Peek the leading transaction number without consuming anything
    pub fn transaction_no(&self) -> Option<TransactionNo> {
        self.reader().read_u4().ok().map(TransactionNo::new)
    }
}

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

/// Builds a message body field by field
#[derive(Debug, Default, Clone)]
pub struct MessageWriter {
    body: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            body: Vec::with_capacity(capacity),
        }
    }

    pub fn add_bool(&mut self, value: bool) -> &mut Self {
        self.body.push(u8::from(value));
        self
    }

    pub fn add_u2(&mut self, value: u16) -> &mut Self {
        self.body.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn add_u4(&mut self, value: u32) -> &mut Self {
        self.body.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn add_i8(&mut self, value: i64) -> &mut Self {
        self.body.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn add_stamp(&mut self, value: LgrDate) -> &mut Self {
        self.add_i8(value.nanos())
    }

    pub fn add_tran_no(&mut self, value: TransactionNo) -> &mut Self {
        self.add_u4(value.value())
    }

    pub fn add_string(&mut self, value: &str) -> &mut Self {
        self.add_bytes(value.as_bytes())
    }

    pub fn add_bytes(&mut self, value: &[u8]) -> &mut Self {
        // Lengths beyond u32 cannot be represented on the wire; callers never
        // build fields that large because the reader caps at MAX_FIELD_LEN.
        let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
        self.add_u4(len);
        self.body.extend_from_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn finish(self, session_no: SessionNo, message_type: u32) -> Message {
        Message::new(session_no, message_type, self.body)
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

// ----------------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------------

/// Reads body fields in order, never panicking on malformed input
#[derive(Debug, Clone)]
pub struct MessageReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], MessageError> {
        if self.remaining() < needed {
            return Err(MessageError::Truncated {
                offset: self.offset,
                needed,
                available: self.remaining(),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], MessageError> {
        let slice = self.take(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(slice);
        Ok(array)
    }

    pub fn read_bool(&mut self) -> Result<bool, MessageError> {
        Ok(self.take_array::<1>()?[0] != 0)
    }

    pub fn read_u2(&mut self) -> Result<u16, MessageError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u4(&mut self) -> Result<u32, MessageError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i8(&mut self) -> Result<i64, MessageError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_stamp(&mut self) -> Result<LgrDate, MessageError> {
        self.read_i8().map(LgrDate::new)
    }

    pub fn read_tran_no(&mut self) -> Result<TransactionNo, MessageError> {
        self.read_u4().map(TransactionNo::new)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, MessageError> {
        let len = self.read_u4()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(MessageError::FieldTooLarge {
                len,
                max: MAX_FIELD_LEN,
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String, MessageError> {
        let offset = self.offset;
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| MessageError::InvalidUtf8 { offset })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
