//! Error types for the coratools core
//!
//! These errors describe contract violations and local faults. Failures that a
//! server or transport reports during a transaction are not errors: they are
//! delivered to clients as typed failure enums (see [`crate::failure`]).

use std::io;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors raised while reading or writing message bodies
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("Message truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("Invalid UTF-8 in string field at offset {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("Field too large: {len} bytes (max {max})")]
    FieldTooLarge { len: usize, max: usize },
    #[error("Frame checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
    #[error("Unexpected message type {message_type:#x}")]
    UnexpectedType { message_type: u32 },
}

/// Errors raised by the database worker queue
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker thread has shut down")]
    ShutDown,
    #[error("Worker thread could not be spawned: {reason}")]
    SpawnFailed { reason: String },
}

// ----------------------------------------------------------------------------
// Core Error Type
// ----------------------------------------------------------------------------

/// Core error type for coratools components
#[derive(Debug, thiserror::Error)]
pub enum CoraError {
    /// An operation was attempted in a component state that does not allow it
    #[error("Invalid state for {operation}: component is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// An argument failed validation (dead client reference, empty name, ...)
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// The event queue or outbound channel has been torn down
    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl CoraError {
    /// Create an invalid state error
    pub fn invalid_state(operation: &'static str, state: &'static str) -> Self {
        CoraError::InvalidState { operation, state }
    }

    /// Create an invalid argument error with a reason
    pub fn invalid_argument<T: Into<String>>(reason: T) -> Self {
        CoraError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        CoraError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        CoraError::Configuration {
            reason: reason.into(),
        }
    }

    /// True for contract violations that indicate a programming error
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            CoraError::InvalidState { .. } | CoraError::InvalidArgument { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, CoraError>;
pub type CoraResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
