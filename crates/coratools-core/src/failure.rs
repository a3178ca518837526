//! Failure taxonomy
//!
//! Three layers, each re-mapped into the next:
//!
//! 1. [`SessionFailure`]: what the transport or router reports
//! 2. per-component failure/outcome enums, a superset of layer 1 plus the
//!    protocol reasons decoded from start acknowledgements and stopped
//!    notifications
//! 3. [`QueryFileOutcome`]: the composite's unified outcome
//!
//! Response and reason codes are fixed tables; codes missing from a table map
//! to `Unknown`.

use core::fmt;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Session Failures
// ----------------------------------------------------------------------------

/// Failure of the connection or of a router session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionFailure {
    Unknown,
    ConnectionFailed,
    InvalidLogon,
    SessionBroken,
    SecurityBlocked,
    Unsupported,
}

impl SessionFailure {
    /// Map a handshake response code (code 1 is success and has no failure)
    pub fn from_hello_code(code: u32) -> Option<Self> {
        use crate::protocol::codes::hello;
        match code {
            hello::OK => None,
            hello::INVALID_LOGON => Some(SessionFailure::InvalidLogon),
            hello::SECURITY_BLOCKED => Some(SessionFailure::SecurityBlocked),
            hello::UNSUPPORTED => Some(SessionFailure::Unsupported),
            _ => Some(SessionFailure::Unknown),
        }
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionFailure::Unknown => "unknown session failure",
            SessionFailure::ConnectionFailed => "connection failed",
            SessionFailure::InvalidLogon => "invalid logon",
            SessionFailure::SessionBroken => "session broken",
            SessionFailure::SecurityBlocked => "security blocked",
            SessionFailure::Unsupported => "unsupported by server",
        };
        f.write_str(text)
    }
}

/// Shared layer-1 mapping applied by every component enum
macro_rules! impl_from_session_failure {
    ($target:ident) => {
        impl From<SessionFailure> for $target {
            fn from(failure: SessionFailure) -> Self {
                match failure {
                    SessionFailure::Unknown => $target::Unknown,
                    SessionFailure::ConnectionFailed | SessionFailure::SessionBroken => {
                        $target::SessionFailed
                    }
                    SessionFailure::InvalidLogon => $target::InvalidLogon,
                    SessionFailure::SecurityBlocked => $target::SecurityBlocked,
                    SessionFailure::Unsupported => $target::Unsupported,
                }
            }
        }
    };
}

// ----------------------------------------------------------------------------
// Formatted Data Advisor
// ----------------------------------------------------------------------------

/// Failure reported by [`crate::FormattedDataAdvisor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdvisorFailure {
    Unknown,
    SessionFailed,
    InvalidLogon,
    SecurityBlocked,
    Unsupported,
    InvalidTableName,
    InvalidStartOption,
    InvalidFormatOption,
    InvalidStationName,
    InsufficientResources,
    InvalidOrderOption,
    StationShutDown,
    TableDeleted,
    CommunicationDisabled,
    /// A record in a batch could not be parsed; the whole batch was dropped
    MalformedRecords,
}

impl AdvisorFailure {
    pub fn from_start_code(code: u32) -> Self {
        match code {
            2 => AdvisorFailure::InvalidTableName,
            3 => AdvisorFailure::InvalidStartOption,
            4 => AdvisorFailure::InvalidFormatOption,
            5 => AdvisorFailure::InvalidStationName,
            6 => AdvisorFailure::InsufficientResources,
            7 => AdvisorFailure::InvalidOrderOption,
            8 => AdvisorFailure::SecurityBlocked,
            _ => AdvisorFailure::Unknown,
        }
    }

    pub fn from_stopped_reason(reason: u32) -> Self {
        match reason {
            1 => AdvisorFailure::StationShutDown,
            2 => AdvisorFailure::TableDeleted,
            3 => AdvisorFailure::CommunicationDisabled,
            4 => AdvisorFailure::InsufficientResources,
            5 => AdvisorFailure::SecurityBlocked,
            _ => AdvisorFailure::Unknown,
        }
    }
}

impl_from_session_failure!(AdvisorFailure);

// ----------------------------------------------------------------------------
// Logger Query
// ----------------------------------------------------------------------------

/// Terminal outcome reported by [`crate::LoggerQuery`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryOutcome {
    Success,
    Unknown,
    SessionFailed,
    InvalidLogon,
    SecurityBlocked,
    Unsupported,
    InvalidStationName,
    InvalidTableName,
    InvalidQueryRange,
    CommunicationDisabled,
    CommunicationFailed,
    InsufficientResources,
    LoggerSecurityBlocked,
    StationShutDown,
    TableDeleted,
}

impl QueryOutcome {
    pub fn from_start_code(code: u32) -> Self {
        match code {
            2 => QueryOutcome::InvalidStationName,
            3 => QueryOutcome::InvalidTableName,
            4 => QueryOutcome::InvalidQueryRange,
            5 => QueryOutcome::CommunicationDisabled,
            6 => QueryOutcome::InsufficientResources,
            7 => QueryOutcome::LoggerSecurityBlocked,
            _ => QueryOutcome::Unknown,
        }
    }

    pub fn from_stopped_reason(reason: u32) -> Self {
        match reason {
            1 => QueryOutcome::StationShutDown,
            2 => QueryOutcome::CommunicationFailed,
            3 => QueryOutcome::CommunicationDisabled,
            4 => QueryOutcome::LoggerSecurityBlocked,
            5 => QueryOutcome::TableDeleted,
            6 => QueryOutcome::InsufficientResources,
            _ => QueryOutcome::Unknown,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, QueryOutcome::Success)
    }
}

impl_from_session_failure!(QueryOutcome);

// ----------------------------------------------------------------------------
// Log Advisor
// ----------------------------------------------------------------------------

/// Failure reported by [`crate::LogAdvisor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogAdvisorFailure {
    Unknown,
    SessionFailed,
    InvalidLogon,
    SecurityBlocked,
    Unsupported,
    InvalidLogId,
    InsufficientResources,
    ServerShutDown,
    MalformedRecords,
}

impl LogAdvisorFailure {
    pub fn from_start_code(code: u32) -> Self {
        match code {
            2 => LogAdvisorFailure::InvalidLogId,
            3 => LogAdvisorFailure::InsufficientResources,
            4 => LogAdvisorFailure::SecurityBlocked,
            _ => LogAdvisorFailure::Unknown,
        }
    }

    pub fn from_stopped_reason(reason: u32) -> Self {
        match reason {
            1 => LogAdvisorFailure::ServerShutDown,
            2 => LogAdvisorFailure::InsufficientResources,
            _ => LogAdvisorFailure::Unknown,
        }
    }
}

impl_from_session_failure!(LogAdvisorFailure);

// ----------------------------------------------------------------------------
// Device Adder
// ----------------------------------------------------------------------------

/// Terminal outcome reported by [`crate::DeviceAdder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceAdderOutcome {
    Success,
    Unknown,
    SessionFailed,
    InvalidLogon,
    SecurityBlocked,
    Unsupported,
    InvalidDeviceName,
    UnsupportedDeviceType,
    InvalidParent,
    NetworkLocked,
}

impl DeviceAdderOutcome {
    pub fn from_ack_code(code: u32) -> Self {
        match code {
            1 => DeviceAdderOutcome::Success,
            2 => DeviceAdderOutcome::InvalidDeviceName,
            3 => DeviceAdderOutcome::UnsupportedDeviceType,
            4 => DeviceAdderOutcome::InvalidParent,
            5 => DeviceAdderOutcome::NetworkLocked,
            6 => DeviceAdderOutcome::SecurityBlocked,
            _ => DeviceAdderOutcome::Unknown,
        }
    }
}

impl_from_session_failure!(DeviceAdderOutcome);

// ----------------------------------------------------------------------------
// Query File Composite
// ----------------------------------------------------------------------------

/// Unified outcome reported by [`crate::LoggerQueryFile`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryFileOutcome {
    Success,
    Unknown,
    SessionFailed,
    InvalidLogon,
    SecurityBlocked,
    Unsupported,
    InvalidStationName,
    InvalidTableName,
    InvalidQueryRange,
    InvalidStartOption,
    InvalidFormatOption,
    InvalidOrderOption,
    CommunicationDisabled,
    CommunicationFailed,
    InsufficientResources,
    LoggerSecurityBlocked,
    StationShutDown,
    TableDeleted,
    MalformedRecords,
    FileOpenFailed,
    CannotAppend,
    FileIoFailed,
    /// The temporary table vanished while it was being streamed
    QueryInterrupted,
}

impl QueryFileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, QueryFileOutcome::Success)
    }
}

impl From<QueryOutcome> for QueryFileOutcome {
    fn from(outcome: QueryOutcome) -> Self {
        match outcome {
            QueryOutcome::Success => QueryFileOutcome::Success,
            QueryOutcome::Unknown => QueryFileOutcome::Unknown,
            QueryOutcome::SessionFailed => QueryFileOutcome::SessionFailed,
            QueryOutcome::InvalidLogon => QueryFileOutcome::InvalidLogon,
            QueryOutcome::SecurityBlocked => QueryFileOutcome::SecurityBlocked,
            QueryOutcome::Unsupported => QueryFileOutcome::Unsupported,
            QueryOutcome::InvalidStationName => QueryFileOutcome::InvalidStationName,
            QueryOutcome::InvalidTableName => QueryFileOutcome::InvalidTableName,
            QueryOutcome::InvalidQueryRange => QueryFileOutcome::InvalidQueryRange,
            QueryOutcome::CommunicationDisabled => QueryFileOutcome::CommunicationDisabled,
            QueryOutcome::CommunicationFailed => QueryFileOutcome::CommunicationFailed,
            QueryOutcome::InsufficientResources => QueryFileOutcome::InsufficientResources,
            QueryOutcome::LoggerSecurityBlocked => QueryFileOutcome::LoggerSecurityBlocked,
            QueryOutcome::StationShutDown => QueryFileOutcome::StationShutDown,
            QueryOutcome::TableDeleted => QueryFileOutcome::TableDeleted,
        }
    }
}

impl From<AdvisorFailure> for QueryFileOutcome {
    fn from(failure: AdvisorFailure) -> Self {
        match failure {
            AdvisorFailure::Unknown => QueryFileOutcome::Unknown,
            AdvisorFailure::SessionFailed => QueryFileOutcome::SessionFailed,
            AdvisorFailure::InvalidLogon => QueryFileOutcome::InvalidLogon,
            AdvisorFailure::SecurityBlocked => QueryFileOutcome::SecurityBlocked,
            AdvisorFailure::Unsupported => QueryFileOutcome::Unsupported,
            AdvisorFailure::InvalidTableName => QueryFileOutcome::InvalidTableName,
            AdvisorFailure::InvalidStartOption => QueryFileOutcome::InvalidStartOption,
            AdvisorFailure::InvalidFormatOption => QueryFileOutcome::InvalidFormatOption,
            AdvisorFailure::InvalidStationName => QueryFileOutcome::InvalidStationName,
            AdvisorFailure::InsufficientResources => QueryFileOutcome::InsufficientResources,
            AdvisorFailure::InvalidOrderOption => QueryFileOutcome::InvalidOrderOption,
            AdvisorFailure::StationShutDown => QueryFileOutcome::StationShutDown,
            AdvisorFailure::TableDeleted => QueryFileOutcome::QueryInterrupted,
            AdvisorFailure::CommunicationDisabled => QueryFileOutcome::CommunicationDisabled,
            AdvisorFailure::MalformedRecords => QueryFileOutcome::MalformedRecords,
        }
    }
}
