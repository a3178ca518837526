//! Message type codes and interface version thresholds
//!
//! The version thresholds encode compatibility with deployed servers and are
//! carried as a literal table.

use crate::types::InterfaceVersion;

// ----------------------------------------------------------------------------
// Connection Messages (session 0)
// ----------------------------------------------------------------------------

pub const HELLO_CMD: u32 = 0x001;
pub const HELLO_ACK: u32 = 0x002;
pub const CLOSE_SESSION_CMD: u32 = 0x003;

/// Handshake response codes carried by `HELLO_ACK`
pub mod hello {
    pub const OK: u32 = 1;
    pub const INVALID_LOGON: u32 = 2;
    pub const SECURITY_BLOCKED: u32 = 3;
    pub const UNSUPPORTED: u32 = 4;
}

// ----------------------------------------------------------------------------
// Formatted Data Advise
// ----------------------------------------------------------------------------

pub mod formatted_advise {
    pub const START_CMD: u32 = 0x101;
    pub const START_ACK: u32 = 0x102;
    pub const RECORDS_NOT: u32 = 0x103;
    pub const CONTINUE_CMD: u32 = 0x104;
    pub const STOPPED_NOT: u32 = 0x105;
}

// ----------------------------------------------------------------------------
// Logger Query
// ----------------------------------------------------------------------------

pub mod logger_query {
    pub const START_CMD: u32 = 0x201;
    pub const START_ACK: u32 = 0x202;
    pub const STATUS_NOT: u32 = 0x203;
    pub const STOPPED_NOT: u32 = 0x204;
}

// ----------------------------------------------------------------------------
// Log Advise
// ----------------------------------------------------------------------------

pub mod log_advise {
    pub const START_CMD: u32 = 0x301;
    pub const START_ACK: u32 = 0x302;
    pub const RECORDS_NOT: u32 = 0x303;
    pub const CONTINUE_CMD: u32 = 0x304;
    pub const STOPPED_NOT: u32 = 0x305;
}

// ----------------------------------------------------------------------------
// Device Adder
// ----------------------------------------------------------------------------

pub mod device_adder {
    pub const ADD_CMD: u32 = 0x401;
    pub const ADD_ACK: u32 = 0x402;
}

/// Start acknowledgement code shared by every transaction
pub const RESP_SUCCESS: u32 = 1;

// ----------------------------------------------------------------------------
// Interface Version Thresholds
// ----------------------------------------------------------------------------

pub mod versions {
    use super::InterfaceVersion;

    /// Formatted data advise is refused below this version
    pub const FORMATTED_ADVISE_MIN: InterfaceVersion = InterfaceVersion::new(1, 3, 1, 28);
    /// Below this the start command carries no order option
    pub const FORMATTED_ADVISE_ORDER_OPTION: InterfaceVersion = InterfaceVersion::new(1, 3, 6, 0);
    /// Below this the JSON format is substituted by CSIXML
    pub const FORMATTED_ADVISE_JSON: InterfaceVersion = InterfaceVersion::new(1, 4, 1, 0);

    /// Logger queries are refused below this version
    pub const LOGGER_QUERY_MIN: InterfaceVersion = InterfaceVersion::new(1, 3, 4, 0);
    /// Below this `All` and `Backfill` are remapped to bounded ranges
    pub const LOGGER_QUERY_EXTENDED_MODES: InterfaceVersion = InterfaceVersion::new(1, 3, 8, 0);
    /// Below this the `use_same_table` flag is omitted
    pub const LOGGER_QUERY_SAME_TABLE: InterfaceVersion = InterfaceVersion::new(1, 4, 1, 0);

    pub const LOG_ADVISE_MIN: InterfaceVersion = InterfaceVersion::new(1, 3, 1, 0);
    /// Below this the backfill count is omitted
    pub const LOG_ADVISE_BACKFILL: InterfaceVersion = InterfaceVersion::new(1, 3, 11, 0);

    pub const DEVICE_ADDER_MIN: InterfaceVersion = InterfaceVersion::new(1, 3, 1, 0);
}

/// Human-readable name for a message type, used in trace output
pub fn message_type_name(message_type: u32) -> &'static str {
    match message_type {
        HELLO_CMD => "hello_cmd",
        HELLO_ACK => "hello_ack",
        CLOSE_SESSION_CMD => "close_session_cmd",
        formatted_advise::START_CMD => "formatted_advise_start_cmd",
        formatted_advise::START_ACK => "formatted_advise_start_ack",
        formatted_advise::RECORDS_NOT => "formatted_advise_records_not",
        formatted_advise::CONTINUE_CMD => "formatted_advise_continue_cmd",
        formatted_advise::STOPPED_NOT => "formatted_advise_stopped_not",
        logger_query::START_CMD => "logger_query_start_cmd",
        logger_query::START_ACK => "logger_query_start_ack",
        logger_query::STATUS_NOT => "logger_query_status_not",
        logger_query::STOPPED_NOT => "logger_query_stopped_not",
        log_advise::START_CMD => "log_advise_start_cmd",
        log_advise::START_ACK => "log_advise_start_ack",
        log_advise::RECORDS_NOT => "log_advise_records_not",
        log_advise::CONTINUE_CMD => "log_advise_continue_cmd",
        log_advise::STOPPED_NOT => "log_advise_stopped_not",
        device_adder::ADD_CMD => "add_device_cmd",
        device_adder::ADD_ACK => "add_device_ack",
        _ => "unknown",
    }
}
