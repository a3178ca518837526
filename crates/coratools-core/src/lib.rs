//! Coratools Core
//!
//! Client-side transaction components for the LoggerNet messaging protocol.
//! Each component drives one server transaction as a small state machine; all
//! state transitions and client callbacks happen on a single dispatch thread,
//! fed by envelopes posted from the transport and database worker threads.
//!
//! ## Architecture
//!
//! - [`dispatch`]: the envelope queue, the [`Dispatcher`] and client identity
//! - [`router`]: the connection/session object shared by components
//! - [`component`]: advise and query transactions plus the query-to-file composite
//! - [`db`]: a worker thread adapter for blocking database backends

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod component;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod failure;
pub mod protocol;
pub mod router;
pub mod sink;
pub mod transport_task;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use component::{
    AdvisorClient, DeviceAdder, DeviceAdderClient, FormattedDataAdvisor, FormattedRecord,
    LogAdvisor, LogAdvisorClient, LogRecord, LoggerQuery, LoggerQueryClient, LoggerQueryFile,
    QueryFileClient,
};
pub use config::{ConnectionConfig, CoraConfig, DispatchConfig, WorkerConfig};
pub use dispatch::{
    ClientToken, Dispatcher, Envelope, Event, EventSender, EventTarget, PostError,
    SessionEvent, TransportEvent,
};
pub use errors::{CoraError, CoraResult, MessageError, Result, WorkerError};
pub use failure::{
    AdvisorFailure, DeviceAdderOutcome, LogAdvisorFailure, QueryFileOutcome, QueryOutcome,
    SessionFailure,
};
pub use protocol::{Message, MessageReader, MessageWriter};
pub use router::{ConnectionState, Router};
pub use transport_task::TransportTask;
pub use types::{
    ComponentId, InterfaceVersion, LgrDate, SessionNo, SystemTimeSource, TimeSource,
    TransactionNo,
};
