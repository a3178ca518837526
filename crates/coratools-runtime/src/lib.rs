//! Coratools Runtime
//!
//! Runtime support for coratools components:
//! - `TcpTransport`: the tokio transport task speaking the framed protocol
//! - `CoraRuntime`: wires the dispatcher, router and transport for one connection
//!
//! Transaction components and the dispatch mechanism live in `coratools-core`.

mod runtime;
pub mod tcp;

pub use runtime::CoraRuntime;
pub use tcp::TcpTransport;

// Re-export core types for convenience
pub use coratools_core::{
    ConnectionConfig, ConnectionState, CoraConfig, CoraError, Dispatcher, Result, Router,
    SessionFailure, TransportTask,
};
