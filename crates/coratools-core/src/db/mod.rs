//! Blocking database adapter
//!
//! A [`DbWorker`] runs a synchronous [`DbBackend`] on its own thread;
//! [`DbQuery`] and [`DbStatement`] are the dispatch-thread components that
//! submit work to it and receive completions as envelopes.

pub mod backend;
pub mod query;
pub mod worker;

pub use backend::{
    BackendFactory, DbBackend, DbError, DbRow, DbValue, FetchedBatch, MemoryBackend, QueryHandle,
};
pub use query::{DbQuery, DbQueryClient, DbStatement, DbStatementClient};
pub use worker::{BatchSlot, DbWorker, SlotWait, WorkerHandle};

/// Completion events posted by the worker thread
#[derive(Debug)]
pub enum DbEvent {
    /// A batch is waiting in the query's slot
    Batch,
    /// The streamed query finished; carries the total row count
    QueryComplete(Result<u64, DbError>),
    /// A statement finished; carries the affected row count
    StatementComplete(Result<u64, DbError>),
}
