//! Blocking database backend interface
//!
//! A backend is created and used only on its worker thread, so it needs no
//! `Send` bound; only the factory crosses threads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Values and Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DbValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

pub type DbRow = Vec<DbValue>;

/// Error code and message captured from the backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Database error {code}: {message}")]
pub struct DbError {
    pub code: i32,
    pub message: String,
}

impl DbError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The consumer did not take a streamed batch in time
    pub fn batch_timeout() -> Self {
        Self::new(-1, "batch acknowledgement timed out")
    }
}

/// Backend-specific handle for an open result set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHandle(pub u64);

/// One fetched batch; `more` is false once the result set is exhausted
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBatch {
    pub rows: Vec<DbRow>,
    pub more: bool,
}

// ----------------------------------------------------------------------------
// Backend Trait
// ----------------------------------------------------------------------------

pub trait DbBackend {
    fn connect(&mut self) -> Result<(), DbError>;

    fn disconnect(&mut self);

    /// Run a statement that returns no rows; yields the affected row count
    fn execute(&mut self, statement: &str) -> Result<u64, DbError>;

    fn execute_query(&mut self, statement: &str) -> Result<QueryHandle, DbError>;

    fn fetch_batch(&mut self, query: QueryHandle, max_rows: usize) -> Result<FetchedBatch, DbError>;

    fn close_query(&mut self, query: QueryHandle);
}

/// Creates backends lazily on the worker thread
pub type BackendFactory = Box<dyn FnMut() -> Box<dyn DbBackend> + Send>;

// ----------------------------------------------------------------------------
// Memory Backend
// ----------------------------------------------------------------------------

/// Canned-result backend that records the calls made on it
///
/// Clones share one call log, so a factory can hand out copies of a
/// configured template.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    results: HashMap<String, Vec<DbRow>>,
    open: HashMap<QueryHandle, std::vec::IntoIter<DbRow>>,
    next_handle: u64,
    connect_error: Option<DbError>,
    log: Arc<Mutex<Vec<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, statement: &str, rows: Vec<DbRow>) -> Self {
        self.results.insert(statement.to_string(), rows);
        self
    }

    pub fn failing_connect(mut self, error: DbError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// Shared call log, readable from other threads
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        self.log.clone()
    }

    fn record(&self, entry: String) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

impl DbBackend for MemoryBackend {
    fn connect(&mut self) -> Result<(), DbError> {
        self.record("connect".to_string());
        match &self.connect_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn disconnect(&mut self) {
        self.record("disconnect".to_string());
        self.open.clear();
    }

    fn execute(&mut self, statement: &str) -> Result<u64, DbError> {
        self.record(format!("execute {statement}"));
        if statement.trim().is_empty() {
            return Err(DbError::new(1, "empty statement"));
        }
        Ok(1)
    }

    fn execute_query(&mut self, statement: &str) -> Result<QueryHandle, DbError> {
        self.record(format!("query {statement}"));
        let rows = self
            .results
            .get(statement)
            .cloned()
            .ok_or_else(|| DbError::new(2, format!("no such table: {statement}")))?;
        self.next_handle += 1;
        let handle = QueryHandle(self.next_handle);
        self.open.insert(handle, rows.into_iter());
        Ok(handle)
    }

    fn fetch_batch(&mut self, query: QueryHandle, max_rows: usize) -> Result<FetchedBatch, DbError> {
        let rows = self
            .open
            .get_mut(&query)
            .ok_or_else(|| DbError::new(3, "query is not open"))?;
        let batch: Vec<DbRow> = rows.by_ref().take(max_rows).collect();
        let more = rows.len() > 0;
        Ok(FetchedBatch { rows: batch, more })
    }

    fn close_query(&mut self, query: QueryHandle) {
        self.record(format!("close {}", query.0));
        self.open.remove(&query);
    }
}
