//! Database worker thread
//!
//! One dedicated thread drains a mutex-protected command queue and runs each
//! command against a lazily created backend. Completions are posted back to
//! the dispatcher only while the requesting component is still alive.
//!
//! Streaming queries hand rows over through a [`BatchSlot`], which has its
//! own lock: the worker fills the slot, posts a batch event and blocks until
//! the consumer takes the rows, the request is cancelled or the
//! acknowledgement timeout expires.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::WorkerConfig;
use crate::db::backend::{BackendFactory, DbBackend, DbError, DbRow};
use crate::db::DbEvent;
use crate::dispatch::{ClientToken, Event, EventSender};
use crate::errors::{CoraError, Result, WorkerError};
use crate::types::ComponentId;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Batch Slot
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SlotState {
    rows: Option<Vec<DbRow>>,
    cancelled: bool,
}

/// Outcome of the worker waiting on a filled slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWait {
    Taken,
    Cancelled,
    TimedOut,
}

/// Single-batch handoff between the worker and the dispatch thread
#[derive(Debug, Default)]
pub struct BatchSlot {
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl BatchSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fill(&self, rows: Vec<DbRow>) {
        lock(&self.state).rows = Some(rows);
    }

    /// Block until the batch is taken or cancelled, up to `timeout`
    pub(crate) fn wait_taken(&self, timeout: Duration) -> SlotWait {
        let guard = lock(&self.state);
        let (mut state, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| {
                state.rows.is_some() && !state.cancelled
            })
            .unwrap_or_else(PoisonError::into_inner);
        if state.cancelled {
            SlotWait::Cancelled
        } else if state.rows.is_none() {
            SlotWait::Taken
        } else {
            // Drop the batch so a late consumer finds nothing
            state.rows = None;
            SlotWait::TimedOut
        }
    }

    /// Copy out the pending batch and release the worker
    pub fn take(&self) -> Option<Vec<DbRow>> {
        let rows = lock(&self.state).rows.take();
        self.changed.notify_all();
        rows
    }

    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.cancelled = true;
        state.rows = None;
        drop(state);
        self.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }
}

// ----------------------------------------------------------------------------
// Work Items
// ----------------------------------------------------------------------------

/// Where and whether to post a completion
pub(crate) struct Reply {
    pub(crate) target: ComponentId,
    pub(crate) token: ClientToken,
    pub(crate) alive: Weak<()>,
    pub(crate) events: EventSender,
}

impl Reply {
    /// Post unless the requester has gone; false if nothing was posted
    fn post(&self, event: DbEvent) -> bool {
        if self.alive.upgrade().is_none() {
            trace!(component = %self.target, "Requester gone, completion dropped");
            return false;
        }
        self.events
            .post(
                self.target,
                Event::Db {
                    token: self.token,
                    event,
                },
            )
            .is_ok()
    }
}

pub(crate) enum WorkItem {
    Execute {
        statement: String,
        reply: Reply,
    },
    Query {
        statement: String,
        reply: Reply,
        slot: Arc<BatchSlot>,
    },
}

#[derive(Default)]
struct WorkerQueue {
    items: VecDeque<WorkItem>,
    shutdown: bool,
}

#[derive(Default)]
struct WorkerShared {
    queue: Mutex<WorkerQueue>,
    wake: Condvar,
}

enum NextItem {
    Work(WorkItem),
    Idle,
    Shutdown,
}

// ----------------------------------------------------------------------------
// Worker Handle
// ----------------------------------------------------------------------------

/// Cloneable enqueue handle used by dispatch-side components
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    config: WorkerConfig,
}

impl WorkerHandle {
    pub(crate) fn enqueue(&self, item: WorkItem) -> core::result::Result<(), WorkerError> {
        let mut queue = lock(&self.shared.queue);
        if queue.shutdown {
            return Err(WorkerError::ShutDown);
        }
        queue.items.push_back(item);
        drop(queue);
        self.shared.wake.notify_one();
        Ok(())
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn pending(&self) -> usize {
        lock(&self.shared.queue).items.len()
    }
}

/// Owns the worker thread; dropping it stops and joins the thread
pub struct DbWorker {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

impl DbWorker {
    pub fn spawn(config: WorkerConfig, factory: BackendFactory) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(WorkerShared::default());
        let thread_shared = shared.clone();
        let thread_config = config.clone();
        // The backend is not Send, so the thread state is built on the thread
        let join = std::thread::Builder::new()
            .name("coratools-db".to_string())
            .spawn(move || {
                WorkerThread {
                    shared: thread_shared,
                    config: thread_config,
                    factory,
                    backend: None,
                    last_used: Instant::now(),
                }
                .run()
            })
            .map_err(|err| {
                CoraError::from(WorkerError::SpawnFailed {
                    reason: err.to_string(),
                })
            })?;
        Ok(Self {
            handle: WorkerHandle { shared, config },
            thread: Some(join),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Stop accepting work, let the thread drain and join it
    pub fn shutdown(&mut self) {
        lock(&self.handle.shared.queue).shutdown = true;
        self.handle.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Database worker thread panicked");
            }
        }
    }
}

impl Drop for DbWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------------
// Worker Thread
// ----------------------------------------------------------------------------

struct WorkerThread {
    shared: Arc<WorkerShared>,
    config: WorkerConfig,
    factory: BackendFactory,
    backend: Option<Box<dyn DbBackend>>,
    last_used: Instant,
}

impl WorkerThread {
    fn run(&mut self) {
        debug!("Database worker started");
        loop {
            match self.next_item() {
                NextItem::Work(item) => self.execute(item),
                NextItem::Idle => self.housekeeping(),
                NextItem::Shutdown => break,
            }
        }
        if let Some(mut backend) = self.backend.take() {
            backend.disconnect();
        }
        debug!("Database worker stopped");
    }

    fn next_item(&self) -> NextItem {
        let mut queue = lock(&self.shared.queue);
        loop {
            if let Some(item) = queue.items.pop_front() {
                return NextItem::Work(item);
            }
            if queue.shutdown {
                return NextItem::Shutdown;
            }
            let (guard, wait) = self
                .shared
                .wake
                .wait_timeout(queue, self.config.idle_wait())
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
            if wait.timed_out() && queue.items.is_empty() && !queue.shutdown {
                return NextItem::Idle;
            }
        }
    }

    fn housekeeping(&mut self) {
        if self.backend.is_some() && self.last_used.elapsed() >= self.config.connection_idle_timeout() {
            debug!("Closing idle database connection");
            if let Some(mut backend) = self.backend.take() {
                backend.disconnect();
            }
        }
    }

    /// Backend, connecting on first use
    fn backend(&mut self) -> core::result::Result<&mut Box<dyn DbBackend>, DbError> {
        self.last_used = Instant::now();
        if self.backend.is_none() {
            let mut backend = (self.factory)();
            backend.connect()?;
            debug!("Database connection opened");
            self.backend = Some(backend);
        }
        self.backend
            .as_mut()
            .ok_or_else(|| DbError::new(-2, "backend unavailable"))
    }

    fn execute(&mut self, item: WorkItem) {
        match item {
            WorkItem::Execute { statement, reply } => {
                if reply.alive.upgrade().is_none() {
                    return;
                }
                let result = self.backend().and_then(|backend| backend.execute(&statement));
                reply.post(DbEvent::StatementComplete(result));
            }
            WorkItem::Query {
                statement,
                reply,
                slot,
            } => {
                if reply.alive.upgrade().is_none() || slot.is_cancelled() {
                    return;
                }
                let result = self.stream_query(&statement, &reply, &slot);
                if let Some(result) = result {
                    reply.post(DbEvent::QueryComplete(result));
                }
            }
        }
        self.last_used = Instant::now();
    }

    /// Returns `None` when the requester went away mid-stream
    fn stream_query(
        &mut self,
        statement: &str,
        reply: &Reply,
        slot: &BatchSlot,
    ) -> Option<core::result::Result<u64, DbError>> {
        let batch_size = self.config.batch_size;
        let ack_timeout = self.config.batch_ack_timeout();
        let backend = match self.backend() {
            Ok(backend) => backend,
            Err(err) => return Some(Err(err)),
        };
        let query = match backend.execute_query(statement) {
            Ok(query) => query,
            Err(err) => return Some(Err(err)),
        };

        let mut total: u64 = 0;
        loop {
            let batch = match backend.fetch_batch(query, batch_size) {
                Ok(batch) => batch,
                Err(err) => {
                    backend.close_query(query);
                    return Some(Err(err));
                }
            };
            if !batch.rows.is_empty() {
                total += batch.rows.len() as u64;
                slot.fill(batch.rows);
                if !reply.post(DbEvent::Batch) {
                    backend.close_query(query);
                    return None;
                }
                match slot.wait_taken(ack_timeout) {
                    SlotWait::Taken => {}
                    SlotWait::Cancelled => {
                        trace!("Query cancelled by consumer");
                        backend.close_query(query);
                        return None;
                    }
                    SlotWait::TimedOut => {
                        warn!(statement, "Consumer did not take batch, query closed");
                        backend.close_query(query);
                        return Some(Err(DbError::batch_timeout()));
                    }
                }
            }
            if !batch.more {
                break;
            }
        }
        backend.close_query(query);
        Some(Ok(total))
    }
}
