//! Dispatch-thread database components
//!
//! Each component holds an `Arc<()>` liveness token while a request is in
//! flight. The worker only posts while it can upgrade its weak copy, so
//! `finish()` or dropping the component silences any outstanding work.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::db::backend::{DbError, DbRow};
use crate::db::worker::{BatchSlot, Reply, WorkItem, WorkerHandle};
use crate::db::DbEvent;
use crate::dispatch::{ClientRef, ClientToken, Delivery, Dispatcher, Event, EventSender, EventTarget, TokenSource};
use crate::errors::{CoraError, Result};
use crate::types::ComponentId;

pub trait DbQueryClient {
    fn on_records(&self, query: &DbQuery, rows: &[DbRow]);

    /// Total rows streamed, or the backend error
    fn on_complete(&self, query: &DbQuery, result: std::result::Result<u64, DbError>);
}

pub trait DbStatementClient {
    fn on_complete(&self, statement: &DbStatement, result: std::result::Result<u64, DbError>);
}

/// Registration and worker plumbing shared by both components
struct DbCore {
    name: &'static str,
    id: ComponentId,
    dispatcher: Rc<Dispatcher>,
    events: EventSender,
    worker: WorkerHandle,
    tokens: TokenSource,
}

impl DbCore {
    fn new(
        name: &'static str,
        dispatcher: &Rc<Dispatcher>,
        worker: WorkerHandle,
        target: Weak<dyn EventTarget>,
    ) -> Self {
        Self {
            name,
            id: dispatcher.register(target),
            dispatcher: dispatcher.clone(),
            events: dispatcher.sender(),
            worker,
            tokens: TokenSource::new(),
        }
    }

    fn reply(&self, token: ClientToken, alive: &Arc<()>) -> Reply {
        Reply {
            target: self.id,
            token,
            alive: Arc::downgrade(alive),
            events: self.events.clone(),
        }
    }
}

impl Drop for DbCore {
    fn drop(&mut self) {
        trace!(component = self.name, id = %self.id, "Component dropped");
        self.dispatcher.unregister(self.id);
    }
}

struct Request<C: ?Sized> {
    client: ClientRef<C>,
    _alive: Arc<()>,
    slot: Option<Arc<BatchSlot>>,
}

// ----------------------------------------------------------------------------
// Query
// ----------------------------------------------------------------------------

const QUERY_NAME: &str = "db_query";

/// Streams a result set from the worker in acknowledged batches
pub struct DbQuery {
    core: DbCore,
    request: RefCell<Option<Request<dyn DbQueryClient>>>,
}

impl DbQuery {
    pub fn new(dispatcher: &Rc<Dispatcher>, worker: WorkerHandle) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<DbQuery>| {
            let target: Weak<dyn EventTarget> = weak.clone();
            Self {
                core: DbCore::new(QUERY_NAME, dispatcher, worker, target),
                request: RefCell::new(None),
            }
        })
    }

    pub fn id(&self) -> ComponentId {
        self.core.id
    }

    pub fn is_active(&self) -> bool {
        self.request.borrow().is_some()
    }

    pub fn start(&self, statement: impl Into<String>, client: Weak<dyn DbQueryClient>) -> Result<()> {
        let mut request = self.request.borrow_mut();
        if request.is_some() {
            return Err(CoraError::invalid_state("start", "Active"));
        }
        let client = ClientRef::bind(client, self.core.tokens.next_token())?;
        let alive = Arc::new(());
        let slot = BatchSlot::new();
        self.core.worker.enqueue(WorkItem::Query {
            statement: statement.into(),
            reply: self.core.reply(client.token(), &alive),
            slot: slot.clone(),
        })?;
        *request = Some(Request {
            client,
            _alive: alive,
            slot: Some(slot),
        });
        Ok(())
    }

    /// Cancel any streaming batch and forget the client
    pub fn finish(&self) {
        if let Some(request) = self.request.borrow_mut().take() {
            if let Some(slot) = request.slot {
                slot.cancel();
            }
        }
    }

    fn resolve(&self, token: ClientToken) -> Delivery<dyn DbQueryClient> {
        let request = self.request.borrow();
        ClientRef::resolve(request.as_ref().map(|r| &r.client), token)
    }

    fn on_db_event(&self, token: ClientToken, event: DbEvent) {
        let delivery = self.resolve(token);
        let client = match delivery {
            Delivery::Deliver(client) => client,
            Delivery::ClientGone => {
                self.finish();
                return;
            }
            Delivery::Stale => return,
        };
        match event {
            DbEvent::Batch => {
                let rows = self
                    .request
                    .borrow()
                    .as_ref()
                    .and_then(|r| r.slot.as_ref())
                    .and_then(|slot| slot.take());
                match rows {
                    Some(rows) => client.on_records(self, &rows),
                    None => trace!(component = QUERY_NAME, "Batch already withdrawn"),
                }
            }
            DbEvent::QueryComplete(result) => {
                self.finish();
                client.on_complete(self, result);
            }
            DbEvent::StatementComplete(_) => {
                debug!(component = QUERY_NAME, "Statement completion ignored");
            }
        }
    }
}

impl EventTarget for DbQuery {
    fn receive(self: Rc<Self>, event: Event) {
        match event {
            Event::Db { token, event } => self.on_db_event(token, event),
            other => debug!(component = QUERY_NAME, kind = other.kind(), "Unexpected event ignored"),
        }
    }

    fn target_name(&self) -> &'static str {
        QUERY_NAME
    }
}

impl Drop for DbQuery {
    fn drop(&mut self) {
        if let Some(slot) = self.request.get_mut().take().and_then(|r| r.slot) {
            slot.cancel();
        }
    }
}

// ----------------------------------------------------------------------------
// Statement
// ----------------------------------------------------------------------------

const STATEMENT_NAME: &str = "db_statement";

/// Runs one statement that returns no rows
pub struct DbStatement {
    core: DbCore,
    request: RefCell<Option<Request<dyn DbStatementClient>>>,
}

impl DbStatement {
    pub fn new(dispatcher: &Rc<Dispatcher>, worker: WorkerHandle) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<DbStatement>| {
            let target: Weak<dyn EventTarget> = weak.clone();
            Self {
                core: DbCore::new(STATEMENT_NAME, dispatcher, worker, target),
                request: RefCell::new(None),
            }
        })
    }

    pub fn id(&self) -> ComponentId {
        self.core.id
    }

    pub fn is_active(&self) -> bool {
        self.request.borrow().is_some()
    }

    pub fn execute(
        &self,
        statement: impl Into<String>,
        client: Weak<dyn DbStatementClient>,
    ) -> Result<()> {
        let mut request = self.request.borrow_mut();
        if request.is_some() {
            return Err(CoraError::invalid_state("execute", "Active"));
        }
        let statement = statement.into();
        if statement.trim().is_empty() {
            return Err(CoraError::invalid_argument("statement is empty"));
        }
        let client = ClientRef::bind(client, self.core.tokens.next_token())?;
        let alive = Arc::new(());
        self.core.worker.enqueue(WorkItem::Execute {
            statement,
            reply: self.core.reply(client.token(), &alive),
        })?;
        *request = Some(Request {
            client,
            _alive: alive,
            slot: None,
        });
        Ok(())
    }

    pub fn finish(&self) {
        self.request.borrow_mut().take();
    }

    fn on_db_event(&self, token: ClientToken, event: DbEvent) {
        let delivery = {
            let request = self.request.borrow();
            ClientRef::resolve(request.as_ref().map(|r| &r.client), token)
        };
        let DbEvent::StatementComplete(result) = event else {
            debug!(component = STATEMENT_NAME, "Query event ignored");
            return;
        };
        match delivery {
            Delivery::Deliver(client) => {
                self.finish();
                client.on_complete(self, result);
            }
            Delivery::ClientGone => self.finish(),
            Delivery::Stale => {}
        }
    }
}

impl EventTarget for DbStatement {
    fn receive(self: Rc<Self>, event: Event) {
        match event {
            Event::Db { token, event } => self.on_db_event(token, event),
            other => debug!(component = STATEMENT_NAME, kind = other.kind(), "Unexpected event ignored"),
        }
    }

    fn target_name(&self) -> &'static str {
        STATEMENT_NAME
    }
}
