//! Connection and session routing
//!
//! The [`Router`] is the connection object shared by every component on one
//! server connection. It tracks the connection state and negotiated interface
//! version, owns the per-connection transaction counter, allocates sessions
//! and routes inbound messages to the component that owns each session.
//!
//! The router never calls into components directly: readiness, failures and
//! inbound messages are all posted to the owning component as envelopes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::dispatch::{Dispatcher, Event, EventSender, EventTarget, SessionEvent, TransportEvent};
use crate::errors::{CoraError, Result};
use crate::failure::SessionFailure;
use crate::protocol::codes::{self, CLOSE_SESSION_CMD};
use crate::protocol::message::Message;
use crate::types::{ComponentId, InterfaceVersion, SessionNo, TransactionNo};

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Connection state as seen by components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready(InterfaceVersion),
    Failed(SessionFailure),
}

#[derive(Debug)]
struct SessionEntry {
    owner: ComponentId,
    /// Set once a message has been sent on the session
    used: bool,
}

#[derive(Debug)]
struct RouterState {
    connection: ConnectionState,
    sessions: HashMap<SessionNo, SessionEntry>,
    next_session: u32,
    next_transaction: u32,
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

pub struct Router {
    id: ComponentId,
    dispatcher: Rc<Dispatcher>,
    events: EventSender,
    outbound: mpsc::UnboundedSender<Message>,
    state: RefCell<RouterState>,
}

impl Router {
    /// Create a router registered with `dispatcher`
    ///
    /// Outbound messages are pushed onto `outbound`; the transport task owns
    /// the receiving end and posts [`TransportEvent`]s to [`Router::id`].
    pub fn new(dispatcher: &Rc<Dispatcher>, outbound: mpsc::UnboundedSender<Message>) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<Router>| {
            let target: Weak<dyn EventTarget> = weak.clone();
            let id = dispatcher.register(target);
            Self {
                id,
                dispatcher: dispatcher.clone(),
                events: dispatcher.sender(),
                outbound,
                state: RefCell::new(RouterState {
                    connection: ConnectionState::Connecting,
                    sessions: HashMap::new(),
                    next_session: 1,
                    next_transaction: 1,
                }),
            }
        })
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn dispatcher(&self) -> &Rc<Dispatcher> {
        &self.dispatcher
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().connection
    }

    pub fn interface_version(&self) -> Option<InterfaceVersion> {
        match self.state.borrow().connection {
            ConnectionState::Ready(version) => Some(version),
            _ => None,
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.borrow().sessions.len()
    }

    /// Allocate the next transaction number for this connection
    pub fn new_transaction_no(&self) -> TransactionNo {
        let mut state = self.state.borrow_mut();
        let value = state.next_transaction;
        state.next_transaction = value.checked_add(1).unwrap_or(1);
        TransactionNo::new(value)
    }

    /// Open a session owned by `owner`
    ///
    /// The owner receives `SessionEvent::Ready` once the connection is up (at
    /// once if it already is) or `SessionEvent::Failed` if it cannot be.
    pub fn open_session(&self, owner: ComponentId) -> SessionNo {
        let (session_no, connection) = {
            let mut state = self.state.borrow_mut();
            let session_no = SessionNo::new(state.next_session);
            state.next_session = state.next_session.checked_add(1).unwrap_or(1);
            state
                .sessions
                .insert(session_no, SessionEntry { owner, used: false });
            (session_no, state.connection)
        };

        debug!(session_no = %session_no, component = %owner, "Session opened");
        match connection {
            ConnectionState::Connecting => {}
            ConnectionState::Ready(interface_version) => {
                self.post_session(owner, session_no, SessionEvent::Ready { interface_version })
            }
            ConnectionState::Failed(failure) => {
                self.post_session(owner, session_no, SessionEvent::Failed(failure))
            }
        }
        session_no
    }

    /// Close a session; the server is told only if the session was used
    pub fn close_session(&self, session_no: SessionNo) {
        let (entry, ready) = {
            let mut state = self.state.borrow_mut();
            let ready = matches!(state.connection, ConnectionState::Ready(_));
            (state.sessions.remove(&session_no), ready)
        };
        let Some(entry) = entry else {
            return;
        };
        debug!(session_no = %session_no, component = %entry.owner, "Session closed");
        if entry.used && ready {
            let message = Message::new(session_no, CLOSE_SESSION_CMD, Vec::new());
            if self.outbound.send(message).is_err() {
                debug!(session_no = %session_no, "Outbound channel closed, close not sent");
            }
        }
    }

    /// Send a message on an open session
    pub fn send(&self, message: Message) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let Some(entry) = state.sessions.get_mut(&message.session_no) else {
                return Err(CoraError::invalid_state("send", "session closed"));
            };
            entry.used = true;
        }
        trace!(
            session_no = %message.session_no,
            message_type = codes::message_type_name(message.message_type),
            len = message.body.len(),
            "Sending message"
        );
        self.outbound
            .send(message)
            .map_err(|_| CoraError::channel_error("outbound message channel closed"))
    }

    fn post_session(&self, owner: ComponentId, session_no: SessionNo, event: SessionEvent) {
        self.events
            .post_or_log(owner, Event::Session { session_no, event });
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    fn on_connected(&self, interface_version: InterfaceVersion) {
        let owners: Vec<(SessionNo, ComponentId)> = {
            let mut state = self.state.borrow_mut();
            if !matches!(state.connection, ConnectionState::Connecting) {
                warn!(state = ?state.connection, "Connected event in unexpected state");
                return;
            }
            state.connection = ConnectionState::Ready(interface_version);
            state
                .sessions
                .iter()
                .map(|(session_no, entry)| (*session_no, entry.owner))
                .collect()
        };

        info!(version = %interface_version, sessions = owners.len(), "Connection ready");
        for (session_no, owner) in sorted(owners) {
            self.post_session(owner, session_no, SessionEvent::Ready { interface_version });
        }
    }

    fn on_message(&self, message: Message) {
        if message.session_no == SessionNo::CONNECTION {
            trace!(
                message_type = codes::message_type_name(message.message_type),
                "Connection-level message ignored by router"
            );
            return;
        }
        let owner = self
            .state
            .borrow()
            .sessions
            .get(&message.session_no)
            .map(|entry| entry.owner);
        match owner {
            Some(owner) => {
                let session_no = message.session_no;
                self.post_session(owner, session_no, SessionEvent::Message(message));
            }
            None => debug!(
                session_no = %message.session_no,
                message_type = codes::message_type_name(message.message_type),
                "Message for unknown session dropped"
            ),
        }
    }

    fn on_failed(&self, failure: SessionFailure) {
        let owners: Vec<(SessionNo, ComponentId)> = {
            let mut state = self.state.borrow_mut();
            if matches!(state.connection, ConnectionState::Failed(_)) {
                return;
            }
            state.connection = ConnectionState::Failed(failure);
            state
                .sessions
                .drain()
                .map(|(session_no, entry)| (session_no, entry.owner))
                .collect()
        };

        warn!(%failure, sessions = owners.len(), "Connection failed");
        for (session_no, owner) in sorted(owners) {
            self.post_session(owner, session_no, SessionEvent::Failed(failure));
        }
    }
}

/// Session order is allocation order; keep fan-out deterministic
fn sorted(mut owners: Vec<(SessionNo, ComponentId)>) -> Vec<(SessionNo, ComponentId)> {
    owners.sort_by_key(|(session_no, _)| *session_no);
    owners
}

impl EventTarget for Router {
    fn receive(self: Rc<Self>, event: Event) {
        match event {
            Event::Transport(TransportEvent::Connected { interface_version }) => {
                self.on_connected(interface_version)
            }
            Event::Transport(TransportEvent::Message(message)) => self.on_message(message),
            Event::Transport(TransportEvent::Failed(failure)) => self.on_failed(failure),
            other => debug!(kind = other.kind(), "Router ignored event"),
        }
    }

    fn target_name(&self) -> &'static str {
        "router"
    }
}

impl core::fmt::Debug for Router {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.id)
            .field("state", &self.state.borrow())
            .finish()
    }
}
