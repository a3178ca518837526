//! Envelope and event types
//!
//! Every cross-thread or deferred notification is one [`Envelope`]: a target
//! component id plus a tagged [`Event`]. Envelopes are posted through an
//! [`EventSender`] from any thread and consumed exactly once by the
//! [`Dispatcher`](super::Dispatcher).

use tokio::sync::mpsc;
use tracing::debug;

use crate::component::device_adder::DeviceAdderNotice;
use crate::component::formatted_advisor::AdvisorNotice;
use crate::component::log_advisor::LogAdvisorNotice;
use crate::component::logger_query::QueryNotice;
use crate::db::DbEvent;
use crate::dispatch::client::ClientToken;
use crate::failure::SessionFailure;
use crate::protocol::message::Message;
use crate::types::{ComponentId, InterfaceVersion, SessionNo};

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Events raised by the transport task for the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake complete; carries the server's interface version
    Connected { interface_version: InterfaceVersion },
    /// A complete inbound message
    Message(Message),
    /// The connection failed or was lost; terminal for the connection
    Failed(SessionFailure),
}

/// Events the router routes to the component owning a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Ready { interface_version: InterfaceVersion },
    Message(Message),
    Failed(SessionFailure),
}

/// Per-component client notification payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationPayload {
    Advisor(AdvisorNotice),
    Query(QueryNotice),
    LogAdvisor(LogAdvisorNotice),
    DeviceAdder(DeviceAdderNotice),
}

/// A client notification tagged with the start/finish cycle that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub token: ClientToken,
    pub payload: NotificationPayload,
}

/// Tagged union of everything a dispatch target can receive
#[derive(Debug)]
pub enum Event {
    Transport(TransportEvent),
    Session {
        session_no: SessionNo,
        event: SessionEvent,
    },
    Notify(Notification),
    Db {
        token: ClientToken,
        event: DbEvent,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Transport(_) => "transport",
            Event::Session { .. } => "session",
            Event::Notify(_) => "notify",
            Event::Db { .. } => "db",
        }
    }
}

/// One queued event addressed to one component
#[derive(Debug)]
pub struct Envelope {
    pub target: ComponentId,
    pub event: Event,
}

impl Envelope {
    pub fn new(target: ComponentId, event: Event) -> Self {
        Self { target, event }
    }
}

// ----------------------------------------------------------------------------
// Event Sender
// ----------------------------------------------------------------------------

/// The queue has been torn down; expected during shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PostError {
    #[error("Event queue closed")]
    QueueClosed,
}

/// Cloneable, thread-safe handle for posting envelopes to a dispatcher
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::UnboundedSender<Envelope>,
}

impl EventSender {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { sender }
    }

    pub fn post_envelope(&self, envelope: Envelope) -> Result<(), PostError> {
        self.sender
            .send(envelope)
            .map_err(|_| PostError::QueueClosed)
    }

    pub fn post(&self, target: ComponentId, event: Event) -> Result<(), PostError> {
        self.post_envelope(Envelope::new(target, event))
    }

    /// Post and log, rather than return, a closed queue
    pub fn post_or_log(&self, target: ComponentId, event: Event) {
        let kind = event.kind();
        if self.post(target, event).is_err() {
            debug!(component = %target, kind, "Event queue closed, envelope dropped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
