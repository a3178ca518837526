//! Transaction components
//!
//! Every component drives one server transaction through the same pattern:
//!
//! ```text
//! Standby --start()--> Delegate --(session ready)--> BeforeActive
//! BeforeActive --(start ack ok)--> active states ...
//! (any state) --(failure)--> Standby   [failure delivered]
//! ```
//!
//! Components are `Rc` handles living on the dispatch thread. Inbound
//! messages arrive as envelopes; client callbacks are themselves posted as
//! notification envelopes and checked against the current [`ClientRef`] when
//! delivered, so a notification outliving a `finish()`, a restart or the
//! client itself becomes a no-op.

pub mod device_adder;
pub mod formatted_advisor;
pub mod log_advisor;
pub mod logger_query;
pub mod query_file;

use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::dispatch::{
    ClientRef, ClientToken, Event, EventSender, EventTarget, Notification, NotificationPayload,
    TokenSource,
};
use crate::errors::Result;
use crate::protocol::message::{Message, MessageWriter};
use crate::router::Router;
use crate::types::{ComponentId, SessionNo, TransactionNo};

pub use device_adder::{DeviceAdder, DeviceAdderClient, DeviceAdderNotice};
pub use formatted_advisor::{
    AdvisorClient, AdvisorNotice, AdvisorState, FormatOption, FormattedDataAdvisor,
    FormattedRecord, OrderOption, StartOption,
};
pub use log_advisor::{LogAdvisor, LogAdvisorClient, LogAdvisorNotice, LogAdvisorState, LogRecord};
pub use logger_query::{
    LoggerQuery, LoggerQueryClient, QueryMode, QueryNotice, QueryState, QueryStatus,
    QueryStatusCode,
};
pub use query_file::{AppendWarning, LoggerQueryFile, QueryFileClient, QueryFileState};

// ----------------------------------------------------------------------------
// Transaction Core
// ----------------------------------------------------------------------------

/// Plumbing shared by every component: registration, sessions, notifications
pub(crate) struct TransactionCore {
    name: &'static str,
    id: ComponentId,
    router: Rc<Router>,
    events: EventSender,
    tokens: TokenSource,
}

impl TransactionCore {
    pub(crate) fn new(name: &'static str, router: &Rc<Router>, target: Weak<dyn EventTarget>) -> Self {
        let id = router.dispatcher().register(target);
        Self {
            name,
            id,
            router: router.clone(),
            events: router.events().clone(),
            tokens: TokenSource::new(),
        }
    }

    pub(crate) fn id(&self) -> ComponentId {
        self.id
    }

    /// Bind a client and open a session for a new cycle
    pub(crate) fn begin<C: ?Sized>(&self, client: Weak<C>) -> Result<Cycle<C>> {
        let client = ClientRef::bind(client, self.tokens.next_token())?;
        let session_no = self.router.open_session(self.id);
        debug!(component = self.name, id = %self.id, session_no = %session_no, "Transaction cycle started");
        Ok(Cycle {
            client,
            session_no,
            tran_no: None,
            terminal_posted: false,
        })
    }

    /// Release the session held by a cycle
    pub(crate) fn end<C: ?Sized>(&self, cycle: &Cycle<C>) {
        self.router.close_session(cycle.session_no);
    }

    /// Allocate a transaction number and record it on the cycle
    pub(crate) fn new_transaction<C: ?Sized>(&self, cycle: &mut Cycle<C>) -> TransactionNo {
        let tran_no = self.router.new_transaction_no();
        cycle.tran_no = Some(tran_no);
        tran_no
    }

    pub(crate) fn send<C: ?Sized>(
        &self,
        cycle: &Cycle<C>,
        message_type: u32,
        body: MessageWriter,
    ) -> Result<()> {
        self.router.send(body.finish(cycle.session_no, message_type))
    }

    /// Queue a client notification for the cycle's token
    pub(crate) fn notify(&self, token: ClientToken, payload: NotificationPayload) {
        self.events
            .post_or_log(self.id, Event::Notify(Notification { token, payload }));
    }

}

impl Drop for TransactionCore {
    fn drop(&mut self) {
        trace!(component = self.name, id = %self.id, "Component dropped");
        self.router.dispatcher().unregister(self.id);
    }
}

// ----------------------------------------------------------------------------
// Cycle
// ----------------------------------------------------------------------------

/// Per start/finish cycle bookkeeping
pub(crate) struct Cycle<C: ?Sized> {
    pub(crate) client: ClientRef<C>,
    pub(crate) session_no: SessionNo,
    pub(crate) tran_no: Option<TransactionNo>,
    /// A terminal notification is queued; further server traffic is ignored
    pub(crate) terminal_posted: bool,
}

impl<C: ?Sized> Cycle<C> {
    pub(crate) fn token(&self) -> ClientToken {
        self.client.token()
    }

    /// True if a session event belongs to this cycle and may still change it
    pub(crate) fn accepts_session(&self, session_no: SessionNo) -> bool {
        session_no == self.session_no && !self.terminal_posted
    }

    /// True if an inbound message echoes this cycle's transaction number
    pub(crate) fn accepts_message(&self, name: &'static str, message: &Message) -> bool {
        if !self.accepts_session(message.session_no) {
            return false;
        }
        let echoed = message.transaction_no();
        if echoed.is_none() || echoed != self.tran_no {
            trace!(
                component = name,
                expected = ?self.tran_no,
                received = ?echoed,
                "Stale transaction number, message discarded"
            );
            return false;
        }
        true
    }
}

/// Current client token of an optional cycle
pub(crate) fn cycle_client<C: ?Sized>(cycle: Option<&Cycle<C>>) -> Option<&ClientRef<C>> {
    cycle.map(|cycle| &cycle.client)
}
