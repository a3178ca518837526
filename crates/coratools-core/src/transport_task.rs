//! Transport Task Trait Definition
//!
//! Defines the interface for the byte-stream transport that carries framed
//! messages to and from the server. Concrete implementations live in the
//! runtime crate.

use tokio::sync::mpsc;

use crate::dispatch::EventSender;
use crate::errors::Result;
use crate::protocol::message::Message;
use crate::types::ComponentId;

// ----------------------------------------------------------------------------
// Transport Task Trait
// ----------------------------------------------------------------------------

/// Common interface for transport tasks
///
/// A transport task runs on its own async task or thread. It performs the
/// handshake, reports the outcome to the router as
/// [`TransportEvent::Connected`](crate::TransportEvent::Connected) or
/// [`TransportEvent::Failed`](crate::TransportEvent::Failed), forwards every
/// decoded inbound message, and writes messages taken from the router's
/// outbound channel. It shares no state with the dispatch thread.
#[async_trait::async_trait]
pub trait TransportTask: Send {
    /// Attach the channels created by the runtime
    fn attach_channels(
        &mut self,
        events: EventSender,
        router: ComponentId,
        outbound: mpsc::UnboundedReceiver<Message>,
    ) -> Result<()>;

    /// Run until the connection ends or the outbound channel closes
    ///
    /// Connection loss is reported as an event, not as an error; an `Err`
    /// means the task was misused (e.g. run before `attach_channels`).
    async fn run(&mut self) -> Result<()>;

    /// Transport identifier for logs
    fn transport_name(&self) -> &'static str;
}
