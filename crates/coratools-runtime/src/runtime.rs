//! Coratools Runtime
//!
//! Wires one server connection together: the [`Dispatcher`] that owns the
//! dispatch thread, the [`Router`] shared by components on the connection,
//! and the transport task that carries frames to and from the server.
//!
//! ```rust,no_run
//! use coratools_core::CoraConfig;
//! use coratools_runtime::{CoraRuntime, TcpTransport};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoraConfig::default();
//! let mut runtime = CoraRuntime::new(&config);
//! runtime.start(TcpTransport::new(config.connection.clone()))?;
//! runtime.wait_connected().await;
//! # Ok(())
//! # }
//! ```
//!
//! The runtime is not `Send`: components and their callbacks live on the
//! thread that drives [`CoraRuntime::run_until`]. Only the transport task is
//! spawned onto the tokio runtime.

use std::rc::Rc;

use coratools_core::{
    ConnectionState, CoraConfig, CoraError, Dispatcher, Message, Result, Router, TransportTask,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

// ----------------------------------------------------------------------------
// Coratools Runtime
// ----------------------------------------------------------------------------

pub struct CoraRuntime {
    dispatcher: Rc<Dispatcher>,
    router: Rc<Router>,
    /// Receiving end of the router's outbound channel until a transport takes it
    outbound: Option<mpsc::UnboundedReceiver<Message>>,
    transport: Option<JoinHandle<Result<()>>>,
    transport_name: Option<&'static str>,
}

impl CoraRuntime {
    pub fn new(config: &CoraConfig) -> Self {
        let dispatcher = Dispatcher::with_config(config.dispatch.clone());
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let router = Router::new(&dispatcher, outbound_tx);
        Self {
            dispatcher,
            router,
            outbound: Some(outbound),
            transport: None,
            transport_name: None,
        }
    }

    pub fn dispatcher(&self) -> &Rc<Dispatcher> {
        &self.dispatcher
    }

    /// Connection object to hand to components
    pub fn router(&self) -> &Rc<Router> {
        &self.router
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.router.connection_state()
    }

    pub fn is_running(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Attach `transport` to the router and spawn it
    ///
    /// A runtime carries one connection; a second start is refused even after
    /// the first transport has ended.
    pub fn start<T: TransportTask + 'static>(&mut self, mut transport: T) -> Result<()> {
        let outbound = self
            .outbound
            .take()
            .ok_or_else(|| CoraError::invalid_state("start", "Started"))?;
        transport.attach_channels(self.dispatcher.sender(), self.router.id(), outbound)?;

        let name = transport.transport_name();
        debug!(transport = name, "Starting transport task");
        self.transport = Some(tokio::spawn(async move { transport.run().await }));
        self.transport_name = Some(name);
        Ok(())
    }

    /// Dispatch envelopes until `done` returns true
    pub async fn run_until<F>(&self, done: F)
    where
        F: FnMut() -> bool,
    {
        self.dispatcher.run_until(done).await;
    }

    /// Dispatch until the handshake has succeeded or failed
    pub async fn wait_connected(&self) -> ConnectionState {
        let router = self.router.clone();
        self.run_until(move || !matches!(router.connection_state(), ConnectionState::Connecting))
            .await;
        self.connection_state()
    }

    /// Stop the transport task
    ///
    /// Components still waiting on the connection are not notified; callers
    /// finish them first.
    pub fn stop(&mut self) {
        if let Some(handle) = self.transport.take() {
            handle.abort();
            info!(transport = self.transport_name.unwrap_or("none"), "Transport stopped");
        }
    }
}

impl Drop for CoraRuntime {
    fn drop(&mut self) {
        if let Some(handle) = self.transport.take() {
            handle.abort();
        }
    }
}
