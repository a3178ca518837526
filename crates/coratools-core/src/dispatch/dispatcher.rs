//! The dispatch context
//!
//! A [`Dispatcher`] lives on exactly one thread. It owns the receiving end of
//! the envelope queue and a registry of targets, and delivers envelopes in
//! FIFO order. No registry or queue borrow is held while a target runs, so
//! targets may register new targets or post further envelopes re-entrantly.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use futures::future::poll_fn;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::DispatchConfig;
use crate::dispatch::event::{Envelope, Event, EventSender};
use crate::types::ComponentId;

// ----------------------------------------------------------------------------
// Event Target Trait
// ----------------------------------------------------------------------------

/// Anything that can receive envelopes from a dispatcher
pub trait EventTarget {
    /// Handle one event on the dispatch thread
    fn receive(self: Rc<Self>, event: Event);

    /// Short name used in trace output
    fn target_name(&self) -> &'static str;
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

pub struct Dispatcher {
    config: DispatchConfig,
    sender: EventSender,
    receiver: RefCell<mpsc::UnboundedReceiver<Envelope>>,
    targets: RefCell<HashMap<ComponentId, Weak<dyn EventTarget>>>,
    next_id: Cell<u64>,
}

impl Dispatcher {
    pub fn new() -> Rc<Self> {
        Self::with_config(DispatchConfig::default())
    }

    pub fn with_config(config: DispatchConfig) -> Rc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Rc::new(Self {
            config,
            sender: EventSender::new(sender),
            receiver: RefCell::new(receiver),
            targets: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        })
    }

    /// Handle for posting envelopes, usable from any thread
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Register a target and allocate its id
    ///
    /// Only a weak reference is kept: dropping the target is enough to make
    /// envelopes addressed to it no-ops.
    pub fn register(&self, target: Weak<dyn EventTarget>) -> ComponentId {
        let id = ComponentId::new(self.next_id.get());
        self.next_id.set(id.value() + 1);
        self.targets.borrow_mut().insert(id, target);
        id
    }

    pub fn unregister(&self, id: ComponentId) {
        self.targets.borrow_mut().remove(&id);
    }

    pub fn registered(&self) -> usize {
        self.targets.borrow().len()
    }

    /// Deliver one envelope to its target, if the target still exists
    pub fn deliver(&self, envelope: Envelope) {
        let Envelope { target, event } = envelope;
        let resolved = self.targets.borrow().get(&target).map(Weak::upgrade);
        match resolved {
            Some(Some(handler)) => {
                trace!(
                    component = %target,
                    target = handler.target_name(),
                    kind = event.kind(),
                    "Delivering envelope"
                );
                handler.receive(event);
            }
            Some(None) => {
                trace!(component = %target, kind = event.kind(), "Target dropped, envelope discarded");
                self.unregister(target);
            }
            None => {
                trace!(component = %target, kind = event.kind(), "Unknown target, envelope discarded");
            }
        }
    }

    /// Deliver everything already queued without waiting
    ///
    /// Returns the number of envelopes taken off the queue. Envelopes posted
    /// while draining are delivered in the same call, up to `max_batch`.
    pub fn dispatch_pending(&self) -> usize {
        let mut delivered = 0;
        loop {
            if self.config.max_batch != 0 && delivered >= self.config.max_batch {
                break;
            }
            let next = self.receiver.borrow_mut().try_recv();
            match next {
                Ok(envelope) => {
                    self.deliver(envelope);
                    delivered += 1;
                }
                Err(_) => break,
            }
        }
        delivered
    }

    /// Wait for one envelope and deliver it
    ///
    /// Returns `false` only if every sender has gone, which cannot happen
    /// while the dispatcher itself is alive.
    pub async fn dispatch_next(&self) -> bool {
        let next = poll_fn(|cx| self.receiver.borrow_mut().poll_recv(cx)).await;
        match next {
            Some(envelope) => {
                self.deliver(envelope);
                true
            }
            None => false,
        }
    }

    /// Dispatch until `done` returns true
    pub async fn run_until<F>(&self, mut done: F)
    where
        F: FnMut() -> bool,
    {
        while !done() {
            if !self.dispatch_next().await {
                break;
            }
        }
    }
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registered", &self.registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::event::TransportEvent;
    use crate::failure::SessionFailure;

    struct Recorder {
        seen: RefCell<Vec<String>>,
        sender: EventSender,
        id: Cell<Option<ComponentId>>,
    }

    impl EventTarget for Recorder {
        fn receive(self: Rc<Self>, event: Event) {
            let label = match &event {
                Event::Transport(TransportEvent::Failed(f)) => f.to_string(),
                other => other.kind().to_string(),
            };
            // The first event re-posts to itself to prove no borrow is held.
            if self.seen.borrow().is_empty() {
                if let Some(id) = self.id.get() {
                    self.sender.post_or_log(
                        id,
                        Event::Transport(TransportEvent::Failed(SessionFailure::Unknown)),
                    );
                }
            }
            self.seen.borrow_mut().push(label);
        }

        fn target_name(&self) -> &'static str {
            "recorder"
        }
    }

    fn recorder(dispatcher: &Rc<Dispatcher>) -> Rc<Recorder> {
        let recorder = Rc::new(Recorder {
            seen: RefCell::new(Vec::new()),
            sender: dispatcher.sender(),
            id: Cell::new(None),
        });
        let weak: Weak<dyn EventTarget> = Rc::downgrade(&recorder) as Weak<Recorder>;
        recorder.id.set(Some(dispatcher.register(weak)));
        recorder
    }

    fn failed(f: SessionFailure) -> Event {
        Event::Transport(TransportEvent::Failed(f))
    }

    #[test]
    fn test_fifo_delivery_with_reentrant_post() {
        let dispatcher = Dispatcher::new();
        let target = recorder(&dispatcher);
        let id = target.id.get().unwrap();

        dispatcher.sender().post(id, failed(SessionFailure::InvalidLogon)).unwrap();
        dispatcher.sender().post(id, failed(SessionFailure::SessionBroken)).unwrap();

        assert_eq!(dispatcher.dispatch_pending(), 3);
        assert_eq!(
            *target.seen.borrow(),
            vec!["invalid logon", "session broken", "unknown session failure"]
        );
    }

    #[test]
    fn test_dropped_target_is_pruned() {
        let dispatcher = Dispatcher::new();
        let target = recorder(&dispatcher);
        let id = target.id.get().unwrap();
        drop(target);

        dispatcher.sender().post(id, failed(SessionFailure::Unknown)).unwrap();
        assert_eq!(dispatcher.dispatch_pending(), 1);
        assert_eq!(dispatcher.registered(), 0);
    }

    #[test]
    fn test_post_after_dispatcher_dropped_reports_closed() {
        let dispatcher = Dispatcher::new();
        let sender = dispatcher.sender();
        drop(dispatcher);
        assert_eq!(
            sender.post(ComponentId::new(1), failed(SessionFailure::Unknown)),
            Err(crate::dispatch::event::PostError::QueueClosed)
        );
    }

    #[tokio::test]
    async fn test_run_until_waits_for_posts_from_other_threads() {
        let dispatcher = Dispatcher::new();
        let target = recorder(&dispatcher);
        let id = target.id.get().unwrap();
        let sender = dispatcher.sender();

        let handle = std::thread::spawn(move || {
            sender.post(id, failed(SessionFailure::ConnectionFailed)).unwrap();
        });

        let seen = target.clone();
        dispatcher.run_until(|| seen.seen.borrow().len() >= 2).await;
        handle.join().unwrap();
        assert_eq!(target.seen.borrow()[0], "connection failed");
    }
}
