//! Device adder transaction
//!
//! A single command/acknowledgement exchange that adds a device to the
//! server's network map. The query-style subset of the transaction pattern:
//! no notifications between start and completion.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::component::{cycle_client, Cycle, TransactionCore};
use crate::dispatch::{
    ClientRef, ClientToken, Delivery, Event, EventTarget, Notification, NotificationPayload,
    SessionEvent,
};
use crate::errors::{CoraError, Result};
use crate::failure::{DeviceAdderOutcome, SessionFailure};
use crate::protocol::codes::{device_adder, versions};
use crate::protocol::message::{Message, MessageWriter};
use crate::router::Router;
use crate::types::{ComponentId, InterfaceVersion, SessionNo};

const NAME: &str = "device_adder";

pub trait DeviceAdderClient {
    fn on_complete(&self, adder: &DeviceAdder, outcome: DeviceAdderOutcome);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAdderNotice {
    Complete(DeviceAdderOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdderState {
    Standby,
    Delegate,
    BeforeActive,
}

impl AdderState {
    fn name(&self) -> &'static str {
        match self {
            AdderState::Standby => "Standby",
            AdderState::Delegate => "Delegate",
            AdderState::BeforeActive => "BeforeActive",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DeviceOptions {
    device_type_code: u32,
    device_name: String,
    parent_name: String,
    as_child: bool,
}

struct AdderRun {
    state: AdderState,
    cycle: Option<Cycle<dyn DeviceAdderClient>>,
}

pub struct DeviceAdder {
    core: TransactionCore,
    options: RefCell<DeviceOptions>,
    run: RefCell<AdderRun>,
}

impl DeviceAdder {
    pub fn new(router: &Rc<Router>) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<DeviceAdder>| {
            let target: Weak<dyn EventTarget> = weak.clone();
            Self {
                core: TransactionCore::new(NAME, router, target),
                options: RefCell::new(DeviceOptions::default()),
                run: RefCell::new(AdderRun {
                    state: AdderState::Standby,
                    cycle: None,
                }),
            }
        })
    }

    pub fn id(&self) -> ComponentId {
        self.core.id()
    }

    pub fn is_standby(&self) -> bool {
        self.run.borrow().state == AdderState::Standby
    }

    fn configure(&self, operation: &'static str, update: impl FnOnce(&mut DeviceOptions)) -> Result<()> {
        let state = self.run.borrow().state;
        if state != AdderState::Standby {
            return Err(CoraError::invalid_state(operation, state.name()));
        }
        update(&mut self.options.borrow_mut());
        Ok(())
    }

    pub fn set_device_type(&self, device_type_code: u32) -> Result<()> {
        self.configure("set_device_type", |o| o.device_type_code = device_type_code)
    }

    pub fn set_device_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.configure("set_device_name", |o| o.device_name = name)
    }

    /// Attach under `parent_name`, as a child or as a sibling after it
    pub fn set_parent(&self, parent_name: impl Into<String>, as_child: bool) -> Result<()> {
        let parent_name = parent_name.into();
        self.configure("set_parent", |o| {
            o.parent_name = parent_name;
            o.as_child = as_child;
        })
    }

    pub fn start(&self, client: Weak<dyn DeviceAdderClient>) -> Result<()> {
        let mut run = self.run.borrow_mut();
        if run.state != AdderState::Standby {
            return Err(CoraError::invalid_state("start", run.state.name()));
        }
        if self.options.borrow().device_name.is_empty() {
            return Err(CoraError::invalid_argument("device name is not set"));
        }
        run.cycle = Some(self.core.begin(client)?);
        run.state = AdderState::Delegate;
        Ok(())
    }

    pub fn finish(&self) {
        let cycle = {
            let mut run = self.run.borrow_mut();
            run.state = AdderState::Standby;
            run.cycle.take()
        };
        if let Some(cycle) = cycle {
            self.core.end(&cycle);
        }
    }

    fn post_complete(&self, cycle: &mut Cycle<dyn DeviceAdderClient>, outcome: DeviceAdderOutcome) {
        cycle.terminal_posted = true;
        self.core.notify(
            cycle.token(),
            NotificationPayload::DeviceAdder(DeviceAdderNotice::Complete(outcome)),
        );
    }

    fn on_session_ready(&self, session_no: SessionNo, version: InterfaceVersion) {
        let mut run = self.run.borrow_mut();
        let run = &mut *run;
        let Some(cycle) = run.cycle.as_mut().filter(|c| c.accepts_session(session_no)) else {
            return;
        };
        if run.state != AdderState::Delegate {
            return;
        }
        if version < versions::DEVICE_ADDER_MIN {
            self.post_complete(cycle, DeviceAdderOutcome::Unsupported);
            return;
        }

        let tran_no = self.core.new_transaction(cycle);
        let mut body = MessageWriter::new();
        {
            let options = self.options.borrow();
            body.add_tran_no(tran_no)
                .add_u4(options.device_type_code)
                .add_string(&options.device_name)
                .add_string(&options.parent_name)
                .add_bool(options.as_child);
        }
        match self.core.send(cycle, device_adder::ADD_CMD, body) {
            Ok(()) => run.state = AdderState::BeforeActive,
            Err(err) => {
                warn!(component = NAME, error = %err, "Add command not sent");
                self.post_complete(cycle, DeviceAdderOutcome::SessionFailed);
            }
        }
    }

    fn on_message(&self, message: Message) {
        let mut run = self.run.borrow_mut();
        let run = &mut *run;
        let Some(cycle) = run.cycle.as_mut() else {
            return;
        };
        if !cycle.accepts_message(NAME, &message) {
            return;
        }
        if run.state != AdderState::BeforeActive || message.message_type != device_adder::ADD_ACK {
            debug!(component = NAME, message_type = message.message_type, "Unexpected message ignored");
            return;
        }
        let mut reader = message.reader();
        let outcome = match reader.read_tran_no().and_then(|_| reader.read_u4()) {
            Ok(code) => DeviceAdderOutcome::from_ack_code(code),
            Err(err) => {
                warn!(component = NAME, error = %err, "Malformed add acknowledgement");
                DeviceAdderOutcome::Unknown
            }
        };
        self.post_complete(cycle, outcome);
    }

    fn on_session_failed(&self, session_no: SessionNo, failure: SessionFailure) {
        let mut run = self.run.borrow_mut();
        if let Some(cycle) = run.cycle.as_mut().filter(|c| c.accepts_session(session_no)) {
            self.post_complete(cycle, failure.into());
        }
    }

    fn deliver(&self, token: ClientToken, notice: DeviceAdderNotice) {
        let delivery = {
            let run = self.run.borrow();
            ClientRef::resolve(cycle_client(run.cycle.as_ref()), token)
        };
        let DeviceAdderNotice::Complete(outcome) = notice;
        match delivery {
            Delivery::Deliver(client) => {
                self.finish();
                client.on_complete(self, outcome);
            }
            Delivery::ClientGone => self.finish(),
            Delivery::Stale => {}
        }
    }
}

impl EventTarget for DeviceAdder {
    fn receive(self: Rc<Self>, event: Event) {
        match event {
            Event::Session { session_no, event } => match event {
                SessionEvent::Ready { interface_version } => {
                    self.on_session_ready(session_no, interface_version)
                }
                SessionEvent::Message(message) => self.on_message(message),
                SessionEvent::Failed(failure) => self.on_session_failed(session_no, failure),
            },
            Event::Notify(Notification {
                token,
                payload: NotificationPayload::DeviceAdder(notice),
            }) => self.deliver(token, notice),
            other => debug!(component = NAME, kind = other.kind(), "Unexpected event ignored"),
        }
    }

    fn target_name(&self) -> &'static str {
        NAME
    }
}

impl Drop for DeviceAdder {
    fn drop(&mut self) {
        if let Some(cycle) = self.run.get_mut().cycle.take() {
            self.core.end(&cycle);
        }
    }
}
