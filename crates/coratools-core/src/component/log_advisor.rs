//! Server log advise transaction
//!
//! Streams server log records. The current batch sits in `unread_records`
//! until the client calls [`LogAdvisor::get_next_batch`], which moves it into
//! a bounded history (`cached_records`) and asks the server for more.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::component::{cycle_client, Cycle, TransactionCore};
use crate::dispatch::{
    ClientRef, ClientToken, Delivery, Event, EventTarget, Notification, NotificationPayload,
    SessionEvent,
};
use crate::errors::{CoraError, MessageError, Result};
use crate::failure::{LogAdvisorFailure, SessionFailure};
use crate::protocol::codes::{log_advise, versions, RESP_SUCCESS};
use crate::protocol::message::{Message, MessageWriter};
use crate::router::Router;
use crate::types::{ComponentId, InterfaceVersion, LgrDate, SessionNo};

const NAME: &str = "log_advisor";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub stamp: LgrDate,
    pub text: String,
}

fn read_log_records(message: &Message) -> core::result::Result<Vec<LogRecord>, MessageError> {
    let mut reader = message.reader();
    reader.read_tran_no()?;
    let count = reader.read_u4()? as usize;
    // stamp plus string length prefix
    let mut records = Vec::with_capacity(count.min(reader.remaining() / 12));
    for _ in 0..count {
        records.push(LogRecord {
            stamp: reader.read_stamp()?,
            text: reader.read_string()?,
        });
    }
    Ok(records)
}

pub trait LogAdvisorClient {
    fn on_started(&self, _advisor: &LogAdvisor) {}
    fn on_records(&self, advisor: &LogAdvisor);
    fn on_failure(&self, advisor: &LogAdvisor, failure: LogAdvisorFailure);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogAdvisorNotice {
    Started,
    Records,
    Failed(LogAdvisorFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAdvisorState {
    Standby,
    Delegate,
    BeforeActive,
    WaitForRecords,
    WaitForContinue,
}

impl LogAdvisorState {
    pub fn name(&self) -> &'static str {
        match self {
            LogAdvisorState::Standby => "Standby",
            LogAdvisorState::Delegate => "Delegate",
            LogAdvisorState::BeforeActive => "BeforeActive",
            LogAdvisorState::WaitForRecords => "WaitForRecords",
            LogAdvisorState::WaitForContinue => "WaitForContinue",
        }
    }
}

#[derive(Debug, Clone)]
struct LogOptions {
    log_id: u32,
    backfill_count: u32,
    cache_limit: usize,
}

struct LogRun {
    state: LogAdvisorState,
    cycle: Option<Cycle<dyn LogAdvisorClient>>,
    unread_records: Vec<LogRecord>,
    cached_records: VecDeque<LogRecord>,
}

pub struct LogAdvisor {
    core: TransactionCore,
    options: RefCell<LogOptions>,
    run: RefCell<LogRun>,
}

impl LogAdvisor {
    pub fn new(router: &Rc<Router>) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<LogAdvisor>| {
            let target: Weak<dyn EventTarget> = weak.clone();
            Self {
                core: TransactionCore::new(NAME, router, target),
                options: RefCell::new(LogOptions {
                    log_id: 1,
                    backfill_count: 0,
                    cache_limit: 1000,
                }),
                run: RefCell::new(LogRun {
                    state: LogAdvisorState::Standby,
                    cycle: None,
                    unread_records: Vec::new(),
                    cached_records: VecDeque::new(),
                }),
            }
        })
    }

    pub fn id(&self) -> ComponentId {
        self.core.id()
    }

    pub fn state(&self) -> LogAdvisorState {
        self.run.borrow().state
    }

    fn configure(&self, operation: &'static str, update: impl FnOnce(&mut LogOptions)) -> Result<()> {
        let state = self.state();
        if state != LogAdvisorState::Standby {
            return Err(CoraError::invalid_state(operation, state.name()));
        }
        update(&mut self.options.borrow_mut());
        Ok(())
    }

    pub fn set_log_id(&self, log_id: u32) -> Result<()> {
        self.configure("set_log_id", |o| o.log_id = log_id)
    }

    /// Records from before the start to send first (servers >= 1.3.11)
    pub fn set_backfill_count(&self, count: u32) -> Result<()> {
        self.configure("set_backfill_count", |o| o.backfill_count = count)
    }

    pub fn set_cache_limit(&self, limit: usize) -> Result<()> {
        self.configure("set_cache_limit", |o| o.cache_limit = limit)
    }

    pub fn start(&self, client: Weak<dyn LogAdvisorClient>) -> Result<()> {
        let mut run = self.run.borrow_mut();
        if run.state != LogAdvisorState::Standby {
            return Err(CoraError::invalid_state("start", run.state.name()));
        }
        run.cycle = Some(self.core.begin(client)?);
        run.state = LogAdvisorState::Delegate;
        Ok(())
    }

    /// Back to `Standby`; the cached history survives until the next start
    pub fn finish(&self) {
        let cycle = {
            let mut run = self.run.borrow_mut();
            run.state = LogAdvisorState::Standby;
            run.unread_records.clear();
            run.cycle.take()
        };
        if let Some(cycle) = cycle {
            self.core.end(&cycle);
        }
    }

    pub fn unread_records(&self) -> Vec<LogRecord> {
        self.run.borrow().unread_records.clone()
    }

    pub fn cached_records(&self) -> Vec<LogRecord> {
        self.run.borrow().cached_records.iter().cloned().collect()
    }

    /// Move the unread batch into the cache and request the next one
    pub fn get_next_batch(&self) -> Result<()> {
        let cache_limit = self.options.borrow().cache_limit;
        let mut run = self.run.borrow_mut();
        let run = &mut *run;
        if run.state != LogAdvisorState::WaitForContinue {
            return Err(CoraError::invalid_state("get_next_batch", run.state.name()));
        }
        let Some(cycle) = run.cycle.as_mut() else {
            return Err(CoraError::invalid_state("get_next_batch", "no cycle"));
        };
        if cycle.terminal_posted {
            return Ok(());
        }
        let Some(tran_no) = cycle.tran_no else {
            return Err(CoraError::invalid_state("get_next_batch", "no transaction"));
        };

        run.cached_records.extend(run.unread_records.drain(..));
        while run.cached_records.len() > cache_limit {
            run.cached_records.pop_front();
        }
        run.state = LogAdvisorState::WaitForRecords;

        let mut body = MessageWriter::new();
        body.add_tran_no(tran_no);
        if let Err(err) = self.core.send(cycle, log_advise::CONTINUE_CMD, body) {
            warn!(component = NAME, error = %err, "Continue command not sent");
            self.post_failure(cycle, LogAdvisorFailure::SessionFailed);
        }
        Ok(())
    }

    fn post_failure(&self, cycle: &mut Cycle<dyn LogAdvisorClient>, failure: LogAdvisorFailure) {
        debug!(component = NAME, ?failure, "Posting failure");
        cycle.terminal_posted = true;
        self.core.notify(
            cycle.token(),
            NotificationPayload::LogAdvisor(LogAdvisorNotice::Failed(failure)),
        );
    }

    fn on_session_ready(&self, session_no: SessionNo, version: InterfaceVersion) {
        let mut run = self.run.borrow_mut();
        let run = &mut *run;
        let Some(cycle) = run.cycle.as_mut().filter(|c| c.accepts_session(session_no)) else {
            return;
        };
        if run.state != LogAdvisorState::Delegate {
            return;
        }
        if version < versions::LOG_ADVISE_MIN {
            self.post_failure(cycle, LogAdvisorFailure::Unsupported);
            return;
        }

        let tran_no = self.core.new_transaction(cycle);
        let mut body = MessageWriter::new();
        {
            let options = self.options.borrow();
            body.add_tran_no(tran_no).add_u4(options.log_id);
            if version >= versions::LOG_ADVISE_BACKFILL {
                body.add_u4(options.backfill_count);
            }
        }
        run.cached_records.clear();
        match self.core.send(cycle, log_advise::START_CMD, body) {
            Ok(()) => run.state = LogAdvisorState::BeforeActive,
            Err(err) => {
                warn!(component = NAME, error = %err, "Start command not sent");
                self.post_failure(cycle, LogAdvisorFailure::SessionFailed);
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

        let mut reader = message.reader();
        match (run.state, message.message_type) {
            (LogAdvisorState::BeforeActive, log_advise::START_ACK) => {
                match reader.read_tran_no().and_then(|_| reader.read_u4()) {
                    Ok(RESP_SUCCESS) => {
                        run.state = LogAdvisorState::WaitForRecords;
                        self.core.notify(
                            cycle.token(),
                            NotificationPayload::LogAdvisor(LogAdvisorNotice::Started),
                        );
                    }
                    Ok(code) => self.post_failure(cycle, LogAdvisorFailure::from_start_code(code)),
                    Err(_) => self.post_failure(cycle, LogAdvisorFailure::Unknown),
                }
            }
            (LogAdvisorState::WaitForRecords, log_advise::RECORDS_NOT) => {
                match read_log_records(&message) {
                    Ok(records) => {
                        trace!(component = NAME, count = records.len(), "Log batch received");
                        run.unread_records = records;
                        run.state = LogAdvisorState::WaitForContinue;
                        self.core.notify(
                            cycle.token(),
                            NotificationPayload::LogAdvisor(LogAdvisorNotice::Records),
                        );
                    }
                    Err(err) => {
                        warn!(component = NAME, error = %err, "Malformed log batch dropped");
                        self.post_failure(cycle, LogAdvisorFailure::MalformedRecords);
                    }
                }
            }
            (LogAdvisorState::WaitForContinue, log_advise::RECORDS_NOT) => {
                warn!(component = NAME, "Log records received before continue was sent");
                self.post_failure(cycle, LogAdvisorFailure::Unknown);
            }
            (_, log_advise::STOPPED_NOT) => {
                let failure = match reader.read_tran_no().and_then(|_| reader.read_u4()) {
                    Ok(reason) => LogAdvisorFailure::from_stopped_reason(reason),
                    Err(_) => LogAdvisorFailure::Unknown,
                };
                self.post_failure(cycle, failure);
            }
            (state, message_type) => debug!(
                component = NAME,
                state = state.name(),
                message_type,
                "Unexpected message ignored"
            ),
        }
    }

    fn on_session_failed(&self, session_no: SessionNo, failure: SessionFailure) {
        let mut run = self.run.borrow_mut();
        if let Some(cycle) = run.cycle.as_mut().filter(|c| c.accepts_session(session_no)) {
            self.post_failure(cycle, failure.into());
        }
    }

    fn deliver(&self, token: ClientToken, notice: LogAdvisorNotice) {
        let delivery = {
            let run = self.run.borrow();
            ClientRef::resolve(cycle_client(run.cycle.as_ref()), token)
        };
        let client = match delivery {
            Delivery::Deliver(client) => client,
            Delivery::ClientGone => {
                self.finish();
                return;
            }
            Delivery::Stale => return,
        };
        match notice {
            LogAdvisorNotice::Started => client.on_started(self),
            LogAdvisorNotice::Records => client.on_records(self),
            LogAdvisorNotice::Failed(failure) => {
                self.finish();
                client.on_failure(self, failure);
            }
        }
    }
}

impl EventTarget for LogAdvisor {
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
                payload: NotificationPayload::LogAdvisor(notice),
            }) => self.deliver(token, notice),
            other => debug!(component = NAME, kind = other.kind(), "Unexpected event ignored"),
        }
    }

    fn target_name(&self) -> &'static str {
        NAME
    }
}

impl Drop for LogAdvisor {
    fn drop(&mut self) {
        if let Some(cycle) = self.run.get_mut().cycle.take() {
            self.core.end(&cycle);
        }
    }
}
