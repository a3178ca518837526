//! Logger query transaction
//!
//! Asks the server to collect a range of a logger table into a temporary
//! table. Progress arrives as status notifications; the transaction completes
//! with `QueryOutcome::Success` when the server reports all data collected.

use core::time::Duration;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::component::{cycle_client, Cycle, TransactionCore};
use crate::dispatch::{
    ClientRef, ClientToken, Delivery, Event, EventTarget, Notification, NotificationPayload,
    SessionEvent,
};
use crate::errors::{CoraError, MessageError, Result};
use crate::failure::{QueryOutcome, SessionFailure};
use crate::protocol::codes::{logger_query, versions, RESP_SUCCESS};
use crate::protocol::message::{Message, MessageWriter};
use crate::router::Router;
use crate::types::{
    ComponentId, InterfaceVersion, LgrDate, SessionNo, SystemTimeSource, TimeSource,
    TransactionNo,
};

const NAME: &str = "logger_query";

// ----------------------------------------------------------------------------
// Query Mode
// ----------------------------------------------------------------------------

/// Which part of the table to collect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryMode {
    DateRange { begin: LgrDate, end: LgrDate },
    RecordNumberRange { begin: u32, end: u32 },
    All,
    /// Everything newer than `now - interval`
    Backfill { interval: Duration },
}

impl QueryMode {
    /// Remap modes a server of `version` cannot handle to bounded ranges
    pub fn negotiate(self, version: InterfaceVersion, now: LgrDate) -> Self {
        if version >= versions::LOGGER_QUERY_EXTENDED_MODES {
            return self;
        }
        match self {
            QueryMode::All => QueryMode::RecordNumberRange {
                begin: 0,
                end: u32::MAX,
            },
            QueryMode::Backfill { interval } => QueryMode::DateRange {
                begin: now - interval,
                end: LgrDate::MAX,
            },
            other => other,
        }
    }

    fn write(&self, writer: &mut MessageWriter) {
        match *self {
            QueryMode::DateRange { begin, end } => {
                writer.add_u4(1).add_stamp(begin).add_stamp(end);
            }
            QueryMode::RecordNumberRange { begin, end } => {
                writer.add_u4(2).add_u4(begin).add_u4(end);
            }
            QueryMode::All => {
                writer.add_u4(3);
            }
            QueryMode::Backfill { interval } => {
                let nanos = i64::try_from(interval.as_nanos()).unwrap_or(i64::MAX);
                writer.add_u4(4).add_i8(nanos);
            }
        }
    }
}

struct QueryOptions {
    station_name: String,
    table_name: String,
    mode: QueryMode,
    use_same_table: bool,
    time_source: Box<dyn TimeSource>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            station_name: String::new(),
            table_name: String::new(),
            mode: QueryMode::All,
            use_same_table: false,
            time_source: Box::new(SystemTimeSource::new()),
        }
    }
}

impl QueryOptions {
    fn start_command(&self, tran_no: TransactionNo, version: InterfaceVersion) -> MessageWriter {
        let mode = self.mode.negotiate(version, self.time_source.now());
        if mode != self.mode {
            debug!(component = NAME, %version, ?mode, "Query mode remapped for server version");
        }
        let mut writer = MessageWriter::new();
        writer
            .add_tran_no(tran_no)
            .add_string(&self.station_name)
            .add_string(&self.table_name);
        mode.write(&mut writer);
        if version >= versions::LOGGER_QUERY_SAME_TABLE {
            writer.add_bool(self.use_same_table);
        }
        writer
    }
}

// ----------------------------------------------------------------------------
// Status
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatusCode {
    TempTableCreated,
    DataCollected,
    AllDataCollected,
}

impl QueryStatusCode {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(QueryStatusCode::TempTableCreated),
            2 => Some(QueryStatusCode::DataCollected),
            3 => Some(QueryStatusCode::AllDataCollected),
            _ => None,
        }
    }
}

/// Progress reported by a status notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStatus {
    pub status: QueryStatusCode,
    pub temp_table_name: String,
    pub records_expected: u32,
    pub records_collected: u32,
}

enum StartAck {
    Accepted { temp_table_name: String },
    Refused(u32),
}

fn read_start_ack(message: &Message) -> core::result::Result<StartAck, MessageError> {
    let mut reader = message.reader();
    reader.read_tran_no()?;
    let resp_code = reader.read_u4()?;
    if resp_code != RESP_SUCCESS {
        return Ok(StartAck::Refused(resp_code));
    }
    Ok(StartAck::Accepted {
        temp_table_name: reader.read_string()?,
    })
}

fn read_status(message: &Message) -> core::result::Result<(u32, QueryStatus), MessageError> {
    let mut reader = message.reader();
    reader.read_tran_no()?;
    let code = reader.read_u4()?;
    let temp_table_name = reader.read_string()?;
    let records_expected = reader.read_u4()?;
    let records_collected = reader.read_u4()?;
    Ok((
        code,
        QueryStatus {
            status: QueryStatusCode::TempTableCreated,
            temp_table_name,
            records_expected,
            records_collected,
        },
    ))
}

// ----------------------------------------------------------------------------
// Client Interface
// ----------------------------------------------------------------------------

pub trait LoggerQueryClient {
    fn on_status(&self, _query: &LoggerQuery, _status: &QueryStatus) {}

    /// Terminal; the query is already back in `Standby`
    fn on_complete(&self, query: &LoggerQuery, outcome: QueryOutcome);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryNotice {
    Status(QueryStatus),
    Complete(QueryOutcome),
}

// ----------------------------------------------------------------------------
// Component
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Standby,
    Delegate,
    BeforeActive,
    Active,
}

impl QueryState {
    pub fn name(&self) -> &'static str {
        match self {
            QueryState::Standby => "Standby",
            QueryState::Delegate => "Delegate",
            QueryState::BeforeActive => "BeforeActive",
            QueryState::Active => "Active",
        }
    }
}

struct QueryRun {
    state: QueryState,
    cycle: Option<Cycle<dyn LoggerQueryClient>>,
    temp_table_name: String,
}

pub struct LoggerQuery {
    core: TransactionCore,
    options: RefCell<QueryOptions>,
    run: RefCell<QueryRun>,
}

impl LoggerQuery {
    pub fn new(router: &Rc<Router>) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<LoggerQuery>| {
            let target: Weak<dyn EventTarget> = weak.clone();
            Self {
                core: TransactionCore::new(NAME, router, target),
                options: RefCell::new(QueryOptions::default()),
                run: RefCell::new(QueryRun {
                    state: QueryState::Standby,
                    cycle: None,
                    temp_table_name: String::new(),
                }),
            }
        })
    }

    pub fn id(&self) -> ComponentId {
        self.core.id()
    }

    pub fn state(&self) -> QueryState {
        self.run.borrow().state
    }

    fn configure(&self, operation: &'static str, update: impl FnOnce(&mut QueryOptions)) -> Result<()> {
        let state = self.state();
        if state != QueryState::Standby {
            return Err(CoraError::invalid_state(operation, state.name()));
        }
        update(&mut self.options.borrow_mut());
        Ok(())
    }

    pub fn set_station_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.configure("set_station_name", |o| o.station_name = name)
    }

    pub fn set_table_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.configure("set_table_name", |o| o.table_name = name)
    }

    pub fn set_query_mode(&self, mode: QueryMode) -> Result<()> {
        if let QueryMode::DateRange { begin, end } = mode {
            if begin > end {
                return Err(CoraError::invalid_argument("date range begins after it ends"));
            }
        }
        self.configure("set_query_mode", |o| o.mode = mode)
    }

    pub fn set_use_same_table(&self, use_same_table: bool) -> Result<()> {
        self.configure("set_use_same_table", |o| o.use_same_table = use_same_table)
    }

    pub fn set_time_source(&self, time_source: Box<dyn TimeSource>) -> Result<()> {
        self.configure("set_time_source", |o| o.time_source = time_source)
    }

    pub fn station_name(&self) -> String {
        self.options.borrow().station_name.clone()
    }

    pub fn query_mode(&self) -> QueryMode {
        self.options.borrow().mode
    }

    /// Name of the server's temporary table once the start was acknowledged
    pub fn temp_table_name(&self) -> String {
        self.run.borrow().temp_table_name.clone()
    }

    pub fn start(&self, client: Weak<dyn LoggerQueryClient>) -> Result<()> {
        let mut run = self.run.borrow_mut();
        if run.state != QueryState::Standby {
            return Err(CoraError::invalid_state("start", run.state.name()));
        }
        {
            let options = self.options.borrow();
            if options.station_name.is_empty() || options.table_name.is_empty() {
                return Err(CoraError::invalid_argument("station and table names must be set"));
            }
        }
        run.cycle = Some(self.core.begin(client)?);
        run.temp_table_name.clear();
        run.state = QueryState::Delegate;
        Ok(())
    }

    pub fn finish(&self) {
        let cycle = {
            let mut run = self.run.borrow_mut();
            run.state = QueryState::Standby;
            run.cycle.take()
        };
        if let Some(cycle) = cycle {
            self.core.end(&cycle);
            debug!(component = NAME, id = %self.core.id(), "Query finished");
        }
    }

    fn post_complete(&self, cycle: &mut Cycle<dyn LoggerQueryClient>, outcome: QueryOutcome) {
        debug!(component = NAME, ?outcome, "Posting completion");
        cycle.terminal_posted = true;
        self.core.notify(
            cycle.token(),
            NotificationPayload::Query(QueryNotice::Complete(outcome)),
        );
    }

    fn on_session_ready(&self, session_no: SessionNo, version: InterfaceVersion) {
        let mut run = self.run.borrow_mut();
        let run = &mut *run;
        let Some(cycle) = run.cycle.as_mut().filter(|c| c.accepts_session(session_no)) else {
            return;
        };
        if run.state != QueryState::Delegate {
            return;
        }
        if version < versions::LOGGER_QUERY_MIN {
            debug!(component = NAME, %version, "Server too old for logger query");
            self.post_complete(cycle, QueryOutcome::Unsupported);
            return;
        }

        let tran_no = self.core.new_transaction(cycle);
        let body = self.options.borrow().start_command(tran_no, version);
        match self.core.send(cycle, logger_query::START_CMD, body) {
            Ok(()) => run.state = QueryState::BeforeActive,
            Err(err) => {
                warn!(component = NAME, error = %err, "Start command not sent");
                self.post_complete(cycle, QueryOutcome::SessionFailed);
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

        match (run.state, message.message_type) {
            (QueryState::BeforeActive, logger_query::START_ACK) => {
                match read_start_ack(&message) {
                    Ok(StartAck::Accepted { temp_table_name }) => {
                        run.temp_table_name = temp_table_name;
                        run.state = QueryState::Active;
                        trace!(component = NAME, temp_table = %run.temp_table_name, "Query started");
                    }
                    Ok(StartAck::Refused(code)) => {
                        self.post_complete(cycle, QueryOutcome::from_start_code(code))
                    }
                    Err(err) => {
                        warn!(component = NAME, error = %err, "Malformed start acknowledgement");
                        self.post_complete(cycle, QueryOutcome::Unknown);
                    }
                }
            }
            (QueryState::Active, logger_query::STATUS_NOT) => match read_status(&message) {
                Ok((code, mut status)) => {
                    let Some(status_code) = QueryStatusCode::from_code(code) else {
                        debug!(component = NAME, code, "Unknown query status ignored");
                        return;
                    };
                    status.status = status_code;
                    if !status.temp_table_name.is_empty() {
                        run.temp_table_name = status.temp_table_name.clone();
                    }
                    trace!(
                        component = NAME,
                        ?status_code,
                        expected = status.records_expected,
                        collected = status.records_collected,
                        "Query status"
                    );
                    self.core.notify(
                        cycle.token(),
                        NotificationPayload::Query(QueryNotice::Status(status)),
                    );
                    if status_code == QueryStatusCode::AllDataCollected {
                        self.post_complete(cycle, QueryOutcome::Success);
                    }
                }
                Err(err) => {
                    warn!(component = NAME, error = %err, "Malformed status notification");
                    self.post_complete(cycle, QueryOutcome::Unknown);
                }
            },
            (_, logger_query::STOPPED_NOT) => {
                let mut reader = message.reader();
                let outcome = match reader.read_tran_no().and_then(|_| reader.read_u4()) {
                    Ok(reason) => QueryOutcome::from_stopped_reason(reason),
                    Err(_) => QueryOutcome::Unknown,
                };
                self.post_complete(cycle, outcome);
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
            self.post_complete(cycle, failure.into());
        }
    }

    fn deliver(&self, token: ClientToken, notice: QueryNotice) {
        let delivery = {
            let run = self.run.borrow();
            ClientRef::resolve(cycle_client(run.cycle.as_ref()), token)
        };
        let client = match delivery {
            Delivery::Deliver(client) => client,
            Delivery::ClientGone => {
                debug!(component = NAME, "Client dropped, finishing query");
                self.finish();
                return;
            }
            Delivery::Stale => {
                trace!(component = NAME, token = token.value(), "Stale notification discarded");
                return;
            }
        };

        match notice {
            QueryNotice::Status(status) => client.on_status(self, &status),
            QueryNotice::Complete(outcome) => {
                self.finish();
                client.on_complete(self, outcome);
            }
        }
    }
}

impl EventTarget for LoggerQuery {
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
                payload: NotificationPayload::Query(notice),
            }) => self.deliver(token, notice),
            other => debug!(component = NAME, kind = other.kind(), "Unexpected event ignored"),
        }
    }

    fn target_name(&self) -> &'static str {
        NAME
    }
}

impl Drop for LoggerQuery {
    fn drop(&mut self) {
        if let Some(cycle) = self.run.get_mut().cycle.take() {
            self.core.end(&cycle);
        }
    }
}
