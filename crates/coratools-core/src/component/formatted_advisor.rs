//! Formatted data advise transaction
//!
//! Subscribes to a logger table and receives batches of records already
//! formatted by the server. Flow control is explicit: after each batch the
//! server waits for the client to call [`FormattedDataAdvisor::continue_advise`].
//!
//! ```text
//! Standby --start()--> Delegate --(ready)--> BeforeActive
//! BeforeActive --(ack ok)--> WaitForRecords --(records)--> WaitForContinue
//! WaitForContinue --continue_advise()--> WaitForRecords
//! ```

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
use crate::failure::{AdvisorFailure, SessionFailure};
use crate::protocol::codes::{formatted_advise, versions, RESP_SUCCESS};
use crate::protocol::message::{Message, MessageReader, MessageWriter};
use crate::router::Router;
use crate::types::{ComponentId, InterfaceVersion, LgrDate, SessionNo, TransactionNo};

const NAME: &str = "formatted_advisor";

/// Smallest encoded record: record no, file mark, stamp, empty blob length
const MIN_RECORD_LEN: usize = 4 + 4 + 8 + 4;

// ----------------------------------------------------------------------------
// Options
// ----------------------------------------------------------------------------

/// Where in the table the advise begins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartOption {
    AtRecord { file_mark_no: u32, record_no: u32 },
    AtTime(LgrDate),
    /// Start this many records back from the newest
    RelativeToNewest(u32),
    AfterNewest,
}

impl StartOption {
    fn write(&self, writer: &mut MessageWriter) {
        match *self {
            StartOption::AtRecord {
                file_mark_no,
                record_no,
            } => {
                writer.add_u4(1).add_u4(file_mark_no).add_u4(record_no);
            }
            StartOption::AtTime(stamp) => {
                writer.add_u4(2).add_stamp(stamp);
            }
            StartOption::RelativeToNewest(count) => {
                writer.add_u4(3).add_u4(count);
            }
            StartOption::AfterNewest => {
                writer.add_u4(4);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderOption {
    Collected = 1,
    LoggedWithHoles = 2,
    LoggedWithoutHoles = 3,
    RealTime = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatOption {
    Toa5 = 1,
    Tob1 = 2,
    CsiXml = 3,
    CsiJson = 4,
    Csv = 5,
}

impl FormatOption {
    /// Format actually requested from a server of `version`
    pub fn negotiate(self, version: InterfaceVersion) -> Self {
        if self == FormatOption::CsiJson && version < versions::FORMATTED_ADVISE_JSON {
            FormatOption::CsiXml
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AdvisorOptions {
    station_name: String,
    table_name: String,
    start_option: StartOption,
    order_option: OrderOption,
    format_option: FormatOption,
    include_time_stamp: bool,
    include_record_no: bool,
    max_records_per_batch: u32,
}

impl Default for AdvisorOptions {
    fn default() -> Self {
        Self {
            station_name: String::new(),
            table_name: String::new(),
            start_option: StartOption::AfterNewest,
            order_option: OrderOption::Collected,
            format_option: FormatOption::Toa5,
            include_time_stamp: true,
            include_record_no: true,
            max_records_per_batch: 100,
        }
    }
}

impl AdvisorOptions {
    fn start_command(&self, tran_no: TransactionNo, version: InterfaceVersion) -> MessageWriter {
        let mut writer = MessageWriter::new();
        writer
            .add_tran_no(tran_no)
            .add_string(&self.station_name)
            .add_string(&self.table_name);
        self.start_option.write(&mut writer);
        if version >= versions::FORMATTED_ADVISE_ORDER_OPTION {
            writer.add_u4(self.order_option as u32);
        }
        let format = self.format_option.negotiate(version);
        if format != self.format_option {
            debug!(component = NAME, %version, "JSON format unsupported, requesting CSIXML");
        }
        writer
            .add_u4(format as u32)
            .add_bool(self.include_time_stamp)
            .add_bool(self.include_record_no)
            .add_u4(self.max_records_per_batch);
        writer
    }
}

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

/// One record as formatted by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedRecord {
    pub record_no: u32,
    pub file_mark_no: u32,
    pub stamp: LgrDate,
    pub formatted: Vec<u8>,
}

/// Parse a records notification; any malformed record rejects the batch
pub(crate) fn read_records(message: &Message) -> core::result::Result<Vec<FormattedRecord>, MessageError> {
    let mut reader = message.reader();
    reader.read_tran_no()?;
    let count = reader.read_u4()? as usize;
    let mut records = Vec::with_capacity(count.min(reader.remaining() / MIN_RECORD_LEN));
    for _ in 0..count {
        records.push(read_record(&mut reader)?);
    }
    Ok(records)
}

fn read_record(reader: &mut MessageReader<'_>) -> core::result::Result<FormattedRecord, MessageError> {
    Ok(FormattedRecord {
        record_no: reader.read_u4()?,
        file_mark_no: reader.read_u4()?,
        stamp: reader.read_stamp()?,
        formatted: reader.read_bytes()?,
    })
}

enum StartAck {
    Accepted { header: Vec<u8>, footer: Vec<u8> },
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
        header: reader.read_bytes()?,
        footer: reader.read_bytes()?,
    })
}

fn read_reason(message: &Message) -> core::result::Result<u32, MessageError> {
    let mut reader = message.reader();
    reader.read_tran_no()?;
    reader.read_u4()
}

// ----------------------------------------------------------------------------
// Client Interface
// ----------------------------------------------------------------------------

/// Callbacks for a [`FormattedDataAdvisor`] client
///
/// Each cycle yields zero or more progress callbacks and at most one
/// `on_failure`, which is always the last.
pub trait AdvisorClient {
    fn on_started(&self, _advisor: &FormattedDataAdvisor, _header: &[u8], _footer: &[u8]) {}

    /// A batch is ready in [`FormattedDataAdvisor::records`]
    fn on_records(&self, advisor: &FormattedDataAdvisor);

    /// The advisor is already back in `Standby` and may be restarted here
    fn on_failure(&self, advisor: &FormattedDataAdvisor, failure: AdvisorFailure);
}

/// Notifications queued for an advisor client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvisorNotice {
    Started { header: Vec<u8>, footer: Vec<u8> },
    Records,
    Failed(AdvisorFailure),
}

// ----------------------------------------------------------------------------
// Component
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisorState {
    Standby,
    Delegate,
    BeforeActive,
    WaitForRecords,
    WaitForContinue,
}

impl AdvisorState {
    pub fn name(&self) -> &'static str {
        match self {
            AdvisorState::Standby => "Standby",
            AdvisorState::Delegate => "Delegate",
            AdvisorState::BeforeActive => "BeforeActive",
            AdvisorState::WaitForRecords => "WaitForRecords",
            AdvisorState::WaitForContinue => "WaitForContinue",
        }
    }
}

struct AdvisorRun {
    state: AdvisorState,
    cycle: Option<Cycle<dyn AdvisorClient>>,
    records: Vec<FormattedRecord>,
}

pub struct FormattedDataAdvisor {
    core: TransactionCore,
    options: RefCell<AdvisorOptions>,
    run: RefCell<AdvisorRun>,
}

impl FormattedDataAdvisor {
    pub fn new(router: &Rc<Router>) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<FormattedDataAdvisor>| {
            let target: Weak<dyn EventTarget> = weak.clone();
            Self {
                core: TransactionCore::new(NAME, router, target),
                options: RefCell::new(AdvisorOptions::default()),
                run: RefCell::new(AdvisorRun {
                    state: AdvisorState::Standby,
                    cycle: None,
                    records: Vec::new(),
                }),
            }
        })
    }

    pub fn id(&self) -> ComponentId {
        self.core.id()
    }

    pub fn state(&self) -> AdvisorState {
        self.run.borrow().state
    }

    // ------------------------------------------------------------------------
    // Configuration (Standby only)
    // ------------------------------------------------------------------------

    fn configure(&self, operation: &'static str, update: impl FnOnce(&mut AdvisorOptions)) -> Result<()> {
        let state = self.state();
        if state != AdvisorState::Standby {
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

    pub fn set_start_option(&self, option: StartOption) -> Result<()> {
        self.configure("set_start_option", |o| o.start_option = option)
    }

    pub fn set_order_option(&self, option: OrderOption) -> Result<()> {
        self.configure("set_order_option", |o| o.order_option = option)
    }

    pub fn set_format_option(&self, option: FormatOption) -> Result<()> {
        self.configure("set_format_option", |o| o.format_option = option)
    }

    pub fn set_include_time_stamp(&self, include: bool) -> Result<()> {
        self.configure("set_include_time_stamp", |o| o.include_time_stamp = include)
    }

    pub fn set_include_record_no(&self, include: bool) -> Result<()> {
        self.configure("set_include_record_no", |o| o.include_record_no = include)
    }

    pub fn set_max_records_per_batch(&self, max: u32) -> Result<()> {
        if max == 0 {
            return Err(CoraError::invalid_argument("max_records_per_batch must be positive"));
        }
        self.configure("set_max_records_per_batch", |o| o.max_records_per_batch = max)
    }

    pub fn table_name(&self) -> String {
        self.options.borrow().table_name.clone()
    }

    pub fn format_option(&self) -> FormatOption {
        self.options.borrow().format_option
    }

    // ------------------------------------------------------------------------
    // Transaction control
    // ------------------------------------------------------------------------

    /// Begin the advise for `client`
    pub fn start(&self, client: Weak<dyn AdvisorClient>) -> Result<()> {
        let mut run = self.run.borrow_mut();
        if run.state != AdvisorState::Standby {
            return Err(CoraError::invalid_state("start", run.state.name()));
        }
        if self.options.borrow().table_name.is_empty() {
            return Err(CoraError::invalid_argument("table name is not set"));
        }
        run.cycle = Some(self.core.begin(client)?);
        run.state = AdvisorState::Delegate;
        Ok(())
    }

    /// Return to `Standby`, dropping buffered records and the session
    ///
    /// Never fails; queued notifications for the finished cycle are discarded
    /// when they reach the dispatcher.
    pub fn finish(&self) {
        let cycle = {
            let mut run = self.run.borrow_mut();
            run.state = AdvisorState::Standby;
            run.records.clear();
            run.cycle.take()
        };
        if let Some(cycle) = cycle {
            self.core.end(&cycle);
            debug!(component = NAME, id = %self.core.id(), "Advise finished");
        }
    }

    /// Acknowledge the current batch and ask the server for the next one
    pub fn continue_advise(&self) -> Result<()> {
        let mut run = self.run.borrow_mut();
        let run = &mut *run;
        if run.state != AdvisorState::WaitForContinue {
            return Err(CoraError::invalid_state("continue_advise", run.state.name()));
        }
        let Some(cycle) = run.cycle.as_mut() else {
            return Err(CoraError::invalid_state("continue_advise", "no cycle"));
        };
        if cycle.terminal_posted {
            debug!(component = NAME, "Continue ignored, failure pending");
            return Ok(());
        }
        let Some(tran_no) = cycle.tran_no else {
            return Err(CoraError::invalid_state("continue_advise", "no transaction"));
        };

        run.records.clear();
        run.state = AdvisorState::WaitForRecords;
        let mut body = MessageWriter::new();
        body.add_tran_no(tran_no);
        if let Err(err) = self.core.send(cycle, formatted_advise::CONTINUE_CMD, body) {
            warn!(component = NAME, error = %err, "Continue command not sent");
            self.post_failure(cycle, AdvisorFailure::SessionFailed);
        }
        Ok(())
    }

    /// Records of the batch awaiting acknowledgement, in arrival order
    pub fn records(&self) -> Vec<FormattedRecord> {
        self.run.borrow().records.clone()
    }

    pub fn record_count(&self) -> usize {
        self.run.borrow().records.len()
    }

    // ------------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------------

    fn post_failure(&self, cycle: &mut Cycle<dyn AdvisorClient>, failure: AdvisorFailure) {
        debug!(component = NAME, ?failure, "Posting failure");
        cycle.terminal_posted = true;
        self.core.notify(
            cycle.token(),
            NotificationPayload::Advisor(AdvisorNotice::Failed(failure)),
        );
    }

    fn on_session_ready(&self, session_no: SessionNo, version: InterfaceVersion) {
        let mut run = self.run.borrow_mut();
        let run = &mut *run;
        let Some(cycle) = run.cycle.as_mut().filter(|c| c.accepts_session(session_no)) else {
            return;
        };
        if run.state != AdvisorState::Delegate {
            return;
        }
        if version < versions::FORMATTED_ADVISE_MIN {
            debug!(component = NAME, %version, "Server too old for formatted advise");
            self.post_failure(cycle, AdvisorFailure::Unsupported);
            return;
        }

        let tran_no = self.core.new_transaction(cycle);
        let body = self.options.borrow().start_command(tran_no, version);
        match self.core.send(cycle, formatted_advise::START_CMD, body) {
            Ok(()) => {
                run.state = AdvisorState::BeforeActive;
                trace!(component = NAME, tran_no = %tran_no, "Start command sent");
            }
            Err(err) => {
                warn!(component = NAME, error = %err, "Start command not sent");
                self.post_failure(cycle, AdvisorFailure::SessionFailed);
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
            (AdvisorState::BeforeActive, formatted_advise::START_ACK) => {
                match read_start_ack(&message) {
                    Ok(StartAck::Accepted { header, footer }) => {
                        run.state = AdvisorState::WaitForRecords;
                        self.core.notify(
                            cycle.token(),
                            NotificationPayload::Advisor(AdvisorNotice::Started { header, footer }),
                        );
                    }
                    Ok(StartAck::Refused(code)) => {
                        self.post_failure(cycle, AdvisorFailure::from_start_code(code))
                    }
                    Err(err) => {
                        warn!(component = NAME, error = %err, "Malformed start acknowledgement");
                        self.post_failure(cycle, AdvisorFailure::Unknown);
                    }
                }
            }
            (AdvisorState::WaitForRecords, formatted_advise::RECORDS_NOT) => {
                match read_records(&message) {
                    Ok(records) => {
                        trace!(component = NAME, count = records.len(), "Record batch received");
                        run.records = records;
                        run.state = AdvisorState::WaitForContinue;
                        self.core
                            .notify(cycle.token(), NotificationPayload::Advisor(AdvisorNotice::Records));
                    }
                    Err(err) => {
                        warn!(component = NAME, error = %err, "Malformed record batch dropped");
                        self.post_failure(cycle, AdvisorFailure::MalformedRecords);
                    }
                }
            }
            (AdvisorState::WaitForContinue, formatted_advise::RECORDS_NOT) => {
                warn!(component = NAME, "Records received before continue was sent");
                self.post_failure(cycle, AdvisorFailure::Unknown);
            }
            (_, formatted_advise::STOPPED_NOT) => {
                let failure = match read_reason(&message) {
                    Ok(reason) => AdvisorFailure::from_stopped_reason(reason),
                    Err(err) => {
                        warn!(component = NAME, error = %err, "Malformed stopped notification");
                        AdvisorFailure::Unknown
                    }
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

    fn deliver(&self, token: ClientToken, notice: AdvisorNotice) {
        let delivery = {
            let run = self.run.borrow();
            ClientRef::resolve(cycle_client(run.cycle.as_ref()), token)
        };
        let client = match delivery {
            Delivery::Deliver(client) => client,
            Delivery::ClientGone => {
                debug!(component = NAME, "Client dropped, finishing advise");
                self.finish();
                return;
            }
            Delivery::Stale => {
                trace!(component = NAME, token = token.value(), "Stale notification discarded");
                return;
            }
        };

        match notice {
            AdvisorNotice::Started { header, footer } => client.on_started(self, &header, &footer),
            AdvisorNotice::Records => client.on_records(self),
            AdvisorNotice::Failed(failure) => {
                self.finish();
                client.on_failure(self, failure);
            }
        }
    }
}

impl EventTarget for FormattedDataAdvisor {
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
                payload: NotificationPayload::Advisor(notice),
            }) => self.deliver(token, notice),
            other => debug!(component = NAME, kind = other.kind(), "Unexpected event ignored"),
        }
    }

    fn target_name(&self) -> &'static str {
        NAME
    }
}

impl Drop for FormattedDataAdvisor {
    fn drop(&mut self) {
        if let Some(cycle) = self.run.get_mut().cycle.take() {
            self.core.end(&cycle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use tokio::sync::mpsc;

    fn advisor() -> (Rc<Dispatcher>, Rc<FormattedDataAdvisor>) {
        let dispatcher = Dispatcher::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let router = Router::new(&dispatcher, tx);
        (dispatcher, FormattedDataAdvisor::new(&router))
    }

    #[test]
    fn test_start_command_omits_order_for_old_servers() {
        let options = AdvisorOptions {
            station_name: "CR1000".to_string(),
            table_name: "Public".to_string(),
            order_option: OrderOption::RealTime,
            ..AdvisorOptions::default()
        };
        let old = options
            .start_command(TransactionNo::new(4), InterfaceVersion::new(1, 3, 2, 0))
            .into_body();
        let new = options
            .start_command(TransactionNo::new(4), InterfaceVersion::new(1, 3, 6, 0))
            .into_body();
        assert_eq!(new.len(), old.len() + 4);
    }

    #[test]
    fn test_json_format_substituted_for_old_servers() {
        assert_eq!(
            FormatOption::CsiJson.negotiate(InterfaceVersion::new(1, 4, 0, 9)),
            FormatOption::CsiXml
        );
        assert_eq!(
            FormatOption::CsiJson.negotiate(InterfaceVersion::new(1, 4, 1, 0)),
            FormatOption::CsiJson
        );
        assert_eq!(
            FormatOption::Toa5.negotiate(InterfaceVersion::new(1, 3, 1, 28)),
            FormatOption::Toa5
        );
    }

    #[test]
    fn test_batch_with_truncated_record_is_rejected() {
        let mut body = MessageWriter::new();
        body.add_u4(1).add_u4(2);
        body.add_u4(10).add_u4(1).add_i8(0).add_bytes(b"a");
        body.add_u4(11).add_u4(1);
        let message = body.finish(SessionNo::new(1), formatted_advise::RECORDS_NOT);
        assert!(matches!(
            read_records(&message),
            Err(MessageError::Truncated { .. })
        ));
    }

    #[test]
    fn test_huge_record_count_does_not_preallocate() {
        let mut body = MessageWriter::new();
        body.add_u4(1).add_u4(u32::MAX);
        let message = body.finish(SessionNo::new(1), formatted_advise::RECORDS_NOT);
        assert!(read_records(&message).is_err());
    }

    #[test]
    fn test_start_requires_table_name() {
        let (_dispatcher, advisor) = advisor();
        struct Quiet;
        impl AdvisorClient for Quiet {
            fn on_records(&self, _advisor: &FormattedDataAdvisor) {}
            fn on_failure(&self, _advisor: &FormattedDataAdvisor, _failure: AdvisorFailure) {}
        }
        let client: Rc<dyn AdvisorClient> = Rc::new(Quiet);
        let err = advisor.start(Rc::downgrade(&client)).unwrap_err();
        assert!(matches!(err, CoraError::InvalidArgument { .. }));
        assert_eq!(advisor.state(), AdvisorState::Standby);
    }

    #[test]
    fn test_continue_in_standby_is_invalid_state() {
        let (_dispatcher, advisor) = advisor();
        assert!(matches!(
            advisor.continue_advise(),
            Err(CoraError::InvalidState { .. })
        ));
        advisor.finish();
        advisor.finish();
        assert_eq!(advisor.state(), AdvisorState::Standby);
    }
}
