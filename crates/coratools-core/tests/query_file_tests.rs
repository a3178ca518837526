//! Query-to-file composite: query, lazily started advisor and output sink


use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use coratools_core::component::{AppendWarning, LoggerQueryFile, QueryFileClient, QueryFileState};
use coratools_core::protocol::codes::{formatted_advise, logger_query};
use coratools_core::sink::{FileMode, MemorySink};
use coratools_core::{CoraError, Message, QueryFileOutcome};
use test_utils::{formatted_records, query_status, respond, FileRecorder, MockServer, CURRENT};

/// A composite whose query has been acknowledged
struct Harness {
    server: MockServer,
    composite: Rc<LoggerQueryFile>,
    client: Rc<FileRecorder>,
    sink: MemorySink,
    query_command: Message,
}

impl Harness {
    fn new(client: Rc<FileRecorder>, sink: MemorySink, file_mode: FileMode) -> Self {
        let mut server = MockServer::connected(CURRENT);
        let composite = LoggerQueryFile::new(&server.router);
        composite.set_station_name("CR1000").unwrap();
        composite.set_table_name("Hourly").unwrap();
        composite.set_output("hourly.dat", file_mode).unwrap();
        composite.set_sink(Box::new(sink.clone())).unwrap();
        let weak = Rc::downgrade(&client) as Weak<dyn QueryFileClient>;
        composite.start(weak).unwrap();
        server.pump();

        let query_command = server.expect_one(logger_query::START_CMD);
        server.reply(respond(&query_command, logger_query::START_ACK, |body| {
            body.add_u4(1).add_string("__tmp_hourly");
        }));
        Self {
            server,
            composite,
            client,
            sink,
            query_command,
        }
    }

    fn query_status(&self, status: u32, expected: u32, collected: u32) {
        self.server
            .reply(respond(&self.query_command, logger_query::STATUS_NOT, |body| {
                query_status(body, status, "__tmp_hourly", expected, collected);
            }));
    }

    /// Report the temporary table and acknowledge the advisor it triggers
    fn start_stream(&mut self, expected: u32) -> Message {
        self.query_status(1, expected, 0);
        let sent = self.server.sent();
        let advise = sent
            .into_iter()
            .find(|m| m.message_type == formatted_advise::START_CMD)
            .expect("advisor started on the temporary table");
        self.server
            .reply(respond(&advise, formatted_advise::START_ACK, |body| {
                body.add_u4(1).add_bytes(b"HDR\n").add_bytes(b"FTR\n");
            }));
        advise
    }

    fn records(&self, advise: &Message, first: u32, rows: &[&str]) {
        self.server
            .reply(respond(advise, formatted_advise::RECORDS_NOT, |body| {
                formatted_records(body, first, rows);
            }));
    }

    fn outcomes(&self) -> Vec<QueryFileOutcome> {
        self.client.outcomes.borrow().clone()
    }
}

#[test]
fn test_completion_waits_for_stream_to_catch_up() {
    let mut harness = Harness::new(FileRecorder::new(), MemorySink::new(), FileMode::Overwrite);
    let advise = harness.start_stream(4);

    let mut reader = advise.reader();
    reader.read_u4().unwrap();
    assert_eq!(reader.read_string().unwrap(), "CR1000");
    assert_eq!(reader.read_string().unwrap(), "__tmp_hourly");
    assert_eq!(reader.read_u4().unwrap(), 1, "starts at a record");

    harness.records(&advise, 1, &["r1\n", "r2\n"]);
    assert_eq!(harness.composite.records_collected(), 2);
    assert!(harness
        .server
        .sent()
        .iter()
        .any(|m| m.message_type == formatted_advise::CONTINUE_CMD));

    // The query finishes while two records are still in flight
    harness.query_status(3, 4, 4);
    assert!(harness.outcomes().is_empty());
    assert_eq!(harness.composite.state(), QueryFileState::QueryComplete);

    harness.records(&advise, 3, &["r3\n", "r4\n"]);
    assert_eq!(harness.outcomes(), vec![QueryFileOutcome::Success]);
    assert_eq!(harness.sink.written(), b"HDR\nr1\nr2\nr3\nr4\nFTR\n");
    assert!(harness.sink.is_closed());
    assert_eq!(harness.composite.state(), QueryFileState::Standby);

    let statuses = harness.client.statuses.borrow().clone();
    assert_eq!(statuses.first(), Some(&(4, 0)));
    assert_eq!(statuses.last(), Some(&(4, 4)));
}

#[test]
fn test_completion_when_stream_already_caught_up() {
    let mut harness = Harness::new(FileRecorder::new(), MemorySink::new(), FileMode::Overwrite);
    let advise = harness.start_stream(1);
    harness.records(&advise, 1, &["only\n"]);
    assert!(harness.outcomes().is_empty());

    harness.query_status(3, 1, 1);
    assert_eq!(harness.outcomes(), vec![QueryFileOutcome::Success]);
    assert_eq!(harness.sink.written(), b"HDR\nonly\nFTR\n");
}

#[test]
fn test_advisor_started_once() {
    let mut harness = Harness::new(FileRecorder::new(), MemorySink::new(), FileMode::Overwrite);
    harness.start_stream(10);
    harness.query_status(2, 10, 5);
    harness.query_status(2, 10, 8);
    assert!(!harness
        .server
        .sent()
        .iter()
        .any(|m| m.message_type == formatted_advise::START_CMD));
}

#[test]
fn test_open_failure() {
    let sink = MemorySink::new();
    sink.fail_open();
    let mut harness = Harness::new(FileRecorder::new(), sink, FileMode::Overwrite);
    harness.start_stream(3);
    assert_eq!(harness.outcomes(), vec![QueryFileOutcome::FileOpenFailed]);
    assert_eq!(harness.composite.state(), QueryFileState::Standby);
}

#[test]
fn test_append_with_different_header_refused() {
    let sink = MemorySink::with_existing(b"OLD!\nrow\n");
    let mut harness = Harness::new(FileRecorder::new(), sink, FileMode::Append);
    harness.start_stream(3);

    assert_eq!(harness.outcomes(), vec![QueryFileOutcome::CannotAppend]);
    let warnings = harness.client.warnings.borrow();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].existing_header, b"OLD!");
    assert_eq!(warnings[0].new_header, b"HDR\n");
    assert!(harness.sink.written().is_empty());
}

#[test]
fn test_append_with_different_header_tolerated() {
    let sink = MemorySink::with_existing(b"OLD!\nrow\n");
    let mut harness = Harness::new(FileRecorder::tolerating_append(), sink, FileMode::Append);
    let advise = harness.start_stream(1);
    harness.records(&advise, 1, &["new\n"]);
    harness.query_status(3, 1, 1);

    assert_eq!(harness.outcomes(), vec![QueryFileOutcome::Success]);
    assert_eq!(harness.sink.written(), b"new\nFTR\n", "no second header");
}

#[test]
fn test_append_with_matching_header_writes_no_header() {
    let sink = MemorySink::with_existing(b"HDR\nold\n");
    let mut harness = Harness::new(FileRecorder::new(), sink, FileMode::Append);
    let advise = harness.start_stream(1);
    harness.records(&advise, 1, &["new\n"]);
    harness.query_status(3, 1, 1);

    assert!(harness.client.warnings.borrow().is_empty());
    assert_eq!(harness.outcomes(), vec![QueryFileOutcome::Success]);
    assert_eq!(harness.sink.written(), b"new\nFTR\n");
}

#[test]
fn test_write_failure() {
    let mut harness = Harness::new(FileRecorder::new(), MemorySink::new(), FileMode::Overwrite);
    let advise = harness.start_stream(2);
    harness.sink.fail_write();
    harness.records(&advise, 1, &["r1\n"]);
    assert_eq!(harness.outcomes(), vec![QueryFileOutcome::FileIoFailed]);
}

#[test]
fn test_deleted_temporary_table_interrupts_query() {
    let mut harness = Harness::new(FileRecorder::new(), MemorySink::new(), FileMode::Overwrite);
    let advise = harness.start_stream(5);
    harness
        .server
        .reply(respond(&advise, formatted_advise::STOPPED_NOT, |body| {
            body.add_u4(2);
        }));

    assert_eq!(harness.outcomes(), vec![QueryFileOutcome::QueryInterrupted]);
    assert!(harness.sink.is_closed());
    // Both halves are torn down; later query traffic goes nowhere
    harness.query_status(3, 5, 5);
    assert_eq!(harness.outcomes().len(), 1);
}

#[test]
fn test_query_failure_reported_once() {
    let client = FileRecorder::new();
    let mut server = MockServer::connected(CURRENT);
    let composite = LoggerQueryFile::new(&server.router);
    composite.set_station_name("CR1000").unwrap();
    composite.set_table_name("Missing").unwrap();
    composite.set_output("missing.dat", FileMode::Overwrite).unwrap();
    composite.set_sink(Box::new(MemorySink::new())).unwrap();
    let weak = Rc::downgrade(&client) as Weak<dyn QueryFileClient>;
    composite.start(weak).unwrap();
    server.pump();

    let command = server.expect_one(logger_query::START_CMD);
    server.reply(respond(&command, logger_query::START_ACK, |body| {
        body.add_u4(3);
    }));
    assert_eq!(*client.outcomes.borrow(), vec![QueryFileOutcome::InvalidTableName]);
    assert_eq!(composite.state(), QueryFileState::Standby);
}

#[test]
fn test_configuration_gated_and_validated() {
    let server = MockServer::connected(CURRENT);
    let client = FileRecorder::new();
    let composite = LoggerQueryFile::new(&server.router);
    composite.set_station_name("CR1000").unwrap();
    composite.set_table_name("Hourly").unwrap();

    let weak = Rc::downgrade(&client) as Weak<dyn QueryFileClient>;
    assert!(matches!(
        composite.start(weak),
        Err(CoraError::InvalidArgument { .. })
    ));

    composite.set_output("out.dat", FileMode::Overwrite).unwrap();
    composite.set_sink(Box::new(MemorySink::new())).unwrap();
    let weak = Rc::downgrade(&client) as Weak<dyn QueryFileClient>;
    composite.start(weak).unwrap();
    assert!(matches!(
        composite.set_table_name("Other"),
        Err(CoraError::InvalidState { .. })
    ));
    assert!(composite.set_sink(Box::new(MemorySink::new())).is_err());

    composite.finish();
    composite.finish();
    assert_eq!(composite.state(), QueryFileState::Standby);
}

// ----------------------------------------------------------------------------
// Cycle isolation
// ----------------------------------------------------------------------------

/// What the client does from inside its own callbacks
#[derive(Clone, Copy)]
enum Reentry {
    /// `finish()` then `start()` on the first status with records collected
    RestartOnProgress,
    /// `finish()` from the append warning, then tolerate the append
    FinishOnAppendWarning,
}

struct ReentrantClient {
    me: Weak<ReentrantClient>,
    composite: RefCell<Weak<LoggerQueryFile>>,
    reentry: Reentry,
    reentered: Cell<bool>,
    outcomes: RefCell<Vec<QueryFileOutcome>>,
}

impl ReentrantClient {
    fn new(reentry: Reentry) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            composite: RefCell::new(Weak::new()),
            reentry,
            reentered: Cell::new(false),
            outcomes: RefCell::new(Vec::new()),
        })
    }

    fn start(&self, composite: &Rc<LoggerQueryFile>) {
        *self.composite.borrow_mut() = Rc::downgrade(composite);
        let weak = self.me.clone() as Weak<dyn QueryFileClient>;
        composite.start(weak).unwrap();
    }
}

impl QueryFileClient for ReentrantClient {
    fn on_status(&self, query: &LoggerQueryFile, _records_expected: u32, records_collected: u32) {
        if matches!(self.reentry, Reentry::RestartOnProgress)
            && records_collected > 0
            && !self.reentered.replace(true)
        {
            query.finish();
            if let Some(composite) = self.composite.borrow().upgrade() {
                let weak = self.me.clone() as Weak<dyn QueryFileClient>;
                composite.start(weak).unwrap();
            }
        }
    }

    fn on_append_warnings(&self, query: &LoggerQueryFile, _warning: &AppendWarning) -> bool {
        if matches!(self.reentry, Reentry::FinishOnAppendWarning) {
            self.reentered.set(true);
            query.finish();
        }
        true
    }

    fn on_complete(&self, _query: &LoggerQueryFile, outcome: QueryFileOutcome) {
        self.outcomes.borrow_mut().push(outcome);
    }
}

fn reentrant_composite(server: &MockServer, sink: &MemorySink, file_mode: FileMode) -> Rc<LoggerQueryFile> {
    let composite = LoggerQueryFile::new(&server.router);
    composite.set_station_name("CR1000").unwrap();
    composite.set_table_name("Hourly").unwrap();
    composite.set_output("hourly.dat", file_mode).unwrap();
    composite.set_sink(Box::new(sink.clone())).unwrap();
    composite
}

/// Acknowledge a query command and report its temporary table
fn ack_query(server: &mut MockServer, command: &Message, expected: u32) -> Message {
    server.reply(respond(command, logger_query::START_ACK, |body| {
        body.add_u4(1).add_string("__tmp_hourly");
    }));
    server.reply(respond(command, logger_query::STATUS_NOT, |body| {
        query_status(body, 1, "__tmp_hourly", expected, 0);
    }));
    let advise = server.expect_one(formatted_advise::START_CMD);
    server.reply(respond(&advise, formatted_advise::START_ACK, |body| {
        body.add_u4(1).add_bytes(b"HDR\n").add_bytes(b"FTR\n");
    }));
    advise
}

#[test]
fn test_restart_from_status_callback_leaves_new_cycle_intact() {
    let mut server = MockServer::connected(CURRENT);
    let sink = MemorySink::new();
    let composite = reentrant_composite(&server, &sink, FileMode::Overwrite);
    let client = ReentrantClient::new(Reentry::RestartOnProgress);
    client.start(&composite);
    server.pump();

    let first_query = server.expect_one(logger_query::START_CMD);
    let first_advise = ack_query(&mut server, &first_query, 4);
    server.reply(respond(&first_advise, formatted_advise::RECORDS_NOT, |body| {
        formatted_records(body, 1, &["r1\n", "r2\n"]);
    }));

    // The batch that triggered the restart is neither continued nor failed
    assert!(client.reentered.get());
    assert!(client.outcomes.borrow().is_empty());
    assert_eq!(composite.state(), QueryFileState::QueryStarted);
    let sent = server.sent();
    assert!(!sent
        .iter()
        .any(|m| m.message_type == formatted_advise::CONTINUE_CMD));
    let second_query = sent
        .into_iter()
        .find(|m| m.message_type == logger_query::START_CMD)
        .expect("restarted cycle sends a new query");

    // Leftover traffic for the old cycle goes nowhere
    server.reply(respond(&first_advise, formatted_advise::RECORDS_NOT, |body| {
        formatted_records(body, 3, &["stale\n"]);
    }));
    assert!(client.outcomes.borrow().is_empty());

    let second_advise = ack_query(&mut server, &second_query, 1);
    server.reply(respond(&second_advise, formatted_advise::RECORDS_NOT, |body| {
        formatted_records(body, 1, &["r9\n"]);
    }));
    server.reply(respond(&second_query, logger_query::STATUS_NOT, |body| {
        query_status(body, 3, "__tmp_hourly", 1, 1);
    }));

    assert_eq!(*client.outcomes.borrow(), vec![QueryFileOutcome::Success]);
    assert_eq!(sink.written(), b"HDR\nr1\nr2\nHDR\nr9\nFTR\n");
    assert_eq!(composite.state(), QueryFileState::Standby);
}

#[test]
fn test_finish_from_append_warning_stops_the_cycle() {
    let mut server = MockServer::connected(CURRENT);
    let sink = MemorySink::with_existing(b"OLD!\nrow\n");
    let composite = reentrant_composite(&server, &sink, FileMode::Append);
    let client = ReentrantClient::new(Reentry::FinishOnAppendWarning);
    client.start(&composite);
    server.pump();

    let query = server.expect_one(logger_query::START_CMD);
    let advise = ack_query(&mut server, &query, 2);

    assert!(client.reentered.get());
    assert!(client.outcomes.borrow().is_empty());
    assert_eq!(composite.state(), QueryFileState::Standby);
    assert!(sink.written().is_empty(), "nothing written after finish");
    assert!(sink.is_closed());

    server.reply(respond(&advise, formatted_advise::RECORDS_NOT, |body| {
        formatted_records(body, 1, &["r1\n"]);
    }));
    server.reply(respond(&query, logger_query::STATUS_NOT, |body| {
        query_status(body, 3, "__tmp_hourly", 2, 2);
    }));
    assert!(client.outcomes.borrow().is_empty());
    assert!(sink.written().is_empty());
}
