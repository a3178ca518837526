//! Formatted data advisor driven through the router by a scripted server


use std::cell::RefCell;
use std::rc::{Rc, Weak};

use coratools_core::component::{AdvisorClient, AdvisorState, FormatOption, FormattedDataAdvisor};
use coratools_core::protocol::codes::{formatted_advise, CLOSE_SESSION_CMD};
use coratools_core::types::InterfaceVersion;
use coratools_core::{AdvisorFailure, CoraError, SessionFailure};
use test_utils::{formatted_records, respond, AdvisorRecorder, MockServer, CURRENT};

fn started_advisor(server: &mut MockServer, client: &Rc<AdvisorRecorder>) -> (Rc<FormattedDataAdvisor>, coratools_core::Message) {
    let advisor = FormattedDataAdvisor::new(&server.router);
    advisor.set_station_name("CR1000").unwrap();
    advisor.set_table_name("Public").unwrap();
    let weak = Rc::downgrade(client) as Weak<dyn AdvisorClient>;
    advisor.start(weak).unwrap();
    server.pump();
    let command = server.expect_one(formatted_advise::START_CMD);
    server.reply(respond(&command, formatted_advise::START_ACK, |body| {
        body.add_u4(1).add_bytes(b"H").add_bytes(b"F");
    }));
    (advisor, command)
}

#[test]
fn test_start_ack_delivers_header_and_footer() {
    let mut server = MockServer::connected(CURRENT);
    let client = AdvisorRecorder::new();
    let (advisor, _) = started_advisor(&mut server, &client);

    assert_eq!(client.events(), vec!["started H F"]);
    assert_eq!(advisor.state(), AdvisorState::WaitForRecords);
}

#[test]
fn test_refused_start_reports_invalid_table_name() {
    let mut server = MockServer::connected(CURRENT);
    let client = AdvisorRecorder::new();
    let advisor = FormattedDataAdvisor::new(&server.router);
    advisor.set_table_name("Nope").unwrap();
    let weak = Rc::downgrade(&client) as Weak<dyn AdvisorClient>;
    advisor.start(weak).unwrap();
    server.pump();

    let command = server.expect_one(formatted_advise::START_CMD);
    server.reply(respond(&command, formatted_advise::START_ACK, |body| {
        body.add_u4(2);
    }));

    assert_eq!(client.events(), vec!["failure InvalidTableName"]);
    assert_eq!(advisor.state(), AdvisorState::Standby);
}

#[test]
fn test_batch_waits_for_continue() {
    let mut server = MockServer::connected(CURRENT);
    let client = AdvisorRecorder::new();
    let (advisor, command) = started_advisor(&mut server, &client);

    server.reply(respond(&command, formatted_advise::RECORDS_NOT, |body| {
        formatted_records(body, 10, &["a", "b", "c"]);
    }));

    assert_eq!(client.events(), vec!["started H F", "records 3"]);
    let records = advisor.records();
    assert_eq!(
        records.iter().map(|r| r.record_no).collect::<Vec<_>>(),
        vec![10, 11, 12]
    );
    assert_eq!(client.batches.borrow()[0], vec!["a", "b", "c"]);
    assert_eq!(advisor.state(), AdvisorState::WaitForContinue);
    assert!(server.sent().is_empty(), "nothing requested before continue");

    advisor.continue_advise().unwrap();
    let continued = server.expect_one(formatted_advise::CONTINUE_CMD);
    assert_eq!(continued.transaction_no(), command.transaction_no());
    assert_eq!(advisor.state(), AdvisorState::WaitForRecords);
    assert_eq!(advisor.record_count(), 0);

    // No batch pending any more
    assert!(matches!(
        advisor.continue_advise(),
        Err(CoraError::InvalidState { .. })
    ));
}

#[test]
fn test_records_before_continue_is_terminal() {
    let mut server = MockServer::connected(CURRENT);
    let client = AdvisorRecorder::new();
    let (advisor, command) = started_advisor(&mut server, &client);

    for first in [1, 2] {
        server.reply(respond(&command, formatted_advise::RECORDS_NOT, |body| {
            formatted_records(body, first, &["x"]);
        }));
    }

    assert_eq!(client.events(), vec!["started H F", "records 1", "failure Unknown"]);
    assert_eq!(advisor.state(), AdvisorState::Standby);
}

#[test]
fn test_malformed_batch_fails_whole_batch() {
    let mut server = MockServer::connected(CURRENT);
    let client = AdvisorRecorder::new();
    let (advisor, command) = started_advisor(&mut server, &client);

    server.reply(respond(&command, formatted_advise::RECORDS_NOT, |body| {
        body.add_u4(2).add_u4(1).add_u4(1).add_i8(0).add_bytes(b"ok");
    }));

    assert_eq!(client.events(), vec!["started H F", "failure MalformedRecords"]);
    assert_eq!(advisor.record_count(), 0);
}

#[test]
fn test_old_server_fails_without_sending() {
    let mut server = MockServer::connected(InterfaceVersion::new(1, 3, 1, 27));
    let client = AdvisorRecorder::new();
    let advisor = FormattedDataAdvisor::new(&server.router);
    advisor.set_table_name("Public").unwrap();
    let weak = Rc::downgrade(&client) as Weak<dyn AdvisorClient>;
    advisor.start(weak).unwrap();
    server.pump();

    assert_eq!(client.events(), vec!["failure Unsupported"]);
    assert!(server.sent().is_empty());
    assert_eq!(server.router.session_count(), 0);
}

#[test]
fn test_json_requested_as_xml_from_older_server() {
    let mut server = MockServer::connected(InterfaceVersion::new(1, 4, 0, 0));
    let client = AdvisorRecorder::new();
    let advisor = FormattedDataAdvisor::new(&server.router);
    advisor.set_table_name("Public").unwrap();
    advisor.set_format_option(FormatOption::CsiJson).unwrap();
    let weak = Rc::downgrade(&client) as Weak<dyn AdvisorClient>;
    advisor.start(weak).unwrap();
    server.pump();

    let command = server.expect_one(formatted_advise::START_CMD);
    let mut reader = command.reader();
    reader.read_u4().unwrap();
    reader.read_string().unwrap();
    assert_eq!(reader.read_string().unwrap(), "Public");
    assert_eq!(reader.read_u4().unwrap(), 4, "after newest");
    assert_eq!(reader.read_u4().unwrap(), 1, "collected order");
    assert_eq!(reader.read_u4().unwrap(), FormatOption::CsiXml as u32);
    assert_eq!(advisor.format_option(), FormatOption::CsiJson);
}

#[test]
fn test_setters_rejected_outside_standby() {
    let mut server = MockServer::connected(CURRENT);
    let client = AdvisorRecorder::new();
    let (advisor, _) = started_advisor(&mut server, &client);

    assert!(matches!(
        advisor.set_table_name("Other"),
        Err(CoraError::InvalidState { .. })
    ));
    assert!(advisor.set_max_records_per_batch(5).is_err());
    assert!(advisor.set_format_option(FormatOption::Csv).is_err());
    assert_eq!(advisor.table_name(), "Public");
    assert_eq!(advisor.format_option(), FormatOption::Toa5);

    let weak = Rc::downgrade(&client) as Weak<dyn AdvisorClient>;
    assert!(matches!(advisor.start(weak), Err(CoraError::InvalidState { .. })));
}

#[test]
fn test_finish_is_idempotent() {
    let mut server = MockServer::connected(CURRENT);
    let client = AdvisorRecorder::new();
    let (advisor, _) = started_advisor(&mut server, &client);

    advisor.finish();
    server.expect_one(CLOSE_SESSION_CMD);
    advisor.finish();
    assert!(server.sent().is_empty());
    assert_eq!(advisor.state(), AdvisorState::Standby);
    assert!(advisor.set_table_name("Other").is_ok());
}

#[test]
fn test_stop_then_records_yields_single_terminal_callback() {
    let mut server = MockServer::connected(CURRENT);
    let client = AdvisorRecorder::new();
    let (_advisor, command) = started_advisor(&mut server, &client);

    server.post(respond(&command, formatted_advise::STOPPED_NOT, |body| {
        body.add_u4(1);
    }));
    server.post(respond(&command, formatted_advise::RECORDS_NOT, |body| {
        formatted_records(body, 1, &["late"]);
    }));
    server.pump();

    assert_eq!(client.events(), vec!["started H F", "failure StationShutDown"]);
}

#[test]
fn test_dropped_client_finishes_without_callback() {
    let mut server = MockServer::connected(CURRENT);
    let client = AdvisorRecorder::new();
    let advisor = FormattedDataAdvisor::new(&server.router);
    advisor.set_table_name("Public").unwrap();
    let weak = Rc::downgrade(&client) as Weak<dyn AdvisorClient>;
    advisor.start(weak).unwrap();
    server.pump();
    let command = server.expect_one(formatted_advise::START_CMD);

    server.post(respond(&command, formatted_advise::START_ACK, |body| {
        body.add_u4(1).add_bytes(b"").add_bytes(b"");
    }));
    drop(client);
    server.pump();

    assert_eq!(advisor.state(), AdvisorState::Standby);
    server.expect_one(CLOSE_SESSION_CMD);
}

#[test]
fn test_restart_discards_traffic_for_previous_cycle() {
    let mut server = MockServer::connected(CURRENT);
    let first = AdvisorRecorder::new();
    let second = AdvisorRecorder::new();
    let advisor = FormattedDataAdvisor::new(&server.router);
    advisor.set_table_name("Public").unwrap();

    let weak = Rc::downgrade(&first) as Weak<dyn AdvisorClient>;
    advisor.start(weak).unwrap();
    server.pump();
    let old_command = server.expect_one(formatted_advise::START_CMD);
    advisor.finish();

    let weak = Rc::downgrade(&second) as Weak<dyn AdvisorClient>;
    advisor.start(weak).unwrap();
    server.pump();
    let sent = server.sent();
    let new_command = sent
        .iter()
        .find(|m| m.message_type == formatted_advise::START_CMD)
        .cloned()
        .unwrap();
    assert_ne!(old_command.transaction_no(), new_command.transaction_no());

    server.reply(respond(&old_command, formatted_advise::START_ACK, |body| {
        body.add_u4(1).add_bytes(b"old").add_bytes(b"old");
    }));
    assert!(first.events().is_empty());
    assert!(second.events().is_empty());

    server.reply(respond(&new_command, formatted_advise::START_ACK, |body| {
        body.add_u4(1).add_bytes(b"new").add_bytes(b"new");
    }));
    assert_eq!(second.events(), vec!["started new new"]);
}

#[test]
fn test_mismatched_transaction_number_is_ignored() {
    let mut server = MockServer::connected(CURRENT);
    let client = AdvisorRecorder::new();
    let advisor = FormattedDataAdvisor::new(&server.router);
    advisor.set_table_name("Public").unwrap();
    let weak = Rc::downgrade(&client) as Weak<dyn AdvisorClient>;
    advisor.start(weak).unwrap();
    server.pump();
    let command = server.expect_one(formatted_advise::START_CMD);

    let wrong = test_utils::respond_on(
        command.session_no,
        coratools_core::TransactionNo::new(9999),
        formatted_advise::START_ACK,
        |body| {
            body.add_u4(2);
        },
    );
    server.reply(wrong);

    assert!(client.events().is_empty());
    assert_eq!(advisor.state(), AdvisorState::BeforeActive);
}

#[test]
fn test_connection_failures_map_to_advisor_failures() {
    for (failure, expected) in [
        (SessionFailure::InvalidLogon, "failure InvalidLogon"),
        (SessionFailure::SessionBroken, "failure SessionFailed"),
        (SessionFailure::SecurityBlocked, "failure SecurityBlocked"),
    ] {
        let server = MockServer::new();
        let client = AdvisorRecorder::new();
        let advisor = FormattedDataAdvisor::new(&server.router);
        advisor.set_table_name("Public").unwrap();
        let weak = Rc::downgrade(&client) as Weak<dyn AdvisorClient>;
        advisor.start(weak).unwrap();
        server.pump();
        assert!(client.events().is_empty(), "waits for the connection");

        server.fail(failure);
        assert_eq!(client.events(), vec![expected]);
        assert_eq!(advisor.state(), AdvisorState::Standby);
    }
}

/// Restarts the advisor from inside its failure callback
struct Restarter {
    this: Weak<Restarter>,
    failures: RefCell<Vec<AdvisorFailure>>,
    restart_result: RefCell<Option<bool>>,
}

impl AdvisorClient for Restarter {
    fn on_records(&self, _advisor: &FormattedDataAdvisor) {}

    fn on_failure(&self, advisor: &FormattedDataAdvisor, failure: AdvisorFailure) {
        self.failures.borrow_mut().push(failure);
        if self.restart_result.borrow().is_none() {
            let me: Weak<dyn AdvisorClient> = self.this.clone();
            *self.restart_result.borrow_mut() = Some(advisor.start(me).is_ok());
        }
    }
}

#[test]
fn test_failure_callback_may_restart() {
    let mut server = MockServer::connected(CURRENT);
    let client = Rc::new_cyclic(|this| Restarter {
        this: this.clone(),
        failures: RefCell::new(Vec::new()),
        restart_result: RefCell::new(None),
    });
    let advisor = FormattedDataAdvisor::new(&server.router);
    advisor.set_table_name("Public").unwrap();
    let weak = Rc::downgrade(&client) as Weak<dyn AdvisorClient>;
    advisor.start(weak).unwrap();
    server.pump();
    let command = server.expect_one(formatted_advise::START_CMD);

    server.reply(respond(&command, formatted_advise::START_ACK, |body| {
        body.add_u4(6);
    }));

    assert_eq!(*client.failures.borrow(), vec![AdvisorFailure::InsufficientResources]);
    assert_eq!(*client.restart_result.borrow(), Some(true));
    let sent = server.sent();
    assert!(sent.iter().any(|m| m.message_type == formatted_advise::START_CMD));
    assert_eq!(advisor.state(), AdvisorState::BeforeActive);
}
