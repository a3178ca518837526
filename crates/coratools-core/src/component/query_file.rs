//! Query-to-file composite
//!
//! [`LoggerQueryFile`] runs a [`LoggerQuery`] that materializes a temporary
//! table on the server, then streams that table through a
//! [`FormattedDataAdvisor`] into an [`OutputSink`].
//!
//! The advisor starts lazily on the first status naming the temporary table.
//! Overall success needs both the query's "all data collected" and a
//! collected record count that has caught up with the expected count; if the
//! query finishes first, completion waits for the advisor to drain. A failure
//! on either side tears down both.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use crate::component::formatted_advisor::{
    AdvisorClient, FormatOption, FormattedDataAdvisor, OrderOption, StartOption,
};
use crate::component::logger_query::{
    LoggerQuery, LoggerQueryClient, QueryMode, QueryStatus, QueryStatusCode,
};
use crate::dispatch::{ClientRef, ClientToken, TokenSource};
use crate::errors::{CoraError, Result};
use crate::failure::{AdvisorFailure, QueryFileOutcome, QueryOutcome};
use crate::router::Router;
use crate::sink::{FileMode, FileSink, OutputSink};

const NAME: &str = "logger_query_file";

// ----------------------------------------------------------------------------
// Client Interface
// ----------------------------------------------------------------------------

/// Raised when appending to a file whose header differs from the new one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendWarning {
    pub path: PathBuf,
    pub existing_header: Vec<u8>,
    pub new_header: Vec<u8>,
}

pub trait QueryFileClient {
    fn on_status(&self, _query: &LoggerQueryFile, _records_expected: u32, _records_collected: u32) {}

    /// Decide synchronously whether a header mismatch is tolerated
    fn on_append_warnings(&self, _query: &LoggerQueryFile, _warning: &AppendWarning) -> bool {
        false
    }

    /// Exactly once per start; the composite is back in `Standby`
    fn on_complete(&self, query: &LoggerQueryFile, outcome: QueryFileOutcome);
}

// ----------------------------------------------------------------------------
// Component
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFileState {
    Standby,
    QueryStarted,
    /// The query reported all data collected; waiting for the stream to drain
    QueryComplete,
}

impl QueryFileState {
    pub fn name(&self) -> &'static str {
        match self {
            QueryFileState::Standby => "Standby",
            QueryFileState::QueryStarted => "QueryStarted",
            QueryFileState::QueryComplete => "QueryComplete",
        }
    }
}

#[derive(Debug, Clone)]
struct FileOptions {
    station_name: String,
    table_name: String,
    mode: QueryMode,
    format: FormatOption,
    output_path: PathBuf,
    file_mode: FileMode,
}

struct FileRun {
    state: QueryFileState,
    client: Option<ClientRef<dyn QueryFileClient>>,
    advisor_started: bool,
    sink_open: bool,
    records_expected: u32,
    records_collected: u32,
    footer: Vec<u8>,
}

impl FileRun {
    fn idle() -> Self {
        Self {
            state: QueryFileState::Standby,
            client: None,
            advisor_started: false,
            sink_open: false,
            records_expected: 0,
            records_collected: 0,
            footer: Vec::new(),
        }
    }
}

pub struct LoggerQueryFile {
    weak_self: Weak<LoggerQueryFile>,
    query: Rc<LoggerQuery>,
    advisor: Rc<FormattedDataAdvisor>,
    tokens: TokenSource,
    options: RefCell<FileOptions>,
    sink: RefCell<Box<dyn OutputSink>>,
    run: RefCell<FileRun>,
}

impl LoggerQueryFile {
    pub fn new(router: &Rc<Router>) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            query: LoggerQuery::new(router),
            advisor: FormattedDataAdvisor::new(router),
            tokens: TokenSource::new(),
            options: RefCell::new(FileOptions {
                station_name: String::new(),
                table_name: String::new(),
                mode: QueryMode::All,
                format: FormatOption::Toa5,
                output_path: PathBuf::new(),
                file_mode: FileMode::Overwrite,
            }),
            sink: RefCell::new(Box::new(FileSink::new())),
            run: RefCell::new(FileRun::idle()),
        })
    }

    pub fn state(&self) -> QueryFileState {
        self.run.borrow().state
    }

    pub fn records_expected(&self) -> u32 {
        self.run.borrow().records_expected
    }

    pub fn records_collected(&self) -> u32 {
        self.run.borrow().records_collected
    }

    /// The underlying query, e.g. to install a time source
    pub fn query(&self) -> &Rc<LoggerQuery> {
        &self.query
    }

    pub fn advisor(&self) -> &Rc<FormattedDataAdvisor> {
        &self.advisor
    }

    // ------------------------------------------------------------------------
    // Configuration (Standby only)
    // ------------------------------------------------------------------------

    fn configure(&self, operation: &'static str, update: impl FnOnce(&mut FileOptions)) -> Result<()> {
        let state = self.state();
        if state != QueryFileState::Standby {
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
        self.configure("set_query_mode", |o| o.mode = mode)
    }

    pub fn set_format_option(&self, format: FormatOption) -> Result<()> {
        self.configure("set_format_option", |o| o.format = format)
    }

    pub fn set_output(&self, path: impl Into<PathBuf>, file_mode: FileMode) -> Result<()> {
        let path = path.into();
        self.configure("set_output", |o| {
            o.output_path = path;
            o.file_mode = file_mode;
        })
    }

    pub fn set_sink(&self, sink: Box<dyn OutputSink>) -> Result<()> {
        let state = self.state();
        if state != QueryFileState::Standby {
            return Err(CoraError::invalid_state("set_sink", state.name()));
        }
        *self.sink.borrow_mut() = sink;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transaction control
    // ------------------------------------------------------------------------

    pub fn start(&self, client: Weak<dyn QueryFileClient>) -> Result<()> {
        let state = self.state();
        if state != QueryFileState::Standby {
            return Err(CoraError::invalid_state("start", state.name()));
        }
        let client = ClientRef::bind(client, self.tokens.next_token())?;
        let options = self.options.borrow().clone();
        if options.output_path.as_os_str().is_empty() {
            return Err(CoraError::invalid_argument("output path is not set"));
        }

        self.query.set_station_name(options.station_name)?;
        self.query.set_table_name(options.table_name)?;
        self.query.set_query_mode(options.mode)?;
        let me: Weak<dyn LoggerQueryClient> = self.weak_self.clone();
        self.query.start(me)?;

        let mut run = self.run.borrow_mut();
        *run = FileRun::idle();
        run.client = Some(client);
        run.state = QueryFileState::QueryStarted;
        info!(component = NAME, path = %options.output_path.display(), "Query to file started");
        Ok(())
    }

    /// Tear down both sub-components and release the sink; never fails
    pub fn finish(&self) {
        let sink_open = {
            let mut run = self.run.borrow_mut();
            let sink_open = run.sink_open;
            *run = FileRun::idle();
            sink_open
        };
        self.query.finish();
        self.advisor.finish();
        if sink_open {
            if let Err(err) = self.sink.borrow_mut().close() {
                debug!(component = NAME, error = %err, "Sink close failed during teardown");
            }
        }
    }

    /// Token of the running cycle, `None` in Standby
    fn cycle_token(&self) -> Option<ClientToken> {
        self.run.borrow().client.as_ref().map(ClientRef::token)
    }

    /// True while the cycle that captured `token` is still running
    ///
    /// A client callback may finish or restart the composite; work left over
    /// from the old cycle must not touch the new one.
    fn still_running(&self, token: ClientToken) -> bool {
        self.cycle_token() == Some(token)
    }

    /// Live client, or teardown if it has gone away
    fn current_client(&self) -> Option<Rc<dyn QueryFileClient>> {
        let client = self.run.borrow().client.as_ref().map(ClientRef::upgrade);
        match client {
            Some(Some(client)) => Some(client),
            Some(None) => {
                debug!(component = NAME, "Client dropped, tearing down");
                self.finish();
                None
            }
            None => None,
        }
    }

    /// Deliver the single terminal outcome
    fn complete(&self, outcome: QueryFileOutcome) {
        let client = self.run.borrow_mut().client.take();
        self.finish();
        debug!(component = NAME, ?outcome, "Query to file complete");
        if let Some(client) = client.and_then(|client| client.upgrade()) {
            client.on_complete(self, outcome);
        }
    }

    fn notify_status(&self) {
        let (expected, collected) = {
            let run = self.run.borrow();
            (run.records_expected, run.records_collected)
        };
        if let Some(client) = self.current_client() {
            client.on_status(self, expected, collected);
        }
    }

    fn start_advisor(&self, temp_table_name: &str) -> Result<()> {
        let (station_name, format) = {
            let options = self.options.borrow();
            (options.station_name.clone(), options.format)
        };
        self.advisor.set_station_name(station_name)?;
        self.advisor.set_table_name(temp_table_name)?;
        self.advisor.set_start_option(StartOption::AtRecord {
            file_mark_no: 0,
            record_no: 0,
        })?;
        self.advisor.set_order_option(OrderOption::Collected)?;
        self.advisor.set_format_option(format)?;
        let me: Weak<dyn AdvisorClient> = self.weak_self.clone();
        self.advisor.start(me)?;
        debug!(component = NAME, temp_table = temp_table_name, "Advisor started on temporary table");
        Ok(())
    }

    /// Succeed if the query is done and the stream has caught up
    fn check_complete(&self) -> bool {
        let (ready, sink_open, footer) = {
            let run = self.run.borrow();
            // A stream that overshoots the last reported count has still caught up
            let ready = run.state == QueryFileState::QueryComplete
                && run.records_collected >= run.records_expected;
            (ready, run.sink_open, run.footer.clone())
        };
        if !ready {
            return false;
        }

        if sink_open {
            self.run.borrow_mut().sink_open = false;
            let result = {
                let mut sink = self.sink.borrow_mut();
                sink.write(&footer).and_then(|_| sink.close())
            };
            if let Err(err) = result {
                warn!(component = NAME, error = %err, "Footer write failed");
                self.complete(QueryFileOutcome::FileIoFailed);
                return true;
            }
        }
        self.complete(QueryFileOutcome::Success);
        true
    }
}

// ----------------------------------------------------------------------------
// Query callbacks
// ----------------------------------------------------------------------------

impl LoggerQueryClient for LoggerQueryFile {
    fn on_status(&self, _query: &LoggerQuery, status: &QueryStatus) {
        let Some(token) = self.cycle_token() else {
            return;
        };
        let (start_advisor, all_collected) = {
            let mut run = self.run.borrow_mut();
            if run.state == QueryFileState::Standby {
                return;
            }
            run.records_expected = status.records_expected;
            let start_advisor = !run.advisor_started && !status.temp_table_name.is_empty();
            if start_advisor {
                run.advisor_started = true;
            }
            let all_collected = status.status == QueryStatusCode::AllDataCollected;
            if all_collected {
                run.state = QueryFileState::QueryComplete;
            }
            (start_advisor, all_collected)
        };

        if start_advisor {
            if let Err(err) = self.start_advisor(&status.temp_table_name) {
                warn!(component = NAME, error = %err, "Advisor could not be started");
                self.complete(QueryFileOutcome::Unknown);
                return;
            }
        }
        self.notify_status();
        if all_collected && self.still_running(token) {
            self.check_complete();
        }
    }

    fn on_complete(&self, _query: &LoggerQuery, outcome: QueryOutcome) {
        if self.cycle_token().is_none() {
            return;
        }
        if outcome.is_success() {
            self.run.borrow_mut().state = QueryFileState::QueryComplete;
            self.check_complete();
        } else {
            self.complete(outcome.into());
        }
    }
}

// ----------------------------------------------------------------------------
// Advisor callbacks
// ----------------------------------------------------------------------------

impl AdvisorClient for LoggerQueryFile {
    fn on_started(&self, _advisor: &FormattedDataAdvisor, header: &[u8], footer: &[u8]) {
        let Some(token) = self.cycle_token() else {
            return;
        };
        let (path, file_mode) = {
            let options = self.options.borrow();
            (options.output_path.clone(), options.file_mode)
        };

        let opened = self.sink.borrow_mut().open(&path, file_mode, header.len());
        let opened = match opened {
            Ok(opened) => opened,
            Err(err) => {
                warn!(component = NAME, path = %path.display(), error = %err, "Output open failed");
                self.complete(QueryFileOutcome::FileOpenFailed);
                return;
            }
        };
        {
            let mut run = self.run.borrow_mut();
            run.sink_open = true;
            run.footer = footer.to_vec();
        }

        let write_header = match opened.existing_header {
            None => true,
            Some(existing) if existing == header => false,
            Some(existing) => {
                let warning = AppendWarning {
                    path,
                    existing_header: existing,
                    new_header: header.to_vec(),
                };
                let tolerated = self
                    .current_client()
                    .map(|client| client.on_append_warnings(self, &warning))
                    .unwrap_or(false);
                if !self.still_running(token) {
                    return;
                }
                if !tolerated {
                    self.complete(QueryFileOutcome::CannotAppend);
                    return;
                }
                false
            }
        };

        if write_header {
            if let Err(err) = self.sink.borrow_mut().write(header) {
                warn!(component = NAME, error = %err, "Header write failed");
                self.complete(QueryFileOutcome::FileIoFailed);
            }
        }
    }

    fn on_records(&self, advisor: &FormattedDataAdvisor) {
        let Some(token) = self.cycle_token() else {
            return;
        };
        let records = advisor.records();
        let written = {
            let mut sink = self.sink.borrow_mut();
            records
                .iter()
                .try_for_each(|record| sink.write(&record.formatted))
        };
        if let Err(err) = written {
            warn!(component = NAME, error = %err, "Record write failed");
            self.complete(QueryFileOutcome::FileIoFailed);
            return;
        }

        {
            let mut run = self.run.borrow_mut();
            let count = u32::try_from(records.len()).unwrap_or(u32::MAX);
            run.records_collected = run.records_collected.saturating_add(count);
        }
        self.notify_status();
        if !self.still_running(token) || self.check_complete() {
            return;
        }
        if let Err(err) = advisor.continue_advise() {
            warn!(component = NAME, error = %err, "Continue failed");
            self.complete(QueryFileOutcome::Unknown);
        }
    }

    fn on_failure(&self, _advisor: &FormattedDataAdvisor, failure: AdvisorFailure) {
        if self.cycle_token().is_some() {
            self.complete(failure.into());
        }
    }
}

impl Drop for LoggerQueryFile {
    fn drop(&mut self) {
        if self.run.get_mut().sink_open {
            let _ = self.sink.get_mut().close();
        }
    }
}
