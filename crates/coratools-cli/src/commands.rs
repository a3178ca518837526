//! Command handlers for the cora CLI

use std::cell::Cell;
use std::io::Write;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use coratools_core::component::{
    AdvisorClient, AppendWarning, FormatOption, FormattedDataAdvisor, LogAdvisor, LogAdvisorClient,
    LoggerQueryFile, QueryFileClient, QueryMode, StartOption,
};
use coratools_core::sink::FileMode;
use coratools_core::{AdvisorFailure, LogAdvisorFailure, QueryFileOutcome};

use crate::app::CoraApp;
use crate::cli::{Cli, Commands, FormatArg, OrderArg};
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        if let Commands::Config { example } = cli.command {
            return Self::handle_config_command(&config, example);
        }

        let mut app = CoraApp::new(config)?;
        app.connect().await?;
        let json = cli.json;
        let result = match cli.command {
            Commands::QueryFile {
                station,
                table,
                output,
                append,
                force_append,
                backfill_secs,
                records,
                format,
            } => {
                let request = QueryFileRequest {
                    station,
                    table,
                    output,
                    file_mode: if append { FileMode::Append } else { FileMode::Overwrite },
                    force_append,
                    mode: query_mode(backfill_secs, records.as_deref())?,
                    format: resolve_format(format, app.config()),
                };
                Self::handle_query_file_command(&app, request, json).await
            }
            Commands::Advise {
                station,
                table,
                backfill,
                batches,
                max_per_batch,
                order,
                format,
            } => {
                let request = AdviseRequest {
                    station,
                    table,
                    backfill,
                    batches,
                    max_per_batch,
                    order,
                    format: resolve_format(format, app.config()),
                };
                Self::handle_advise_command(&app, request, json).await
            }
            Commands::Log {
                log_id,
                backfill,
                batches,
            } => Self::handle_log_command(&app, log_id, backfill, batches, json).await,
            Commands::Config { .. } => Ok(()),
        };
        app.stop();
        result
    }

    fn handle_config_command(config: &AppConfig, example: bool) -> Result<()> {
        if example {
            print!("{}", AppConfig::example_config());
        } else {
            print!("{}", config.to_toml()?);
        }
        Ok(())
    }

    /// Handle the query-file command
    async fn handle_query_file_command(app: &CoraApp, request: QueryFileRequest, json: bool) -> Result<()> {
        let composite = LoggerQueryFile::new(app.runtime().router());
        composite.set_station_name(&request.station)?;
        composite.set_table_name(&request.table)?;
        composite.set_query_mode(request.mode)?;
        composite.set_format_option(request.format)?;
        composite.set_output(&request.output, request.file_mode)?;

        let client = Rc::new(FileProgress {
            force_append: request.force_append,
            outcome: Cell::new(None),
        });
        let weak = Rc::downgrade(&client) as Weak<dyn QueryFileClient>;
        composite.start(weak)?;

        let completed = app.run_until(|| client.outcome.get().is_some()).await?;
        let records = composite.records_collected();
        composite.finish();
        if !completed {
            return Ok(());
        }

        let outcome = client.outcome.get().unwrap_or(QueryFileOutcome::Unknown);
        if json {
            let summary = serde_json::json!({
                "outcome": outcome,
                "records": records,
                "path": request.output,
            });
            println!("{}", serde_json::to_string(&summary)?);
        }
        if outcome != QueryFileOutcome::Success {
            return Err(CliError::transaction("query-file", outcome));
        }
        info!("Wrote {} records to {}", records, request.output.display());
        Ok(())
    }

    /// Handle the advise command
    async fn handle_advise_command(app: &CoraApp, request: AdviseRequest, json: bool) -> Result<()> {
        let advisor = FormattedDataAdvisor::new(app.runtime().router());
        advisor.set_station_name(&request.station)?;
        advisor.set_table_name(&request.table)?;
        advisor.set_start_option(if request.backfill == 0 {
            StartOption::AfterNewest
        } else {
            StartOption::RelativeToNewest(request.backfill)
        })?;
        advisor.set_order_option(request.order.into())?;
        advisor.set_format_option(request.format)?;
        if request.max_per_batch > 0 {
            advisor.set_max_records_per_batch(request.max_per_batch)?;
        }

        let client = Rc::new(StreamPrinter::new(request.batches));
        let weak = Rc::downgrade(&client) as Weak<dyn AdvisorClient>;
        advisor.start(weak)?;
        app.run_until(|| client.done.get()).await?;
        advisor.finish();

        let failure = client.failure.get();
        if json {
            let summary = serde_json::json!({
                "failure": failure,
                "batches": client.batches.get(),
                "records": client.records.get(),
            });
            println!("{}", serde_json::to_string(&summary)?);
        }
        match failure {
            Some(failure) => Err(CliError::transaction("advise", failure)),
            None => Ok(()),
        }
    }

    /// Handle the log command
    async fn handle_log_command(
        app: &CoraApp,
        log_id: u32,
        backfill: u32,
        batches: Option<usize>,
        json: bool,
    ) -> Result<()> {
        let advisor = LogAdvisor::new(app.runtime().router());
        advisor.set_log_id(log_id)?;
        advisor.set_backfill_count(backfill)?;

        let client = Rc::new(LogPrinter {
            limit: batches,
            batches: Cell::new(0),
            done: Cell::new(false),
            failure: Cell::new(None),
        });
        let weak = Rc::downgrade(&client) as Weak<dyn LogAdvisorClient>;
        advisor.start(weak)?;
        app.run_until(|| client.done.get()).await?;
        advisor.finish();

        let failure = client.failure.get();
        if json {
            let summary = serde_json::json!({
                "failure": failure,
                "batches": client.batches.get(),
            });
            println!("{}", serde_json::to_string(&summary)?);
        }
        match failure {
            Some(failure) => Err(CliError::transaction("log", failure)),
            None => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

struct QueryFileRequest {
    station: String,
    table: String,
    output: PathBuf,
    file_mode: FileMode,
    force_append: bool,
    mode: QueryMode,
    format: FormatOption,
}

struct AdviseRequest {
    station: String,
    table: String,
    backfill: u32,
    batches: Option<usize>,
    max_per_batch: u32,
    order: OrderArg,
    format: FormatOption,
}

fn resolve_format(arg: Option<FormatArg>, config: &AppConfig) -> FormatOption {
    arg.map(FormatOption::from)
        .unwrap_or(config.cli.default_format)
}

/// Query mode from the command-line selectors; everything when neither is given
pub fn query_mode(backfill_secs: Option<u64>, records: Option<&str>) -> Result<QueryMode> {
    if let Some(secs) = backfill_secs {
        return Ok(QueryMode::Backfill {
            interval: Duration::from_secs(secs),
        });
    }
    let Some(range) = records else {
        return Ok(QueryMode::All);
    };
    let invalid = || CliError::InvalidArgument(format!("record range `{range}` is not BEGIN..END"));
    let (begin, end) = range.split_once("..").ok_or_else(invalid)?;
    let begin: u32 = begin.trim().parse().map_err(|_| invalid())?;
    let end: u32 = end.trim().parse().map_err(|_| invalid())?;
    if begin > end {
        return Err(invalid());
    }
    Ok(QueryMode::RecordNumberRange { begin, end })
}

fn write_stdout(bytes: &[u8]) -> bool {
    let mut out = std::io::stdout().lock();
    match out.write_all(bytes).and_then(|()| out.flush()) {
        Ok(()) => true,
        Err(err) => {
            warn!("Cannot write to standard output: {}", err);
            false
        }
    }
}

// ----------------------------------------------------------------------------
// Clients
// ----------------------------------------------------------------------------

struct FileProgress {
    force_append: bool,
    outcome: Cell<Option<QueryFileOutcome>>,
}

impl QueryFileClient for FileProgress {
    fn on_status(&self, _query: &LoggerQueryFile, records_expected: u32, records_collected: u32) {
        info!("{}/{} records", records_collected, records_expected);
    }

    fn on_append_warnings(&self, _query: &LoggerQueryFile, warning: &AppendWarning) -> bool {
        warn!(
            "Header of {} differs from the table header{}",
            warning.path.display(),
            if self.force_append { "; appending anyway" } else { "" }
        );
        self.force_append
    }

    fn on_complete(&self, _query: &LoggerQueryFile, outcome: QueryFileOutcome) {
        debug!(?outcome, "Query to file complete");
        self.outcome.set(Some(outcome));
    }
}

/// Writes advised records to standard output
struct StreamPrinter {
    limit: Option<usize>,
    batches: Cell<usize>,
    records: Cell<usize>,
    done: Cell<bool>,
    failure: Cell<Option<AdvisorFailure>>,
    header_written: Cell<bool>,
}

impl StreamPrinter {
    fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            batches: Cell::new(0),
            records: Cell::new(0),
            done: Cell::new(false),
            failure: Cell::new(None),
            header_written: Cell::new(false),
        }
    }
}

impl AdvisorClient for StreamPrinter {
    fn on_started(&self, _advisor: &FormattedDataAdvisor, header: &[u8], _footer: &[u8]) {
        if !self.header_written.replace(true) && !write_stdout(header) {
            self.done.set(true);
        }
    }

    fn on_records(&self, advisor: &FormattedDataAdvisor) {
        let records = advisor.records();
        for record in &records {
            if !write_stdout(&record.formatted) {
                self.done.set(true);
                return;
            }
        }
        self.records.set(self.records.get() + records.len());
        self.batches.set(self.batches.get() + 1);

        if self.limit.is_some_and(|limit| self.batches.get() >= limit) {
            self.done.set(true);
            return;
        }
        if let Err(err) = advisor.continue_advise() {
            warn!("Cannot continue advise: {}", err);
            self.done.set(true);
        }
    }

    fn on_failure(&self, _advisor: &FormattedDataAdvisor, failure: AdvisorFailure) {
        self.failure.set(Some(failure));
        self.done.set(true);
    }
}

struct LogPrinter {
    limit: Option<usize>,
    batches: Cell<usize>,
    done: Cell<bool>,
    failure: Cell<Option<LogAdvisorFailure>>,
}

impl LogAdvisorClient for LogPrinter {
    fn on_records(&self, advisor: &LogAdvisor) {
        for record in advisor.unread_records() {
            if !write_stdout(format!("{}  {}\n", record.stamp, record.text).as_bytes()) {
                self.done.set(true);
                return;
            }
        }
        self.batches.set(self.batches.get() + 1);

        if self.limit.is_some_and(|limit| self.batches.get() >= limit) {
            self.done.set(true);
            return;
        }
        if let Err(err) = advisor.get_next_batch() {
            warn!("Cannot request the next log batch: {}", err);
            self.done.set(true);
        }
    }

    fn on_failure(&self, _advisor: &LogAdvisor, failure: LogAdvisorFailure) {
        self.failure.set(Some(failure));
        self.done.set(true);
    }
}
