//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use coratools_core::component::{FormatOption, OrderOption};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Server address (host:port), overriding the configuration file
    #[arg(short, long, global = true)]
    pub server: Option<String>,

    /// Logon name, overriding the configuration file
    #[arg(long, global = true)]
    pub logon: Option<String>,

    /// Logon password, overriding the configuration file
    #[arg(long, global = true)]
    pub password: Option<String>,

    /// Print the final outcome as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Query a table and write the results to a file
    QueryFile {
        /// Station name
        station: String,
        /// Table name
        table: String,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Append to an existing file instead of overwriting it
        #[arg(short, long)]
        append: bool,
        /// Append even if the existing file has a different header
        #[arg(long, requires = "append")]
        force_append: bool,
        /// Collect records newer than this many seconds ago
        #[arg(long, conflicts_with = "records")]
        backfill_secs: Option<u64>,
        /// Collect a record number range, e.g. `100..200`
        #[arg(long)]
        records: Option<String>,
        /// Output format
        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,
    },
    /// Stream new records from a table to standard output
    Advise {
        /// Station name
        station: String,
        /// Table name
        table: String,
        /// Start this many records back from the newest
        #[arg(short, long, default_value_t = 0)]
        backfill: u32,
        /// Stop after this many batches
        #[arg(short = 'n', long)]
        batches: Option<usize>,
        /// Largest batch the server may send (0 = server default)
        #[arg(long, default_value_t = 0)]
        max_per_batch: u32,
        /// Record order
        #[arg(long, value_enum, default_value_t = OrderArg::Collected)]
        order: OrderArg,
        /// Output format
        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,
    },
    /// Stream server log messages to standard output
    Log {
        /// Server log identifier
        #[arg(default_value_t = 1)]
        log_id: u32,
        /// Older messages to send first
        #[arg(short, long, default_value_t = 0)]
        backfill: u32,
        /// Stop after this many batches
        #[arg(short = 'n', long)]
        batches: Option<usize>,
    },
    /// Print the effective configuration
    Config {
        /// Print an example configuration instead
        #[arg(long)]
        example: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Toa5,
    Tob1,
    Xml,
    Json,
    Csv,
}

impl From<FormatArg> for FormatOption {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Toa5 => FormatOption::Toa5,
            FormatArg::Tob1 => FormatOption::Tob1,
            FormatArg::Xml => FormatOption::CsiXml,
            FormatArg::Json => FormatOption::CsiJson,
            FormatArg::Csv => FormatOption::Csv,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OrderArg {
    Collected,
    LoggedWithHoles,
    LoggedWithoutHoles,
    RealTime,
}

impl From<OrderArg> for OrderOption {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::Collected => OrderOption::Collected,
            OrderArg::LoggedWithHoles => OrderOption::LoggedWithHoles,
            OrderArg::LoggedWithoutHoles => OrderOption::LoggedWithoutHoles,
            OrderArg::RealTime => OrderOption::RealTime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_file() {
        let cli = Cli::try_parse_from([
            "cora", "query-file", "CR1000", "Hourly", "-o", "hourly.dat", "--append",
            "--backfill-secs", "3600", "--server", "10.0.0.2:6789",
        ])
        .unwrap();
        assert_eq!(cli.server.as_deref(), Some("10.0.0.2:6789"));
        match cli.command {
            Commands::QueryFile {
                station,
                append,
                backfill_secs,
                ..
            } => {
                assert_eq!(station, "CR1000");
                assert!(append);
                assert_eq!(backfill_secs, Some(3600));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_force_append_requires_append() {
        assert!(Cli::try_parse_from([
            "cora", "query-file", "CR1000", "Hourly", "-o", "out.dat", "--force-append",
        ])
        .is_err());
    }

    #[test]
    fn test_log_defaults() {
        let cli = Cli::try_parse_from(["cora", "log", "-n", "3"]).unwrap();
        match cli.command {
            Commands::Log {
                log_id,
                backfill,
                batches,
            } => {
                assert_eq!(log_id, 1);
                assert_eq!(backfill, 0);
                assert_eq!(batches, Some(3));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
