// crates/elephant-state-cli/src/main.rs
// ============================================================================
// Module: Elephant State CLI Entry Point
// Description: Command dispatcher for workflow ingestion and dashboard queries.
// Purpose: Drive the workflow store from files and emit JSON results.
// Dependencies: clap, elephant-state-core, elephant-state-config, tracing.
// ============================================================================

//! ## Overview
//! The `elephant-state` CLI feeds step notifications and error reports into
//! the configured workflow store, runs the dashboard and repair queries, and
//! administers error status. Every command prints one JSON document on
//! stdout; logs go to stderr. Inputs are untrusted and read with hard size
//! limits.

// ============================================================================
// SECTION: Modules
// ============================================================================


// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use elephant_state_config::ConfigError;
use elephant_state_config::ElephantStateConfig;
use elephant_state_config::LogFormat;
use elephant_state_config::LoggingConfig;
use elephant_state_core::CountyAggregateRequest;
use elephant_state_core::ErrorHash;
use elephant_state_core::ErrorListRequest;
use elephant_state_core::ErrorReport;
use elephant_state_core::ErrorStatus;
use elephant_state_core::ExecutionId;
use elephant_state_core::ExecutionRankRequest;
use elephant_state_core::InMemoryWorkflowStore;
use elephant_state_core::SharedWorkflowStore;
use elephant_state_core::SortOrder;
use elephant_state_core::WorkflowEvent;
use elephant_state_core::WorkflowIngestor;
use elephant_state_core::WorkflowQueryService;
use elephant_state_store_sqlite::SqliteWorkflowStore;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum size of an input JSON file.
const MAX_INPUT_BYTES: usize = 16 * 1024 * 1024;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Workflow state store command line.
#[derive(Parser, Debug)]
#[command(name = "elephant-state", version, disable_help_subcommand = true)]
struct Cli {
    /// Path to `elephant-state.toml`.
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Command to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply one notification or an array of notifications.
    IngestEvent(InputArgs),
    /// Ingest one error report or an array of reports.
    IngestErrors(InputArgs),
    /// Page step aggregates, across all shards or for one county.
    Aggregates(AggregatesCommand),
    /// Sum every step aggregate into fleet-wide per-step totals.
    FleetTotals,
    /// Page error records by occurrence count.
    Errors(ErrorsCommand),
    /// Show the execution with the most or fewest distinct errors.
    NextExecution(NextExecutionCommand),
    /// Show one execution.
    Execution(ExecutionArgs),
    /// Mark errors as possibly fixed pending a successful re-run.
    MarkMaybeSolved(HashArgs),
    /// Mark errors as solved.
    MarkSolved(HashArgs),
    /// Mark errors as unrecoverable.
    MarkUnrecoverable(HashArgs),
    /// Remove an execution, its counter contribution, and its error links.
    DeleteExecution(ExecutionArgs),
    /// Configuration utilities.
    Config {
        /// Selected config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Input file arguments.
#[derive(Args, Debug)]
struct InputArgs {
    /// JSON input file.
    #[arg(long, value_name = "FILE")]
    input: PathBuf,
}

/// Aggregate query arguments.
#[derive(Args, Debug)]
struct AggregatesCommand {
    /// Restrict to one county.
    #[arg(long, value_name = "COUNTY")]
    county: Option<String>,
    /// Data-group label for the county query.
    #[arg(long = "data-group", value_name = "LABEL", requires = "county")]
    data_group: Option<String>,
    /// Phase prefix for the county query.
    #[arg(long, value_name = "PHASE", requires = "county")]
    phase: Option<String>,
    /// Continuation cursor from a previous page.
    #[arg(long, value_name = "CURSOR", conflicts_with = "county")]
    cursor: Option<String>,
    /// Requested page size.
    #[arg(long, value_name = "N", conflicts_with = "county")]
    limit: Option<usize>,
}

/// Error listing arguments.
#[derive(Args, Debug)]
struct ErrorsCommand {
    /// Error type prefix.
    #[arg(long = "error-type", value_name = "TYPE")]
    error_type: Option<String>,
    /// Error status filter.
    #[arg(long, value_name = "STATUS")]
    status: Option<ErrorStatus>,
    /// Continuation cursor from a previous page.
    #[arg(long, value_name = "CURSOR")]
    cursor: Option<String>,
    /// Requested page size.
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
}

/// Ranking arguments.
#[derive(Args, Debug)]
struct NextExecutionCommand {
    /// `most` or `least`.
    #[arg(long, value_name = "ORDER", default_value = "most")]
    sort: SortOrder,
    /// Error type prefix.
    #[arg(long = "error-type", value_name = "TYPE")]
    error_type: Option<String>,
}

/// Single execution argument.
#[derive(Args, Debug)]
struct ExecutionArgs {
    /// Execution identifier.
    #[arg(value_name = "ID")]
    execution_id: String,
}

/// Error hash arguments.
#[derive(Args, Debug)]
struct HashArgs {
    /// Error hashes to change.
    #[arg(value_name = "HASH", required = true, num_args = 1..)]
    hashes: Vec<String>,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Load and validate the configuration.
    Validate,
}

/// A JSON document holding one item or an array of items.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    /// Array form.
    Many(Vec<T>),
    /// Single object form.
    One(T),
}

impl<T> OneOrMany<T> {
    /// Flattens into a list.
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Many(items) => items,
            Self::One(item) => vec![item],
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error wrapper.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(error: ConfigError) -> Self {
        Self::new(format!("failed to load config: {error}"))
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Loads configuration, installs logging, and dispatches the command.
fn run(cli: Cli) -> CliResult<ExitCode> {
    let config = ElephantStateConfig::load(cli.config.as_deref())?;
    if let Commands::Config {
        command: ConfigCommand::Validate,
    } = cli.command
    {
        return write_json(&json!({ "valid": true }));
    }
    init_logging(&config.logging)?;
    let store = open_store(&config)?;
    let limits = config.query.page_limits()?;
    let ingestor = WorkflowIngestor::new(store.clone());
    let queries = WorkflowQueryService::with_limits(store, limits);

    match cli.command {
        Commands::IngestEvent(args) => command_ingest_event(&ingestor, &args.input),
        Commands::IngestErrors(args) => command_ingest_errors(&ingestor, &args.input),
        Commands::Aggregates(command) => command_aggregates(&queries, command),
        Commands::FleetTotals => {
            let totals = queries.fleet_totals().map_err(|err| CliError::new(err.to_string()))?;
            write_json(&totals)
        }
        Commands::Errors(command) => {
            let request = ErrorListRequest {
                error_type: command.error_type,
                status: command.status,
                cursor: command.cursor,
                limit: command.limit,
            };
            let page = queries.list_errors(&request).map_err(|err| CliError::new(err.to_string()))?;
            write_json(&page)
        }
        Commands::NextExecution(command) => {
            let request = ExecutionRankRequest {
                sort_order: command.sort,
                error_type: command.error_type,
            };
            let summary = queries
                .execution_by_error_count(&request)
                .map_err(|err| CliError::new(err.to_string()))?;
            write_json(&summary)
        }
        Commands::Execution(args) => {
            let summary = queries
                .execution(&ExecutionId::new(args.execution_id))
                .map_err(|err| CliError::new(err.to_string()))?;
            write_json(&summary)
        }
        Commands::MarkMaybeSolved(args) => {
            let changed = ingestor
                .mark_errors_as_maybe_solved(&to_hashes(args.hashes))
                .map_err(|err| CliError::new(err.to_string()))?;
            write_json(&json!({ "changed": changed }))
        }
        Commands::MarkSolved(args) => {
            let changed = ingestor
                .mark_errors_solved(&to_hashes(args.hashes))
                .map_err(|err| CliError::new(err.to_string()))?;
            write_json(&json!({ "changed": changed }))
        }
        Commands::MarkUnrecoverable(args) => {
            let changed = ingestor
                .mark_errors_unrecoverable(&to_hashes(args.hashes))
                .map_err(|err| CliError::new(err.to_string()))?;
            write_json(&json!({ "changed": changed }))
        }
        Commands::DeleteExecution(args) => {
            let outcome = ingestor
                .delete_execution(&ExecutionId::new(args.execution_id))
                .map_err(|err| CliError::new(err.to_string()))?;
            write_json(&outcome)
        }
        Commands::Config {
            command: ConfigCommand::Validate,
        } => write_json(&json!({ "valid": true })),
    }
}

// ============================================================================
// SECTION: Setup
// ============================================================================

/// Installs the stderr tracing subscriber; `RUST_LOG` overrides the config.
fn init_logging(logging: &LoggingConfig) -> CliResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(logging.level.trim())
            .map_err(|err| CliError::new(format!("invalid logging level: {err}")))?,
    };
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match logging.format {
        LogFormat::Json => {
            registry.with(fmt::layer().json().with_writer(std::io::stderr)).try_init()
        }
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).try_init(),
    };
    installed.map_err(|err| CliError::new(format!("failed to install logging: {err}")))
}

/// Opens the configured store backend.
fn open_store(config: &ElephantStateConfig) -> CliResult<SharedWorkflowStore> {
    match config.store.sqlite_config() {
        Some(sqlite) => {
            let store = SqliteWorkflowStore::new(sqlite)
                .map_err(|err| CliError::new(format!("failed to open store: {err}")))?;
            Ok(SharedWorkflowStore::from_store(store))
        }
        None => Ok(SharedWorkflowStore::from_store(InMemoryWorkflowStore::new())),
    }
}

// ============================================================================
// SECTION: Commands
// ============================================================================

/// Applies every notification in the input file.
fn command_ingest_event(
    ingestor: &WorkflowIngestor<SharedWorkflowStore>,
    input: &Path,
) -> CliResult<ExitCode> {
    let events: Vec<WorkflowEvent> = read_json::<OneOrMany<WorkflowEvent>>(input)?.into_vec();
    let mut outcomes = Vec::with_capacity(events.len());
    for event in &events {
        let outcome = ingestor.apply_event(event).map_err(|err| {
            CliError::new(format!("event {} rejected: {err}", event.event_id))
        })?;
        outcomes.push(outcome);
    }
    info!(events = outcomes.len(), "ingested notifications");
    write_json(&outcomes)
}

/// Ingests every error report in the input file.
fn command_ingest_errors(
    ingestor: &WorkflowIngestor<SharedWorkflowStore>,
    input: &Path,
) -> CliResult<ExitCode> {
    let reports: Vec<ErrorReport> = read_json::<OneOrMany<ErrorReport>>(input)?.into_vec();
    let mut outcomes = Vec::with_capacity(reports.len());
    for report in &reports {
        let outcome = ingestor.ingest_error_report(report).map_err(|err| {
            CliError::new(format!("error report for {} rejected: {err}", report.execution_id))
        })?;
        outcomes.push(outcome);
    }
    info!(reports = outcomes.len(), "ingested error reports");
    write_json(&outcomes)
}

/// Runs the fleet or county aggregate query.
fn command_aggregates(
    queries: &WorkflowQueryService<SharedWorkflowStore>,
    command: AggregatesCommand,
) -> CliResult<ExitCode> {
    if let Some(county) = command.county {
        let request = CountyAggregateRequest {
            county,
            data_group_label: command.data_group,
            phase: command.phase,
        };
        let items = queries
            .query_step_aggregates_for_county(&request)
            .map_err(|err| CliError::new(err.to_string()))?;
        return write_json(&json!({ "items": items }));
    }
    let page = queries
        .query_all_step_aggregates(command.cursor.as_deref(), command.limit)
        .map_err(|err| CliError::new(err.to_string()))?;
    write_json(&page)
}

// ============================================================================
// SECTION: Input Helpers
// ============================================================================

/// Errors raised while reading bounded input files.
#[derive(Debug)]
enum ReadLimitError {
    /// File I/O failure.
    Io(std::io::Error),
    /// File size exceeds the configured limit.
    TooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Allowed limit in bytes.
        limit: usize,
    },
}

/// Reads a file from disk while enforcing a hard size limit.
fn read_bytes_with_limit(path: &Path, max_bytes: usize) -> Result<Vec<u8>, ReadLimitError> {
    let file = File::open(path).map_err(ReadLimitError::Io)?;
    let size = file.metadata().map_err(ReadLimitError::Io)?.len();
    let limit = u64::try_from(max_bytes).map_err(|_| ReadLimitError::TooLarge {
        size,
        limit: max_bytes,
    })?;
    if size > limit {
        return Err(ReadLimitError::TooLarge {
            size,
            limit: max_bytes,
        });
    }
    let mut limited = file.take(limit.saturating_add(1));
    let mut bytes = Vec::new();
    limited.read_to_end(&mut bytes).map_err(ReadLimitError::Io)?;
    if bytes.len() > max_bytes {
        return Err(ReadLimitError::TooLarge {
            size: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            limit: max_bytes,
        });
    }
    Ok(bytes)
}

/// Reads and parses a bounded JSON input file.
fn read_json<T: DeserializeOwned>(path: &Path) -> CliResult<T> {
    let bytes = read_bytes_with_limit(path, MAX_INPUT_BYTES).map_err(|err| match err {
        ReadLimitError::Io(error) => {
            CliError::new(format!("failed to read {}: {error}", path.display()))
        }
        ReadLimitError::TooLarge {
            size,
            limit,
        } => CliError::new(format!(
            "{} is {size} bytes, above the {limit} byte input limit",
            path.display()
        )),
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|err| CliError::new(format!("invalid json in {}: {err}", path.display())))
}

/// Wraps raw hash arguments.
fn to_hashes(raw: Vec<String>) -> Vec<ErrorHash> {
    raw.into_iter().map(ErrorHash::new).collect()
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Writes a value as pretty JSON on stdout.
fn write_json<T: Serialize>(value: &T) -> CliResult<ExitCode> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::new(format!("failed to serialize output: {err}")))?;
    write_stdout_line(&rendered)
        .map_err(|err| CliError::new(format!("failed to write stdout: {err}")))?;
    Ok(ExitCode::SUCCESS)
}

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}
