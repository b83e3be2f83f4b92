//! # Elspeth CLI — pipeline runner
//!
//! Wires the reference plugins in `elspeth-io` into a graph and drives it
//! through an `Orchestrator`: parse arguments, load configuration, build
//! the graph, handle Ctrl-C as a cooperative shutdown signal, print a
//! summary.
//!
//! This binary does not take an arbitrary YAML pipeline topology — the
//! reference plugin set is a fixed CSV-source / JSON-Lines-sink
//! pipeline, wired from flags. A declarative graph-spec loader is future
//! work for whoever plugs in a real connector set.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use elspeth_audit::memory::InMemoryAuditRecorder;
use elspeth_audit::sqlite::SqliteAuditRecorder;
use elspeth_checkpoint::manager::{CheckpointManager, SqliteCheckpointManager};
use elspeth_core::audit::AuditRecorder;
use elspeth_core::config::RunConfig;
use elspeth_core::schema::DeclaredSchema;
use elspeth_core::{Clock, RateLimiter, SchemaContract, SystemClock};
use elspeth_exec::rate_limit::RateLimiterRegistry;
use elspeth_exec::{BatchAwareRegistry, Orchestrator};
use elspeth_graph::{Edge, EdgeMode, ExecutionGraph, Node, NodePlugin};
use elspeth_core::audit::RunStatus;
use elspeth_io::{CsvSource, JsonLinesSink};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Process exit codes: 0 clean completion, 1 validation/config error, 2
/// runtime failure, 3 graceful-shutdown interruption.
mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIGURATION: i32 = 1;
    pub const RUNTIME: i32 = 2;
    pub const INTERRUPTED: i32 = 3;
}

/// Run a pipeline reading `--source-csv` against `--schema` and writing to
/// `--sink-jsonl` (or stdout, if omitted).
#[derive(Parser, Debug)]
#[command(name = "elspeth-cli")]
#[command(about = "Elspeth pipeline runner")]
struct Args {
    /// YAML file describing the declared source schema (fields + types).
    #[arg(long)]
    schema: PathBuf,

    /// CSV file to read rows from.
    #[arg(long)]
    source_csv: PathBuf,

    /// First line of the CSV file is a header and should be skipped.
    #[arg(long, default_value_t = true)]
    has_header: bool,

    /// Write JSON Lines output here instead of stdout.
    #[arg(long)]
    sink_jsonl: Option<PathBuf>,

    /// Run configuration (checkpoint cadence, retry, rate limits, export).
    /// Defaults to `RunConfig::default()` when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite file backing checkpoint storage. In-memory (no resume across
    /// process restarts) when omitted.
    #[arg(long)]
    checkpoint_db: Option<PathBuf>,

    /// SQLite file backing the audit trail. In-memory when omitted.
    #[arg(long)]
    audit_db: Option<PathBuf>,

    /// Resume a previously interrupted run instead of starting a fresh one.
    #[arg(long)]
    resume: Option<Uuid>,
}

fn load_run_config(path: Option<&PathBuf>) -> Result<RunConfig> {
    match path {
        Some(path) => {
            let yaml = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
            serde_yaml::from_str(&yaml).with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(RunConfig::default()),
    }
}

fn load_schema(path: &PathBuf) -> Result<DeclaredSchema> {
    let yaml = std::fs::read_to_string(path).with_context(|| format!("reading schema {}", path.display()))?;
    serde_yaml::from_str(&yaml).with_context(|| format!("parsing schema {}", path.display()))
}

/// Everything that must succeed before the orchestrator takes over the
/// main loop — loading config/schema, building the graph, opening
/// checkpoint/audit storage, constructing the orchestrator, and resuming
/// a prior run — is treated as a configuration-stage failure.
enum CliOutcome {
    Ran(elspeth_exec::RunSummary),
    ConfigError(anyhow::Error),
    RuntimeError(anyhow::Error),
}

async fn run_cli(args: Args) -> CliOutcome {
    let config = match load_run_config(args.config.as_ref()) {
        Ok(c) => c,
        Err(e) => return CliOutcome::ConfigError(e),
    };
    let declared = match load_schema(&args.schema) {
        Ok(d) => d,
        Err(e) => return CliOutcome::ConfigError(e),
    };
    let contract = SchemaContract::create_output_contract_from_schema(&declared);

    let source = CsvSource::new(
        "source",
        args.source_csv.clone(),
        &declared,
        args.has_header,
        b',',
        elspeth_core::RoutePolicy::Discard,
    );
    let sink: JsonLinesSink = match &args.sink_jsonl {
        Some(path) => match JsonLinesSink::try_file("sink", contract, path.clone()) {
            Ok(s) => s,
            Err(e) => return CliOutcome::ConfigError(e),
        },
        None => JsonLinesSink::stdout("sink", contract),
    };

    let graph = match ExecutionGraph::build(
        vec![
            Node::new("source", NodePlugin::Source(Box::new(source))),
            Node::new("sink", NodePlugin::Sink(Box::new(sink))),
        ],
        vec![Edge::new("source", "sink", None, EdgeMode::Move)],
    ) {
        Ok(g) => g,
        Err(errors) => return CliOutcome::ConfigError(anyhow::anyhow!("graph failed validation: {errors:?}")),
    };

    let checkpoint_manager: Arc<dyn CheckpointManager> = match &args.checkpoint_db {
        Some(path) => match SqliteCheckpointManager::open(path, config.checkpoint.clone()) {
            Ok(m) => Arc::new(m),
            Err(e) => return CliOutcome::ConfigError(e.into()),
        },
        None => match SqliteCheckpointManager::open_in_memory(config.checkpoint.clone()) {
            Ok(m) => Arc::new(m),
            Err(e) => return CliOutcome::ConfigError(e.into()),
        },
    };
    let audit: Arc<dyn AuditRecorder> = match &args.audit_db {
        Some(path) => match SqliteAuditRecorder::open(path) {
            Ok(a) => Arc::new(a),
            Err(e) => return CliOutcome::ConfigError(e.into()),
        },
        None => Arc::new(InMemoryAuditRecorder::new()),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let rate_limiter: Arc<dyn RateLimiter> = Arc::new(RateLimiterRegistry::new(config.rate_limit.clone()));

    let mut orchestrator = match Orchestrator::new(graph, BatchAwareRegistry::new(), config, audit, checkpoint_manager, clock, rate_limiter) {
        Ok(o) => o,
        Err(e) => return CliOutcome::ConfigError(e.into()),
    };

    if let Some(run_id) = args.resume {
        orchestrator = match orchestrator.resume(run_id).await {
            Ok(o) => o,
            Err(e) => return CliOutcome::ConfigError(e.into()),
        };
    }

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl-C, requesting graceful shutdown");
            shutdown_for_signal.cancel();
        }
    });

    match orchestrator.run(Some(shutdown)).await {
        Ok(summary) => CliOutcome::Ran(summary),
        Err(e) => CliOutcome::RuntimeError(e.into()),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let code = match run_cli(args).await {
        CliOutcome::Ran(summary) => {
            tracing::info!(
                run_id = %summary.run_id,
                status = ?summary.status,
                rows_loaded = summary.counters.rows_loaded,
                rows_succeeded = summary.counters.rows_succeeded,
                rows_failed = summary.counters.rows_failed,
                rows_quarantined = summary.counters.rows_quarantined,
                "run finished"
            );
            println!("{summary:#?}");
            match summary.status {
                RunStatus::Completed => exit_code::OK,
                RunStatus::Interrupted => exit_code::INTERRUPTED,
                RunStatus::Failed | RunStatus::Running => exit_code::RUNTIME,
            }
        }
        CliOutcome::ConfigError(e) => {
            eprintln!("configuration error: {e:#}");
            exit_code::CONFIGURATION
        }
        CliOutcome::RuntimeError(e) => {
            eprintln!("runtime error: {e:#}");
            exit_code::RUNTIME
        }
    };
    std::process::exit(code);
}
