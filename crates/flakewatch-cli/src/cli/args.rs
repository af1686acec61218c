use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "flakewatch",
    version,
    about = "Test-run history, flaky detection and failure classification"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,

    /// tracing filter, e.g. "info" or "flakewatch_core=debug"
    #[arg(long, global = true, env = "FLAKEWATCH_LOG", default_value = "warn")]
    pub log_level: String,

    /// log line format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a commented sample config
    Init(InitArgs),
    /// Replay a JSONL file of session_start / test_outcome / session_finish events
    Ingest(IngestArgs),
    /// Per-run pass rate over a window, globally or for one test
    Trend(TrendArgs),
    /// Tests whose outcome keeps flipping
    Flaky(FlakyArgs),
    /// Aggregate history statistics
    Stats(StatsArgs),
    /// Delete runs older than the retention window
    Purge(PurgeArgs),
    /// Classify failure text
    Classify(ClassifyArgs),
    Version,
}

#[derive(clap::Args, Clone)]
pub struct EngineArgs {
    #[arg(long, default_value = "flakewatch.yaml")]
    pub config: PathBuf,

    /// overrides `database_path` from the config
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// reject unknown config keys
    #[arg(long)]
    pub strict_config: bool,
}

#[derive(Parser, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "flakewatch.yaml")]
    pub config: PathBuf,
}

#[derive(Parser, Clone)]
pub struct IngestArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// JSONL event file; "-" reads stdin
    #[arg(long)]
    pub events: PathBuf,

    /// serve the live feed while replaying
    #[arg(long)]
    pub live: bool,

    /// live feed port (0 picks a free one)
    #[arg(long)]
    pub port: Option<u16>,

    /// keep the live feed open after the replay until Ctrl-C
    #[arg(long, requires = "live")]
    pub hold: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Parser, Clone)]
pub struct TrendArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    #[arg(long, default_value_t = 7)]
    pub days: u32,

    /// restrict to one test identity
    #[arg(long)]
    pub test: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Parser, Clone)]
pub struct FlakyArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// only tests seen in the last N days (defaults to retention_days)
    #[arg(long)]
    pub days: Option<u32>,

    /// single test; prints its verdict even when there is too little history
    #[arg(long)]
    pub test: Option<String>,

    #[arg(long)]
    pub min_observations: Option<usize>,

    #[arg(long)]
    pub threshold: Option<f64>,

    /// exit 1 when any flaky test is found
    #[arg(long)]
    pub fail_on_flaky: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Parser, Clone)]
pub struct StatsArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    #[arg(long, default_value_t = 10)]
    pub limit: u32,

    /// window for the trend summary and error breakdown
    #[arg(long, default_value_t = 7)]
    pub days: u32,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Parser, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// defaults to retention_days
    #[arg(long)]
    pub days: Option<u32>,
}

#[derive(Parser, Clone)]
pub struct ClassifyArgs {
    /// failure text; omit to read --file or stdin
    pub text: Option<String>,

    #[arg(long, conflicts_with = "text")]
    pub file: Option<PathBuf>,

    /// consult the configured analysis provider
    #[arg(long)]
    pub enrich: bool,

    #[arg(long, default_value = "flakewatch.yaml")]
    pub config: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
}
