use super::args::*;
use flakewatch_core::config::{load_config, EngineConfig};
use flakewatch_core::storage::Store;
use serde::Serialize;

pub mod ingest;
pub mod maintenance;
pub mod query;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const FLAKY_FOUND: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Init(args) => maintenance::cmd_init(args),
        Command::Ingest(args) => ingest::cmd_ingest(args),
        Command::Trend(args) => query::cmd_trend(args),
        Command::Flaky(args) => query::cmd_flaky(args),
        Command::Stats(args) => query::cmd_stats(args),
        Command::Purge(args) => maintenance::cmd_purge(args),
        Command::Classify(args) => maintenance::cmd_classify(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

/// Config file (missing means defaults), then `FLAKEWATCH_*` env, then CLI flags.
pub(crate) fn engine_config(args: &EngineArgs) -> anyhow::Result<EngineConfig> {
    let mut cfg = load_config(&args.config, args.strict_config)
        .map_err(|e| anyhow::anyhow!("config error: {}", e))?;
    if let Some(db) = &args.db {
        cfg.database_path = db.clone();
    }
    Ok(cfg)
}

pub(crate) fn open_store(cfg: &EngineConfig) -> anyhow::Result<Store> {
    ensure_parent_dir(&cfg.database_path)?;
    let store = Store::open(&cfg.database_path)?.with_recency_window(cfg.retention_days);
    store.init_schema()?;
    Ok(store)
}

pub(crate) fn ensure_parent_dir(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn percent(rate: Option<f64>) -> String {
    match rate {
        Some(r) => format!("{:.1}%", r * 100.0),
        None => "n/a".to_string(),
    }
}
