use super::{engine_config, exit_codes, open_store, print_json};
use crate::cli::args::{ClassifyArgs, InitArgs, OutputFormat, PurgeArgs};
use anyhow::Context;
use flakewatch_core::analyzer::{ErrorSignature, PatternAnalyzer};
use flakewatch_core::config::{load_config, write_sample_config};
use flakewatch_core::providers::build_provider;
use std::io::Read;
use std::time::Duration;

pub fn cmd_init(args: InitArgs) -> anyhow::Result<i32> {
    if args.config.exists() {
        eprintln!("note: {} already exists", args.config.display());
        return Ok(exit_codes::OK);
    }
    super::ensure_parent_dir(&args.config)?;
    write_sample_config(&args.config).map_err(|e| anyhow::anyhow!(e))?;
    eprintln!("created {}", args.config.display());
    Ok(exit_codes::OK)
}

pub fn cmd_purge(args: PurgeArgs) -> anyhow::Result<i32> {
    let cfg = engine_config(&args.engine)?;
    let days = args.days.unwrap_or(cfg.retention_days);
    let store = open_store(&cfg)?;
    let summary = store.purge_older_than(days)?;
    eprintln!(
        "purged {} runs ({} results) started before {}",
        summary.runs_deleted,
        summary.results_deleted,
        summary.cutoff.to_rfc3339()
    );
    Ok(exit_codes::OK)
}

pub fn cmd_classify(args: ClassifyArgs) -> anyhow::Result<i32> {
    let text = match (&args.text, &args.file) {
        (Some(t), _) => t.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    if text.trim().is_empty() {
        eprintln!("config error: nothing to classify");
        return Ok(exit_codes::CONFIG_ERROR);
    }

    let cfg = load_config(&args.config, false).map_err(|e| anyhow::anyhow!("config error: {}", e))?;
    let mut analyzer = PatternAnalyzer::new(cfg.analyzer_cache_entries)?;

    let signature = if args.enrich {
        if let Some(provider) = build_provider(&cfg)? {
            analyzer = analyzer.with_provider(provider, Duration::from_millis(cfg.provider_timeout_ms));
        } else {
            eprintln!("note: no analysis provider configured; classifying locally");
        }
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start runtime")?;
        rt.block_on(analyzer.classify_enriched(&text))
    } else {
        analyzer.classify(&text)
    };

    match args.format {
        OutputFormat::Json => print_json(&signature)?,
        OutputFormat::Text => print_signature(&signature),
    }
    Ok(exit_codes::OK)
}

fn print_signature(sig: &ErrorSignature) {
    println!("category: {}", sig.category);
    println!("severity: {}", sig.severity.as_str());
    if let Some(t) = &sig.error_type {
        println!("type:     {}", t);
    }
    println!("hash:     {}", sig.normalized_hash);
    println!("message:  {}", sig.normalized_message);
    if !sig.suggested_actions.is_empty() {
        println!("suggestions:");
        for s in &sig.suggested_actions {
            println!("  - {}", s);
        }
    }
    for d in &sig.doc_links {
        println!("docs:     {}", d);
    }
    for l in &sig.search_links {
        println!("search:   {}", l);
    }
    if let Some(n) = &sig.provider_notes {
        println!("notes:    {}", n);
    }
}
