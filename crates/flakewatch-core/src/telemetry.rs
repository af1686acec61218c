use crate::analyzer::PatternAnalyzer;
use crate::config::EngineConfig;
use crate::flaky::FlakyDetector;
use crate::ingest::{IngestOptions, IngestPipeline};
use crate::providers;
use crate::realtime::{Broadcaster, RealtimeServer};
use crate::storage::Store;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Owns every long-lived piece of the engine for one host process: the
/// background runtime, the store, the analyzer and flaky caches, the
/// broadcaster and (optionally) its TCP listener.
///
/// Meant for synchronous hosts; constructing it inside an async context panics
/// when the realtime listener is enabled.
pub struct Telemetry {
    config: EngineConfig,
    store: Option<Store>,
    analyzer: Arc<PatternAnalyzer>,
    flaky: Option<FlakyDetector>,
    broadcaster: Broadcaster,
    pipeline: IngestPipeline,
    server: Option<RealtimeServer>,
    runtime: Option<Runtime>,
}

impl Telemetry {
    /// Store and listener failures degrade (logged, feature disabled);
    /// only an unusable analyzer or runtime is an error.
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("flakewatch-rt")
            .enable_all()
            .build()
            .context("failed to start background runtime")?;

        let store = match open_store(&config) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(
                    event = "history_unavailable",
                    path = %config.database_path.display(),
                    error = %e
                );
                None
            }
        };

        let mut analyzer = PatternAnalyzer::new(config.analyzer_cache_entries)
            .context("failed to compile classification rules")?;
        match providers::build_provider(&config) {
            Ok(Some(p)) => {
                tracing::info!(event = "provider_enabled", provider = p.provider_name());
                analyzer = analyzer.with_provider(p, Duration::from_millis(config.provider_timeout_ms));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(event = "provider_disabled", error = %e),
        }
        let analyzer = Arc::new(analyzer);

        let broadcaster = Broadcaster::new(config.client_queue_capacity);
        let server = if config.realtime_enabled {
            let addr = config.realtime_addr();
            match runtime.block_on(RealtimeServer::bind(&addr, broadcaster.clone())) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!(event = "realtime_disabled", error = %e);
                    None
                }
            }
        } else {
            None
        };

        let flaky = store.clone().map(|s| {
            FlakyDetector::new(s, config.flaky_min_observations, config.flaky_threshold)
        });

        let pipeline = IngestPipeline::new(
            store.clone(),
            analyzer.clone(),
            broadcaster.clone(),
            IngestOptions {
                max_buffered_results: config.max_buffered_results,
                persist_timeout: Duration::from_millis(config.persist_timeout_ms),
            },
        )
        .with_runtime(runtime.handle().clone());

        Ok(Self {
            config,
            store,
            analyzer,
            flaky,
            broadcaster,
            pipeline,
            server,
            runtime: Some(runtime),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }

    pub fn analyzer(&self) -> &PatternAnalyzer {
        &self.analyzer
    }

    pub fn flaky(&self) -> Option<&FlakyDetector> {
        self.flaky.as_ref()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn realtime_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr())
    }

    /// Runs a future on the background runtime, e.g. `classify_enriched`.
    pub fn block_on<F: std::future::Future>(&self, fut: F) -> Option<F::Output> {
        self.runtime.as_ref().map(|rt| rt.block_on(fut))
    }

    /// Closes every live client and releases the listener port.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            match self.runtime.as_ref() {
                Some(rt) => rt.block_on(server.shutdown()),
                None => server.signal_shutdown(),
            }
        }
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
        }
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.signal_shutdown();
        }
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}

fn open_store(config: &EngineConfig) -> Result<Store, crate::errors::StorageError> {
    let store = Store::open(&config.database_path)?.with_recency_window(config.retention_days);
    store.init_schema()?;
    Ok(store)
}
