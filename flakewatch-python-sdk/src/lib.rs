use flakewatch_core::config::{load_config, EngineConfig};
use flakewatch_core::ingest::SessionContext;
use flakewatch_core::model::{Outcome, RunMetadata};
use pyo3::exceptions::{PyKeyError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("FLAKEWATCH_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    // A host may already have installed a subscriber; keep theirs.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn to_json<T: serde::Serialize>(value: &T) -> PyResult<String> {
    serde_json::to_string(value).map_err(|e| PyRuntimeError::new_err(e.to_string()))
}

#[pyclass]
/// Test-run telemetry for one host process.
///
/// The pytest hook layer calls `session_start`, then `test_outcome` per test,
/// then `session_finish`. Reports and query results are returned as JSON strings.
struct Telemetry {
    inner: Option<flakewatch_core::Telemetry>,
    sessions: Mutex<HashMap<String, SessionContext>>,
}

impl Telemetry {
    fn engine(&self) -> PyResult<&flakewatch_core::Telemetry> {
        self.inner
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("Telemetry is closed"))
    }
}

#[pymethods]
impl Telemetry {
    #[new]
    #[pyo3(signature = (config_path=None, database_path=None, realtime=None))]
    /// Args:
    ///     config_path (Optional[str]): YAML config; missing file means defaults.
    ///     database_path (Optional[str]): overrides `database_path`.
    ///     realtime (Optional[bool]): overrides `realtime_enabled`.
    fn new(
        config_path: Option<String>,
        database_path: Option<String>,
        realtime: Option<bool>,
    ) -> PyResult<Self> {
        init_logging();
        let mut cfg = match config_path {
            Some(p) => load_config(Path::new(&p), false),
            None => EngineConfig::from_env(),
        }
        .map_err(|e| PyValueError::new_err(e.to_string()))?;
        if let Some(db) = database_path {
            cfg.database_path = PathBuf::from(db);
        }
        if let Some(enabled) = realtime {
            cfg.realtime_enabled = enabled;
        }

        let inner = flakewatch_core::Telemetry::new(cfg)
            .map_err(|e| PyRuntimeError::new_err(format!("{:#}", e)))?;
        Ok(Telemetry {
            inner: Some(inner),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    #[pyo3(signature = (metadata=None))]
    /// Starts a run and returns its run_id.
    ///
    /// Args:
    ///     metadata (Optional[dict]): branch, commit, environment, tags.
    fn session_start(&self, metadata: Option<PyObject>, py: Python<'_>) -> PyResult<String> {
        let metadata: RunMetadata = match metadata {
            Some(obj) => pythonize::depythonize(obj.bind(py))
                .map_err(|e| PyValueError::new_err(format!("Invalid metadata: {}", e)))?,
            None => RunMetadata::default(),
        };
        let ctx = self.engine()?.pipeline().on_session_start(metadata);
        let run_id = ctx.run_id().to_string();
        self.sessions
            .lock()
            .map_err(|_| PyRuntimeError::new_err("session table poisoned"))?
            .insert(run_id.clone(), ctx);
        Ok(run_id)
    }

    #[pyo3(signature = (run_id, test_identity, outcome, duration_ms, error_text=None))]
    fn test_outcome(
        &self,
        run_id: &str,
        test_identity: &str,
        outcome: &str,
        duration_ms: f64,
        error_text: Option<&str>,
    ) -> PyResult<()> {
        let outcome = Outcome::parse(outcome)
            .ok_or_else(|| PyValueError::new_err(format!("unknown outcome '{}'", outcome)))?;
        let engine = self.engine()?;
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| PyRuntimeError::new_err("session table poisoned"))?;
        let ctx = sessions
            .get_mut(run_id)
            .ok_or_else(|| PyKeyError::new_err(format!("no active session '{}'", run_id)))?;
        engine.pipeline().on_test_outcome(
            ctx,
            test_identity,
            outcome,
            duration_ms.max(0.0).round() as u64,
            error_text,
        );
        Ok(())
    }

    /// Finalizes the run and returns the session report as JSON. Persistence
    /// problems appear in the report's `persist` and `warning` fields.
    fn session_finish(&self, run_id: &str, py: Python<'_>) -> PyResult<String> {
        let ctx = self
            .sessions
            .lock()
            .map_err(|_| PyRuntimeError::new_err("session table poisoned"))?
            .remove(run_id)
            .ok_or_else(|| PyKeyError::new_err(format!("no active session '{}'", run_id)))?;
        let engine = self.engine()?;
        let report = py.allow_threads(|| engine.pipeline().on_session_finish(ctx));
        to_json(&report)
    }

    /// Classifies failure text; uses the configured provider when there is one.
    fn classify(&self, error_text: &str, py: Python<'_>) -> PyResult<String> {
        let engine = self.engine()?;
        let sig = py.allow_threads(|| {
            let analyzer = engine.analyzer();
            if analyzer.has_provider() {
                engine
                    .block_on(analyzer.classify_enriched(error_text))
                    .unwrap_or_else(|| analyzer.classify(error_text))
            } else {
                analyzer.classify(error_text)
            }
        });
        to_json(&sig)
    }

    #[pyo3(signature = (test_identity, min_observations=None))]
    fn detect_flaky(&self, test_identity: &str, min_observations: Option<usize>) -> PyResult<String> {
        let engine = self.engine()?;
        let detector = engine
            .flaky()
            .ok_or_else(|| PyRuntimeError::new_err("test history is unavailable"))?;
        let min = min_observations.unwrap_or(engine.config().flaky_min_observations);
        let verdict = detector
            .detect_flaky(test_identity, min)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        to_json(&verdict)
    }

    #[pyo3(signature = (window_days=None))]
    fn flaky_tests(&self, window_days: Option<u32>) -> PyResult<String> {
        let engine = self.engine()?;
        let detector = engine
            .flaky()
            .ok_or_else(|| PyRuntimeError::new_err("test history is unavailable"))?;
        let records = detector
            .flaky_tests(window_days.unwrap_or(engine.config().retention_days))
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        to_json(&records)
    }

    /// Port of the live feed, or None when it is disabled or failed to bind.
    #[getter]
    fn realtime_port(&self) -> PyResult<Option<u16>> {
        Ok(self.engine()?.realtime_addr().map(|a| a.port()))
    }

    /// Stops the live feed and releases resources. Further calls raise RuntimeError.
    fn close(&mut self, py: Python<'_>) {
        if let Some(inner) = self.inner.take() {
            py.allow_threads(|| inner.shutdown());
        }
    }
}

#[pymodule]
#[pyo3(name = "_native")]
fn native(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Telemetry>()?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
