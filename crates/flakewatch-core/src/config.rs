use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProviderKind {
    #[default]
    Local,
    #[serde(rename = "openai")]
    OpenAi,
    Http,
}

impl AiProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "none" => Some(Self::Local),
            "openai" => Some(Self::OpenAi),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub retention_days: u32,
    pub flaky_min_observations: usize,
    pub flaky_threshold: f64,
    pub realtime_enabled: bool,
    pub realtime_host: String,
    pub realtime_port: u16,
    pub client_queue_capacity: usize,
    pub max_buffered_results: usize,
    pub persist_timeout_ms: u64,
    pub analyzer_cache_entries: u64,
    pub ai_provider: AiProviderKind,
    pub ai_model: String,
    pub ai_endpoint: Option<String>,
    pub ai_api_key_env: String,
    pub provider_timeout_ms: u64,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("test-history.db"),
            retention_days: 90,
            flaky_min_observations: 5,
            flaky_threshold: 0.3,
            realtime_enabled: true,
            realtime_host: "127.0.0.1".to_string(),
            realtime_port: 8888,
            client_queue_capacity: 256,
            max_buffered_results: 100_000,
            persist_timeout_ms: 10_000,
            analyzer_cache_entries: 1024,
            ai_provider: AiProviderKind::Local,
            ai_model: "gpt-4o-mini".to_string(),
            ai_endpoint: None,
            ai_api_key_env: "FLAKEWATCH_AI_API_KEY".to_string(),
            provider_timeout_ms: 5000,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn realtime_addr(&self) -> String {
        format!("{}:{}", self.realtime_host, self.realtime_port)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies `FLAKEWATCH_*` overrides. `lookup` is injectable so tests don't touch the process env.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FLAKEWATCH_DB") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FLAKEWATCH_RETENTION_DAYS") {
            self.retention_days = parse_env("FLAKEWATCH_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = lookup("FLAKEWATCH_FLAKY_MIN_OBSERVATIONS") {
            self.flaky_min_observations = parse_env("FLAKEWATCH_FLAKY_MIN_OBSERVATIONS", &v)?;
        }
        if let Some(v) = lookup("FLAKEWATCH_FLAKY_THRESHOLD") {
            self.flaky_threshold = parse_env("FLAKEWATCH_FLAKY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("FLAKEWATCH_REALTIME") {
            self.realtime_enabled = !matches!(v.as_str(), "0" | "false" | "off" | "no");
        }
        if let Some(v) = lookup("FLAKEWATCH_REALTIME_PORT") {
            self.realtime_port = parse_env("FLAKEWATCH_REALTIME_PORT", &v)?;
        }
        if let Some(v) = lookup("FLAKEWATCH_AI_PROVIDER") {
            self.ai_provider = AiProviderKind::parse(&v).ok_or_else(|| {
                ConfigError(format!("FLAKEWATCH_AI_PROVIDER: unknown provider '{}'", v))
            })?;
        }
        if let Some(v) = lookup("FLAKEWATCH_AI_ENDPOINT") {
            self.ai_endpoint = Some(v);
        }
        if let Some(v) = lookup("FLAKEWATCH_LOG") {
            self.log_level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.flaky_threshold.is_finite() || !(0.0..=1.0).contains(&self.flaky_threshold) {
            return Err(ConfigError(format!(
                "flaky_threshold must be within [0, 1], got {}",
                self.flaky_threshold
            )));
        }
        if self.flaky_min_observations < 2 {
            return Err(ConfigError(
                "flaky_min_observations must be at least 2".into(),
            ));
        }
        if self.retention_days == 0 {
            return Err(ConfigError("retention_days must be at least 1".into()));
        }
        if self.client_queue_capacity == 0 {
            return Err(ConfigError("client_queue_capacity must be at least 1".into()));
        }
        if self.max_buffered_results == 0 {
            return Err(ConfigError("max_buffered_results must be at least 1".into()));
        }
        if self.ai_provider == AiProviderKind::Http && self.ai_endpoint.is_none() {
            return Err(ConfigError(
                "ai_provider 'http' requires ai_endpoint".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError(format!("{}: invalid value '{}'", key, raw)))
}

/// Loads the YAML file at `path`, then env overrides, then validation.
/// A missing file yields defaults. Unknown keys are rejected when `strict`.
pub fn load_config(path: &Path, strict: bool) -> Result<EngineConfig, ConfigError> {
    let mut cfg = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;
        parse_config(&raw, strict)
            .map_err(|ConfigError(msg)| ConfigError(format!("{} (file: {})", msg, path.display())))?
    } else {
        tracing::debug!(event = "config_defaults", path = %path.display());
        EngineConfig::default()
    };

    cfg.apply_env(|k| std::env::var(k).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn parse_config(raw: &str, strict: bool) -> Result<EngineConfig, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(EngineConfig::default());
    }

    let mut ignored_keys = BTreeSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(raw);
    let cfg: EngineConfig = serde_ignored::deserialize(deserializer, |path| {
        ignored_keys.insert(path.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

    let unknown: Vec<_> = ignored_keys
        .into_iter()
        .filter(|k| !k.starts_with('_') && !k.starts_with("x-"))
        .collect();
    if !unknown.is_empty() {
        if strict {
            return Err(ConfigError(format!("unknown config fields: {:?}", unknown)));
        }
        tracing::warn!(event = "config_unknown_fields", fields = ?unknown);
    }
    Ok(cfg)
}

pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(
        path,
        r#"# flakewatch configuration. Every key is optional.
database_path: test-history.db
retention_days: 90

# Flaky detection
flaky_min_observations: 5
flaky_threshold: 0.3

# Live feed (newline-delimited JSON over TCP)
realtime_enabled: true
realtime_host: 127.0.0.1
realtime_port: 8888
client_queue_capacity: 256

max_buffered_results: 100000
persist_timeout_ms: 10000
analyzer_cache_entries: 1024

# Failure analysis: local | openai | http
ai_provider: local
ai_model: gpt-4o-mini
# ai_endpoint: https://analysis.internal/v1/analyze
ai_api_key_env: FLAKEWATCH_AI_API_KEY
provider_timeout_ms: 5000

log_level: info
"#,
    )
    .map_err(|e| ConfigError(format!("failed to write sample config: {}", e)))?;
    Ok(())
}
