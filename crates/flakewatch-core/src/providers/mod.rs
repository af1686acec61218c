use crate::config::{AiProviderKind, EngineConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod fake;
pub mod http;
pub mod openai;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest {
    pub normalized_text: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// External failure analysis. Implementations may be slow or unavailable;
/// callers bound every call with a timeout and fall back to local rules.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AnalysisResponse>;
    fn provider_name(&self) -> &'static str;
}

/// `None` means local-only classification.
pub fn build_provider(cfg: &EngineConfig) -> anyhow::Result<Option<Arc<dyn AnalysisProvider>>> {
    match cfg.ai_provider {
        AiProviderKind::Local => Ok(None),
        AiProviderKind::OpenAi => {
            let Ok(key) = std::env::var(&cfg.ai_api_key_env) else {
                tracing::warn!(
                    event = "provider_disabled",
                    provider = "openai",
                    reason = "missing api key",
                    env = %cfg.ai_api_key_env
                );
                return Ok(None);
            };
            let mut client = openai::OpenAiProvider::new(cfg.ai_model.clone(), key);
            if let Some(endpoint) = &cfg.ai_endpoint {
                client = client.with_base_url(endpoint.clone());
            }
            Ok(Some(Arc::new(client)))
        }
        AiProviderKind::Http => {
            let endpoint = cfg
                .ai_endpoint
                .clone()
                .ok_or_else(|| anyhow::anyhow!("ai_provider 'http' requires ai_endpoint"))?;
            let token = std::env::var(&cfg.ai_api_key_env).ok();
            Ok(Some(Arc::new(http::HttpProvider::new(endpoint, token))))
        }
    }
}
