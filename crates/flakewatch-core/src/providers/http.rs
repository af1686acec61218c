use super::{AnalysisProvider, AnalysisRequest, AnalysisResponse};
use async_trait::async_trait;

/// Posts the request as JSON to a fixed endpoint and expects an
/// `AnalysisResponse`-shaped JSON body back.
pub struct HttpProvider {
    pub endpoint: String,
    pub bearer_token: Option<String>,
    pub client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(endpoint: String, bearer_token: Option<String>) -> Self {
        Self {
            endpoint,
            bearer_token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AnalysisProvider for HttpProvider {
    async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AnalysisResponse> {
        let mut req = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.bearer_token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            anyhow::bail!("analysis endpoint returned {}: {}", status, error_text);
        }
        Ok(resp.json().await?)
    }

    fn provider_name(&self) -> &'static str {
        "http"
    }
}
