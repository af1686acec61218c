use super::{AnalysisProvider, AnalysisRequest, AnalysisResponse};
use async_trait::async_trait;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_SUGGESTIONS: usize = 5;

pub struct OpenAiProvider {
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    pub client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(model: String, api_key: String) -> Self {
        Self {
            model,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

fn prompt(request: &AnalysisRequest) -> String {
    let mut p = format!(
        "A test failed. Category: {}\n",
        request.category
    );
    if let Some(t) = &request.error_type {
        p.push_str(&format!("Exception: {}\n", t));
    }
    p.push_str(&format!(
        "Failure text:\n{}\n\nReply with up to {} short remediation steps, one per line.",
        request.normalized_text, MAX_SUGGESTIONS
    ));
    p
}

/// Splits a free-text answer into suggestion lines, dropping list markers.
pub(crate) fn parse_suggestions(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| {
            l.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')', '-', '*', '•'])
                .trim()
        })
        .filter(|l| !l.is_empty())
        .take(MAX_SUGGESTIONS)
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl AnalysisProvider for OpenAiProvider {
    async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AnalysisResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt(request) }],
            "temperature": 0.0,
            "max_tokens": 300,
        });

        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI chat API error: {}", error_text);
        }

        let json: serde_json::Value = resp.json().await?;
        let text = json
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("OpenAI API response missing content"))?;

        Ok(AnalysisResponse {
            suggestions: parse_suggestions(text),
            notes: None,
        })
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}
