//! Failure-text classification.
//!
//! `classify` is pure and local: normalize, look up by `lookup_key(normalized)`,
//! otherwise run the rule table. The signature hash covers the category too, so
//! the cache key and the signature identity are deliberately different values.
//! `classify_enriched` adds an optional provider round-trip on top.

pub mod normalize;
pub mod rules;

use crate::errors::ClassificationTimeout;
use crate::model::{ClassifiedError, Severity};
use crate::providers::{AnalysisProvider, AnalysisRequest};
use moka::sync::Cache;
use normalize::{lookup_key, signature_hash, truncate_chars, Normalizer, MAX_MESSAGE_CHARS};
use rules::{generic_suggestions, RuleSet, UNCLASSIFIED};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const LOCAL_SOURCE: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignature {
    pub category: String,
    pub severity: Severity,
    pub normalized_hash: String,
    pub normalized_message: String,
    pub error_type: Option<String>,
    pub suggested_actions: Vec<String>,
    pub doc_links: Vec<String>,
    /// Web searches for the exception name; empty when none was found.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_links: Vec<String>,
    pub provider_notes: Option<String>,
    /// "local" or the provider name that enriched it.
    pub source: String,
}

impl ErrorSignature {
    pub fn is_unclassified(&self) -> bool {
        self.category == UNCLASSIFIED
    }
}

fn search_links(error_type: &str) -> Vec<String> {
    vec![
        format!("https://stackoverflow.com/search?q={}+pytest", error_type),
        format!("https://github.com/search?q={}+language:Python&type=issues", error_type),
        format!("https://www.google.com/search?q={}+pytest+python", error_type),
    ]
}

impl From<&ErrorSignature> for ClassifiedError {
    fn from(sig: &ErrorSignature) -> Self {
        ClassifiedError {
            category: sig.category.clone(),
            severity: sig.severity,
            normalized_hash: sig.normalized_hash.clone(),
            message: sig.normalized_message.clone(),
        }
    }
}

pub struct PatternAnalyzer {
    normalizer: Normalizer,
    rules: RuleSet,
    local: Cache<String, Arc<ErrorSignature>>,
    enriched: Cache<String, Arc<ErrorSignature>>,
    provider: Option<Arc<dyn AnalysisProvider>>,
    provider_timeout: Duration,
}

impl PatternAnalyzer {
    pub fn new(cache_entries: u64) -> Result<Self, regex::Error> {
        Ok(Self::with_rules(Normalizer::new()?, RuleSet::defaults()?, cache_entries))
    }

    pub fn with_rules(normalizer: Normalizer, rules: RuleSet, cache_entries: u64) -> Self {
        Self {
            normalizer,
            rules,
            local: Cache::new(cache_entries),
            enriched: Cache::new(cache_entries),
            provider: None,
            provider_timeout: Duration::from_millis(5000),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn AnalysisProvider>, timeout: Duration) -> Self {
        self.provider = Some(provider);
        self.provider_timeout = timeout;
        self
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub fn provider_timeout(&self) -> Duration {
        self.provider_timeout
    }

    pub fn normalize(&self, raw: &str) -> String {
        self.normalizer.normalize(raw)
    }

    pub fn classify(&self, raw: &str) -> ErrorSignature {
        let normalized = self.normalizer.normalize(raw);
        let key = lookup_key(&normalized);
        let sig = self
            .local
            .get_with(key, || Arc::new(self.classify_normalized(normalized)));
        (*sig).clone()
    }

    pub fn classify_batch<S: AsRef<str>>(&self, texts: &[S]) -> Vec<ErrorSignature> {
        texts.iter().map(|t| self.classify(t.as_ref())).collect()
    }

    /// Rules, exception name and hash all see the full normalized text; only
    /// the stored message is capped.
    fn classify_normalized(&self, normalized: String) -> ErrorSignature {
        let error_type = self.normalizer.error_type(&normalized);
        let (category, severity, suggested_actions, doc_links) =
            match self.rules.first_match(&normalized) {
                Some(rule) => (
                    rule.category.clone(),
                    rule.severity,
                    rule.suggestions.clone(),
                    rule.docs.clone(),
                ),
                None => (
                    UNCLASSIFIED.to_string(),
                    Severity::Medium,
                    generic_suggestions(&normalized),
                    Vec::new(),
                ),
            };
        tracing::debug!(event = "error_classified", category = %category);
        ErrorSignature {
            normalized_hash: signature_hash(&category, &normalized),
            category,
            severity,
            normalized_message: truncate_chars(&normalized, MAX_MESSAGE_CHARS),
            search_links: error_type.as_deref().map(search_links).unwrap_or_default(),
            error_type,
            suggested_actions,
            doc_links,
            provider_notes: None,
            source: LOCAL_SOURCE.to_string(),
        }
    }

    /// Local classification, then the provider under a timeout. Any provider
    /// failure yields the local signature; only successes are cached.
    pub async fn classify_enriched(&self, raw: &str) -> ErrorSignature {
        let local = self.classify(raw);
        let Some(provider) = self.provider.as_ref() else {
            return local;
        };
        if let Some(hit) = self.enriched.get(&local.normalized_hash) {
            return (*hit).clone();
        }

        let request = AnalysisRequest {
            normalized_text: local.normalized_message.clone(),
            category: local.category.clone(),
            error_type: local.error_type.clone(),
        };
        match tokio::time::timeout(self.provider_timeout, provider.analyze(&request)).await {
            Ok(Ok(resp)) => {
                let mut sig = local.clone();
                if !resp.suggestions.is_empty() {
                    sig.suggested_actions = resp.suggestions;
                }
                sig.provider_notes = resp.notes;
                sig.source = provider.provider_name().to_string();
                let stored = self
                    .enriched
                    .entry(local.normalized_hash)
                    .or_insert(Arc::new(sig))
                    .into_value();
                (*stored).clone()
            }
            Ok(Err(e)) => {
                tracing::debug!(
                    event = "provider_failed",
                    provider = provider.provider_name(),
                    error = %e
                );
                local
            }
            Err(_) => {
                let timeout = ClassificationTimeout {
                    provider: provider.provider_name().to_string(),
                    after_ms: self.provider_timeout.as_millis() as u64,
                };
                tracing::warn!(event = "provider_timeout", error = %timeout);
                local
            }
        }
    }

    /// Approximate; moka applies writes lazily.
    pub fn cached_signatures(&self) -> u64 {
        self.local.run_pending_tasks();
        self.local.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> PatternAnalyzer {
        PatternAnalyzer::new(64).unwrap()
    }

    #[test]
    fn test_classify_is_idempotent() {
        let a = analyzer();
        let first = a.classify("AssertionError: expected 5 got 3");
        let second = a.classify("AssertionError: expected 5 got 3");
        assert_eq!(first, second);
        assert_eq!(first.category, "ASSERTION_FAILURE");
        assert_eq!(first.severity, Severity::High);
        assert_eq!(first.error_type.as_deref(), Some("AssertionError"));
        assert_eq!(first.source, LOCAL_SOURCE);
        assert!(!first.suggested_actions.is_empty());
    }

    #[test]
    fn test_noise_collapses_to_one_hash() {
        let a = analyzer();
        let x = a.classify("ConnectionError at 0x7fa1 in /srv/app/db.py:10 at 2024-05-01T10:00:00Z");
        let y = a.classify("ConnectionError at 0x1b2c in /opt/ci/db.py:99 at 2025-02-02T12:34:56Z");
        assert_eq!(x.normalized_hash, y.normalized_hash);
        assert_eq!(x.category, "CONNECTION_ERROR");
        assert_eq!(a.cached_signatures(), 1);
    }

    #[test]
    fn test_unclassified_defaults() {
        let sig = analyzer().classify("database returned null row");
        assert!(sig.is_unclassified());
        assert_eq!(sig.severity, Severity::Medium);
        assert!(sig.suggested_actions.iter().any(|s| s.contains("database")));
        assert!(sig.doc_links.is_empty());
        assert!(sig.search_links.is_empty());
    }

    fn traceback(last_line: &str) -> String {
        let mut text = String::from("    def test_order_totals(customer, basket):\n");
        for i in 0..16 {
            text.push_str(&format!(
                "app/orders/step_{i}.py:{line}: in step_{i}\n    return price_line(item, catalog[item.sku])\n",
                i = i,
                line = 20 + i
            ));
        }
        text.push_str(&format!("E       {}\n", last_line));
        text
    }

    #[test]
    fn test_long_traceback_classified_by_final_line() {
        let a = analyzer();
        let assertion = traceback("AssertionError: expected 5 got 3");
        let missing_key = traceback("KeyError: 'user_id'");
        assert!(assertion.len() > 2 * MAX_MESSAGE_CHARS);

        let x = a.classify(&assertion);
        let y = a.classify(&missing_key);
        assert_eq!(x.category, "ASSERTION_FAILURE");
        assert_eq!(x.error_type.as_deref(), Some("AssertionError"));
        assert_eq!(y.category, "KEY_ERROR");
        assert_eq!(y.error_type.as_deref(), Some("KeyError"));
        assert_ne!(x.normalized_hash, y.normalized_hash);

        assert_eq!(x.normalized_message.chars().count(), MAX_MESSAGE_CHARS);
        assert_eq!(ClassifiedError::from(&y).message.chars().count(), MAX_MESSAGE_CHARS);
        assert_eq!(
            x.normalized_hash,
            signature_hash("ASSERTION_FAILURE", &a.normalize(&assertion))
        );
    }

    #[test]
    fn test_same_prefix_different_tail_not_merged() {
        let a = analyzer();
        let first = a.classify(&traceback("KeyError: 'user_id'"));
        let second = a.classify(&traceback("KeyError: 'order_id'"));
        assert_eq!(first.category, second.category);
        assert_ne!(first.normalized_hash, second.normalized_hash);
        assert_eq!(a.cached_signatures(), 2);
    }

    #[test]
    fn test_search_links_from_error_type() {
        let sig = analyzer().classify("AttributeError: 'NoneType' object has no attribute 'id'");
        assert_eq!(sig.search_links.len(), 3);
        assert_eq!(
            sig.search_links[0],
            "https://stackoverflow.com/search?q=AttributeError+pytest"
        );
        assert!(sig.search_links.iter().all(|l| l.contains("AttributeError")));
    }

    #[test]
    fn test_hash_depends_on_category() {
        let a = analyzer();
        let sig = a.classify("KeyError: 'id'");
        assert_eq!(
            sig.normalized_hash,
            signature_hash("KEY_ERROR", &sig.normalized_message)
        );
    }

    #[test]
    fn test_batch_preserves_order() {
        let out = analyzer().classify_batch(&["KeyError: 'x'", "IndexError: list index out of range"]);
        assert_eq!(out[0].category, "KEY_ERROR");
        assert_eq!(out[1].category, "INDEX_ERROR");
    }

    #[test]
    fn test_classified_error_projection() {
        let sig = analyzer().classify("PermissionError: [Errno 13] Permission denied");
        let stored = ClassifiedError::from(&sig);
        assert_eq!(stored.category, "PERMISSION_ERROR");
        assert_eq!(stored.normalized_hash, sig.normalized_hash);
    }

    #[test]
    fn test_concurrent_classify_shares_one_entry() {
        let a = analyzer();
        let texts = [
            "ConnectionError at 0x7fa1 in /srv/app/db.py:10",
            "ConnectionError at 0x1b2c in /opt/ci/db.py:99",
        ];
        let sigs: Vec<ErrorSignature> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|i| {
                    let a = &a;
                    let text = texts[i % 2];
                    s.spawn(move || a.classify(text))
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(sigs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(a.cached_signatures(), 1);
    }
}
