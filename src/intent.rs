//! IntentClassifier: decides whether a query is a wiki lookup or a guide
//! question, and produces the rewritten query used for retrieval.

use crate::error::ApiError;
use crate::fallback::{FailureClass, FallbackRouter};
use crate::loader::ModuleLoader;
use crate::sites::SiteTable;
use crate::types::{GameContext, SearchMode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const WIKI_KEYWORDS: &[&str] = &["是什么", "what is", "wiki", "介绍", "info"];
const GUIDE_KEYWORDS: &[&str] = &["怎么", "如何", "how to", "guide", "推荐", "best"];

pub const HEURISTIC_CONFIDENCE: f32 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentType {
    Wiki,
    Guide,
    Unsupported,
}

/// Outcome of classification. Produced once per query and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryIntent {
    pub intent_type: IntentType,
    /// In [0, 1]
    pub confidence: f32,
    pub rewritten_query: String,
    pub translated_query: String,
}

impl QueryIntent {
    pub fn new(
        intent_type: IntentType,
        confidence: f32,
        rewritten_query: impl Into<String>,
        translated_query: impl Into<String>,
    ) -> Self {
        Self {
            intent_type,
            confidence: confidence.clamp(0.0, 1.0),
            rewritten_query: rewritten_query.into(),
            translated_query: translated_query.into(),
        }
    }

    fn passthrough(intent_type: IntentType, confidence: f32, query: &str) -> Self {
        Self::new(intent_type, confidence, query, query)
    }
}

/// Keyword-majority fallback. Case-insensitive substring counts; ties,
/// including no hits at all, go to guide.
pub fn heuristic_intent(query: &str) -> QueryIntent {
    let lowered = query.to_lowercase();
    let hits = |keywords: &[&str]| keywords.iter().filter(|k| lowered.contains(*k)).count();
    let intent_type = if hits(WIKI_KEYWORDS) > hits(GUIDE_KEYWORDS) {
        IntentType::Wiki
    } else {
        IntentType::Guide
    };
    QueryIntent::passthrough(intent_type, HEURISTIC_CONFIDENCE, query)
}

pub struct IntentClassifier {
    loader: Arc<ModuleLoader>,
    sites: Arc<SiteTable>,
    timeout: Duration,
}

impl IntentClassifier {
    pub fn new(loader: Arc<ModuleLoader>, sites: Arc<SiteTable>, timeout: Duration) -> Self {
        Self {
            loader,
            sites,
            timeout,
        }
    }

    /// Classify `query` for `context` under `mode`.
    ///
    /// Only a rate-limit error escapes; every other backend failure, and
    /// running out of time, degrades to [`heuristic_intent`].
    pub async fn classify(
        &self,
        query: &str,
        context: Option<&GameContext>,
        mode: SearchMode,
    ) -> Result<QueryIntent, ApiError> {
        match mode {
            SearchMode::Wiki => return Ok(QueryIntent::passthrough(IntentType::Wiki, 1.0, query)),
            SearchMode::Ai => return Ok(QueryIntent::passthrough(IntentType::Guide, 1.0, query)),
            SearchMode::Auto => {}
        }

        let Some(context) = self.sites.effective_context(context) else {
            return Ok(heuristic_intent(query));
        };

        if !self.sites.is_supported(context) {
            info!(context = %context, "Context has no engine or wiki mapping");
            return Ok(QueryIntent::passthrough(IntentType::Unsupported, 1.0, query));
        }

        match tokio::time::timeout(self.timeout, self.classify_remote(query, context)).await {
            Ok(Ok(intent)) => Ok(intent),
            Ok(Err(err)) if FallbackRouter::classify(&err) == FailureClass::RateLimited => Err(err),
            Ok(Err(err)) => {
                debug!(error = %err, "Backend classification failed; using keyword heuristic");
                Ok(heuristic_intent(query))
            }
            Err(_) => {
                debug!(timeout_ms = self.timeout.as_millis() as u64, "Classification timed out; using keyword heuristic");
                Ok(heuristic_intent(query))
            }
        }
    }

    async fn classify_remote(
        &self,
        query: &str,
        context: &GameContext,
    ) -> Result<QueryIntent, ApiError> {
        if !self.loader.ensure_loaded_async().await {
            return Err(self.loader.last_error().unwrap_or_else(|| {
                ApiError::ClassificationFailed("backend not loaded".to_string())
            }));
        }
        let classifier = self
            .loader
            .modules()
            .and_then(|m| m.classifier.clone())
            .ok_or_else(|| ApiError::MissingCredentials("no classifier configured".to_string()))?;
        classifier.classify_intent(query, context).await
    }
}
