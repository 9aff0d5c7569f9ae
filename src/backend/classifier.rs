//! Provider-backed intent classification.
//!
//! One model call translates, rewrites and classifies the query. The model
//! is asked for strict JSON; the reply is parsed leniently.

use super::IntentBackend;
use crate::error::ApiError;
use crate::intent::{IntentType, QueryIntent};
use crate::provider::{ChatMessage, CompletionOptions, ModelProviderClient};
use crate::types::GameContext;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_BACKEND_CONFIDENCE: f32 = 0.6;

pub struct ProviderIntentBackend {
    client: Arc<dyn ModelProviderClient>,
}

impl ProviderIntentBackend {
    pub fn new(client: Arc<dyn ModelProviderClient>) -> Self {
        Self { client }
    }
}

fn classification_prompt(query: &str, context: &GameContext) -> String {
    format!(
        r#"You process search queries for a game wiki and guide assistant.
The user is playing: {context}

For the query below:
1. Translate it to English if it is not English (translated_query).
2. Rewrite it into a concise retrieval query that keeps the game terms (rewritten_query).
3. Classify the intent:
   - "wiki": looking up a specific item, character, boss or mechanic ("what is", "info").
   - "guide": asking how to do something, for strategies, builds or recommendations.

Reply with JSON only:
{{"translated_query": "...", "rewritten_query": "...", "intent": "wiki|guide", "confidence": 0.0-1.0, "reasoning": "..."}}

Query: {query}"#,
        context = context.as_str(),
        query = query
    )
}

#[derive(Debug, Deserialize)]
struct ClassificationReply {
    #[serde(default)]
    translated_query: Option<String>,
    #[serde(default)]
    rewritten_query: Option<String>,
    intent: String,
    #[serde(default)]
    confidence: Option<f32>,
}

fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    text.strip_suffix("```").unwrap_or(text).trim()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse a model reply into a `QueryIntent`.
///
/// Takes the first `{...}` block, accepts only `wiki` and `guide`, clamps
/// confidence into [0, 1]. Missing rewrites fall back to the translation,
/// then to the original query.
pub fn parse_classification(reply: &str, query: &str) -> Result<QueryIntent, ApiError> {
    let body = strip_code_fence(reply);
    let start = body
        .find('{')
        .ok_or_else(|| ApiError::ClassificationFailed("reply contains no JSON object".to_string()))?;
    let end = body
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| ApiError::ClassificationFailed("unterminated JSON object".to_string()))?;

    let parsed: ClassificationReply = serde_json::from_str(&body[start..=end])
        .map_err(|e| ApiError::ClassificationFailed(format!("malformed reply: {}", e)))?;

    let intent_type = match parsed.intent.trim().to_lowercase().as_str() {
        "wiki" => IntentType::Wiki,
        "guide" => IntentType::Guide,
        other => {
            return Err(ApiError::ClassificationFailed(format!(
                "unexpected intent '{}'",
                other
            )))
        }
    };

    let translated = non_blank(parsed.translated_query).unwrap_or_else(|| query.to_string());
    let rewritten = non_blank(parsed.rewritten_query).unwrap_or_else(|| translated.clone());
    let confidence = parsed
        .confidence
        .filter(|c| c.is_finite())
        .unwrap_or(DEFAULT_BACKEND_CONFIDENCE)
        .clamp(0.0, 1.0);

    Ok(QueryIntent::new(intent_type, confidence, rewritten, translated))
}

#[async_trait]
impl IntentBackend for ProviderIntentBackend {
    async fn classify_intent(
        &self,
        query: &str,
        context: &GameContext,
    ) -> Result<QueryIntent, ApiError> {
        let messages = vec![ChatMessage::user(classification_prompt(query, context))];
        let options = CompletionOptions {
            temperature: Some(0.1),
            max_tokens: Some(400),
        };
        let response = self.client.complete(messages, options).await?;
        debug!(model = %response.model, "Classification reply received");
        parse_classification(&response.content, query)
    }
}
