//! File-backed knowledge engine.
//!
//! Each engine key owns `<index_dir>/<key>.json`, an array of passages.
//! Retrieval ranks passages by term overlap with the query; the best
//! `top_k` are handed to the model as grounding for a streamed answer.

use super::{ChunkStream, Engine, EngineFactory};
use crate::error::ApiError;
use crate::provider::{ChatMessage, CompletionOptions, DeferredClient, ModelProviderClient};
use crate::types::{EngineKey, GameContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone)]
struct IndexedPassage {
    passage: Passage,
    title_terms: HashSet<String>,
    body_terms: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct KnowledgeIndex {
    passages: Vec<IndexedPassage>,
}

impl KnowledgeIndex {
    pub fn new(passages: Vec<Passage>) -> Self {
        let passages = passages
            .into_iter()
            .map(|passage| IndexedPassage {
                title_terms: terms(&passage.title),
                body_terms: terms(&passage.content),
                passage,
            })
            .collect();
        Self { passages }
    }

    /// Load the index file for `key`. A missing file is `IndexUnavailable`.
    pub fn load(index_dir: &Path, key: &EngineKey) -> Result<Self, ApiError> {
        let path = index_path(index_dir, key);
        if !path.is_file() {
            return Err(ApiError::IndexUnavailable(key.to_string()));
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            ApiError::IndexUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let passages: Vec<Passage> = serde_json::from_str(&raw).map_err(|e| {
            ApiError::IndexUnavailable(format!("{}: malformed index: {}", path.display(), e))
        })?;
        Ok(Self::new(passages))
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Passages sharing at least one term with `query`, best first.
    /// Title hits count double.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<&Passage> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(usize, &Passage)> = self
            .passages
            .iter()
            .filter_map(|p| {
                let score: usize = query_terms
                    .iter()
                    .map(|t| 2 * usize::from(p.title_terms.contains(t)) + usize::from(p.body_terms.contains(t)))
                    .sum();
                (score > 0).then_some((score, &p.passage))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(top_k).map(|(_, p)| p).collect()
    }
}

fn index_path(index_dir: &Path, key: &EngineKey) -> PathBuf {
    index_dir.join(format!("{}.json", key.as_str()))
}

/// Lower-cased ASCII words plus single non-ASCII characters, so CJK text
/// (no spaces between words) still overlaps character-wise.
fn terms(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut word = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            word.push(ch.to_ascii_lowercase());
            continue;
        }
        if !word.is_empty() {
            out.insert(std::mem::take(&mut word));
        }
        if !ch.is_ascii() && ch.is_alphanumeric() {
            out.insert(ch.to_lowercase().collect());
        }
    }
    if !word.is_empty() {
        out.insert(word);
    }
    out
}

pub struct KnowledgeEngine {
    key: EngineKey,
    index: KnowledgeIndex,
    client: Arc<dyn ModelProviderClient>,
}

impl KnowledgeEngine {
    pub fn new(key: EngineKey, index: KnowledgeIndex, client: Arc<dyn ModelProviderClient>) -> Self {
        Self { key, index, client }
    }

    fn build_messages(&self, query: &str, passages: &[&Passage], context: Option<&GameContext>) -> Vec<ChatMessage> {
        let game = context.map(|c| c.as_str()).unwrap_or(self.key.as_str());
        let system = format!(
            "You are a game guide assistant for {}. Answer using only the reference passages. \
             Reply in the language of the question. Be concise and concrete.",
            game
        );
        let mut user = String::from("Reference passages:\n");
        for (i, p) in passages.iter().enumerate() {
            user.push_str(&format!("\n[{}] {}\n{}\n", i + 1, p.title, p.content));
        }
        user.push_str(&format!("\nQuestion: {}", query));
        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}

#[async_trait]
impl Engine for KnowledgeEngine {
    fn key(&self) -> &EngineKey {
        &self.key
    }

    async fn query_stream(
        &self,
        query: &str,
        top_k: usize,
        context: Option<&GameContext>,
    ) -> Result<ChunkStream, ApiError> {
        let passages = self.index.search(query, top_k);
        debug!(engine_key = %self.key, hits = passages.len(), "Retrieved passages");
        if passages.is_empty() {
            // Nothing to ground on: an empty answer lets the caller fall back
            return Ok(Box::pin(futures::stream::empty()));
        }
        let messages = self.build_messages(query, &passages, context);
        self.client.stream(messages, CompletionOptions::default()).await
    }
}

/// Builds `KnowledgeEngine`s from index files.
///
/// Credentials are checked on every initialization, so a failed attempt
/// reports `MissingCredentials` and a later one succeeds once a key exists.
pub struct KnowledgeEngineFactory {
    index_dir: PathBuf,
    client: Arc<DeferredClient>,
}

impl KnowledgeEngineFactory {
    pub fn new(index_dir: PathBuf, client: Arc<DeferredClient>) -> Self {
        Self { index_dir, client }
    }
}

#[async_trait]
impl EngineFactory for KnowledgeEngineFactory {
    async fn initialize(&self, key: &EngineKey) -> Result<Arc<dyn Engine>, ApiError> {
        let client = self.client.resolve().map_err(|e| match e {
            ApiError::MissingCredentials(msg) => ApiError::MissingCredentials(format!(
                "no provider credentials for engine '{}': {}",
                key, msg
            )),
            other => other,
        })?;

        let dir = self.index_dir.clone();
        let owned_key = key.clone();
        let index = tokio::task::spawn_blocking(move || KnowledgeIndex::load(&dir, &owned_key))
            .await
            .map_err(|e| ApiError::ProviderError(format!("index loader panicked: {}", e)))??;

        info!(engine_key = %key, passages = index.len(), "Knowledge engine ready");
        Ok(Arc::new(KnowledgeEngine::new(key.clone(), index, client)))
    }
}
