//! Backend contracts.
//!
//! The query subsystem only talks to retrieval, generation and
//! classification through these traits. `BackendSource` is the heavyweight
//! construction step the `ModuleLoader` runs once; it yields the factories
//! every other component shares.

use crate::error::ApiError;
use crate::intent::QueryIntent;
use crate::provider::CompletionStream;
use crate::types::{EngineKey, GameContext};
use async_trait::async_trait;
use std::sync::Arc;

pub mod classifier;
pub mod grounding;
pub mod knowledge;
pub mod source;

pub use classifier::ProviderIntentBackend;
pub use grounding::ProviderGrounding;
pub use knowledge::{KnowledgeEngine, KnowledgeEngineFactory, KnowledgeIndex, Passage};
pub use source::ProviderBackendSource;

/// Lazy sequence of generated text. Dropping it closes the upstream.
pub type ChunkStream = CompletionStream;

/// A fully constructed retrieval and generation engine bound to one key.
#[async_trait]
pub trait Engine: Send + Sync {
    fn key(&self) -> &EngineKey;

    /// Retrieve up to `top_k` passages for `query` and stream an answer.
    ///
    /// May fail before the first chunk or mid-stream.
    async fn query_stream(
        &self,
        query: &str,
        top_k: usize,
        context: Option<&GameContext>,
    ) -> Result<ChunkStream, ApiError>;
}

/// Builds engines. Construction may take seconds.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn initialize(&self, key: &EngineKey) -> Result<Arc<dyn Engine>, ApiError>;
}

/// Remote intent classification.
#[async_trait]
pub trait IntentBackend: Send + Sync {
    async fn classify_intent(
        &self,
        query: &str,
        context: &GameContext,
    ) -> Result<QueryIntent, ApiError>;
}

/// Opt-in answer generation from web search, used once the engine path is
/// exhausted.
#[async_trait]
pub trait WebSearchGrounding: Send + Sync {
    async fn search_and_generate_stream(
        &self,
        query: &str,
        rewritten_query: &str,
        context: Option<&GameContext>,
    ) -> Result<ChunkStream, ApiError>;
}

/// Everything the loader produces.
#[derive(Clone)]
pub struct BackendModules {
    pub engines: Arc<dyn EngineFactory>,
    /// `None` when no credentials are configured
    pub classifier: Option<Arc<dyn IntentBackend>>,
    pub grounding: Option<Arc<dyn WebSearchGrounding>>,
}

impl std::fmt::Debug for BackendModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendModules")
            .field("classifier", &self.classifier.is_some())
            .field("grounding", &self.grounding.is_some())
            .finish()
    }
}

/// One-shot, blocking construction of the backend. Runs on a worker thread.
pub trait BackendSource: Send + Sync {
    fn load(&self) -> Result<BackendModules, ApiError>;
}
