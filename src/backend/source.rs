//! Provider-backed construction of the backend modules.

use super::{
    BackendModules, BackendSource, IntentBackend, KnowledgeEngineFactory, ProviderGrounding,
    ProviderIntentBackend, WebSearchGrounding,
};
use crate::config::AssistantConfig;
use crate::error::ApiError;
use crate::provider::{DeferredClient, ModelProviderClient};
use std::sync::Arc;
use tracing::{info, warn};

/// Builds the real backend from configuration.
///
/// Missing credentials do not fail the load: the wiki path stays usable,
/// classification falls back to heuristics and engine initialization
/// reports `MissingCredentials` until a key appears. The provider client is
/// resolved on use, so no reload is needed once it does.
pub struct ProviderBackendSource {
    config: AssistantConfig,
}

impl ProviderBackendSource {
    pub fn new(config: AssistantConfig) -> Self {
        Self { config }
    }
}

impl BackendSource for ProviderBackendSource {
    fn load(&self) -> Result<BackendModules, ApiError> {
        let client = Arc::new(DeferredClient::new(self.config.provider.clone()));
        let credentials = match client.resolve() {
            Ok(_) => true,
            Err(ApiError::MissingCredentials(msg)) => {
                warn!(reason = %msg, "No provider credentials yet; guide answers disabled until a key is set");
                false
            }
            Err(e) => return Err(e),
        };

        if !self.config.index.dir.is_dir() {
            warn!(dir = %self.config.index.dir.display(), "Index directory does not exist");
        }

        let shared: Arc<dyn ModelProviderClient> = client.clone();
        let grounding = self.config.grounding.enabled.then(|| {
            Arc::new(ProviderGrounding::new(Arc::clone(&shared))) as Arc<dyn WebSearchGrounding>
        });

        info!(
            provider = ?self.config.provider.provider_type,
            model = %self.config.provider.model,
            credentials,
            grounding = grounding.is_some(),
            "Backend modules loaded"
        );

        Ok(BackendModules {
            engines: Arc::new(KnowledgeEngineFactory::new(
                self.config.index.dir.clone(),
                client,
            )),
            classifier: Some(Arc::new(ProviderIntentBackend::new(shared)) as Arc<dyn IntentBackend>),
            grounding,
        })
    }
}
