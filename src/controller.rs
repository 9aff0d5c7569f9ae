//! Controller: composition root and the presentation layer's entry point.
//!
//! Keeps at most one pipeline active. A new submission cancels the current
//! pipeline at once (its queued events are dropped at the sink) and hands
//! the new one to a single dispatcher task. The dispatcher takes pipelines
//! in submission order and starts each only after the one before it has
//! reached a terminal state.

use crate::backend::{BackendSource, Engine, ProviderBackendSource};
use crate::config::AssistantConfig;
use crate::engine::{EngineRegistry, WaitError};
use crate::error::ApiError;
use crate::events::{CancelledPipelines, EventBus, EventReceiver};
use crate::intent::IntentClassifier;
use crate::loader::ModuleLoader;
use crate::pipeline::{
    abandon, PendingQuery, PipelineHandle, PipelineState, QueryPipeline, QueryRequest,
    QueryServices, StateTransition,
};
use crate::sites::SiteTable;
use crate::types::{EngineKey, GameContext, PipelineId, SearchMode};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TRANSITION_CHANNEL_CAPACITY: usize = 64;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct Controller {
    services: Arc<QueryServices>,
    cancelled: CancelledPipelines,
    /// Most recently submitted pipeline, running or waiting to start
    current: Mutex<Option<PipelineHandle>>,
    dispatch: UnboundedSender<QueryPipeline>,
}

impl Controller {
    /// Build a controller over the provider-backed backend.
    pub fn from_config(config: &AssistantConfig) -> Result<(Self, EventReceiver), ApiError> {
        Self::new(config, Arc::new(ProviderBackendSource::new(config.clone())))
    }

    /// Build a controller over an arbitrary backend. Must be called from
    /// inside a Tokio runtime.
    pub fn new(
        config: &AssistantConfig,
        source: Arc<dyn BackendSource>,
    ) -> Result<(Self, EventReceiver), ApiError> {
        let runtime = Handle::try_current().map_err(|e| {
            ApiError::ConfigError(format!("controller needs a Tokio runtime: {}", e))
        })?;
        let settings = config.query.clone();
        settings.validate().map_err(ApiError::ConfigError)?;

        let loader = ModuleLoader::new(source);
        let sites = Arc::new(SiteTable::from_config(config));
        let registry = EngineRegistry::new(
            Arc::clone(&loader),
            runtime.clone(),
            settings.engine_init_timeout(),
        );
        let classifier = IntentClassifier::new(
            Arc::clone(&loader),
            Arc::clone(&sites),
            settings.classification_timeout(),
        );

        let cancelled = CancelledPipelines::default();
        let (events, receiver) = EventBus::with_cancelled(cancelled.clone());
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);

        let services = Arc::new(QueryServices::new(
            classifier,
            registry,
            loader,
            sites,
            settings,
            events,
            transitions,
        ));

        let (dispatch, queue) = unbounded_channel();
        runtime.spawn(run_dispatcher(queue));

        Ok((
            Self {
                services,
                cancelled,
                current: Mutex::new(None),
                dispatch,
            },
            receiver,
        ))
    }

    /// Start answering `text`. Returns immediately; progress arrives on the
    /// event channel tagged with the returned id.
    pub fn submit_query(
        &self,
        text: impl Into<String>,
        context: Option<GameContext>,
        mode: SearchMode,
    ) -> PipelineId {
        // Held across id allocation and enqueue so ids, retirement and start
        // order all follow the same sequence
        let mut current = self.current.lock();
        let pipeline = QueryPipeline::new(
            QueryRequest {
                text: text.into(),
                context,
                mode,
            },
            Arc::clone(&self.services),
        );
        let handle = pipeline.handle();
        let id = handle.id;

        if let Some(previous) = current.replace(handle) {
            self.retire(&previous);
        }
        debug!(pipeline_id = %id, mode = mode.as_str(), "Query submitted");

        if let Err(rejected) = self.dispatch.send(pipeline) {
            warn!(pipeline_id = %id, "Dispatcher stopped; dropping query");
            abandon(rejected.0);
        }
        id
    }

    /// Cancel whatever is running. Its remaining events are suppressed.
    pub fn cancel_current(&self) {
        if let Some(current) = self.current.lock().as_ref() {
            if !current.state().is_terminal() {
                self.retire(current);
            }
        }
    }

    fn retire(&self, handle: &PipelineHandle) {
        handle.cancel.cancel();
        self.cancelled.mark(handle.id);
        debug!(pipeline_id = %handle.id, "Pipeline cancelled by owner");
    }

    /// Warm the engine for a newly focused window.
    ///
    /// Returns the engine key being prepared, if the window maps to one.
    pub fn observe_context(&self, window_title: &str) -> Option<EngineKey> {
        let context = GameContext::new(window_title);
        if self.services.sites.is_ignored(&context) {
            return None;
        }
        let key = self.services.sites.engine_key_for_context(&context)?;
        info!(context = %context, engine_key = %key, "Warming engine for context");
        self.services.registry.get_or_init(&key);
        Some(key)
    }

    /// Start loading the backend without waiting for it.
    pub fn preload(&self) {
        self.services.loader.preload();
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.services.transitions.subscribe()
    }

    /// Id and state of the most recently submitted pipeline.
    pub fn active_state(&self) -> Option<(PipelineId, PipelineState)> {
        self.current.lock().as_ref().map(|h| (h.id, h.state()))
    }

    pub fn pending_query(&self) -> Option<PendingQuery> {
        self.services.pending_query()
    }

    /// Engine for `key`, blocking the calling thread for at most the
    /// configured `blocking_wait_ms`. Must not be called from a runtime
    /// worker thread.
    pub fn engine_blocking(&self, key: &EngineKey) -> Result<Arc<dyn Engine>, WaitError> {
        self.services
            .registry
            .get_or_init_blocking(key, self.services.settings.blocking_wait())
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.services.registry
    }

    pub fn sites(&self) -> &SiteTable {
        &self.services.sites
    }

    /// Resolve once the most recent submission has reached a terminal state.
    ///
    /// Earlier submissions are terminal by then too, since each one finishes
    /// before the next is started.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self
                .current
                .lock()
                .as_ref()
                .map(|h| h.state().is_terminal())
                .unwrap_or(true);
            if idle {
                return;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// Cancel the active pipeline, wait for it to stop and release the engine.
    pub async fn shutdown(&self) {
        self.cancel_current();
        self.wait_idle().await;
        self.services.registry.shutdown();
        info!("Controller shut down");
    }
}

/// Start pipelines one at a time, in the order they were submitted.
///
/// Runs until the controller drops its sender.
async fn run_dispatcher(mut queue: UnboundedReceiver<QueryPipeline>) {
    let mut running: Option<JoinHandle<PipelineState>> = None;
    while let Some(pipeline) = queue.recv().await {
        if let Some(previous) = running.take() {
            if let Err(e) = previous.await {
                warn!(error = %e, "Previous pipeline task ended abnormally");
            }
        }
        let handle = pipeline.handle();
        if handle.cancel.is_cancelled() {
            abandon(pipeline);
            continue;
        }
        running = Some(tokio::spawn(async move {
            match AssertUnwindSafe(pipeline.run()).catch_unwind().await {
                Ok(state) => state,
                Err(_) => {
                    warn!(pipeline_id = %handle.id, "Pipeline task panicked");
                    handle.mark_failed()
                }
            }
        }));
    }
    debug!("Pipeline dispatcher stopped");
}
