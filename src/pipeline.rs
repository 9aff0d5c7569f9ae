//! QueryPipeline: one submitted query, from classification to a terminal
//! state.
//!
//! ```text
//! Created -> ClassifyingIntent -> PreparingWikiUrl ----------------> Completed
//!                              -> AwaitingEngine -> Generating ----> Completed
//!                                        \              \
//!                                         +-> grounding / wiki fallback
//! any non-terminal state -> Cancelled | Failed
//! ```
//!
//! Cancellation is cooperative: the flag is checked after every await and
//! before every emission, and a cancelled pipeline emits nothing further.

use crate::backend::{Engine, WebSearchGrounding};
use crate::cancel::CancellationFlag;
use crate::config::QuerySettings;
use crate::engine::{EngineLookup, EngineRegistry, WaitError};
use crate::events::{AssistantEvent, EventBus};
use crate::fallback::{compound_error, FallbackAction, FallbackRouter};
use crate::intent::{IntentClassifier, IntentType, QueryIntent};
use crate::loader::ModuleLoader;
use crate::sites::SiteTable;
use crate::stream::{StreamOutcome, StreamSession};
use crate::types::{EngineKey, GameContext, PipelineId, SearchMode};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const NOTICE_ENGINE_WARMING: &str = "Preparing the guide engine for this game, please wait...";
const NOTICE_ENGINE_DEGRADED: &str = "The guide engine is unavailable; falling back to wiki search.";
const NOTICE_GROUNDING: &str = "No guide answer found; searching the web instead...";
const NOTICE_WIKI_FALLBACK: &str = "Switching to wiki search.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Created,
    ClassifyingIntent,
    PreparingWikiUrl,
    AwaitingEngine,
    Generating,
    Completed,
    Cancelled,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Cancelled | PipelineState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub pipeline: PipelineId,
    pub from: PipelineState,
    pub to: PipelineState,
}

/// The query parked while its engine is still being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuery {
    pub pipeline: PipelineId,
    pub engine_key: EngineKey,
    pub query: String,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub context: Option<GameContext>,
    pub mode: SearchMode,
}

/// Collaborators shared by every pipeline of one controller.
pub struct QueryServices {
    pub classifier: IntentClassifier,
    pub registry: Arc<EngineRegistry>,
    pub loader: Arc<ModuleLoader>,
    pub sites: Arc<SiteTable>,
    pub router: FallbackRouter,
    pub settings: QuerySettings,
    pub events: EventBus,
    pub transitions: broadcast::Sender<StateTransition>,
    pending: Mutex<Option<PendingQuery>>,
}

impl QueryServices {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        classifier: IntentClassifier,
        registry: Arc<EngineRegistry>,
        loader: Arc<ModuleLoader>,
        sites: Arc<SiteTable>,
        settings: QuerySettings,
        events: EventBus,
        transitions: broadcast::Sender<StateTransition>,
    ) -> Self {
        Self {
            classifier,
            registry,
            loader,
            sites,
            router: FallbackRouter::new(settings.stream_retries),
            settings,
            events,
            transitions,
            pending: Mutex::new(None),
        }
    }

    pub fn pending_query(&self) -> Option<PendingQuery> {
        self.pending.lock().clone()
    }

    fn grounding(&self) -> Option<Arc<dyn WebSearchGrounding>> {
        self.loader.modules().and_then(|m| m.grounding.clone())
    }
}

/// Cheap view of a pipeline for its owner.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    pub id: PipelineId,
    pub cancel: CancellationFlag,
    state: Arc<Mutex<PipelineState>>,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Settle a pipeline whose task died without reaching a terminal state.
    pub(crate) fn mark_failed(&self) -> PipelineState {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = PipelineState::Failed;
        }
        *state
    }
}

pub struct QueryPipeline {
    id: PipelineId,
    request: QueryRequest,
    cancel: CancellationFlag,
    state: Arc<Mutex<PipelineState>>,
    services: Arc<QueryServices>,
}

impl QueryPipeline {
    pub fn new(request: QueryRequest, services: Arc<QueryServices>) -> Self {
        Self {
            id: PipelineId::next(),
            request,
            cancel: CancellationFlag::new(),
            state: Arc::new(Mutex::new(PipelineState::Created)),
            services,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            id: self.id,
            cancel: self.cancel.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Drive the pipeline to a terminal state and return it.
    pub async fn run(self) -> PipelineState {
        if self.cancelled() {
            return self.finish_cancelled();
        }
        self.transition(PipelineState::ClassifyingIntent);

        let query = self.request.text.trim().to_string();
        if query.is_empty() {
            return self.fail("Please enter a question.".to_string());
        }

        let classified = self
            .services
            .classifier
            .classify(&query, self.request.context.as_ref(), self.request.mode)
            .await;
        if self.cancelled() {
            return self.finish_cancelled();
        }
        let intent = match classified {
            Ok(intent) => intent,
            Err(err) => {
                warn!(pipeline_id = %self.id, error = %err, "Classification failed");
                return self.fail(FallbackRouter::user_message(&err));
            }
        };

        info!(
            pipeline_id = %self.id,
            intent = ?intent.intent_type,
            confidence = intent.confidence,
            "Intent detected"
        );
        self.emit(AssistantEvent::IntentDetected {
            intent: intent.clone(),
        });

        let context = self
            .services
            .sites
            .effective_context(self.request.context.as_ref())
            .cloned();

        match intent.intent_type {
            IntentType::Unsupported => {
                let title = context.as_ref().map(|c| c.as_str()).unwrap_or("this window");
                self.fail(format!(
                    "Unsupported context: no wiki or guide is configured for '{}'.",
                    title
                ))
            }
            IntentType::Wiki => self.redirect_to_wiki(context.as_ref(), &query, None),
            IntentType::Guide => self.answer_guide(context.as_ref(), &intent).await,
        }
    }

    async fn answer_guide(&self, context: Option<&GameContext>, intent: &QueryIntent) -> PipelineState {
        let Some(key) = context.and_then(|c| self.services.sites.engine_key_for_context(c)) else {
            debug!(pipeline_id = %self.id, "No engine for context");
            return self
                .exhaust(context, intent, "no guide engine for this game".to_string())
                .await;
        };

        self.transition(PipelineState::AwaitingEngine);
        let engine = match self.services.registry.get_or_init(&key) {
            EngineLookup::Ready(engine) => engine,
            EngineLookup::Pending => match self.await_engine(&key).await {
                Ok(engine) => engine,
                Err(WaitError::Cancelled) => return self.finish_cancelled(),
                Err(err) => {
                    if self.cancelled() {
                        return self.finish_cancelled();
                    }
                    warn!(pipeline_id = %self.id, engine_key = %key, error = %err, "Proceeding without engine");
                    self.emit(AssistantEvent::Notice {
                        message: NOTICE_ENGINE_DEGRADED.to_string(),
                    });
                    return self.exhaust(context, intent, err.to_string()).await;
                }
            },
        };
        if self.cancelled() {
            return self.finish_cancelled();
        }

        self.generate(engine, context, intent).await
    }

    async fn await_engine(&self, key: &EngineKey) -> Result<Arc<dyn Engine>, WaitError> {
        self.emit(AssistantEvent::Notice {
            message: NOTICE_ENGINE_WARMING.to_string(),
        });
        // Replaces whatever was parked before
        *self.services.pending.lock() = Some(PendingQuery {
            pipeline: self.id,
            engine_key: key.clone(),
            query: self.request.text.clone(),
        });

        let settings = &self.services.settings;
        let result = self
            .services
            .registry
            .wait_for(
                key,
                settings.engine_wait_timeout(),
                settings.engine_poll_interval(),
                &self.cancel,
            )
            .await;

        let mut pending = self.services.pending.lock();
        if pending.as_ref().map(|p| p.pipeline) == Some(self.id) {
            *pending = None;
        }
        result
    }

    async fn generate(
        &self,
        engine: Arc<dyn Engine>,
        context: Option<&GameContext>,
        intent: &QueryIntent,
    ) -> PipelineState {
        self.transition(PipelineState::Generating);
        let mut session = StreamSession::new(self.cancel.clone());
        let mut attempt = 0;

        loop {
            let outcome = match engine
                .query_stream(&intent.rewritten_query, self.services.settings.top_k, context)
                .await
            {
                Ok(stream) => {
                    session
                        .consume(stream, |text| {
                            self.emit(AssistantEvent::StreamChunk { text });
                        })
                        .await
                }
                Err(err) => StreamOutcome::Failed(err),
            };

            match outcome {
                StreamOutcome::Finished => return self.finish_stream(&session),
                StreamOutcome::Cancelled => return self.finish_cancelled(),
                StreamOutcome::Empty => {
                    if self.cancelled() {
                        return self.finish_cancelled();
                    }
                    return self
                        .exhaust(context, intent, "the guide engine found nothing relevant".to_string())
                        .await;
                }
                StreamOutcome::Failed(err) => {
                    if self.cancelled() {
                        return self.finish_cancelled();
                    }
                    match self.services.router.decide(&err, session.has_output(), attempt) {
                        FallbackAction::Retry => {
                            attempt += 1;
                            warn!(pipeline_id = %self.id, attempt, error = %err, "Retrying generation");
                        }
                        FallbackAction::Surface(message) => return self.fail(message),
                        FallbackAction::FallbackToWiki => {
                            return self.exhaust(context, intent, err.to_string()).await
                        }
                    }
                }
            }
        }
    }

    /// The engine path produced nothing usable: try grounding when it is
    /// enabled, then the wiki redirect with the rewritten query.
    async fn exhaust(
        &self,
        context: Option<&GameContext>,
        intent: &QueryIntent,
        reason: String,
    ) -> PipelineState {
        let mut reason = reason;
        if let Some(grounding) = self.services.grounding() {
            self.emit(AssistantEvent::Notice {
                message: NOTICE_GROUNDING.to_string(),
            });
            self.transition(PipelineState::Generating);
            let opened = grounding
                .search_and_generate_stream(&self.request.text, &intent.rewritten_query, context)
                .await;
            if self.cancelled() {
                return self.finish_cancelled();
            }

            let mut session = StreamSession::new(self.cancel.clone());
            let outcome = match opened {
                Ok(stream) => {
                    session
                        .consume(stream, |text| {
                            self.emit(AssistantEvent::StreamChunk { text });
                        })
                        .await
                }
                Err(err) => StreamOutcome::Failed(err),
            };
            match outcome {
                StreamOutcome::Finished => return self.finish_stream(&session),
                StreamOutcome::Cancelled => return self.finish_cancelled(),
                StreamOutcome::Empty => {}
                StreamOutcome::Failed(err) => {
                    // No retries here; only rate limits and partial answers stop the chain
                    match self.services.router.decide(&err, session.has_output(), usize::MAX) {
                        FallbackAction::Surface(message) => return self.fail(message),
                        FallbackAction::Retry | FallbackAction::FallbackToWiki => {
                            reason = format!("{}; web search failed: {}", reason, err);
                        }
                    }
                }
            }
        }

        if self.cancelled() {
            return self.finish_cancelled();
        }
        info!(pipeline_id = %self.id, reason = %reason, "Falling back to wiki search");
        self.emit(AssistantEvent::Notice {
            message: NOTICE_WIKI_FALLBACK.to_string(),
        });
        self.redirect_to_wiki(context, &intent.rewritten_query, Some(reason))
    }

    fn redirect_to_wiki(
        &self,
        context: Option<&GameContext>,
        query: &str,
        primary_failure: Option<String>,
    ) -> PipelineState {
        self.transition(PipelineState::PreparingWikiUrl);
        match self.services.sites.wiki_search(context, query) {
            Ok(search) => {
                self.emit(AssistantEvent::WikiResult {
                    url: search.url,
                    title: search.title,
                });
                self.transition(PipelineState::Completed)
            }
            Err(err) => {
                let message = match primary_failure {
                    Some(primary) => compound_error(&primary, &err),
                    None => err.to_string(),
                };
                self.fail(message)
            }
        }
    }

    fn finish_stream(&self, session: &StreamSession) -> PipelineState {
        debug!(pipeline_id = %self.id, output_chars = session.output_chars(), "Stream finished");
        self.emit(AssistantEvent::StreamFinished);
        self.transition(PipelineState::Completed)
    }

    fn finish_cancelled(&self) -> PipelineState {
        info!(pipeline_id = %self.id, "Pipeline cancelled");
        self.transition(PipelineState::Cancelled)
    }

    fn fail(&self, message: String) -> PipelineState {
        self.emit(AssistantEvent::Error { message });
        self.transition(PipelineState::Failed)
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drop the event once cancellation is visible.
    fn emit(&self, event: AssistantEvent) {
        if self.cancelled() {
            return;
        }
        self.services.events.emit(self.id, event);
    }

    fn transition(&self, to: PipelineState) -> PipelineState {
        let from = std::mem::replace(&mut *self.state.lock(), to);
        if from != to {
            debug!(pipeline_id = %self.id, from = ?from, to = ?to, "State transition");
            // Nobody subscribed is fine
            let _ = self.services.transitions.send(StateTransition {
                pipeline: self.id,
                from,
                to,
            });
        }
        to
    }
}

/// Mark a pipeline that was superseded before it ever ran.
pub(crate) fn abandon(pipeline: QueryPipeline) -> PipelineState {
    pipeline.finish_cancelled()
}
