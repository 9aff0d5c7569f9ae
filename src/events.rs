//! Presentation event channel.
//!
//! One-directional and fire-and-forget: pipelines never wait on the
//! presentation layer. The receiving end drops every envelope whose
//! pipeline has been cancelled, including envelopes queued before the
//! cancellation.
//!
//! Pipeline ids only grow and an owner retires pipelines in submission
//! order, so cancellation is tracked as a single watermark.

use crate::intent::QueryIntent;
use crate::types::PipelineId;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantEvent {
    IntentDetected { intent: QueryIntent },
    WikiResult { url: String, title: String },
    StreamChunk { text: String },
    StreamFinished,
    /// Transient status, e.g. waiting for an engine or switching to wiki
    Notice { message: String },
    Error { message: String },
}

impl AssistantEvent {
    /// Events after which the pipeline emits nothing more.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AssistantEvent::WikiResult { .. } | AssistantEvent::StreamFinished | AssistantEvent::Error { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub ts: String,
    pub pipeline: PipelineId,
    pub event: AssistantEvent,
}

impl EventEnvelope {
    pub fn with_now(pipeline: PipelineId, event: AssistantEvent) -> Self {
        Self {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            pipeline,
            event,
        }
    }
}

/// Pipelines whose events must no longer reach the presentation layer.
#[derive(Debug, Clone, Default)]
pub struct CancelledPipelines {
    /// Every id below this is cancelled
    floor: Arc<AtomicU64>,
}

impl CancelledPipelines {
    /// Cancel `id` together with every pipeline submitted before it.
    pub fn mark(&self, id: PipelineId) {
        self.floor.fetch_max(id.as_u64() + 1, Ordering::SeqCst);
    }

    pub fn contains(&self, id: PipelineId) -> bool {
        id.as_u64() < self.floor.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: UnboundedSender<EventEnvelope>,
}

impl EventBus {
    pub fn new_pair() -> (Self, EventReceiver) {
        let cancelled = CancelledPipelines::default();
        Self::with_cancelled(cancelled)
    }

    pub fn with_cancelled(cancelled: CancelledPipelines) -> (Self, EventReceiver) {
        let (sender, receiver) = unbounded_channel();
        (
            Self { sender },
            EventReceiver {
                receiver,
                cancelled,
            },
        )
    }

    /// Send without waiting. A closed receiver only means nobody is
    /// listening any more.
    pub fn emit(&self, pipeline: PipelineId, event: AssistantEvent) {
        if self.sender.send(EventEnvelope::with_now(pipeline, event)).is_err() {
            debug!(pipeline_id = %pipeline, "Event receiver closed; dropping event");
        }
    }
}

pub struct EventReceiver {
    receiver: UnboundedReceiver<EventEnvelope>,
    cancelled: CancelledPipelines,
}

impl EventReceiver {
    pub fn cancelled(&self) -> CancelledPipelines {
        self.cancelled.clone()
    }

    /// Next deliverable envelope; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            let envelope = self.receiver.recv().await?;
            if !self.cancelled.contains(envelope.pipeline) {
                return Some(envelope);
            }
        }
    }

    /// Non-blocking variant of [`EventReceiver::recv`].
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        while let Ok(envelope) = self.receiver.try_recv() {
            if !self.cancelled.contains(envelope.pipeline) {
                return Some(envelope);
            }
        }
        None
    }
}
