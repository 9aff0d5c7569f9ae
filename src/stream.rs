//! StreamConsumer: drains a generated answer into the caller.

use crate::backend::ChunkStream;
use crate::cancel::CancellationFlag;
use crate::error::ApiError;
use futures::StreamExt;
use tracing::debug;

/// Per-pipeline generation state. Never shared between pipelines.
#[derive(Debug)]
pub struct StreamSession {
    output_chars: usize,
    has_output: bool,
    cancel: CancellationFlag,
}

#[derive(Debug, Clone)]
pub enum StreamOutcome {
    /// Upstream ended after producing output
    Finished,
    /// Upstream ended without a single non-blank chunk
    Empty,
    Cancelled,
    Failed(ApiError),
}

impl StreamSession {
    pub fn new(cancel: CancellationFlag) -> Self {
        Self {
            output_chars: 0,
            has_output: false,
            cancel,
        }
    }

    pub fn has_output(&self) -> bool {
        self.has_output
    }

    pub fn output_chars(&self) -> usize {
        self.output_chars
    }

    /// Forward every non-blank chunk of `stream` to `forward`.
    ///
    /// Cancellation is checked before each pull and again before each
    /// forward; on cancellation the upstream is dropped right away, which
    /// closes the underlying connection.
    pub async fn consume<F>(&mut self, mut stream: ChunkStream, mut forward: F) -> StreamOutcome
    where
        F: FnMut(String),
    {
        loop {
            if self.cancel.is_cancelled() {
                drop(stream);
                return StreamOutcome::Cancelled;
            }
            match stream.next().await {
                Some(Ok(chunk)) => {
                    if self.cancel.is_cancelled() {
                        drop(stream);
                        return StreamOutcome::Cancelled;
                    }
                    if chunk.trim().is_empty() {
                        continue;
                    }
                    self.output_chars += chunk.chars().count();
                    self.has_output = true;
                    forward(chunk);
                }
                Some(Err(err)) => {
                    debug!(error = %err, output_chars = self.output_chars, "Stream failed");
                    return StreamOutcome::Failed(err);
                }
                None if self.has_output => return StreamOutcome::Finished,
                None => return StreamOutcome::Empty,
            }
        }
    }
}
