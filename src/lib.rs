//! GameWiki: query orchestration for a game wiki and guide assistant
//!
//! Turns a free-text question plus the title of the window the user is
//! looking at into either a site-scoped wiki search or a streamed guide
//! answer, while managing the heavyweight retrieval engines behind it.

pub mod backend;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod fallback;
pub mod intent;
pub mod loader;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod sites;
pub mod stream;
pub mod types;

pub use controller::Controller;
pub use error::{ApiError, EngineInitError};
pub use events::{AssistantEvent, EventEnvelope, EventReceiver};
pub use pipeline::{PipelineState, StateTransition};
pub use types::{EngineKey, GameContext, PipelineId, SearchMode};
