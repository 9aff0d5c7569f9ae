//! ModuleLoader: single-flight lazy construction of the backend.
//!
//! The first caller starts the load on a dedicated worker thread; everyone
//! who arrives while it runs waits on the same attempt and sees the same
//! outcome. Failures are not cached: the next call starts a fresh attempt.

use crate::backend::{BackendModules, BackendSource};
use crate::error::ApiError;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Loading,
    Loaded,
}

struct LoaderState {
    phase: Phase,
    /// Attempt currently (or last) started
    attempt: u64,
    /// Highest attempt whose outcome is recorded
    finished: u64,
    modules: Option<Arc<BackendModules>>,
    last_error: Option<ApiError>,
}

pub struct ModuleLoader {
    source: Arc<dyn BackendSource>,
    state: Mutex<LoaderState>,
    done: Condvar,
}

impl ModuleLoader {
    pub fn new(source: Arc<dyn BackendSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            state: Mutex::new(LoaderState {
                phase: Phase::Idle,
                attempt: 0,
                finished: 0,
                modules: None,
                last_error: None,
            }),
            done: Condvar::new(),
        })
    }

    /// Load the backend if needed and wait for the outcome.
    ///
    /// Blocks the calling thread; async callers go through
    /// [`ModuleLoader::ensure_loaded_async`].
    pub fn ensure_loaded(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        let attempt = match state.phase {
            Phase::Loaded => return true,
            Phase::Loading => state.attempt,
            Phase::Idle => self.start_attempt(&mut state),
        };
        while state.finished < attempt {
            self.done.wait(&mut state);
        }
        state.modules.is_some()
    }

    pub async fn ensure_loaded_async(self: &Arc<Self>) -> bool {
        if self.is_loaded() {
            return true;
        }
        let loader = Arc::clone(self);
        tokio::task::spawn_blocking(move || loader.ensure_loaded())
            .await
            .unwrap_or(false)
    }

    /// Start loading in the background without waiting.
    pub fn preload(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.phase == Phase::Idle {
            self.start_attempt(&mut state);
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().phase == Phase::Loaded
    }

    pub fn modules(&self) -> Option<Arc<BackendModules>> {
        self.state.lock().modules.clone()
    }

    /// Error of the most recent failed attempt, cleared on success.
    pub fn last_error(&self) -> Option<ApiError> {
        self.state.lock().last_error.clone()
    }

    fn start_attempt(self: &Arc<Self>, state: &mut LoaderState) -> u64 {
        state.phase = Phase::Loading;
        state.attempt += 1;
        let attempt = state.attempt;
        debug!(attempt, "Starting backend load");

        let loader = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("module-loader".to_string())
            .spawn(move || loader.run(attempt));

        if let Err(e) = spawned {
            // Record the failure in place; no worker will.
            let err = ApiError::ProviderError(format!("failed to spawn loader thread: {}", e));
            warn!(attempt, error = %err, "Backend load could not start");
            state.phase = Phase::Idle;
            state.finished = attempt;
            state.last_error = Some(err);
        }
        attempt
    }

    fn run(&self, attempt: u64) {
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| self.source.load())).unwrap_or_else(|_| {
            Err(ApiError::ProviderError("backend load panicked".to_string()))
        });

        let mut state = self.state.lock();
        state.finished = attempt;
        match result {
            Ok(modules) => {
                info!(attempt, elapsed_ms = started.elapsed().as_millis() as u64, "Backend loaded");
                state.phase = Phase::Loaded;
                state.modules = Some(Arc::new(modules));
                state.last_error = None;
            }
            Err(err) => {
                warn!(attempt, error = %err, "Backend load failed");
                state.phase = Phase::Idle;
                state.last_error = Some(err);
            }
        }
        drop(state);
        self.done.notify_all();
    }
}
