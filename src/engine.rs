//! EngineRegistry: owns the single active engine.
//!
//! At most one engine exists per process, bound to `current_key`. Asking for
//! another key discards it and starts a background construction; callers see
//! either a fully built engine or `Pending`, never a half-built one.
//!
//! Every construction is stamped with a generation. A construction that
//! finishes after a newer request (or shutdown) bumped the generation is
//! dropped instead of cached, so a stale engine can never be handed out.

use crate::backend::Engine;
use crate::cancel::CancellationFlag;
use crate::error::EngineInitError;
use crate::loader::ModuleLoader;
use crate::types::EngineKey;
use futures::FutureExt;
use parking_lot::{Condvar, Mutex};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Result of [`EngineRegistry::get_or_init`].
#[derive(Clone)]
pub enum EngineLookup {
    Ready(Arc<dyn Engine>),
    Pending,
}

/// Snapshot of the registry as seen for one key.
#[derive(Clone)]
pub enum EngineStatus {
    Ready(Arc<dyn Engine>),
    Initializing,
    Failed(EngineInitError),
    /// Nothing known about this key: never requested, superseded, or torn down
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Failed(EngineInitError),
    TimedOut(Duration),
    Cancelled,
    /// Another key took the slot while we waited
    Superseded,
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Failed(e) => write!(f, "engine initialization failed: {}", e),
            WaitError::TimedOut(d) => write!(f, "engine not ready after {:?}", d),
            WaitError::Cancelled => write!(f, "wait cancelled"),
            WaitError::Superseded => write!(f, "engine request superseded by another context"),
        }
    }
}

impl std::error::Error for WaitError {}

#[derive(Default)]
struct RegistryState {
    current_key: Option<EngineKey>,
    current_engine: Option<Arc<dyn Engine>>,
    initializing_key: Option<EngineKey>,
    init_error: Option<(EngineKey, EngineInitError)>,
    generation: u64,
}

impl RegistryState {
    fn status(&self, key: &EngineKey) -> EngineStatus {
        if self.current_key.as_ref() == Some(key) {
            if let Some(engine) = &self.current_engine {
                return EngineStatus::Ready(Arc::clone(engine));
            }
        }
        if self.initializing_key.as_ref() == Some(key) {
            return EngineStatus::Initializing;
        }
        match &self.init_error {
            Some((failed, err)) if failed == key => EngineStatus::Failed(err.clone()),
            _ => EngineStatus::Idle,
        }
    }
}

pub struct EngineRegistry {
    loader: Arc<ModuleLoader>,
    runtime: Handle,
    init_timeout: Duration,
    state: Mutex<RegistryState>,
    changed: Condvar,
}

impl EngineRegistry {
    pub fn new(loader: Arc<ModuleLoader>, runtime: Handle, init_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            loader,
            runtime,
            init_timeout,
            state: Mutex::new(RegistryState::default()),
            changed: Condvar::new(),
        })
    }

    /// Cached engine for `key`, or `Pending` after making sure a
    /// construction for `key` is running.
    pub fn get_or_init(self: &Arc<Self>, key: &EngineKey) -> EngineLookup {
        let mut state = self.state.lock();
        match state.status(key) {
            EngineStatus::Ready(engine) => return EngineLookup::Ready(engine),
            EngineStatus::Initializing => return EngineLookup::Pending,
            EngineStatus::Failed(_) | EngineStatus::Idle => {}
        }

        state.generation += 1;
        let generation = state.generation;
        let retired = state.current_engine.take();
        let previous = state.current_key.take();
        state.initializing_key = Some(key.clone());
        state.init_error = None;
        drop(state);
        // Blocked waiters on the old key must see it gone
        self.changed.notify_all();

        if let Some(previous) = previous {
            info!(from = %previous, to = %key, "Switching engine");
        }
        // Dropped outside the lock; teardown may be slow
        drop(retired);

        debug!(engine_key = %key, generation, "Starting engine initialization");
        let registry = Arc::clone(self);
        let key = key.clone();
        self.runtime.spawn(async move {
            registry.run_initialization(key, generation).await;
        });
        EngineLookup::Pending
    }

    pub fn poll(&self, key: &EngineKey) -> EngineStatus {
        self.state.lock().status(key)
    }

    pub fn current_key(&self) -> Option<EngineKey> {
        let state = self.state.lock();
        state.current_engine.as_ref().and(state.current_key.clone())
    }

    pub fn initializing_key(&self) -> Option<EngineKey> {
        self.state.lock().initializing_key.clone()
    }

    /// Wait asynchronously until `key` is ready, fails, `timeout` elapses or
    /// `cancel` fires. Re-requests the key if it fell out of the registry.
    pub async fn wait_for(
        self: &Arc<Self>,
        key: &EngineKey,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationFlag,
    ) -> Result<Arc<dyn Engine>, WaitError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll(key) {
                EngineStatus::Ready(engine) => return Ok(engine),
                EngineStatus::Failed(err) => return Err(WaitError::Failed(err)),
                EngineStatus::Idle => {
                    if let EngineLookup::Ready(engine) = self.get_or_init(key) {
                        return Ok(engine);
                    }
                }
                EngineStatus::Initializing => {}
            }
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::TimedOut(timeout));
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Blocking variant of `get_or_init` with a bounded wait.
    ///
    /// Parks the calling thread; never call it from an async task.
    pub fn get_or_init_blocking(
        self: &Arc<Self>,
        key: &EngineKey,
        timeout: Duration,
    ) -> Result<Arc<dyn Engine>, WaitError> {
        if let EngineLookup::Ready(engine) = self.get_or_init(key) {
            return Ok(engine);
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match state.status(key) {
                EngineStatus::Ready(engine) => return Ok(engine),
                EngineStatus::Failed(err) => return Err(WaitError::Failed(err)),
                EngineStatus::Idle => return Err(WaitError::Superseded),
                EngineStatus::Initializing => {}
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return match state.status(key) {
                    EngineStatus::Ready(engine) => Ok(engine),
                    EngineStatus::Failed(err) => Err(WaitError::Failed(err)),
                    _ => Err(WaitError::TimedOut(timeout)),
                };
            }
        }
    }

    /// Drop the engine and orphan any construction in flight.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        let retired = state.current_engine.take();
        state.current_key = None;
        state.initializing_key = None;
        state.init_error = None;
        drop(state);
        self.changed.notify_all();
        if retired.is_some() {
            info!("Engine released");
        }
    }

    async fn run_initialization(self: Arc<Self>, key: EngineKey, generation: u64) {
        let started = Instant::now();
        let construction = AssertUnwindSafe(self.construct(&key)).catch_unwind();
        let result = match tokio::time::timeout(self.init_timeout, construction).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineInitError::BackendUnavailable(
                "engine construction panicked".to_string(),
            )),
            Err(_) => Err(EngineInitError::Timeout(self.init_timeout)),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(engine_key = %key, elapsed_ms, "Engine initialized"),
            Err(err) => warn!(engine_key = %key, elapsed_ms, error = %err, "Engine initialization failed"),
        }
        self.complete(key, generation, result);
    }

    async fn construct(&self, key: &EngineKey) -> Result<Arc<dyn Engine>, EngineInitError> {
        if !self.loader.ensure_loaded_async().await {
            return Err(self
                .loader
                .last_error()
                .map(|e| EngineInitError::from_api(&e))
                .unwrap_or_else(|| EngineInitError::BackendUnavailable("backend not loaded".to_string())));
        }
        let modules = self
            .loader
            .modules()
            .ok_or_else(|| EngineInitError::BackendUnavailable("backend not loaded".to_string()))?;
        modules
            .engines
            .initialize(key)
            .await
            .map_err(|e| EngineInitError::from_api(&e))
    }

    fn complete(
        &self,
        key: EngineKey,
        generation: u64,
        result: Result<Arc<dyn Engine>, EngineInitError>,
    ) {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(engine_key = %key, generation, current = state.generation, "Discarding stale engine initialization");
            return;
        }
        state.initializing_key = None;
        match result {
            Ok(engine) => {
                state.current_key = Some(key);
                state.current_engine = Some(engine);
                state.init_error = None;
            }
            Err(err) => {
                state.init_error = Some((key, err));
            }
        }
        drop(state);
        self.changed.notify_all();
    }
}
