//! Shared engine lifecycle: single-flight initialization, serialized
//! inference, cooperative teardown.

use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::{Engine, Page};

/// Lifecycle phase of the shared engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    /// Initialization failed. Terminal; carries the failure reason.
    Failed(String),
    /// Shut down. Terminal.
    Stopped,
}

/// One engine instance shared by every connection.
///
/// Initialization is single-flight: the first caller runs the build
/// while concurrent callers block until that attempt resolves, then
/// observe its outcome. Inference gates through a fair async mutex, so
/// requests run one at a time in arrival order.
///
/// [`EngineCell::infer`] hands the model call to
/// [`tokio::task::block_in_place`] and therefore needs a multi-thread
/// runtime.
pub struct EngineCell {
    state: Mutex<EngineState>,
    resolved: Condvar,
    gate: AsyncMutex<()>,
    engine: Mutex<Option<Engine>>,
}

impl EngineCell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::Uninitialized),
            resolved: Condvar::new(),
            gate: AsyncMutex::new(()),
            engine: Mutex::new(None),
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.lock_state().clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.lock_state() == EngineState::Ready
    }

    /// Run `build` exactly once across all callers.
    ///
    /// The winning caller executes `build` with no locks held; losers
    /// block until the attempt resolves and see the same outcome. This
    /// blocks the calling thread, so under a runtime wrap it in
    /// `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// [`EngineError::InitFailed`] once a build has failed (the failure
    /// is terminal) and [`EngineError::Stopped`] after shutdown.
    pub fn initialize<F>(&self, build: F) -> Result<(), EngineError>
    where
        F: FnOnce() -> Result<Engine, EngineError>,
    {
        {
            let mut state = self.lock_state();
            loop {
                match &*state {
                    EngineState::Ready => return Ok(()),
                    EngineState::Failed(reason) => {
                        return Err(EngineError::InitFailed(reason.clone()));
                    }
                    EngineState::Stopped => return Err(EngineError::Stopped),
                    EngineState::Initializing => {
                        state = self
                            .resolved
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    EngineState::Uninitialized => {
                        *state = EngineState::Initializing;
                        break;
                    }
                }
            }
        }

        let outcome = build();

        let mut state = self.lock_state();
        match outcome {
            Ok(engine) => {
                if *state == EngineState::Stopped {
                    // stopped while building; the fresh engine is dropped
                    self.resolved.notify_all();
                    return Err(EngineError::Stopped);
                }
                *self
                    .engine
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(engine);
                *state = EngineState::Ready;
                self.resolved.notify_all();
                info!("engine ready");
                Ok(())
            }
            Err(e) => {
                if *state != EngineState::Stopped {
                    *state = EngineState::Failed(e.to_string());
                }
                self.resolved.notify_all();
                warn!(reason = %e, "engine initialization failed");
                Err(e)
            }
        }
    }

    /// Run one recognition. Requests queue in arrival order; the state
    /// is re-checked after queueing so callers parked behind a long
    /// inference observe a shutdown that happened meanwhile.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotReady`] before initialization completes,
    /// [`EngineError::InitFailed`] after a failed one,
    /// [`EngineError::Stopped`] after shutdown, and
    /// [`EngineError::Inference`] when the backend fails.
    pub async fn infer(&self, image: &Path) -> Result<Vec<Page>, EngineError> {
        self.check_ready()?;
        let _turn = self.gate.lock().await;
        self.check_ready()?;

        let mut slot = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(engine) = slot.as_mut() else {
            return Err(EngineError::Stopped);
        };
        tokio::task::block_in_place(|| engine.recognize(image)).map_err(|e| {
            let message = e.to_string();
            let chain = format!("{e:#}");
            EngineError::Inference {
                details: (chain != message).then_some(chain),
                message,
            }
        })
    }

    /// Move to `Stopped`. Queued and future calls fail with
    /// [`EngineError::Stopped`]; an in-flight inference is left to
    /// finish. Idempotent.
    pub fn begin_stop(&self) {
        let mut state = self.lock_state();
        if *state != EngineState::Stopped {
            debug!(from = ?*state, "engine stopping");
            *state = EngineState::Stopped;
        }
        self.resolved.notify_all();
    }

    /// Drop the engine once any in-flight inference completes.
    /// Call after [`EngineCell::begin_stop`]. Idempotent.
    pub async fn release(&self) {
        let _turn = self.gate.lock().await;
        let engine = self
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if engine.is_some() {
            info!("engine released");
        }
    }

    fn check_ready(&self) -> Result<(), EngineError> {
        match &*self.lock_state() {
            EngineState::Ready => Ok(()),
            EngineState::Uninitialized | EngineState::Initializing => Err(EngineError::NotReady),
            EngineState::Failed(reason) => Err(EngineError::InitFailed(reason.clone())),
            EngineState::Stopped => Err(EngineError::Stopped),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EngineCell {
    fn default() -> Self {
        Self::new()
    }
}
