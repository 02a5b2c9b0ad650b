//! Start/stop state machine gating the poll loop.
//!
//! ```text
//! stopped --start()--> started --stop()--> stopping --(loop top)--> stopped
//!                      started/stopping --fatal fetch error--> stopped
//! ```

use std::{fmt, sync::Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LifecycleState {
    #[default]
    Stopped,
    Started,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Started => "started",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Single state cell shared by the controller (start/stop) and the poll loop.
///
/// Transitions are applied under the watch channel's write lock, so exactly one
/// state is visible at any instant and subscribers see every change.
pub struct Lifecycle {
    state: watch::Sender<LifecycleState>,
    // Cancelled by `stop()`; interrupts the inter-iteration delay of the current run.
    wake: Mutex<CancellationToken>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Stopped);
        Self {
            state,
            wake: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// `stopped -> started`. No-op (returns false) in any other state.
    pub fn start(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s != LifecycleState::Stopped {
                return false;
            }
            *self.lock_wake() = CancellationToken::new();
            *s = LifecycleState::Started;
            true
        })
    }

    /// `started -> stopping`. No-op (returns false) in any other state.
    pub fn stop(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s != LifecycleState::Started {
                return false;
            }
            self.lock_wake().cancel();
            *s = LifecycleState::Stopping;
            true
        })
    }

    /// Terminal transition into `stopped`, taken by the poll loop when it exits.
    pub(crate) fn finish(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == LifecycleState::Stopped {
                return false;
            }
            self.lock_wake().cancel();
            *s = LifecycleState::Stopped;
            true
        })
    }

    /// Token cancelled once the current run is asked to stop.
    pub fn stop_signal(&self) -> CancellationToken {
        self.lock_wake().clone()
    }

    fn lock_wake(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.wake
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.current())
            .finish()
    }
}
