//! Front-end facing controller: `start()` / `stop()` bound to poll loop runs.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::{
    checkpoint::CheckpointStore,
    errors::Error,
    lifecycle::{Lifecycle, LifecycleState},
    poll::{LoopEvent, PollLoop, PollSettings, RunSummary},
    session::BotSession,
    source::MessageSource,
    Result,
};

const EVENT_CAPACITY: usize = 256;

pub struct Bot {
    session: BotSession,
    source: Arc<dyn MessageSource>,
    checkpoints: Arc<CheckpointStore>,
    settings: PollSettings,
    lifecycle: Arc<Lifecycle>,
    events: broadcast::Sender<LoopEvent>,
    run: Mutex<Option<JoinHandle<Result<RunSummary>>>>,
}

impl Bot {
    pub fn new(
        session: BotSession,
        source: Arc<dyn MessageSource>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session,
            source,
            checkpoints,
            settings: PollSettings::default(),
            lifecycle: Arc::new(Lifecycle::new()),
            events,
            run: Mutex::new(None),
        }
    }

    pub fn with_settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Spawn a poll loop run. No-op (returns false) unless currently stopped.
    ///
    /// Also returns false, leaving the state untouched, when called outside a
    /// tokio runtime.
    pub fn start(&self) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("bot start requested outside a tokio runtime");
            return false;
        };
        if !self.lifecycle.start() {
            return false;
        }

        let run = PollLoop::new(
            self.session.clone(),
            self.source.clone(),
            self.checkpoints.clone(),
            self.lifecycle.clone(),
        )
        .with_settings(self.settings.clone())
        .with_events(self.events.clone());

        let handle = runtime.spawn(run.run());
        let previous = self
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if previous.is_some() {
            tracing::debug!("discarding result of an earlier run that was never awaited");
        }
        tracing::info!(session = ?self.session, "bot started");
        true
    }

    /// Ask the running loop to stop after its current iteration.
    pub fn stop(&self) -> bool {
        let changed = self.lifecycle.stop();
        if changed {
            tracing::info!("bot stopping");
        }
        changed
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LoopEvent> {
        self.events.subscribe()
    }

    /// Wait for the latest run to end. `None` if no run was started since the last wait.
    pub async fn wait(&self) -> Option<Result<RunSummary>> {
        let handle = self
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        Some(match handle.await {
            Ok(result) => result,
            Err(e) => {
                self.lifecycle.finish();
                Err(Error::External(format!("poll loop task failed: {e}")))
            }
        })
    }
}
