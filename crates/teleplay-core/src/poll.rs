//! The poll loop: fetch -> dispatch -> checkpoint -> delay, while started.

use std::{sync::Arc, time::Duration};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::CheckpointStore,
    dispatch::{dispatch, Outcome, PerMessageResult},
    domain::{next_offset, Update},
    errors::Error,
    lifecycle::{Lifecycle, LifecycleState},
    retry::RetryPolicy,
    session::BotSession,
    source::{MessageSource, SourceError},
    Result,
};

pub const DEFAULT_BATCH_LIMIT: usize = 10;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Knobs for one run of the poll loop.
#[derive(Clone, Debug)]
pub struct PollSettings {
    pub batch_limit: usize,
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Observable progress of the loop, for embedding front ends.
#[derive(Clone, Debug)]
pub enum LoopEvent {
    Fetched { offset: i64, count: usize },
    FetchFailed { offset: i64, error: String },
    Message(PerMessageResult),
    CheckpointAdvanced { offset: i64 },
    CheckpointFailed { error: String },
    Fatal { reason: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub fetched: u64,
    pub replied: u64,
    pub handler_failures: u64,
    pub send_failures: u64,
    pub last_offset: Option<i64>,
}

impl RunSummary {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Replied(_) => self.replied += 1,
            Outcome::HandlerFailed(_) => self.handler_failures += 1,
            Outcome::SendFailed(_) => self.send_failures += 1,
        }
    }
}

enum Step {
    Fetched,
    Retry,
}

pub struct PollLoop {
    session: BotSession,
    source: Arc<dyn MessageSource>,
    checkpoints: Arc<CheckpointStore>,
    lifecycle: Arc<Lifecycle>,
    settings: PollSettings,
    events: Option<broadcast::Sender<LoopEvent>>,
}

impl PollLoop {
    pub fn new(
        session: BotSession,
        source: Arc<dyn MessageSource>,
        checkpoints: Arc<CheckpointStore>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            session,
            source,
            checkpoints,
            lifecycle,
            settings: PollSettings::default(),
            events: None,
        }
    }

    pub fn with_settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<LoopEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run until the lifecycle leaves `started`.
    ///
    /// Returns `Err(Error::Fatal)` when the source rejects the credential; the
    /// lifecycle is `stopped` in both cases once this returns.
    pub async fn run(self) -> Result<RunSummary> {
        let stop = self.lifecycle.stop_signal();
        let mut summary = RunSummary::default();
        let mut failures: u32 = 0;

        info!(
            concurrency = self.session.concurrency_limit(),
            batch_limit = self.settings.batch_limit,
            "poll loop started"
        );

        loop {
            let state = self.lifecycle.current();
            if state != LifecycleState::Started {
                self.lifecycle.finish();
                info!(iterations = summary.iterations, "poll loop stopped");
                return Ok(summary);
            }

            summary.iterations += 1;
            match self.iterate(&mut summary).await {
                Ok(Step::Fetched) => failures = 0,
                Ok(Step::Retry) => failures = failures.saturating_add(1),
                Err(e) => {
                    error!(error = %e, "poll loop aborted");
                    self.emit(LoopEvent::Fatal {
                        reason: e.to_string(),
                    });
                    self.lifecycle.finish();
                    return Err(e);
                }
            }

            let delay = self.settings.retry.delay(failures);
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn iterate(&self, summary: &mut RunSummary) -> Result<Step> {
        let token = self.session.token();

        let offset = match self.checkpoints.offset_or_default(token) {
            Ok(offset) => offset,
            Err(e) => {
                warn!(error = %e, "failed to read checkpoint");
                self.emit(LoopEvent::CheckpointFailed {
                    error: e.to_string(),
                });
                return Ok(Step::Retry);
            }
        };

        debug!(offset, "fetching updates");
        let batch = match self
            .source
            .fetch_updates(offset, self.settings.batch_limit, self.settings.poll_timeout)
            .await
        {
            Ok(batch) => batch,
            Err(SourceError::Fatal(reason)) => return Err(Error::Fatal(reason)),
            Err(e) => {
                warn!(offset, error = %e, "fetch failed, retrying after delay");
                self.emit(LoopEvent::FetchFailed {
                    offset,
                    error: e.to_string(),
                });
                return Ok(Step::Retry);
            }
        };

        // Never go back below the requested offset, even if the source does.
        let batch: Vec<Update> = batch
            .into_iter()
            .filter(|u| offset < 0 || u.update_id.0 >= offset)
            .collect();

        summary.fetched += batch.len() as u64;
        self.emit(LoopEvent::Fetched {
            offset,
            count: batch.len(),
        });

        let next = next_offset(&batch);
        let dispatchable: Vec<Update> = batch
            .into_iter()
            .filter(|u| u.dispatchable_text().is_some())
            .collect();

        if !dispatchable.is_empty() {
            let results = dispatch(
                dispatchable,
                self.session.handler(),
                self.source.clone(),
                self.session.concurrency_limit(),
            )
            .await;
            for result in results {
                summary.record(&result.outcome);
                self.emit(LoopEvent::Message(result));
            }
        }

        if let Some(next) = next {
            match self.checkpoints.set(token, next) {
                Ok(true) => {
                    debug!(offset = next, "checkpoint advanced");
                    summary.last_offset = Some(next);
                    self.emit(LoopEvent::CheckpointAdvanced { offset: next });
                }
                Ok(false) => {}
                Err(e) => {
                    error!(offset = next, error = %e, "failed to persist checkpoint");
                    self.emit(LoopEvent::CheckpointFailed {
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(Step::Fetched)
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.events {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChatId;
    use crate::handler::{handler_fn, EchoHandler, MessageHandler};
    use crate::store::{KeyValueStore, MemoryStore};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const TOKEN: &str = "123456:test-token";

    type FetchResult = std::result::Result<Vec<Update>, SourceError>;

    /// Replays scripted fetch results; stops the lifecycle once the script runs out.
    struct ScriptedSource {
        script: Mutex<VecDeque<FetchResult>>,
        offsets: Mutex<Vec<i64>>,
        fetched_at: Mutex<Vec<tokio::time::Instant>>,
        sent: Mutex<Vec<(i64, String)>>,
        lifecycle: Arc<Lifecycle>,
        stop_during_first_fetch: bool,
    }

    impl ScriptedSource {
        fn new(lifecycle: Arc<Lifecycle>, script: Vec<FetchResult>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                offsets: Mutex::new(Vec::new()),
                fetched_at: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                lifecycle,
                stop_during_first_fetch: false,
            }
        }

        fn offsets(&self) -> Vec<i64> {
            self.offsets.lock().unwrap().clone()
        }

        fn gaps_between_fetches(&self) -> Vec<Duration> {
            let at = self.fetched_at.lock().unwrap();
            at.windows(2).map(|w| w[1] - w[0]).collect()
        }

        /// Replies sorted by chat id; completion order across handlers is unspecified.
        fn sent(&self) -> Vec<(i64, String)> {
            let mut sent = self.sent.lock().unwrap().clone();
            sent.sort();
            sent
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn fetch_updates(
            &self,
            offset: i64,
            limit: usize,
            _timeout: Duration,
        ) -> FetchResult {
            assert_eq!(limit, DEFAULT_BATCH_LIMIT);
            self.fetched_at
                .lock()
                .unwrap()
                .push(tokio::time::Instant::now());
            let first = {
                let mut offsets = self.offsets.lock().unwrap();
                offsets.push(offset);
                offsets.len() == 1
            };
            if first && self.stop_during_first_fetch {
                self.lifecycle.stop();
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => {
                    self.lifecycle.stop();
                    Ok(Vec::new())
                }
            }
        }

        async fn send_reply(
            &self,
            chat_id: ChatId,
            text: &str,
        ) -> std::result::Result<(), SourceError> {
            self.sent.lock().unwrap().push((chat_id.0, text.to_string()));
            Ok(())
        }
    }

    /// Memory store that records every write and can be told to fail them.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        writes: Mutex<Vec<String>>,
        fail_reads: bool,
        fail_writes: bool,
    }

    impl KeyValueStore for RecordingStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            if self.fail_reads {
                return Err(Error::Storage("checkpoint file unreadable".to_string()));
            }
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            if self.fail_writes {
                return Err(Error::Storage("disk full".to_string()));
            }
            self.writes.lock().unwrap().push(value.to_string());
            self.inner.set(key, value)
        }
    }

    struct Harness {
        lifecycle: Arc<Lifecycle>,
        source: Arc<ScriptedSource>,
        kv: Arc<RecordingStore>,
        checkpoints: Arc<CheckpointStore>,
    }

    impl Harness {
        fn new(script: Vec<FetchResult>) -> Self {
            Self::with_store(script, RecordingStore::default())
        }

        fn with_store(script: Vec<FetchResult>, store: RecordingStore) -> Self {
            let lifecycle = Arc::new(Lifecycle::new());
            let source = Arc::new(ScriptedSource::new(lifecycle.clone(), script));
            let kv = Arc::new(store);
            let checkpoints = Arc::new(CheckpointStore::new(kv.clone()));
            Self {
                lifecycle,
                source,
                kv,
                checkpoints,
            }
        }

        fn poll_loop(&self, handler: Arc<dyn MessageHandler>) -> PollLoop {
            let session = BotSession::new(TOKEN, handler)
                .with_concurrency_limit(2)
                .unwrap();
            PollLoop::new(
                session,
                self.source.clone(),
                self.checkpoints.clone(),
                self.lifecycle.clone(),
            )
            .with_settings(PollSettings {
                retry: RetryPolicy::fixed(Duration::from_millis(1)),
                ..PollSettings::default()
            })
        }

        async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<RunSummary> {
            assert!(self.lifecycle.start());
            self.poll_loop(handler).run().await
        }

        fn writes(&self) -> Vec<String> {
            self.kv.writes.lock().unwrap().clone()
        }
    }

    fn echo() -> Arc<dyn MessageHandler> {
        Arc::new(EchoHandler::default())
    }

    fn msg(id: i64, text: &str) -> Update {
        Update::text_message(id, 1000 + id, text)
    }

    #[tokio::test]
    async fn batch_with_gap_commits_max_id_plus_one() {
        let h = Harness::new(vec![Ok(vec![msg(7, "hi"), msg(9, "yo")])]);

        let summary = h.run(echo()).await.unwrap();

        assert_eq!(h.checkpoints.get(TOKEN).unwrap(), Some(10));
        assert_eq!(summary.replied, 2);
        assert_eq!(summary.last_offset, Some(10));
        assert_eq!(
            h.source.sent(),
            vec![
                (1007, "you said: hi".to_string()),
                (1009, "you said: yo".to_string())
            ]
        );
        assert_eq!(h.source.offsets(), vec![-1, 10]);
        assert_eq!(h.lifecycle.current(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn empty_long_poll_writes_no_checkpoint() {
        let h = Harness::new(vec![Ok(Vec::new()), Ok(Vec::new())]);

        let summary = h.run(echo()).await.unwrap();

        assert!(h.writes().is_empty());
        assert_eq!(h.checkpoints.get(TOKEN).unwrap(), None);
        assert_eq!(h.source.offsets(), vec![-1, -1, -1]);
        assert_eq!(summary.fetched, 0);
        assert_eq!(summary.last_offset, None);
    }

    #[tokio::test]
    async fn fatal_fetch_stops_without_retry_or_checkpoint() {
        let h = Harness::new(vec![
            Err(SourceError::Fatal("401 Unauthorized".to_string())),
            Ok(vec![msg(1, "never fetched")]),
        ]);

        let err = h.run(echo()).await.unwrap_err();

        assert!(err.is_fatal(), "{err}");
        assert_eq!(h.lifecycle.current(), LifecycleState::Stopped);
        assert_eq!(h.source.offsets(), vec![-1]);
        assert!(h.writes().is_empty());
        assert!(h.source.sent().is_empty());
    }

    #[tokio::test]
    async fn transient_fetch_error_retries_from_same_offset() {
        let h = Harness::new(vec![
            Ok(vec![msg(3, "a")]),
            Err(SourceError::Transient("connection reset".to_string())),
            Ok(vec![msg(4, "b")]),
        ]);

        let summary = h.run(echo()).await.unwrap();

        assert_eq!(h.source.offsets(), vec![-1, 4, 4, 5]);
        assert_eq!(h.checkpoints.get(TOKEN).unwrap(), Some(5));
        assert_eq!(summary.replied, 2);
    }

    #[tokio::test]
    async fn resume_starts_from_persisted_offset_and_drops_stale_updates() {
        let h = Harness::new(vec![Ok(vec![msg(50, "stale"), msg(57, "fresh")])]);
        h.checkpoints.set(TOKEN, 57).unwrap();

        let summary = h.run(echo()).await.unwrap();

        assert_eq!(h.source.offsets()[0], 57);
        assert_eq!(h.source.sent(), vec![(1057, "you said: fresh".to_string())]);
        assert_eq!(summary.fetched, 1);
        assert_eq!(h.checkpoints.get(TOKEN).unwrap(), Some(58));
    }

    #[tokio::test]
    async fn failing_handler_is_isolated_and_checkpoint_still_advances() {
        let h = Harness::new(vec![Ok(vec![msg(4, "a"), msg(5, "b"), msg(6, "c")])]);
        let handler: Arc<dyn MessageHandler> =
            Arc::new(handler_fn(|text: String, update: Update| async move {
                if update.update_id.0 == 5 {
                    anyhow::bail!("cannot handle 5");
                }
                Ok(text)
            }));

        let summary = h.run(handler).await.unwrap();

        assert_eq!(summary.replied, 2);
        assert_eq!(summary.handler_failures, 1);
        let chats: Vec<i64> = h.source.sent().into_iter().map(|(c, _)| c).collect();
        assert_eq!(chats, vec![1004, 1006]);
        assert_eq!(h.checkpoints.get(TOKEN).unwrap(), Some(7));
    }

    #[tokio::test]
    async fn updates_without_text_are_skipped_but_counted_for_offset() {
        let mut photo = msg(12, "");
        photo.text = None;
        let h = Harness::new(vec![Ok(vec![msg(11, "x"), photo])]);

        let summary = h.run(echo()).await.unwrap();

        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.replied, 1);
        assert_eq!(h.checkpoints.get(TOKEN).unwrap(), Some(13));
    }

    #[tokio::test]
    async fn stop_mid_iteration_finishes_current_batch_then_stops() {
        let lifecycle = Arc::new(Lifecycle::new());
        let mut source = ScriptedSource::new(
            lifecycle.clone(),
            vec![Ok(vec![msg(1, "in flight")]), Ok(vec![msg(2, "later")])],
        );
        source.stop_during_first_fetch = true;
        let source = Arc::new(source);
        let checkpoints = Arc::new(CheckpointStore::new(Arc::new(MemoryStore::new())));
        let session = BotSession::new(TOKEN, echo());

        lifecycle.start();
        let summary = PollLoop::new(
            session,
            source.clone(),
            checkpoints.clone(),
            lifecycle.clone(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(source.offsets(), vec![-1]);
        assert_eq!(source.sent(), vec![(1001, "you said: in flight".to_string())]);
        assert_eq!(checkpoints.get(TOKEN).unwrap(), Some(2));
        assert_eq!(summary.iterations, 1);
        assert_eq!(lifecycle.current(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn checkpoint_never_decreases_across_run() {
        let h = Harness::new(vec![
            Ok(vec![msg(1, "a"), msg(2, "b")]),
            Ok(Vec::new()),
            Err(SourceError::Transient("timeout".to_string())),
            Ok(vec![msg(3, "c")]),
            Ok(vec![msg(9, "d")]),
        ]);

        h.run(echo()).await.unwrap();

        let writes: Vec<i64> = h.writes().iter().map(|w| w.parse().unwrap()).collect();
        assert_eq!(writes, vec![3, 4, 10]);
        assert!(writes.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn checkpoint_write_failure_is_reported_and_loop_continues() {
        let h = Harness::with_store(
            vec![Ok(vec![msg(1, "a")]), Ok(vec![msg(1, "a again")])],
            RecordingStore {
                fail_writes: true,
                ..Default::default()
            },
        );
        let (tx, mut rx) = broadcast::channel(64);
        h.lifecycle.start();

        let summary = h.poll_loop(echo()).with_events(tx).run().await.unwrap();

        // Offset never persisted, so the update is fetched (and dispatched) again.
        assert_eq!(h.source.offsets(), vec![-1, -1, -1]);
        assert_eq!(summary.replied, 2);
        assert_eq!(summary.last_offset, None);

        let mut failures = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, LoopEvent::CheckpointFailed { .. }) {
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_fetch_failures_back_off_and_success_resets() {
        let transient = || Err(SourceError::Transient("502 Bad Gateway".to_string()));
        let h = Harness::new(vec![
            transient(),
            transient(),
            transient(),
            Ok(Vec::new()),
            transient(),
        ]);
        assert!(h.lifecycle.start());

        h.poll_loop(echo())
            .with_settings(PollSettings {
                retry: RetryPolicy {
                    first: Duration::from_millis(100),
                    max: Duration::from_secs(10),
                    factor: 2.0,
                },
                ..PollSettings::default()
            })
            .run()
            .await
            .unwrap();

        let expected_ms = [200u64, 400, 800, 100, 200];
        let gaps = h.source.gaps_between_fetches();
        assert_eq!(gaps.len(), expected_ms.len(), "{gaps:?}");
        for (gap, ms) in gaps.iter().zip(expected_ms) {
            let want = Duration::from_millis(ms);
            assert!(
                *gap >= want && *gap < want + Duration::from_millis(5),
                "gaps {gaps:?}, expected {expected_ms:?}"
            );
        }
    }

    #[tokio::test]
    async fn checkpoint_read_failure_skips_fetch() {
        let h = Harness::with_store(
            vec![Ok(vec![msg(1, "a")])],
            RecordingStore {
                fail_reads: true,
                ..Default::default()
            },
        );
        let (tx, mut rx) = broadcast::channel(64);
        assert!(h.lifecycle.start());
        let run = tokio::spawn(h.poll_loop(echo()).with_events(tx).run());

        for _ in 0..2 {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("loop kept iterating")
                .unwrap();
            assert!(
                matches!(&ev, LoopEvent::CheckpointFailed { error } if error.contains("unreadable")),
                "unexpected event {ev:?}"
            );
        }
        h.lifecycle.stop();

        let summary = run.await.unwrap().unwrap();
        assert!(summary.iterations >= 2);
        assert!(h.source.offsets().is_empty());
        assert!(h.source.sent().is_empty());
        assert!(h.writes().is_empty());
        assert_eq!(h.lifecycle.current(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn events_report_progress_in_order() {
        let h = Harness::new(vec![Ok(vec![msg(7, "hi")])]);
        let (tx, mut rx) = broadcast::channel(64);
        h.lifecycle.start();

        h.poll_loop(echo()).with_events(tx).run().await.unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            LoopEvent::Fetched { offset: -1, count: 1 }
        ));
        match rx.try_recv().unwrap() {
            LoopEvent::Message(r) => {
                assert_eq!(r.update.update_id.0, 7);
                assert_eq!(r.outcome, Outcome::Replied("you said: hi".to_string()));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            LoopEvent::CheckpointAdvanced { offset: 8 }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            LoopEvent::Fetched { offset: 8, count: 0 }
        ));
    }

    #[tokio::test]
    async fn run_on_stopped_lifecycle_exits_immediately() {
        let h = Harness::new(vec![Ok(vec![msg(1, "a")])]);

        let summary = h.poll_loop(echo()).run().await.unwrap();

        assert_eq!(summary, RunSummary::default());
        assert!(h.source.offsets().is_empty());
    }
}
