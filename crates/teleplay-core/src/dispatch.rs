//! Bounded-concurrency dispatch of one fetched batch.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::{domain::Update, handler::MessageHandler, source::MessageSource};

/// What happened to a single dispatched update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded and the reply was delivered.
    Replied(String),
    /// Handler returned an error (or panicked); nothing was sent.
    HandlerFailed(String),
    /// Handler succeeded but the reply could not be delivered.
    SendFailed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PerMessageResult {
    pub update: Update,
    pub outcome: Outcome,
}

/// Run `handler` for every update in `batch` with at most `concurrency_limit`
/// invocations in flight, sending each reply through `source`.
///
/// Never fails: per-message errors end up in the returned report, which keeps
/// the order of `batch`.
pub async fn dispatch(
    batch: Vec<Update>,
    handler: Arc<dyn MessageHandler>,
    source: Arc<dyn MessageSource>,
    concurrency_limit: usize,
) -> Vec<PerMessageResult> {
    let permits = Arc::new(Semaphore::new(
        concurrency_limit.clamp(1, Semaphore::MAX_PERMITS),
    ));

    let mut tasks = Vec::with_capacity(batch.len());
    for update in batch {
        let permits = permits.clone();
        let handler = handler.clone();
        let source = source.clone();
        let task_update = update.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return Outcome::HandlerFailed("dispatcher closed".to_string());
            };
            handle_one(handler.as_ref(), source.as_ref(), &task_update).await
        });
        tasks.push((update, handle));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for (update, handle) in tasks {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Outcome::HandlerFailed("handler panicked".to_string()),
            Err(e) => Outcome::HandlerFailed(format!("handler task failed: {e}")),
        };
        log_outcome(&update, &outcome);
        results.push(PerMessageResult { update, outcome });
    }
    results
}

async fn handle_one(
    handler: &dyn MessageHandler,
    source: &dyn MessageSource,
    update: &Update,
) -> Outcome {
    let text = update.text.as_deref().unwrap_or_default();
    let reply = match handler.on_message(text, update).await {
        Ok(reply) => reply,
        Err(e) => return Outcome::HandlerFailed(format!("{e:#}")),
    };

    let Some(chat_id) = update.chat_id else {
        return Outcome::SendFailed("update has no chat to reply to".to_string());
    };
    match source.send_reply(chat_id, &reply).await {
        Ok(()) => Outcome::Replied(reply),
        Err(e) => Outcome::SendFailed(e.to_string()),
    }
}

fn log_outcome(update: &Update, outcome: &Outcome) {
    let update_id = update.update_id.0;
    match outcome {
        Outcome::Replied(_) => tracing::debug!(update_id, "handled a message"),
        Outcome::HandlerFailed(reason) => {
            tracing::warn!(update_id, reason = %reason, "handler failed")
        }
        Outcome::SendFailed(reason) => {
            tracing::warn!(update_id, reason = %reason, "reply delivery failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChatId;
    use crate::source::SourceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSource {
        sent: Mutex<Vec<(i64, String)>>,
        fail_chat: Option<i64>,
    }

    #[async_trait]
    impl MessageSource for RecordingSource {
        async fn fetch_updates(
            &self,
            _offset: i64,
            _limit: usize,
            _timeout: Duration,
        ) -> Result<Vec<Update>, SourceError> {
            Ok(Vec::new())
        }

        async fn send_reply(&self, chat_id: ChatId, text: &str) -> Result<(), SourceError> {
            if self.fail_chat == Some(chat_id.0) {
                return Err(SourceError::Transient("chat unreachable".to_string()));
            }
            self.sent.lock().unwrap().push((chat_id.0, text.to_string()));
            Ok(())
        }
    }

    /// Tracks the high-water mark of concurrent invocations.
    #[derive(Default)]
    struct SlowHandler {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn on_message(&self, text: &str, update: &Update) -> anyhow::Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match update.update_id.0 {
                5 => anyhow::bail!("cannot handle update 5"),
                13 => panic!("handler blew up"),
                _ => Ok(format!("re: {text}")),
            }
        }
    }

    fn batch(ids: std::ops::RangeInclusive<i64>) -> Vec<Update> {
        ids.map(|id| Update::text_message(id, id * 100, format!("m{id}")))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_concurrency_limit() {
        let handler = Arc::new(SlowHandler::default());
        let source = Arc::new(RecordingSource::default());

        let updates: Vec<Update> = batch(1..=4).into_iter().chain(batch(6..=12)).collect();

        let results = dispatch(updates, handler.clone(), source, 3).await;

        assert_eq!(results.len(), 11);
        let peak = handler.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in-flight was {peak}");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn failing_update_does_not_affect_siblings() {
        let handler = Arc::new(SlowHandler::default());
        let source = Arc::new(RecordingSource::default());

        let results = dispatch(batch(4..=6), handler, source.clone(), 2).await;

        let ids: Vec<i64> = results.iter().map(|r| r.update.update_id.0).collect();
        assert_eq!(ids, vec![4, 5, 6]);
        assert_eq!(results[0].outcome, Outcome::Replied("re: m4".to_string()));
        assert!(matches!(&results[1].outcome, Outcome::HandlerFailed(r) if r.contains("update 5")));
        assert_eq!(results[2].outcome, Outcome::Replied("re: m6".to_string()));

        let sent = source.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.contains(&(400, "re: m4".to_string())));
        assert!(sent.contains(&(600, "re: m6".to_string())));
    }

    #[tokio::test]
    async fn handler_panic_is_reported_not_propagated() {
        let results = dispatch(
            batch(12..=14),
            Arc::new(SlowHandler::default()),
            Arc::new(RecordingSource::default()),
            5,
        )
        .await;

        assert_eq!(
            results[1].outcome,
            Outcome::HandlerFailed("handler panicked".to_string())
        );
        assert!(matches!(results[0].outcome, Outcome::Replied(_)));
        assert!(matches!(results[2].outcome, Outcome::Replied(_)));
    }

    #[tokio::test]
    async fn send_failure_is_isolated() {
        let source = Arc::new(RecordingSource {
            fail_chat: Some(200),
            ..Default::default()
        });

        let results = dispatch(batch(1..=3), Arc::new(SlowHandler::default()), source, 1).await;

        assert!(matches!(results[0].outcome, Outcome::Replied(_)));
        assert!(matches!(&results[1].outcome, Outcome::SendFailed(r) if r.contains("chat unreachable")));
        assert!(matches!(results[2].outcome, Outcome::Replied(_)));
    }

    #[tokio::test]
    async fn oversized_limit_is_clamped_instead_of_panicking() {
        let source = Arc::new(RecordingSource::default());

        let results = dispatch(
            batch(1..=2),
            Arc::new(SlowHandler::default()),
            source.clone(),
            usize::MAX,
        )
        .await;

        assert!(results
            .iter()
            .all(|r| matches!(r.outcome, Outcome::Replied(_))));
        assert_eq!(source.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_yields_empty_report() {
        let results = dispatch(
            Vec::new(),
            Arc::new(SlowHandler::default()),
            Arc::new(RecordingSource::default()),
            5,
        )
        .await;
        assert!(results.is_empty());
    }
}
