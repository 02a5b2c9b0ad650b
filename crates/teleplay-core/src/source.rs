use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{ChatId, Update};

/// Failure at the message source boundary.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Network blip, non-success status, malformed payload. Retried next iteration.
    #[error("transient source error: {0}")]
    Transient(String),

    /// Credential rejected or otherwise irrecoverable. Stops the poll loop.
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Fatal(_))
    }
}

/// Port to the remote message source (Telegram Bot API, a queue, ...).
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Long-poll for updates with `update_id >= offset`.
    ///
    /// Blocks up to `timeout` waiting for at least one update and returns an
    /// empty batch when none arrives. Batches are ordered by `update_id`.
    async fn fetch_updates(
        &self,
        offset: i64,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<Update>, SourceError>;

    async fn send_reply(&self, chat_id: ChatId, text: &str) -> Result<(), SourceError>;
}
