use std::{fmt, sync::Arc};

use crate::{errors::Error, handler::MessageHandler, Result};

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;

/// Largest concurrency limit the dispatcher's semaphore can hold.
pub const MAX_CONCURRENCY_LIMIT: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Immutable per-run configuration owned by the poll loop.
#[derive(Clone)]
pub struct BotSession {
    token: String,
    concurrency_limit: usize,
    handler: Arc<dyn MessageHandler>,
}

impl BotSession {
    pub fn new(token: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            token: token.into(),
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            handler,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(Error::Config(
                "concurrency limit must be a positive integer".to_string(),
            ));
        }
        if limit > MAX_CONCURRENCY_LIMIT {
            return Err(Error::Config(format!(
                "concurrency limit must not exceed {MAX_CONCURRENCY_LIMIT}"
            )));
        }
        self.concurrency_limit = limit;
        Ok(self)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.handler.clone()
    }
}

impl fmt::Debug for BotSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotSession")
            .field("token", &redact_token(&self.token))
            .field("concurrency_limit", &self.concurrency_limit)
            .finish_non_exhaustive()
    }
}

/// Keep the public bot id (before `:`), hide the secret part.
pub fn redact_token(token: &str) -> String {
    match token.split_once(':') {
        Some((id, _)) => format!("{id}:***"),
        None => "***".to_string(),
    }
}
