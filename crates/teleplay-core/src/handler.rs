//! The message handler capability supplied by the embedding application.

use std::future::Future;

use async_trait::async_trait;

use crate::domain::Update;

/// Produces a reply for one inbound message.
///
/// Errors are reported per message and never stop the bot.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, text: &str, update: &Update) -> anyhow::Result<String>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(String, Update) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(String, Update) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    async fn on_message(&self, text: &str, update: &Update) -> anyhow::Result<String> {
        (self.f)(text.to_string(), update.clone()).await
    }
}

/// Replies with the incoming text behind a fixed prefix.
#[derive(Clone, Debug)]
pub struct EchoHandler {
    prefix: String,
}

impl EchoHandler {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new("you said: ")
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn on_message(&self, text: &str, _update: &Update) -> anyhow::Result<String> {
        Ok(format!("{}{text}", self.prefix))
    }
}
