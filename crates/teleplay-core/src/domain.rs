use serde::{Deserialize, Serialize};

/// Offset used when no checkpoint exists yet ("from the beginning").
pub const DEFAULT_OFFSET: i64 = -1;

/// Source-assigned, monotonically increasing update id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateId(pub i64);

/// Opaque reply destination (Telegram chat id).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// Source-assigned message id within a chat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

/// One inbound update as fetched from the message source.
///
/// `raw` keeps the full record so handlers can look at fields the core does
/// not model.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub update_id: UpdateId,
    pub chat_id: Option<ChatId>,
    pub message_id: Option<MessageId>,
    pub text: Option<String>,
    pub raw: serde_json::Value,
}

impl Update {
    /// A plain text message update (no raw payload).
    pub fn text_message(update_id: i64, chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            update_id: UpdateId(update_id),
            chat_id: Some(ChatId(chat_id)),
            message_id: None,
            text: Some(text.into()),
            raw: serde_json::Value::Null,
        }
    }

    /// Text to hand to the handler, if this update is dispatchable at all.
    ///
    /// Updates without a chat to reply to or without non-empty text are skipped.
    pub fn dispatchable_text(&self) -> Option<&str> {
        self.chat_id?;
        self.text.as_deref().filter(|t| !t.is_empty())
    }
}

/// Next offset to request after `batch`: `max(update_id) + 1`, or `None` for an empty batch.
pub fn next_offset(batch: &[Update]) -> Option<i64> {
    batch
        .iter()
        .map(|u| u.update_id.0)
        .max()
        .map(|max| max.saturating_add(1))
}
