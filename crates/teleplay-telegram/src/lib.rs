//! Telegram adapter (Bot API over `reqwest`).
//!
//! Implements the `teleplay-core` [`MessageSource`] port with `getUpdates`
//! long polling and `sendMessage` replies.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use teleplay_core::{
    domain::{ChatId, MessageId, Update, UpdateId},
    errors::Error,
    source::{MessageSource, SourceError},
    Result,
};

/// Extra time on top of the long-poll timeout before the HTTP request gives up.
const HTTP_GRACE: Duration = Duration::from_secs(10);

/// HTTP statuses / Bot API error codes that mean the token itself is bad.
const CREDENTIAL_REJECTED: [u16; 2] = [401, 404];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Clone)]
pub struct TelegramClient {
    token: String,
    api_base: String,
    http: reqwest::Client,
}

impl TelegramClient {
    pub fn new(
        token: impl Into<String>,
        api_base: impl Into<String>,
        poll_timeout: Duration,
    ) -> Result<Self> {
        let deadline = request_deadline(poll_timeout).ok_or_else(|| {
            Error::Config(format!("poll timeout {poll_timeout:?} is too large"))
        })?;
        let http = reqwest::Client::builder()
            .timeout(deadline)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            token: token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    /// Check the credential and return who we are.
    pub async fn get_me(&self) -> std::result::Result<BotIdentity, SourceError> {
        let result = self.call("getMe", &[], None).await?;
        parse_me(result)
    }

    /// `deadline` overrides the client-wide timeout for this request.
    async fn call(
        &self,
        method: &str,
        query: &[(&str, String)],
        deadline: Option<Duration>,
    ) -> std::result::Result<Value, SourceError> {
        let mut req = self.http.get(self.method_url(method)).query(query);
        if let Some(deadline) = deadline {
            req = req.timeout(deadline);
        }
        let resp = req
            .send()
            .await
            // The URL carries the token; keep it out of error messages.
            .map_err(|e| {
                SourceError::Transient(format!("{method} request failed: {}", e.without_url()))
            })?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| {
            SourceError::Transient(format!("{method} body read failed: {}", e.without_url()))
        })?;
        interpret_response(method, status, &body)
    }
}

#[async_trait]
impl MessageSource for TelegramClient {
    async fn fetch_updates(
        &self,
        offset: i64,
        limit: usize,
        timeout: Duration,
    ) -> std::result::Result<Vec<Update>, SourceError> {
        let deadline = request_deadline(timeout);
        if deadline.is_none() {
            tracing::warn!(?timeout, "long-poll timeout too large, using client default deadline");
        }
        let result = self
            .call(
                "getUpdates",
                &[
                    ("offset", offset.to_string()),
                    ("limit", limit.to_string()),
                    ("timeout", timeout.as_secs().to_string()),
                ],
                deadline,
            )
            .await?;
        let updates = parse_updates(result)?;
        tracing::debug!(offset, count = updates.len(), "getUpdates returned");
        Ok(updates)
    }

    async fn send_reply(&self, chat_id: ChatId, text: &str) -> std::result::Result<(), SourceError> {
        self.call(
            "sendMessage",
            &[("chat_id", chat_id.0.to_string()), ("text", text.to_string())],
            None,
        )
        .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

/// HTTP deadline for a request that may long-poll for `poll_timeout`.
fn request_deadline(poll_timeout: Duration) -> Option<Duration> {
    poll_timeout.checked_add(HTTP_GRACE)
}

fn parse_me(result: Value) -> std::result::Result<BotIdentity, SourceError> {
    let me: TgUser = serde_json::from_value(result)
        .map_err(|e| SourceError::Transient(format!("getMe: malformed result: {e}")))?;
    Ok(BotIdentity {
        id: me.id,
        username: me.username,
    })
}

/// Map an HTTP status + body to the `result` payload or a classified error.
fn interpret_response(
    method: &str,
    status: u16,
    body: &str,
) -> std::result::Result<Value, SourceError> {
    let parsed = serde_json::from_str::<ApiResponse>(body);

    if CREDENTIAL_REJECTED.contains(&status) {
        let description = parsed
            .ok()
            .and_then(|r| r.description)
            .unwrap_or_else(|| "credential rejected".to_string());
        return Err(SourceError::Fatal(format!(
            "{method}: {status} {description}"
        )));
    }

    let resp = match parsed {
        Ok(resp) => resp,
        Err(e) if !(200..300).contains(&status) => {
            return Err(SourceError::Transient(format!(
                "{method}: unexpected status {status}: {e}"
            )))
        }
        Err(e) => {
            return Err(SourceError::Transient(format!(
                "{method}: malformed response: {e}"
            )))
        }
    };

    if !resp.ok {
        let code = resp.error_code.unwrap_or(status);
        let description = resp.description.unwrap_or_default();
        let msg = format!("{method}: {code} {description}");
        return Err(if CREDENTIAL_REJECTED.contains(&code) {
            SourceError::Fatal(msg)
        } else {
            SourceError::Transient(msg)
        });
    }

    Ok(resp.result.unwrap_or(Value::Null))
}

/// Convert a `getUpdates` result array into core updates, ordered by id.
///
/// Every item needs an integer `update_id`; without one the offset cannot
/// advance past it, so the whole batch is rejected. A `message` that does not
/// have the expected shape only makes its update non-dispatchable.
fn parse_updates(result: Value) -> std::result::Result<Vec<Update>, SourceError> {
    let Value::Array(items) = result else {
        return Err(SourceError::Transient(
            "getUpdates: result is not an array".to_string(),
        ));
    };

    let mut updates = Vec::with_capacity(items.len());
    for raw in items {
        let update_id = raw
            .get("update_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                SourceError::Transient("getUpdates: update without an integer update_id".to_string())
            })?;
        let message = match raw.get("message") {
            None | Some(Value::Null) => None,
            Some(m) => match TgMessage::deserialize(m) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(update_id, error = %e, "skipping malformed message");
                    None
                }
            },
        };
        let (chat_id, message_id, text) = match message {
            Some(m) => (Some(ChatId(m.chat.id)), Some(MessageId(m.message_id)), m.text),
            None => (None, None, None),
        };
        updates.push(Update {
            update_id: UpdateId(update_id),
            chat_id,
            message_id,
            text,
            raw,
        });
    }
    updates.sort_by_key(|u| u.update_id);
    Ok(updates)
}
