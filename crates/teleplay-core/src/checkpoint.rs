//! Per-bot offset checkpoints on top of a [`KeyValueStore`].

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::{domain::DEFAULT_OFFSET, errors::Error, store::KeyValueStore, Result};

/// Durable "next update id to request" per bot token.
///
/// Offsets only move forward: `set` ignores values below the stored one.
/// The token is hashed into the key so the credential never lands on disk.
#[derive(Clone)]
pub struct CheckpointStore {
    kv: Arc<dyn KeyValueStore>,
}

impl CheckpointStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn key_for(token: &str) -> String {
        let mut h = Sha256::new();
        h.update(token.as_bytes());
        format!("checkpoint:{}", hex_prefix(&h.finalize(), 16))
    }

    pub fn get(&self, token: &str) -> Result<Option<i64>> {
        let key = Self::key_for(token);
        let Some(raw) = self.kv.get(&key)? else {
            return Ok(None);
        };
        raw.trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|e| Error::Storage(format!("invalid checkpoint value {raw:?} for {key}: {e}")))
    }

    /// Stored offset, or [`DEFAULT_OFFSET`] when nothing has been committed yet.
    pub fn offset_or_default(&self, token: &str) -> Result<i64> {
        Ok(self.get(token)?.unwrap_or(DEFAULT_OFFSET))
    }

    /// Commit `offset`. Returns `Ok(true)` if the stored value moved forward.
    pub fn set(&self, token: &str, offset: i64) -> Result<bool> {
        match self.get(token)? {
            Some(current) if offset == current => return Ok(false),
            Some(current) if offset < current => {
                tracing::warn!(current, offset, "refusing to move checkpoint backwards");
                return Ok(false);
            }
            _ => {}
        }
        self.kv.set(&Self::key_for(token), &offset.to_string())?;
        Ok(true)
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(len);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
        if out.len() >= len {
            out.truncate(len);
            break;
        }
    }
    out
}
