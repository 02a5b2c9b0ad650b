//! Durable key/value persistence used by the checkpoint store.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

const STORE_SCHEMA_VERSION: u32 = 1;

/// Minimal string key/value port.
///
/// Implementations must be durable if the bot is expected to resume after a
/// restart. A single writer per key is assumed; with several writers the last
/// write wins.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// In-process store. Not durable; for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoreFile {
    schema_version: u32,
    #[serde(default)]
    saved_at: Option<String>,
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            schema_version: STORE_SCHEMA_VERSION,
            saved_at: None,
            entries: BTreeMap::new(),
        }
    }
}

/// JSON file store.
///
/// The file is re-read on every `get` and replaced atomically on every `set`,
/// so a crash mid-write leaves the previous contents intact.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoreFile> {
        if !self.path.exists() {
            return Ok(StoreFile::default());
        }
        let txt = fs::read_to_string(&self.path)?;
        if txt.trim().is_empty() {
            return Ok(StoreFile::default());
        }
        let data: StoreFile = serde_json::from_str(&txt).map_err(|e| {
            Error::Storage(format!("failed to parse {}: {e}", self.path.display()))
        })?;
        if data.schema_version != STORE_SCHEMA_VERSION {
            return Err(Error::Storage(format!(
                "unsupported store schema in {}: expected {STORE_SCHEMA_VERSION}, found {}",
                self.path.display(),
                data.schema_version
            )));
        }
        Ok(data)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut data = self.load()?;
        if data.entries.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        data.entries.insert(key.to_string(), value.to_string());
        data.saved_at = Some(Utc::now().to_rfc3339());

        let txt = serde_json::to_string_pretty(&data)?;
        write_text_atomic(&self.path, &txt)
    }
}

/// Write `content` to a sibling temp file, fsync it, then rename over `path`.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::Storage("destination path cannot be empty".to_string()));
    }
    if path.is_dir() {
        return Err(Error::Storage(format!(
            "destination path '{}' is a directory",
            path.display()
        )));
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent_dir)?;

    let temp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("store"),
        std::process::id()
    );
    let temp_path = parent_dir.join(temp_name);

    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&temp_path);
        return Err(Error::Storage(format!(
            "failed to write {}: {e}",
            path.display()
        )));
    }
    Ok(())
}
