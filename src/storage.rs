//! Storage layer for snapshots and per-conversation settings
//!
//! Provides atomic JSON file persistence and the group settings key-value
//! collaborator used by the access policy store.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored document does not have the expected shape
    #[error("Malformed document: {0}")]
    Malformed(String),
    /// Backend refused or failed the operation
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Setting stored under a conversation's feature sub-key
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSetting {
    /// Whether the feature is on
    pub enabled: bool,
    /// Last change, epoch milliseconds
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}

/// Key-value settings collaborator keyed by conversation id
///
/// Implementations must only touch the given sub-key and leave sibling
/// settings of the conversation intact.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GroupSettingsStore: Send + Sync {
    /// Read the setting stored under `key` for a conversation
    async fn get_feature(
        &self,
        conversation_id: &str,
        key: &str,
    ) -> Result<Option<FeatureSetting>, StorageError>;
    /// Write the setting stored under `key` for a conversation
    async fn set_feature(
        &self,
        conversation_id: &str,
        key: &str,
        setting: FeatureSetting,
    ) -> Result<(), StorageError>;
}

/// Read and decode a JSON file, `None` when the file does not exist.
///
/// # Errors
///
/// Returns an error if the file cannot be read or decoded.
pub async fn read_json_optional<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replace a file with the JSON encoding of `data` via temp file + rename.
///
/// # Errors
///
/// Returns an error if encoding, writing or renaming fails.
pub async fn write_json_atomic<T: Serialize + Sync>(
    path: &Path,
    data: &T,
) -> Result<(), StorageError> {
    let payload = serde_json::to_vec_pretty(data)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&temp_path, payload).await?;
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    debug!(path = %path.display(), "Snapshot written");
    Ok(())
}

/// Group settings kept in a single JSON document on disk
///
/// Layout: `{ conversationId: { key: { enabled, updatedAt } } }`.
pub struct JsonFileSettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSettingsStore {
    /// Create a store backed by `path`; the file is created on first write
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load_document(&self) -> Result<Map<String, Value>, StorageError> {
        match read_json_optional::<Value>(&self.path).await? {
            None => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(StorageError::Malformed(
                "settings root is not an object".into(),
            )),
        }
    }
}

#[async_trait]
impl GroupSettingsStore for JsonFileSettingsStore {
    async fn get_feature(
        &self,
        conversation_id: &str,
        key: &str,
    ) -> Result<Option<FeatureSetting>, StorageError> {
        let document = self.load_document().await?;
        document
            .get(conversation_id)
            .and_then(|conversation| conversation.get(key))
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(StorageError::from)
    }

    async fn set_feature(
        &self,
        conversation_id: &str,
        key: &str,
        setting: FeatureSetting,
    ) -> Result<(), StorageError> {
        // Read-modify-write under one lock so concurrent toggles don't drop each other
        let _guard = self.write_lock.lock().await;
        let mut document = self.load_document().await?;

        let conversation = document
            .entry(conversation_id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(conversation) = conversation else {
            return Err(StorageError::Malformed(format!(
                "settings for {conversation_id} are not an object"
            )));
        };
        conversation.insert(key.to_string(), serde_json::to_value(setting)?);

        write_json_atomic(&self.path, &Value::Object(document)).await
    }
}

/// In-process settings store, used when no data directory is available
#[derive(Default)]
pub struct MemorySettingsStore {
    settings: RwLock<HashMap<String, HashMap<String, FeatureSetting>>>,
    reads: AtomicU64,
}

impl MemorySettingsStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_feature` calls served so far
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl GroupSettingsStore for MemorySettingsStore {
    async fn get_feature(
        &self,
        conversation_id: &str,
        key: &str,
    ) -> Result<Option<FeatureSetting>, StorageError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .settings
            .read()
            .await
            .get(conversation_id)
            .and_then(|conversation| conversation.get(key))
            .copied())
    }

    async fn set_feature(
        &self,
        conversation_id: &str,
        key: &str,
        setting: FeatureSetting,
    ) -> Result<(), StorageError> {
        self.settings
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .insert(key.to_string(), setting);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_file_reads_as_none() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let value: Option<Value> = read_json_optional(&dir.path().join("absent.json")).await?;
        assert!(value.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_atomic_write_replaces_file() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("snapshot.json");

        write_json_atomic(&path, &json!({"a": 1})).await?;
        write_json_atomic(&path, &json!({"b": 2})).await?;

        let value: Option<Value> = read_json_optional(&path).await?;
        assert_eq!(value, Some(json!({"b": 2})));

        // No temp files left behind
        let leftovers = std::fs::read_dir(path.parent().unwrap_or(dir.path()))?.count();
        assert_eq!(leftovers, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_json_store_preserves_sibling_keys() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("groups.json");
        tokio::fs::write(
            &path,
            serde_json::to_vec(&json!({
                "g1": {"welcome": {"enabled": true, "updatedAt": 1}, "lang": "de"},
                "g2": {"media": {"enabled": true, "updatedAt": 2}}
            }))?,
        )
        .await?;

        let store = JsonFileSettingsStore::new(&path);
        store
            .set_feature("g1", "media", FeatureSetting { enabled: true, updated_at: 10 })
            .await?;

        let document: Option<Value> = read_json_optional(&path).await?;
        let document = document.unwrap_or_default();
        assert_eq!(document["g1"]["welcome"]["enabled"], json!(true));
        assert_eq!(document["g1"]["lang"], json!("de"));
        assert_eq!(document["g1"]["media"]["updatedAt"], json!(10));
        assert_eq!(document["g2"]["media"]["updatedAt"], json!(2));

        assert_eq!(
            store.get_feature("g1", "media").await?,
            Some(FeatureSetting { enabled: true, updated_at: 10 })
        );
        assert_eq!(store.get_feature("g3", "media").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_json_store_rejects_non_object_conversation() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("groups.json");
        tokio::fs::write(&path, br#"{"g1": "oops"}"#).await?;

        let store = JsonFileSettingsStore::new(&path);
        let result = store
            .set_feature("g1", "media", FeatureSetting { enabled: true, updated_at: 1 })
            .await;
        assert!(matches!(result, Err(StorageError::Malformed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_counts_reads() -> Result<(), StorageError> {
        let store = MemorySettingsStore::new();
        store
            .set_feature("g1", "media", FeatureSetting { enabled: false, updated_at: 5 })
            .await?;

        assert_eq!(
            store.get_feature("g1", "media").await?,
            Some(FeatureSetting { enabled: false, updated_at: 5 })
        );
        assert_eq!(store.get_feature("g1", "other").await?, None);
        assert_eq!(store.read_count(), 2);
        Ok(())
    }
}
