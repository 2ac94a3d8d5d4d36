//! Persistent key-value storage.
//!
//! Mirrors extension storage: namespaced string keys (`local:rules`) holding
//! JSON values. The rule list lives under a single key as an ordered array of
//! `{id, path, method, enabled, mock}` records.

use crate::rule::Rule;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Default key of the persisted rule list.
pub const RULES_KEY: &str = "local:rules";

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("stored value for {key} is malformed: {source}")]
    Malformed {
        key: String,
        source: serde_json::Error,
    },
    #[error("storage file {path} is not a JSON object")]
    NotAnObject { path: PathBuf },
    #[error("storage write rejected: {0}")]
    WriteRejected(String),
}

/// Key-value storage area.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError>;

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError>;
}

/// Read the rule list stored under `key`. A missing key is an empty list.
pub async fn load_rules(
    storage: &dyn KeyValueStorage,
    key: &str,
) -> Result<Vec<Rule>, StorageError> {
    match storage.get_item(key).await? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value).map_err(|source| StorageError::Malformed {
            key: key.to_string(),
            source,
        }),
    }
}

/// Write the rule list under `key`.
pub async fn save_rules(
    storage: &dyn KeyValueStorage,
    key: &str,
    rules: &[Rule],
) -> Result<(), StorageError> {
    let value = serde_json::to_value(rules).map_err(|source| StorageError::Malformed {
        key: key.to_string(),
        source,
    })?;
    storage.set_item(key, value).await
}

/// Volatile storage.
#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, Value>>,
    reject_writes: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write with `reason` until cleared with `None`.
    pub fn reject_writes(&self, reason: Option<String>) {
        *lock(&self.reject_writes) = reason;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(lock(&self.items).get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError> {
        if let Some(reason) = lock(&self.reject_writes).clone() {
            return Err(StorageError::WriteRejected(reason));
        }
        lock(&self.items).insert(key.to_string(), value);
        Ok(())
    }
}

/// Storage backed by a single JSON object file.
///
/// Writes go to a sibling temp file that is renamed over the original.
pub struct FileStorage {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>, StorageError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        let value: Value =
            serde_json::from_str(&content).map_err(|source| StorageError::Malformed {
                key: self.path.display().to_string(),
                source,
            })?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(StorageError::NotAnObject {
                path: self.path.clone(),
            }),
        }
    }
}

#[async_trait]
impl KeyValueStorage for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.read_all().await?;
        items.insert(key.to_string(), value);

        let content = serde_json::to_string_pretty(&Value::Object(items)).map_err(|source| {
            StorageError::Malformed {
                key: key.to_string(),
                source,
            }
        })?;
        let io_err = |source: std::io::Error| StorageError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!(path = %self.path.display(), key, "Persisted storage item");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{HttpMethod, RuleDraft};

    fn rules() -> Vec<Rule> {
        vec![
            Rule::from_draft(1, RuleDraft::new("/a", HttpMethod::Get, "{}")),
            Rule::from_draft(2, RuleDraft::new("/b", HttpMethod::Post, "[]")),
        ]
    }

    #[tokio::test]
    async fn test_memory_roundtrip_keeps_order() {
        let storage = MemoryStorage::new();
        assert!(load_rules(&storage, RULES_KEY).await.unwrap().is_empty());

        save_rules(&storage, RULES_KEY, &rules()).await.unwrap();
        let loaded = load_rules(&storage, RULES_KEY).await.unwrap();
        assert_eq!(loaded, rules());
    }

    #[tokio::test]
    async fn test_memory_rejects_writes() {
        let storage = MemoryStorage::new();
        storage.reject_writes(Some("quota".to_string()));
        assert!(matches!(
            save_rules(&storage, RULES_KEY, &rules()).await,
            Err(StorageError::WriteRejected(_))
        ));
        storage.reject_writes(None);
        assert!(save_rules(&storage, RULES_KEY, &rules()).await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_value() {
        let storage = MemoryStorage::new();
        storage
            .set_item(RULES_KEY, serde_json::json!({"not": "a list"}))
            .await
            .unwrap();
        assert!(matches!(
            load_rules(&storage, RULES_KEY).await,
            Err(StorageError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let storage = FileStorage::new(&path);
        assert!(load_rules(&storage, RULES_KEY).await.unwrap().is_empty());
        save_rules(&storage, RULES_KEY, &rules()).await.unwrap();
        storage
            .set_item("local:other", serde_json::json!(42))
            .await
            .unwrap();

        let reopened = FileStorage::new(&path);
        assert_eq!(load_rules(&reopened, RULES_KEY).await.unwrap(), rules());
        assert_eq!(
            reopened.get_item("local:other").await.unwrap(),
            Some(serde_json::json!(42))
        );
    }

    #[tokio::test]
    async fn test_file_storage_not_an_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        let storage = FileStorage::new(&path);
        assert!(matches!(
            storage.get_item(RULES_KEY).await,
            Err(StorageError::NotAnObject { .. })
        ));
    }
}
