use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use af_client::{StorageError, TokenStore};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

/// Token store backed by a small JSON object on disk.
///
/// Writes go to a sibling temp file that is renamed into place, so a crash
/// mid-write leaves the previous contents intact.
pub struct FileTokenStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(values)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values).await?;
        debug!(key, path = %self.path.display(), "Persisted token");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_all().await?;
        if values.remove(key).is_some() {
            self.write_all(&values).await?;
            debug!(key, path = %self.path.display(), "Removed token");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("auth.json"));

        assert_eq!(store.get("auth_token").await.unwrap(), None);

        store.set("auth_token", "abc").await.unwrap();
        store.set("other", "xyz").await.unwrap();
        assert_eq!(store.get("auth_token").await.unwrap().as_deref(), Some("abc"));

        store.delete("auth_token").await.unwrap();
        assert_eq!(store.get("auth_token").await.unwrap(), None);
        assert_eq!(store.get("other").await.unwrap().as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("auth.json");

        FileTokenStore::new(&path).set("auth_token", "persisted").await.unwrap();

        let reopened = FileTokenStore::new(&path);
        assert_eq!(reopened.get("auth_token").await.unwrap().as_deref(), Some("persisted"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileTokenStore::new(&path).get("auth_token").await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
