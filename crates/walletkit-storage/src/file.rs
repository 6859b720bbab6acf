use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use crate::error::StorageError;
use crate::store::KeyValueStorage;

const VALUE_EXT: &str = "value";
const TMP_EXT: &str = "tmp";

/// Disk-backed storage, one file per key.
///
/// Layout under `base_dir`:
/// ```text
/// {base_dir}/
///   {hex(key)}.value   - current value
///   {hex(key)}.tmp     - in-flight write, renamed over .value
/// ```
///
/// Writes go to a temp file first and are renamed into place, so a crash
/// mid-write leaves the previous value intact.
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Default location: ~/.walletkit/storage/
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".walletkit")
            .join("storage")
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn init(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        Ok(())
    }

    fn value_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self
            .base_dir
            .join(format!("{}.{VALUE_EXT}", hex::encode(key))))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{TMP_EXT}", hex::encode(key)))
    }

    /// Keys currently stored, sorted.
    pub async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        if !self.base_dir.exists() {
            return Ok(keys);
        }
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == VALUE_EXT) {
                let decoded = path
                    .file_stem()
                    .and_then(|stem| hex::decode(stem.to_string_lossy().as_bytes()).ok())
                    .and_then(|bytes| String::from_utf8(bytes).ok());
                match decoded {
                    Some(key) => keys.push(key),
                    None => tracing::warn!(path = %path.display(), "Skipping undecodable storage file"),
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl KeyValueStorage for FileStorage {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.value_path(key)?;
            match tokio::fs::read_to_string(&path).await {
                Ok(value) => Ok(Some(value)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn save<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.value_path(key)?;
            let tmp = self.tmp_path(key);
            tokio::fs::create_dir_all(&self.base_dir).await?;
            tokio::fs::write(&tmp, value).await?;
            tokio::fs::rename(&tmp, &path).await?;
            tracing::trace!(key, path = %path.display(), "Value saved");
            Ok(())
        })
    }

    fn remove<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.value_path(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn clear<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>> {
        Box::pin(async move {
            if !self.base_dir.exists() {
                return Ok(());
            }
            let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path
                    .extension()
                    .is_some_and(|e| e == VALUE_EXT || e == TMP_EXT)
                {
                    tokio::fs::remove_file(&path).await?;
                }
            }
            tracing::info!(dir = %self.base_dir.display(), "Storage cleared");
            Ok(())
        })
    }

    fn backend_name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn values_survive_a_new_instance() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path().to_path_buf());
        storage.init().await.unwrap();
        storage.save("durable_events", r#"{"a":1}"#).await.unwrap();

        let reopened = FileStorage::new(tmp.path().to_path_buf());
        assert_eq!(
            reopened.get("durable_events").await.unwrap().as_deref(),
            Some(r#"{"a":1}"#)
        );
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path().to_path_buf());
        assert_eq!(storage.get("nope").await.unwrap(), None);
        storage.remove("nope").await.unwrap();
    }

    #[tokio::test]
    async fn keys_with_separators_round_trip() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path().to_path_buf());
        storage.save("walletkit:mainnet/durable_events", "x").await.unwrap();
        storage.save("sessions", "y").await.unwrap();

        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["sessions".to_string(), "walletkit:mainnet/durable_events".to_string()]
        );
    }

    #[tokio::test]
    async fn clear_removes_only_value_files() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path().to_path_buf());
        storage.save("a", "1").await.unwrap();
        std::fs::write(tmp.path().join("README"), "keep").unwrap();

        storage.clear().await.unwrap();
        assert!(storage.keys().await.unwrap().is_empty());
        assert!(tmp.path().join("README").exists());
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path().to_path_buf());
        assert!(matches!(
            storage.save("", "x").await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
