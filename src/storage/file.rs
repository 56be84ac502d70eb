use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{validate_key, StringStorage};
use crate::error::{Result, TorError};

/// One file per key inside a directory
///
/// Each key is stored as `<dir>/<prefix><key>`. Writes go to a sibling
/// temp file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStringStorage {
    dir: PathBuf,
    prefix: String,
}

impl FileStringStorage {
    /// Storage rooted at `dir`, created if missing
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_prefix(dir, "")
    }

    pub fn with_prefix(dir: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| TorError::Storage(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
        })
    }

    /// Storage under the system temp dir, shared by all clients using `prefix`
    pub fn in_temp_dir(prefix: &str) -> Result<Self> {
        Self::with_prefix(std::env::temp_dir().join("tor-netlib"), prefix)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}{}", self.prefix, key)))
    }
}

#[async_trait]
impl StringStorage for FileStringStorage {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| TorError::Storage(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| TorError::Storage(format!("rename {}: {}", path.display(), e)))?;
        log::debug!("Stored {} ({} bytes)", key, value.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TorError::Storage(format!("read {}: {}", path.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStringStorage::with_prefix(dir.path(), "test-").unwrap();

        assert_eq!(storage.get("consensus.txt").await.unwrap(), None);
        storage.put("consensus.txt", "network-status-version 3\n").await.unwrap();
        assert_eq!(
            storage.get("consensus.txt").await.unwrap().as_deref(),
            Some("network-status-version 3\n")
        );
        assert!(dir.path().join("test-consensus.txt").exists());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStringStorage::new(dir.path()).unwrap();
        assert!(storage.put("../x", "v").await.is_err());
        assert!(storage.get("/etc/passwd").await.is_err());
    }
}
