use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{validate_key, StringStorage};
use crate::error::{Result, TorError};

/// In-process storage, lost on drop
#[derive(Debug, Default)]
pub struct MemoryStringStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStringStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StringStorage for MemoryStringStorage {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        self.values
            .lock()
            .map_err(|_| TorError::Internal("storage lock poisoned".into()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        Ok(self
            .values
            .lock()
            .map_err(|_| TorError::Internal("storage lock poisoned".into()))?
            .get(key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get() {
        let storage = MemoryStringStorage::new();
        assert_eq!(storage.get("a.txt").await.unwrap(), None);
        storage.put("a.txt", "hello").await.unwrap();
        assert_eq!(storage.get("a.txt").await.unwrap().as_deref(), Some("hello"));
        assert!(storage.put("A.txt", "x").await.is_err());
    }
}
