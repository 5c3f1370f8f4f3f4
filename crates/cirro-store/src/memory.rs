use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backend::{check_key, Backend};
use crate::error::StoreError;

/// In-memory [`Backend`].
///
/// All data is lost on process exit. Suitable for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        check_key(key)?;
        let guard = self.inner.read().await;
        Ok(guard.get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        let mut guard = self.inner.write().await;
        guard.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        check_key(key)?;
        let mut guard = self.inner.write().await;
        guard.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_delete() {
        let backend = MemoryBackend::new();
        backend.write("a/b", b"v").await.unwrap();
        assert_eq!(backend.read("a/b").await.unwrap().as_deref(), Some(&b"v"[..]));
        backend.delete("a/b").await.unwrap();
        assert!(backend.read("a/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let backend = MemoryBackend::new();
        backend.write("p/z", b"1").await.unwrap();
        backend.write("p/a", b"2").await.unwrap();
        backend.write("q/a", b"3").await.unwrap();
        assert_eq!(backend.list("p/").await.unwrap(), vec!["p/a", "p/z"]);
    }
}
