use async_trait::async_trait;

use crate::error::StoreError;

/// Raw key-addressed persistence behind the typed [`StateStore`](crate::StateStore).
///
/// Keys are `/`-separated relative paths. The backend is unaware of entity
/// schemas; payloads are opaque bytes. Implementations must make `write`
/// atomic per key (write-to-temp + rename for filesystems, single-object put
/// for object storage).
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Read a key. `Ok(None)` means absent, not an error.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a key atomically, creating it if absent.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Delete a key. Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List all keys under a prefix, sorted ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Reject keys that could escape the backend root or collide with temp files.
pub(crate) fn check_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
