// Storage contract and backend factory
mod config;
mod error;
mod key;
mod local;
mod memory;

pub use config::{BackendKind, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use key::Key;
pub use local::LocalStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use tokio::io::AsyncRead;

/// Readable stream over a stored blob
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Hook run by [`Storage::put_reader`] once the streamed content is persisted
/// and before the write reports success. Returning an error fails the write.
pub type AfterWrite<'a> = Box<dyn FnOnce(&dyn Artifact) -> anyhow::Result<()> + Send + 'a>;

/// Handle on a finalized blob, given to an [`AfterWrite`] hook
pub trait Artifact: Send + Sync {
    /// Key the blob is being stored under
    fn key(&self) -> &Key;

    /// Size as reported by the backing medium
    fn size(&self) -> StorageResult<u64>;
}

/// Path-addressed blob storage contract.
///
/// Keys form a tree under `/`. Directories are never stored: a key is a
/// directory exactly while at least one blob lives below it. Every backend
/// must behave identically, including:
/// - `list` of a key with no children is an error ([`StorageError::Empty`]),
///   whether the key was never written, was emptied, or is a blob.
/// - Removing the last blob under a prefix makes the prefix disappear from
///   its parent's listing.
/// - `remove_all` never fails because nothing matched.
///
/// `list` results carry no ordering.
#[async_trait]
pub trait Storage: Send + Sync {
    /// One-time setup run after construction and before any other call
    async fn initialize(&self) -> StorageResult<()> {
        Ok(())
    }

    /// True if a blob is stored at `key`
    async fn exists(&self, key: &str) -> bool;

    /// Read a whole blob
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Open a stream over a blob
    async fn get_reader(&self, key: &str) -> StorageResult<BlobReader>;

    /// Blob length in bytes
    async fn size(&self, key: &str) -> StorageResult<u64>;

    /// Create or overwrite a blob
    async fn put(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Stream a blob into `key`, then run `after_write` against the stored
    /// artifact. The write only succeeds if the hook does.
    async fn put_reader(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        after_write: AfterWrite<'_>,
    ) -> StorageResult<()>;

    /// Delete the blob at `key` and prune emptied ancestors
    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// Delete `prefix` and everything below it; succeeds when nothing matches
    async fn remove_all(&self, prefix: &str) -> StorageResult<()>;

    /// Immediate children of `key`
    async fn list(&self, key: &str) -> StorageResult<Vec<Key>>;
}

/// Construct and initialize the backend described by `config`
pub async fn open(config: &StorageConfig) -> StorageResult<Box<dyn Storage>> {
    let storage: Box<dyn Storage> = match config.backend {
        BackendKind::Local => Box::new(LocalStorage::new(config.clone())),
        BackendKind::Memory => Box::new(MemoryStorage::new()),
    };

    storage.initialize().await?;
    tracing::debug!("Opened {:?} storage", config.backend);

    Ok(storage)
}
