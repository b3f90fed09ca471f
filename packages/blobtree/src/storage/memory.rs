// In-memory storage backend
use super::{AfterWrite, Artifact, BlobReader, Key, Storage, StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;

/// In-memory storage backend
///
/// Models an object store: blobs sit in a flat map with no directory
/// entries at all. Directory existence is tracked incrementally instead, as
/// the set of live children under each prefix. A prefix is a directory
/// exactly while its child set is non-empty.
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    blobs: HashMap<Key, Vec<u8>>,
    children: HashMap<Key, HashSet<Key>>,
}

impl State {
    fn is_dir(&self, key: &Key) -> bool {
        self.children.get(key).is_some_and(|set| !set.is_empty())
    }

    fn check_writable(&self, key: &Key) -> StorageResult<()> {
        if key.is_root() {
            return Err(StorageError::Conflict {
                key: key.to_string(),
                reason: "the root is always a directory",
            });
        }
        if self.is_dir(key) {
            return Err(StorageError::Conflict {
                key: key.to_string(),
                reason: "key is a directory",
            });
        }
        if key.ancestors().iter().any(|a| self.blobs.contains_key(a)) {
            return Err(StorageError::Conflict {
                key: key.to_string(),
                reason: "an ancestor is a blob",
            });
        }
        Ok(())
    }

    /// Store a blob and link it into every ancestor's child set
    fn insert(&mut self, key: Key, data: Vec<u8>) {
        let mut node = key.clone();
        while let Some(parent) = node.parent() {
            let set = self.children.entry(parent.clone()).or_default();
            if !set.insert(node) {
                break;
            }
            node = parent;
        }
        self.blobs.insert(key, data);
    }

    /// Unlink `key` from its parent and keep going while parents empty out,
    /// stopping at the root.
    fn unlink(&mut self, key: &Key) {
        let mut node = key.clone();
        while let Some(parent) = node.parent() {
            let emptied = match self.children.get_mut(&parent) {
                Some(set) => {
                    set.remove(&node);
                    set.is_empty()
                }
                None => false,
            };
            if !emptied {
                break;
            }
            self.children.remove(&parent);
            node = parent;
        }
    }

    /// Drop every blob and child set at or below `prefix`
    fn remove_subtree(&mut self, prefix: &Key) -> usize {
        let before = self.blobs.len();
        self.blobs.retain(|key, _| !key.is_within(prefix));
        self.children.retain(|key, _| !key.is_within(prefix));
        before - self.blobs.len()
    }
}

impl MemoryStorage {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored
    pub async fn len(&self) -> usize {
        self.state.read().await.blobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.blobs.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn exists(&self, key: &str) -> bool {
        let Ok(key) = Key::parse(key) else {
            return false;
        };
        self.state.read().await.blobs.contains_key(&key)
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let key = Key::parse(key)?;
        let state = self.state.read().await;
        state
            .blobs
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn get_reader(&self, key: &str) -> StorageResult<BlobReader> {
        let data = self.get(key).await?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn size(&self, key: &str) -> StorageResult<u64> {
        let key = Key::parse(key)?;
        let state = self.state.read().await;
        state
            .blobs
            .get(&key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let key = Key::parse(key)?;
        let mut state = self.state.write().await;
        state.check_writable(&key)?;
        state.insert(key.clone(), data.to_vec());

        tracing::info!("Stored blob: {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn put_reader(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        after_write: AfterWrite<'_>,
    ) -> StorageResult<()> {
        let key = Key::parse(key)?;
        self.state.read().await.check_writable(&key)?;

        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| StorageError::medium(format!("Failed to read stream for: {}", key), e))?;

        let artifact = BufferArtifact { key, data };
        after_write(&artifact).map_err(|source| StorageError::AfterWrite {
            key: artifact.key.to_string(),
            source,
        })?;

        let BufferArtifact { key, data } = artifact;
        let size = data.len();
        let mut state = self.state.write().await;
        state.check_writable(&key)?;
        state.insert(key.clone(), data);

        tracing::info!("Stored blob: {} ({} bytes)", key, size);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let key = Key::parse(key)?;
        let mut state = self.state.write().await;
        if state.blobs.remove(&key).is_none() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        state.unlink(&key);

        tracing::info!("Deleted blob: {}", key);
        Ok(())
    }

    async fn remove_all(&self, prefix: &str) -> StorageResult<()> {
        let prefix = Key::parse(prefix)?;
        let mut state = self.state.write().await;

        let removed = state.remove_subtree(&prefix);
        if removed > 0 && !prefix.is_root() {
            state.unlink(&prefix);
        }

        tracing::info!("Deleted {} blobs under {}", removed, prefix);
        Ok(())
    }

    async fn list(&self, key: &str) -> StorageResult<Vec<Key>> {
        let key = Key::parse(key)?;
        let state = self.state.read().await;
        match state.children.get(&key) {
            Some(set) if !set.is_empty() => Ok(set.iter().cloned().collect()),
            _ => Err(StorageError::Empty(key.to_string())),
        }
    }
}

/// Fully buffered stream content, handed to after-write hooks
struct BufferArtifact {
    key: Key,
    data: Vec<u8>,
}

impl Artifact for BufferArtifact {
    fn key(&self) -> &Key {
        &self.key
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;
    use crate::storage::test_support::capture_logs;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_conformance() {
        let storage = MemoryStorage::new();
        conformance::run(&storage).await.unwrap();
    }

    #[tokio::test]
    async fn test_bookkeeping_drops_empty_prefixes() {
        let storage = MemoryStorage::new();

        storage.put("/a/b/c", b"1").await.unwrap();
        storage.put("/a/d", b"2").await.unwrap();
        storage.remove("/a/b/c").await.unwrap();

        let state = storage.state.read().await;
        assert!(!state.children.contains_key(&Key::parse("/a/b").unwrap()));
        assert!(state.is_dir(&Key::parse("/a").unwrap()));
        assert!(state.is_dir(&Key::root()));
    }

    #[tokio::test]
    async fn test_remove_all_of_single_blob() {
        let storage = MemoryStorage::new();

        storage.put("/dir/1", b"1").await.unwrap();
        storage.put("/dir/2", b"2").await.unwrap();
        storage.remove_all("/dir/1").await.unwrap();

        let listed = storage.list("/dir").await.unwrap();
        assert_eq!(listed, vec![Key::parse("/dir/2").unwrap()]);
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_all_does_not_touch_lookalike_prefix() {
        let storage = MemoryStorage::new();

        storage.put("/dir/1", b"1").await.unwrap();
        storage.put("/dirty/1", b"2").await.unwrap();
        storage.remove_all("/dir").await.unwrap();

        assert!(storage.exists("/dirty/1").await);
        assert_eq!(storage.list("/").await.unwrap(), vec![Key::parse("/dirty").unwrap()]);
    }

    #[tokio::test]
    async fn test_failed_hook_commits_nothing() {
        let storage = MemoryStorage::new();

        let mut reader: &[u8] = b"content";
        let result = storage
            .put_reader(
                "/x/y",
                &mut reader,
                Box::new(|_: &dyn Artifact| -> anyhow::Result<()> {
                    anyhow::bail!("reject")
                }),
            )
            .await;

        assert!(matches!(result, Err(StorageError::AfterWrite { .. })));
        assert!(storage.is_empty().await);
        assert!(storage.list("/").await.unwrap_err().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_hook_commits_nothing() {
        let storage = Arc::new(MemoryStorage::new());

        let writer = Arc::clone(&storage);
        let joined = tokio::spawn(async move {
            let mut reader: &[u8] = b"never stored";
            writer
                .put_reader(
                    "/dir/1",
                    &mut reader,
                    Box::new(|_: &dyn Artifact| -> anyhow::Result<()> {
                        panic!("hook exploded")
                    }),
                )
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert!(!storage.exists("/dir/1").await);
        assert!(storage.list("/").await.unwrap_err().is_empty());
        assert!(storage.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_same_key() {
        let storage = Arc::new(MemoryStorage::new());
        let payloads: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 100_000]).collect();

        let mut handles = Vec::new();
        for data in payloads.clone() {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                storage.put("/same/k", &data).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = storage.get("/same/k").await.unwrap();
        assert!(payloads.contains(&stored));
        assert_eq!(storage.size("/same/k").await.unwrap(), 100_000);
        assert_eq!(storage.list("/same").await.unwrap(), vec![Key::parse("/same/k").unwrap()]);
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_mutations_logged_at_info() {
        let storage = MemoryStorage::new();
        let (logs, _guard) = capture_logs();

        storage.put("/dir/1", b"lolwtf").await.unwrap();
        storage.remove("/dir/1").await.unwrap();
        storage.put("/dir/2", b"x").await.unwrap();
        storage.remove_all("/dir").await.unwrap();

        let output = logs.contents();
        assert!(output.contains("Stored blob: /dir/1 (6 bytes)"));
        assert!(output.contains("Deleted blob: /dir/1"));
        assert!(output.contains("Deleted 1 blobs under /dir"));
    }

    #[tokio::test]
    async fn test_concurrent_puts() {
        let storage = Arc::new(MemoryStorage::new());

        let (r1, r2, r3) = tokio::join!(
            storage.put("/c/1", b"concurrent 1"),
            storage.put("/c/2", b"concurrent 2"),
            storage.put("/c/3", b"concurrent 3")
        );

        assert!(r1.is_ok());
        assert!(r2.is_ok());
        assert!(r3.is_ok());
        assert_eq!(storage.list("/c").await.unwrap().len(), 3);
    }
}
