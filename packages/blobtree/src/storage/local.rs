// Local filesystem storage backend
use super::{AfterWrite, Artifact, BlobReader, Key, Storage, StorageConfig, StorageError, StorageResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Local filesystem storage backend
///
/// Blobs live at their key path below `root/store/`, so `/dir/1` is the file
/// `root/store/dir/1`. Directories on disk mirror the implicit directories of
/// the key tree: they are created when a blob is written below them and
/// removed as soon as the last blob below them goes away.
///
/// Streamed writes land in `root/staging/` first and are renamed into place
/// once the after-write hook accepts them.
pub struct LocalStorage {
    config: StorageConfig,
    /// Shared by writers creating directories, exclusive for removal and
    /// pruning, so a prune never deletes a directory a writer is about to use.
    namespace: RwLock<()>,
}

impl LocalStorage {
    /// Create a new LocalStorage instance with the given configuration
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            namespace: RwLock::new(()),
        }
    }

    /// Create a new LocalStorage instance from a root path
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self::new(StorageConfig {
            root: root.as_ref().to_path_buf(),
            backend: super::BackendKind::Local,
        })
    }

    /// Get the root directory for storage
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn blob_path(&self, key: &Key) -> PathBuf {
        self.config.store_path().join(key.to_relative_path())
    }

    fn staging_file(&self) -> PathBuf {
        let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        self.config
            .staging_path()
            .join(format!("{}-{}.part", std::process::id(), seq))
    }

    /// Metadata of the blob at `key`; directories count as missing
    async fn blob_metadata(&self, key: &Key) -> StorageResult<std::fs::Metadata> {
        match fs::metadata(self.blob_path(key)).await {
            Ok(meta) if meta.is_file() => Ok(meta),
            Ok(_) => Err(StorageError::NotFound(key.to_string())),
            Err(e) if is_absent(&e) => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(StorageError::medium(format!("Failed to stat blob: {}", key), e)),
        }
    }

    /// Reject writes that would turn a directory into a blob or nest a blob
    /// below another blob
    async fn check_writable(&self, key: &Key) -> StorageResult<()> {
        if key.is_root() {
            return Err(StorageError::Conflict {
                key: key.to_string(),
                reason: "the root is always a directory",
            });
        }

        if let Ok(meta) = fs::metadata(self.blob_path(key)).await {
            if meta.is_dir() {
                return Err(StorageError::Conflict {
                    key: key.to_string(),
                    reason: "key is a directory",
                });
            }
        }

        for ancestor in key.ancestors() {
            if let Ok(meta) = fs::metadata(self.blob_path(&ancestor)).await {
                if meta.is_file() {
                    return Err(StorageError::Conflict {
                        key: key.to_string(),
                        reason: "an ancestor is a blob",
                    });
                }
            }
        }

        Ok(())
    }

    /// Remove every ancestor directory of `key` left without children,
    /// nearest first, stopping at the first non-empty one. Never touches the
    /// store root. Callers must hold the namespace write lock.
    async fn prune_empty_dirs(&self, key: &Key) -> StorageResult<()> {
        for ancestor in key.ancestors() {
            let path = self.blob_path(&ancestor);

            let mut entries = match fs::read_dir(&path).await {
                Ok(entries) => entries,
                Err(e) if is_absent(&e) => continue,
                Err(e) => {
                    return Err(StorageError::medium(
                        format!("Failed to read directory: {}", path.display()),
                        e,
                    ))
                }
            };

            let has_children = entries
                .next_entry()
                .await
                .map_err(|e| {
                    StorageError::medium(format!("Failed to read directory: {}", path.display()), e)
                })?
                .is_some();
            if has_children {
                break;
            }

            match fs::remove_dir(&path).await {
                Ok(()) => tracing::debug!("Pruned empty directory: {}", ancestor),
                Err(e) if is_absent(&e) => {}
                Err(e) => {
                    return Err(StorageError::medium(
                        format!("Failed to remove directory: {}", path.display()),
                        e,
                    ))
                }
            }
        }

        Ok(())
    }

    /// Move a staged file to the blob path of `key`, materializing its
    /// ancestors. A failed commit prunes any directories it left empty.
    async fn commit(&self, key: &Key, staged: &Path) -> StorageResult<()> {
        let result = {
            let _guard = self.namespace.read().await;
            self.check_writable(key).await?;
            self.link_staged(key, staged).await
        };

        if result.is_err() {
            let _guard = self.namespace.write().await;
            if let Err(e) = self.prune_empty_dirs(key).await {
                tracing::warn!("Failed to prune after aborted commit of {}: {}", key, e);
            }
        }
        result
    }

    async fn link_staged(&self, key: &Key, staged: &Path) -> StorageResult<()> {
        let path = self.blob_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::medium(format!("Failed to create directory: {}", parent.display()), e)
            })?;
        }

        fs::rename(staged, &path)
            .await
            .map_err(|e| StorageError::medium(format!("Failed to commit blob: {}", key), e))
    }

    /// Delete everything directly inside the store directory, keeping the
    /// directory itself
    async fn clear_store(&self) -> StorageResult<()> {
        let store = self.config.store_path();
        let mut entries = match fs::read_dir(&store).await {
            Ok(entries) => entries,
            Err(e) if is_absent(&e) => return Ok(()),
            Err(e) => return Err(StorageError::medium("Failed to read store directory", e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::medium("Failed to read store directory", e))?
        {
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => fs::remove_dir_all(&path).await,
                Ok(_) => fs::remove_file(&path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(e) if is_absent(&e) => {}
                Err(e) => {
                    return Err(StorageError::medium(
                        format!("Failed to remove: {}", path.display()),
                        e,
                    ))
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    /// Create the store and staging directories and drop staged files left
    /// behind by an interrupted process
    async fn initialize(&self) -> StorageResult<()> {
        let store = self.config.store_path();
        fs::create_dir_all(&store).await.map_err(|e| {
            StorageError::medium(format!("Failed to create store directory: {}", store.display()), e)
        })?;

        let staging = self.config.staging_path();
        fs::create_dir_all(&staging).await.map_err(|e| {
            StorageError::medium(format!("Failed to create staging directory: {}", staging.display()), e)
        })?;

        let mut entries = fs::read_dir(&staging)
            .await
            .map_err(|e| StorageError::medium("Failed to read staging directory", e))?;
        let mut stale = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::medium("Failed to read staging directory", e))?
        {
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => stale += 1,
                Err(e) => tracing::warn!("Failed to discard staged entry {}: {}", path.display(), e),
            }
        }
        if stale > 0 {
            tracing::warn!("Discarded {} stale staged writes in {}", stale, staging.display());
        }

        tracing::debug!("Initialized local storage at {}", self.config.root.display());
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        let Ok(key) = Key::parse(key) else {
            return false;
        };
        self.blob_metadata(&key).await.is_ok()
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let key = Key::parse(key)?;
        self.blob_metadata(&key).await?;

        fs::read(self.blob_path(&key)).await.map_err(|e| {
            if is_absent(&e) {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::medium(format!("Failed to read blob: {}", key), e)
            }
        })
    }

    async fn get_reader(&self, key: &str) -> StorageResult<BlobReader> {
        let key = Key::parse(key)?;
        self.blob_metadata(&key).await?;

        let file = fs::File::open(self.blob_path(&key)).await.map_err(|e| {
            if is_absent(&e) {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::medium(format!("Failed to open blob: {}", key), e)
            }
        })?;

        Ok(Box::new(BufReader::new(file)))
    }

    async fn size(&self, key: &str) -> StorageResult<u64> {
        let key = Key::parse(key)?;
        Ok(self.blob_metadata(&key).await?.len())
    }

    async fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let mut reader = data;
        self.put_reader(key, &mut reader, Box::new(|_| Ok(()))).await
    }

    async fn put_reader(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        after_write: AfterWrite<'_>,
    ) -> StorageResult<()> {
        let key = Key::parse(key)?;
        self.check_writable(&key).await?;

        let mut staged = StagedFile::new(self.staging_file());
        let mut file = fs::File::create(&staged.path).await.map_err(|e| {
            StorageError::medium(format!("Failed to create staged file for: {}", key), e)
        })?;

        let written = tokio::io::copy(reader, &mut file)
            .await
            .map_err(|e| StorageError::medium(format!("Failed to write blob: {}", key), e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::medium(format!("Failed to flush blob: {}", key), e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::medium(format!("Failed to sync blob: {}", key), e))?;

        {
            let artifact = FileArtifact {
                key: key.clone(),
                file: file.into_std().await,
            };
            after_write(&artifact).map_err(|source| StorageError::AfterWrite {
                key: key.to_string(),
                source,
            })?;
        }

        self.commit(&key, &staged.path).await?;
        staged.committed = true;

        tracing::info!("Stored blob: {} ({} bytes)", key, written);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let key = Key::parse(key)?;
        let _guard = self.namespace.write().await;

        self.blob_metadata(&key).await?;
        fs::remove_file(self.blob_path(&key)).await.map_err(|e| {
            if is_absent(&e) {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::medium(format!("Failed to delete blob: {}", key), e)
            }
        })?;

        tracing::info!("Deleted blob: {}", key);

        self.prune_empty_dirs(&key).await
    }

    async fn remove_all(&self, prefix: &str) -> StorageResult<()> {
        let prefix = Key::parse(prefix)?;
        let _guard = self.namespace.write().await;

        if prefix.is_root() {
            self.clear_store().await?;
            tracing::info!("Deleted all blobs");
            return Ok(());
        }

        let path = self.blob_path(&prefix);
        let result = match fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => tracing::info!("Deleted tree: {}", prefix),
            Err(e) if is_absent(&e) => {
                tracing::debug!("Nothing to delete under {}", prefix);
                return Ok(());
            }
            Err(e) => {
                return Err(StorageError::medium(format!("Failed to delete tree: {}", prefix), e))
            }
        }

        self.prune_empty_dirs(&prefix).await
    }

    async fn list(&self, key: &str) -> StorageResult<Vec<Key>> {
        let key = Key::parse(key)?;
        let path = self.blob_path(&key);

        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if is_absent(&e) => return Err(StorageError::Empty(key.to_string())),
            Err(e) => {
                return Err(StorageError::medium(format!("Failed to list: {}", key), e))
            }
        };

        let mut children = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::medium(format!("Failed to list: {}", key), e))?
        {
            match entry.file_name().to_str() {
                Some(name) => children.push(key.child(name)?),
                None => tracing::warn!("Skipping non UTF-8 entry under {}", key),
            }
        }

        if children.is_empty() {
            return Err(StorageError::Empty(key.to_string()));
        }
        Ok(children)
    }
}

/// A flushed file in the staging area, handed to after-write hooks
struct FileArtifact {
    key: Key,
    file: std::fs::File,
}

impl Artifact for FileArtifact {
    fn key(&self) -> &Key {
        &self.key
    }

    fn size(&self) -> StorageResult<u64> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|e| StorageError::medium(format!("Failed to stat staged blob: {}", self.key), e))
    }
}

/// Staged file removed on drop unless it was committed
struct StagedFile {
    path: PathBuf,
    committed: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Errors meaning "nothing there", including a blob sitting where a
/// directory was expected
fn is_absent(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;
    use crate::storage::test_support::capture_logs;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::with_root(temp_dir.path());
        storage.initialize().await.unwrap();
        (storage, temp_dir)
    }

    fn names(keys: Vec<Key>) -> HashSet<String> {
        keys.into_iter().map(String::from).collect()
    }

    #[tokio::test]
    async fn test_conformance() {
        let (storage, _temp) = create_test_storage().await;
        conformance::run(&storage).await.unwrap();
    }

    #[tokio::test]
    async fn test_blob_layout_on_disk() {
        let (storage, temp) = create_test_storage().await;

        storage.put("/dir/sub/1", b"nested").await.unwrap();

        let on_disk = temp.path().join("store").join("dir").join("sub").join("1");
        assert_eq!(std::fs::read(on_disk).unwrap(), b"nested");
    }

    #[tokio::test]
    async fn test_remove_prunes_directories_on_disk() {
        let (storage, temp) = create_test_storage().await;

        storage.put("/a/b/c/1", b"x").await.unwrap();
        storage.put("/a/2", b"y").await.unwrap();
        storage.remove("/a/b/c/1").await.unwrap();

        let store = temp.path().join("store");
        assert!(!store.join("a").join("b").exists());
        assert!(store.join("a").join("2").is_file());
        assert!(store.is_dir());
    }

    #[tokio::test]
    async fn test_remove_all_root_keeps_store() {
        let (storage, temp) = create_test_storage().await;

        storage.put("/x/1", b"1").await.unwrap();
        storage.put("/y", b"2").await.unwrap();
        storage.remove_all("/").await.unwrap();

        assert!(temp.path().join("store").is_dir());
        assert!(storage.list("/").await.unwrap_err().is_empty());
        // A second sweep is a no-op
        storage.remove_all("/").await.unwrap();
    }

    #[tokio::test]
    async fn test_after_write_sees_file_size() {
        let (storage, _temp) = create_test_storage().await;

        let mut observed = None;
        let mut reader: &[u8] = b"lolwtfdir";
        storage
            .put_reader(
                "/dir/1",
                &mut reader,
                Box::new(|artifact: &dyn Artifact| -> anyhow::Result<()> {
                    observed = Some((artifact.key().to_string(), artifact.size()?));
                    Ok(())
                }),
            )
            .await
            .unwrap();

        assert_eq!(observed, Some(("/dir/1".to_string(), 9)));
    }

    #[tokio::test]
    async fn test_failed_hook_leaves_no_trace() {
        let (storage, temp) = create_test_storage().await;

        let mut reader: &[u8] = b"rejected";
        let err = storage
            .put_reader(
                "/dir/1",
                &mut reader,
                Box::new(|_: &dyn Artifact| -> anyhow::Result<()> {
                    anyhow::bail!("too large")
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::AfterWrite { .. }));
        assert!(!storage.exists("/dir/1").await);
        assert!(storage.list("/").await.unwrap_err().is_empty());
        let staged = std::fs::read_dir(temp.path().join("staging")).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn test_failed_hook_keeps_previous_content() {
        let (storage, _temp) = create_test_storage().await;

        storage.put("/1", b"original").await.unwrap();
        let mut reader: &[u8] = b"replacement";
        let result = storage
            .put_reader(
                "/1",
                &mut reader,
                Box::new(|_: &dyn Artifact| -> anyhow::Result<()> {
                    anyhow::bail!("no")
                }),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(storage.get("/1").await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_initialize_clears_stale_staging() {
        let (storage, temp) = create_test_storage().await;

        let stale = temp.path().join("staging").join("999-0.part");
        std::fs::write(&stale, b"half written").unwrap();
        storage.initialize().await.unwrap();

        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_get_reader_streams_large_blob() {
        let (storage, _temp) = create_test_storage().await;

        let data = vec![0xAB; 1_000_000];
        storage.put("/large", &data).await.unwrap();

        let mut reader = storage.get_reader("/large").await.unwrap();
        let mut retrieved = Vec::new();
        reader.read_to_end(&mut retrieved).await.unwrap();

        assert_eq!(storage.size("/large").await.unwrap(), 1_000_000);
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn test_concurrent_writes_and_removes_on_siblings() {
        let (storage, _temp) = create_test_storage().await;
        let storage = Arc::new(storage);

        let mut handles = Vec::new();
        for i in 0..16 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                let key = format!("/shared/{}", i);
                storage.put(&key, b"payload").await.unwrap();
                if i % 2 == 0 {
                    storage.remove(&key).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let expected: HashSet<String> = (0..16)
            .filter(|i| i % 2 == 1)
            .map(|i| format!("/shared/{}", i))
            .collect();
        assert_eq!(names(storage.list("/shared").await.unwrap()), expected);
    }

    #[tokio::test]
    async fn test_panicking_hook_leaves_no_trace() {
        let (storage, temp) = create_test_storage().await;
        let storage = Arc::new(storage);

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
        let staged = std::fs::read_dir(temp.path().join("staging")).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_same_key() {
        let (storage, _temp) = create_test_storage().await;
        let storage = Arc::new(storage);
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
        assert_eq!(names(storage.list("/same").await.unwrap()), HashSet::from(["/same/k".to_string()]));
    }

    #[tokio::test]
    async fn test_failed_commit_prunes_created_dirs() {
        let (storage, temp) = create_test_storage().await;
        storage.put("/a/keep", b"1").await.unwrap();

        let missing = temp.path().join("staging").join("vanished.part");
        let key = Key::parse("/a/b/c/1").unwrap();
        let err = storage.commit(&key, &missing).await.unwrap_err();

        assert!(matches!(err, StorageError::Medium { .. }));
        let store = temp.path().join("store");
        assert!(!store.join("a").join("b").exists());
        assert_eq!(names(storage.list("/a").await.unwrap()), HashSet::from(["/a/keep".to_string()]));
    }

    #[tokio::test]
    async fn test_failed_commit_at_top_level_leaves_root_empty() {
        let (storage, temp) = create_test_storage().await;

        let missing = temp.path().join("staging").join("vanished.part");
        let key = Key::parse("/x/y/1").unwrap();
        assert!(storage.commit(&key, &missing).await.is_err());

        assert!(storage.list("/").await.unwrap_err().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_warns_about_undeletable_staging_entry() {
        let (storage, temp) = create_test_storage().await;
        let stuck = temp.path().join("staging").join("leftover-dir");
        std::fs::create_dir(&stuck).unwrap();

        let (logs, _guard) = capture_logs();
        storage.initialize().await.unwrap();

        assert!(logs.contents().contains("Failed to discard staged entry"));
        assert!(stuck.exists());
    }

    #[tokio::test]
    async fn test_with_root() {
        let storage = LocalStorage::with_root("/tmp/test");
        assert_eq!(storage.root(), Path::new("/tmp/test"));
        assert_eq!(
            storage.blob_path(&Key::parse("/dir/1").unwrap()),
            PathBuf::from("/tmp/test/store/dir/1")
        );
    }
}
