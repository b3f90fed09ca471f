// Black-box checks every storage backend must pass
//
// Each check leaves the backend as empty as it found it. Failures come back
// as errors naming the broken expectation, so a backend's own test suite can
// simply `run(&backend).await.unwrap()`.
use crate::storage::{Artifact, Key, Storage, StorageError};
use anyhow::{bail, ensure, Context, Result};
use futures::future::try_join_all;
use std::collections::HashSet;
use tokio::io::AsyncReadExt;

/// Run the whole battery against a freshly initialized backend
pub async fn run<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    storage.remove_all("/").await.context("Initial sweep failed")?;
    expect_empty(storage, "/").await?;

    get_put_exists_size_remove(storage).await?;
    get_put_readers(storage).await?;
    list_remove_all(storage).await?;
    key_normalization(storage).await?;
    key_conflicts(storage).await?;
    overwrite(storage).await?;
    hook_gates_write(storage).await?;
    concurrent_siblings(storage).await?;
    same_key_last_write_wins(storage).await?;

    storage.remove_all("/").await.context("Final sweep failed")?;
    expect_empty(storage, "/").await?;
    Ok(())
}

/// Whole-blob round trip and the not-found behavior around it
pub async fn get_put_exists_size_remove<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    expect_absent(storage, "/1").await?;

    storage.put("/1", b"lolwtf").await?;
    ensure!(storage.exists("/1").await, "Key should exist now");
    ensure!(storage.size("/1").await? == 6, "Size should be 6");
    ensure!(storage.get("/1").await? == b"lolwtf", "Content should be 'lolwtf'");

    storage.remove("/1").await?;
    ensure!(!storage.exists("/1").await, "Key should be gone after remove");
    expect_empty(storage, "/").await
}

/// Streaming round trip with the after-write hook
pub async fn get_put_readers<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    expect_absent(storage, "/dir/1").await?;

    let mut observed = None;
    let mut reader: &[u8] = b"lolwtfdir";
    storage
        .put_reader(
            "/dir/1",
            &mut reader,
            Box::new(|artifact: &dyn Artifact| -> Result<()> {
                observed = Some(artifact.size()?);
                Ok(())
            }),
        )
        .await?;

    match observed {
        None => bail!("afterWrite should have been called"),
        Some(size) => ensure!(size == 9, "afterWrite saw size {}, expected 9", size),
    }
    ensure!(storage.size("/dir/1").await? == 9, "Size should be 9");
    ensure!(storage.exists("/dir/1").await, "Key should exist now");

    let mut content = Vec::new();
    storage
        .get_reader("/dir/1")
        .await?
        .read_to_end(&mut content)
        .await?;
    ensure!(content == b"lolwtfdir", "Streamed content should be 'lolwtfdir'");

    storage.remove("/dir/1").await?;
    expect_empty(storage, "/dir").await?;
    // The emptied directory must disappear from its parent too
    expect_empty(storage, "/").await
}

/// Listing of implicit directories and recursive removal
pub async fn list_remove_all<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    storage.put("/dir/1", b"lolwtfdir1").await?;
    storage.put("/dir/2", b"lolwtfdir2").await?;
    storage.put("/dir/3", b"lolwtfdir3").await?;
    storage.put("/anotherdir/1", b"lolwtfanotherdir1").await?;

    expect_list(storage, "/", &["/dir", "/anotherdir"]).await?;
    expect_list(storage, "/dir", &["/dir/1", "/dir/2", "/dir/3"]).await?;
    expect_list(storage, "/anotherdir/", &["/anotherdir/1"]).await?;

    storage.remove_all("/dir").await?;
    expect_list(storage, "/", &["/anotherdir"]).await?;
    expect_empty(storage, "/dir").await?;
    expect_list(storage, "/anotherdir", &["/anotherdir/1"]).await?;

    storage.remove_all("/anotherdir").await?;
    expect_empty(storage, "/").await?;
    expect_empty(storage, "/dir").await?;
    expect_empty(storage, "/anotherdir").await?;

    storage
        .remove_all("/anotherdir")
        .await
        .context("Repeated remove_all should be a no-op")?;
    storage
        .remove_all("/never/written")
        .await
        .context("remove_all of an absent prefix should be a no-op")?;
    expect_empty(storage, "/").await
}

/// Equivalent spellings of a key address the same blob
pub async fn key_normalization<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    storage.put("norm//a/", b"x").await?;
    ensure!(storage.exists("/norm/a").await, "'norm//a/' should address /norm/a");
    expect_list(storage, "//norm", &["/norm/a"]).await?;

    ensure!(!storage.exists("/norm/../norm/a").await, "Relative keys never exist");
    ensure!(
        matches!(storage.get("/norm/../a").await, Err(StorageError::InvalidKey { .. })),
        "Relative keys should be rejected"
    );

    storage.remove("/norm/a/").await?;
    expect_empty(storage, "/").await
}

/// A key is a blob or a directory, never both
pub async fn key_conflicts<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    storage.put("/tree/leaf", b"1").await?;

    ensure!(
        matches!(storage.put("/tree", b"2").await, Err(StorageError::Conflict { .. })),
        "Writing a blob over a directory should conflict"
    );
    ensure!(
        matches!(storage.put("/tree/leaf/below", b"3").await, Err(StorageError::Conflict { .. })),
        "Writing below a blob should conflict"
    );
    ensure!(
        matches!(storage.put("/", b"4").await, Err(StorageError::Conflict { .. })),
        "Writing a blob at the root should conflict"
    );

    ensure!(!storage.exists("/tree").await, "A directory is not a blob");
    expect_not_found(storage.get("/tree").await.map(drop), "get of a directory")?;
    expect_not_found(storage.size("/tree").await.map(drop), "size of a directory")?;
    expect_not_found(storage.remove("/tree").await, "remove of a directory")?;
    expect_empty(storage, "/tree/leaf").await?;

    storage.remove_all("/tree").await?;
    expect_empty(storage, "/").await
}

/// Rewriting a key replaces its content in place
pub async fn overwrite<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    storage.put("/over/1", b"first version").await?;
    storage.put("/over/1", b"second").await?;

    ensure!(storage.get("/over/1").await? == b"second", "Last write should win");
    ensure!(storage.size("/over/1").await? == 6, "Size should follow the last write");
    expect_list(storage, "/over", &["/over/1"]).await?;

    storage.remove("/over/1").await?;
    expect_empty(storage, "/").await
}

/// A failing after-write hook fails the write and stores nothing
pub async fn hook_gates_write<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    let mut reader: &[u8] = b"rejected";
    let result = storage
        .put_reader(
            "/gated/1",
            &mut reader,
            Box::new(|_: &dyn Artifact| -> Result<()> { bail!("hook refused the blob") }),
        )
        .await;

    ensure!(
        matches!(result, Err(StorageError::AfterWrite { .. })),
        "A failing hook should fail put_reader"
    );
    expect_absent(storage, "/gated/1").await?;
    expect_empty(storage, "/gated").await?;
    expect_empty(storage, "/").await
}

/// Writers and removers on distinct sibling keys do not interfere
pub async fn concurrent_siblings<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    let keys: Vec<String> = (0..8).map(|i| format!("/concurrent/{}", i)).collect();

    try_join_all(keys.iter().map(|key| storage.put(key, key.as_bytes()))).await?;
    for key in &keys {
        ensure!(storage.get(key).await? == key.as_bytes(), "{} has the wrong content", key);
    }
    let expected: Vec<&str> = keys.iter().map(String::as_str).collect();
    expect_list(storage, "/concurrent", &expected).await?;

    try_join_all(keys.iter().map(|key| storage.remove(key))).await?;
    expect_empty(storage, "/concurrent").await?;
    expect_empty(storage, "/").await
}

/// Concurrent writers to one key leave exactly one of their payloads intact
pub async fn same_key_last_write_wins<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![b'a' + i; 64 * 1024]).collect();

    try_join_all(payloads.iter().map(|data| storage.put("/same/k", data))).await?;

    let stored = storage.get("/same/k").await?;
    ensure!(
        payloads.iter().any(|data| *data == stored),
        "Stored blob should equal one written payload, got {} mixed bytes",
        stored.len()
    );
    ensure!(
        storage.size("/same/k").await? == stored.len() as u64,
        "Size should match the winning payload"
    );
    expect_list(storage, "/same", &["/same/k"]).await?;

    storage.remove("/same/k").await?;
    expect_empty(storage, "/").await
}

async fn expect_absent<S: Storage + ?Sized>(storage: &S, key: &str) -> Result<()> {
    ensure!(!storage.exists(key).await, "{} should not exist yet", key);
    expect_not_found(storage.get(key).await.map(drop), "get")?;
    expect_not_found(storage.get_reader(key).await.map(drop), "get_reader")?;
    expect_not_found(storage.size(key).await.map(drop), "size")?;
    expect_not_found(storage.remove(key).await, "remove")
}

fn expect_not_found(result: Result<(), StorageError>, what: &str) -> Result<()> {
    match result {
        Err(StorageError::NotFound(_)) => Ok(()),
        Err(other) => bail!("{} should fail with NotFound, got: {}", what, other),
        Ok(()) => bail!("{} of a missing blob should fail", what),
    }
}

/// Listing an empty or absent key must be an error, never an empty result
async fn expect_empty<S: Storage + ?Sized>(storage: &S, key: &str) -> Result<()> {
    match storage.list(key).await {
        Err(StorageError::Empty(_)) => Ok(()),
        Err(other) => bail!("Listing {} should fail with Empty, got: {}", key, other),
        Ok(names) => bail!(
            "Listing the empty directory {} should be an error, got {:?}",
            key,
            names
        ),
    }
}

async fn expect_list<S: Storage + ?Sized>(storage: &S, key: &str, expected: &[&str]) -> Result<()> {
    let names = storage
        .list(key)
        .await
        .with_context(|| format!("Listing {} failed", key))?;
    let got: HashSet<&str> = names.iter().map(Key::as_str).collect();
    let want: HashSet<&str> = expected.iter().copied().collect();

    ensure!(
        names.len() == expected.len() && got == want,
        "Listing {} returned {:?}, expected {:?}",
        key,
        got,
        want
    );
    Ok(())
}
