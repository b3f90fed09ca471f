//! Path-addressed blob storage with interchangeable backends.
//!
//! Every backend implements [`Storage`], a contract over slash-delimited keys
//! where directories are never stored on their own: a key is a directory
//! while at least one blob lives below it, and listing a key without
//! children is an error rather than an empty result.
//!
//! Backends:
//! - [`LocalStorage`] keeps blobs as files under a root directory
//! - [`MemoryStorage`] keeps blobs in a flat map, object-store style
//!
//! Use [`open`] to build an initialized backend from a [`StorageConfig`], and
//! [`conformance::run`] to check a backend against the contract.

pub mod conformance;
pub mod storage;

pub use storage::{
    open, AfterWrite, Artifact, BackendKind, BlobReader, Key, LocalStorage, MemoryStorage, Storage,
    StorageConfig, StorageError, StorageResult,
};
