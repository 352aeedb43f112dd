//! Result persistence.
//!
//! Every backend hands out scheme-prefixed locators and answers `None` for a
//! locator it does not own, so callers can probe several backends in turn.

mod content;
mod http;
mod local;
mod memory;

pub use content::ContentAddressedStore;
pub use http::HttpStore;
pub use local::LocalStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::StoreError;

/// Interchangeable result storage backend
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Locator prefix owned by this backend, e.g. `ipfs://`
    fn scheme(&self) -> &'static str;

    /// Persist `result` and return its locator
    async fn store(&self, result: &Value) -> Result<String, StoreError>;

    /// Fetch a stored result; `None` when missing or owned by another backend
    async fn retrieve(&self, locator: &str) -> Result<Option<Value>, StoreError>;
}

/// Try each store in order until one returns the result
pub async fn probe(
    stores: &[Arc<dyn ResultStore>],
    locator: &str,
) -> Result<Option<Value>, StoreError> {
    for store in stores {
        if let Some(value) = store.retrieve(locator).await? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Backend selection from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Ipfs,
    Local,
    Http,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ipfs" | "content" => Ok(StorageBackend::Ipfs),
            "local" | "file" | "fs" => Ok(StorageBackend::Local),
            "http" | "remote" => Ok(StorageBackend::Http),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("unknown storage backend: {}", s)),
        }
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Ipfs => write!(f, "ipfs"),
            StorageBackend::Local => write!(f, "local"),
            StorageBackend::Http => write!(f, "http"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Connection target for a backend
#[derive(Debug, Clone)]
pub enum StorageTarget {
    Directory(PathBuf),
    Url(String),
    None,
}

/// Build the configured backend
pub fn open(backend: StorageBackend, target: StorageTarget) -> Result<Arc<dyn ResultStore>, StoreError> {
    let store: Arc<dyn ResultStore> = match (backend, target) {
        (StorageBackend::Ipfs, StorageTarget::Directory(dir)) => Arc::new(ContentAddressedStore::new(dir)),
        (StorageBackend::Local, StorageTarget::Directory(dir)) => Arc::new(LocalStore::new(dir)),
        (StorageBackend::Http, StorageTarget::Url(url)) => Arc::new(HttpStore::new(&url)?),
        (StorageBackend::Memory, _) => Arc::new(MemoryStore::new()),
        (backend, target) => {
            return Err(StoreError::InvalidLocator(format!(
                "{} backend cannot use target {:?}",
                backend, target
            )))
        }
    };
    Ok(store)
}

/// Short prefix of a string identifier, used in file names
pub(crate) fn prefix(s: &str, len: usize) -> &str {
    match s.char_indices().nth(len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
