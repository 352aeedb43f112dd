use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::ResultStore;
use crate::error::StoreError;

const SCHEME: &str = "memory://";

/// In-process store for tests; locators are `memory://<n>` with `n`
/// strictly increasing.
pub struct MemoryStore {
    next: AtomicU64,
    results: RwLock<HashMap<u64, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            results: RwLock::new(HashMap::new()),
        }
    }

    /// Drop every stored result. The counter keeps increasing.
    pub async fn clear(&self) {
        self.results.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    async fn store(&self, result: &Value) -> Result<String, StoreError> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.results.write().await.insert(id, result.clone());
        Ok(format!("{}{}", SCHEME, id))
    }

    async fn retrieve(&self, locator: &str) -> Result<Option<Value>, StoreError> {
        let Some(id) = locator
            .strip_prefix(SCHEME)
            .and_then(|id| id.parse::<u64>().ok())
        else {
            return Ok(None);
        };
        Ok(self.results.read().await.get(&id).cloned())
    }
}
