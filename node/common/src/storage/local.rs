use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{prefix, ResultStore};
use crate::crypto::hash_canonical;
use crate::error::StoreError;

const SCHEME: &str = "file://";

/// One JSON document per result in a local directory.
/// File names are `<orderIdPrefix>-<digestPrefix>.json`.
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_name(result: &Value) -> String {
        let order_id = match result.get("orderId") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => "result".to_string(),
        };
        let digest = hex::encode(hash_canonical(result));
        format!("{}-{}.json", prefix(&order_id, 8), prefix(&digest, 16))
    }

    fn path_from_locator(&self, locator: &str) -> Option<PathBuf> {
        let path = Path::new(locator.strip_prefix(SCHEME)?);
        let name = path.file_name()?;
        // only files directly inside the store directory
        if path.parent()? != self.dir.as_path() {
            return None;
        }
        Some(self.dir.join(name))
    }
}

#[async_trait]
impl ResultStore for LocalStore {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    async fn store(&self, result: &Value) -> Result<String, StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.dir.join(Self::file_name(result));
        tokio::fs::write(&path, serde_json::to_vec_pretty(result)?).await?;

        let locator = format!("{}{}", SCHEME, path.display());
        debug!("Stored result at {}", locator);
        Ok(locator)
    }

    async fn retrieve(&self, locator: &str) -> Result<Option<Value>, StoreError> {
        let Some(path) = self.path_from_locator(locator) else {
            return Ok(None);
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
