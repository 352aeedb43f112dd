use async_trait::async_trait;
use ethers::types::H256;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::ResultStore;
use crate::crypto::hash_canonical;
use crate::error::StoreError;

const SCHEME: &str = "ipfs://";

/// CIDv1 prefix in base16 multibase: version 1, raw codec, sha2-256, 32 bytes
const CID_PREFIX: &str = "f01551220";

/// Content-addressed storage. Locators are CIDs over the canonical payload
/// digest; pinning is simulated by a local directory until network pinning
/// is wired in.
pub struct ContentAddressedStore {
    pin_dir: PathBuf,
}

impl ContentAddressedStore {
    pub fn new(pin_dir: impl Into<PathBuf>) -> Self {
        Self {
            pin_dir: pin_dir.into(),
        }
    }

    /// Locator of the document whose canonical digest is `digest`
    pub fn locator_for_digest(digest: H256) -> String {
        format!("{}{}{}", SCHEME, CID_PREFIX, hex::encode(digest))
    }

    fn cid_from_locator(locator: &str) -> Option<&str> {
        let cid = locator.strip_prefix(SCHEME)?;
        let digest = cid.strip_prefix(CID_PREFIX)?;
        if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(cid)
        } else {
            None
        }
    }

    fn pin_path(&self, cid: &str) -> PathBuf {
        self.pin_dir.join(format!("{}.json", cid))
    }

    pub fn pin_dir(&self) -> &Path {
        &self.pin_dir
    }
}

#[async_trait]
impl ResultStore for ContentAddressedStore {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    async fn store(&self, result: &Value) -> Result<String, StoreError> {
        let locator = Self::locator_for_digest(hash_canonical(result));
        // locator_for_digest always yields a well-formed CID
        let cid = Self::cid_from_locator(&locator)
            .ok_or_else(|| StoreError::InvalidLocator(locator.clone()))?;

        tokio::fs::create_dir_all(&self.pin_dir).await?;
        tokio::fs::write(self.pin_path(cid), serde_json::to_vec(result)?).await?;

        debug!("Pinned {}", locator);
        Ok(locator)
    }

    async fn retrieve(&self, locator: &str) -> Result<Option<Value>, StoreError> {
        let Some(cid) = Self::cid_from_locator(locator) else {
            return Ok(None);
        };

        match tokio::fs::read(self.pin_path(cid)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
