use thiserror::Error;

/// Proof signing and signature decoding failures
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),
}

/// Result storage failures. A miss is not an error: `retrieve` returns `None`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage sink returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("storage sink unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid locator {0}")]
    InvalidLocator(String),
}
