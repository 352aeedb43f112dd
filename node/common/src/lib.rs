//! Shared building blocks for the Agora provider agent and verifier:
//! order and proof types, canonical hashing, proof signing, result storage,
//! contract bindings and the retry/confirmation policy for ledger writes.

pub mod contracts;
pub mod crypto;
pub mod error;
pub mod proof;
pub mod reliability;
pub mod storage;
pub mod types;

pub use error::{ProofError, StoreError};
pub use proof::{ProofEngine, Verification};
pub use storage::ResultStore;
pub use types::*;
