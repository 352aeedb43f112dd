//! Signed proof-of-work records.
//!
//! A proof binds the canonical digest of a task's input and output to the
//! agent's signing key. The signature is an EIP-191 personal signature over
//! the canonical JSON of every other field, so verifiers only need the
//! agent's address to check it.

use ethers::{
    signers::{LocalWallet, Signer},
    types::{Address, Signature, SignatureError, H256},
    utils::hash_message,
};
use serde_json::{json, Value};
use std::time::Duration;

use crate::crypto::{canonical_json, hash_canonical};
use crate::error::ProofError;
use crate::types::{ProofKind, ProofOfWork, TaskInput};

/// Default acceptable age of a proof at verification time
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(3600);

/// Outcome of a proof check; every failed check adds one entry to `errors`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Proof generation and verification
pub struct ProofEngine {
    wallet: LocalWallet,
    freshness: Duration,
}

impl ProofEngine {
    pub fn new(wallet: LocalWallet) -> Self {
        Self {
            wallet,
            freshness: DEFAULT_FRESHNESS,
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Address proofs from this engine recover to
    pub fn signer(&self) -> Address {
        self.wallet.address()
    }

    /// The input document a proof commits to
    pub fn input_document(task: &TaskInput) -> &Value {
        &task.payload
    }

    /// 32-byte digest used on-chain for a result object
    pub fn result_hash(result: &Value) -> H256 {
        hash_canonical(result)
    }

    /// Build and sign a proof over `task`'s input and `output`
    pub fn generate(
        &self,
        kind: ProofKind,
        task: &TaskInput,
        output: &Value,
        evidence: Value,
    ) -> Result<ProofOfWork, ProofError> {
        let mut proof = ProofOfWork {
            kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
            input_hash: hash_canonical(Self::input_document(task)),
            output_hash: hash_canonical(output),
            evidence,
            signature: String::new(),
        };

        let body = unsigned_body(&proof)?;
        let signature = self
            .wallet
            .sign_hash(hash_message(body.as_bytes()))
            .map_err(|e| ProofError::Signing(e.to_string()))?;
        proof.signature = format!("0x{}", hex::encode(signature.to_vec()));

        Ok(proof)
    }

    /// Check `proof` against the expected signer and, when supplied, the
    /// original input and output. All checks run; failures accumulate.
    pub fn verify(
        &self,
        proof: &ProofOfWork,
        expected_signer: Address,
        input: Option<&Value>,
        output: Option<&Value>,
    ) -> Verification {
        verify_at(
            proof,
            expected_signer,
            input,
            output,
            chrono::Utc::now().timestamp_millis(),
            self.freshness,
        )
    }
}

/// Stateless verification against an explicit clock (unix ms)
pub fn verify_at(
    proof: &ProofOfWork,
    expected_signer: Address,
    input: Option<&Value>,
    output: Option<&Value>,
    now_ms: i64,
    freshness: Duration,
) -> Verification {
    let mut errors = Vec::new();

    match recover_signer(proof) {
        Ok(signer) if signer == expected_signer => {}
        Ok(signer) => errors.push(format!(
            "signature recovers to {:?}, expected {:?}",
            signer, expected_signer
        )),
        Err(e) => errors.push(format!("signature check failed: {}", e)),
    }

    if let Some(input) = input {
        let computed = hash_canonical(input);
        if computed != proof.input_hash {
            errors.push(format!(
                "input hash mismatch: proof has {:?}, computed {:?}",
                proof.input_hash, computed
            ));
        }
    }

    if let Some(output) = output {
        let computed = hash_canonical(output);
        if computed != proof.output_hash {
            errors.push(format!(
                "output hash mismatch: proof has {:?}, computed {:?}",
                proof.output_hash, computed
            ));
        }
    }

    let window = freshness.as_millis() as i64;
    let age = now_ms - proof.timestamp;
    if age.abs() > window {
        errors.push(format!(
            "timestamp {} outside freshness window of {}ms (age {}ms)",
            proof.timestamp, window, age
        ));
    }

    Verification {
        valid: errors.is_empty(),
        errors,
    }
}

/// Recover the address that signed `proof`
pub fn recover_signer(proof: &ProofOfWork) -> Result<Address, ProofError> {
    let signature: Signature = proof
        .signature
        .parse()
        .map_err(|e: SignatureError| ProofError::MalformedSignature(e.to_string()))?;
    let body = unsigned_body(proof)?;
    signature
        .recover(body.as_str())
        .map_err(|e| ProofError::MalformedSignature(e.to_string()))
}

/// Canonical JSON of every field except the signature
fn unsigned_body(proof: &ProofOfWork) -> Result<String, ProofError> {
    let body = json!({
        "type": proof.kind,
        "timestamp": proof.timestamp,
        "inputHash": proof.input_hash,
        "outputHash": proof.output_hash,
        "evidence": proof.evidence,
    });
    Ok(canonical_json(&body))
}
