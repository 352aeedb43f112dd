use agora_common::{
    contracts::ServiceMarketplace,
    proof::verify_at,
    storage::probe,
    ProofEngine, ResultStore, StoredResult,
};
use anyhow::{Context, Result};
use ethers::{
    providers::Middleware,
    types::{Address, H256, U256},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Largest block window requested in one log query
const MAX_BLOCK_RANGE: u64 = 2_000;

/// Outcome of auditing one completed order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// No configured store holds the locator
    Missing,
    Invalid(Vec<String>),
}

/// Checks stored results against their on-chain commitment and proof
pub struct ResultVerifier {
    stores: Vec<Arc<dyn ResultStore>>,
    agent: Address,
    max_age: Duration,
}

impl ResultVerifier {
    pub fn new(stores: Vec<Arc<dyn ResultStore>>, agent: Address, max_age: Duration) -> Self {
        Self {
            stores,
            agent,
            max_age,
        }
    }

    /// Fetch the result behind `locator` and audit it
    pub async fn verify(&self, order_id: U256, locator: &str, on_chain_hash: H256) -> Result<Verdict> {
        let document = match probe(&self.stores, locator).await? {
            Some(document) => document,
            None => return Ok(Verdict::Missing),
        };

        let stored: StoredResult = match serde_json::from_value(document) {
            Ok(stored) => stored,
            Err(e) => {
                return Ok(Verdict::Invalid(vec![format!(
                    "malformed result document: {}",
                    e
                )]))
            }
        };

        let errors = self.check(
            order_id,
            &stored,
            on_chain_hash,
            chrono::Utc::now().timestamp_millis(),
        );
        Ok(if errors.is_empty() {
            Verdict::Valid
        } else {
            Verdict::Invalid(errors)
        })
    }

    /// Every failed check, in order; empty when the result is sound
    pub fn check(
        &self,
        order_id: U256,
        stored: &StoredResult,
        on_chain_hash: H256,
        now_ms: i64,
    ) -> Vec<String> {
        let mut errors = Vec::new();

        if stored.order_id != order_id {
            errors.push(format!(
                "document is for order {}, settled as order {}",
                stored.order_id, order_id
            ));
        }

        let computed = ProofEngine::result_hash(&stored.output);
        if computed != stored.result_hash {
            errors.push(format!(
                "stored hash {:?} does not match output hash {:?}",
                stored.result_hash, computed
            ));
        }
        if computed != on_chain_hash {
            errors.push(format!(
                "on-chain hash {:?} does not match output hash {:?}",
                on_chain_hash, computed
            ));
        }

        let proof = verify_at(
            &stored.proof,
            self.agent,
            None,
            Some(&stored.output),
            now_ms,
            self.max_age,
        );
        errors.extend(proof.errors);

        errors
    }
}

/// Polls order-completed events and audits each one
pub struct CompletionWatcher<M> {
    marketplace: ServiceMarketplace<M>,
    verifier: ResultVerifier,
    poll_interval: Duration,
    next_block: Option<u64>,
}

impl<M: Middleware + 'static> CompletionWatcher<M> {
    pub fn new(marketplace: ServiceMarketplace<M>, verifier: ResultVerifier, poll_interval: Duration) -> Self {
        Self {
            marketplace,
            verifier,
            poll_interval,
            next_block: None,
        }
    }

    pub fn with_start_block(mut self, block: u64) -> Self {
        self.next_block = Some(block);
        self
    }

    /// Audit every completion between the last scanned block and the head
    pub async fn poll_once(&mut self) -> Result<usize> {
        let latest = self
            .marketplace
            .client()
            .get_block_number()
            .await
            .context("fetching block number")?
            .as_u64();

        let mut from = self.next_block.unwrap_or(latest);
        let mut audited = 0;
        while from <= latest {
            let to = latest.min(from + MAX_BLOCK_RANGE - 1);
            let mut events = self
                .marketplace
                .order_completed_filter()
                .from_block(from)
                .to_block(to)
                .query_with_meta()
                .await
                .with_context(|| format!("querying completions in blocks {}..={}", from, to))?;
            events.sort_by_key(|(_, meta)| (meta.block_number, meta.log_index));

            for (event, meta) in events {
                let hash = H256::from(event.result_hash);
                match self.verifier.verify(event.order_id, &event.result_uri, hash).await {
                    Ok(Verdict::Valid) => {
                        info!("Order {} verified ({})", event.order_id, event.result_uri)
                    }
                    Ok(Verdict::Missing) => warn!(
                        "Order {}: result {} not found in any store",
                        event.order_id, event.result_uri
                    ),
                    Ok(Verdict::Invalid(errors)) => error!(
                        "Order {} failed verification in tx {:?}: {}",
                        event.order_id,
                        meta.transaction_hash,
                        errors.join("; ")
                    ),
                    Err(e) => error!("Order {}: fetching result failed: {:#}", event.order_id, e),
                }
                audited += 1;
            }

            from = to + 1;
            self.next_block = Some(from);
        }

        Ok(audited)
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => info!("Audited {} completed orders", n),
                Err(e) => error!("Completion poll failed: {:#}", e),
            }
        }
    }
}
