use agora_common::storage::{probe, ContentAddressedStore};
use agora_common::{
    Order, OrderStatus, ProofEngine, ResultStore, StoredResult, TaskInput,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::types::{H256, U256};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::orderbook::OrderBook;
use crate::registry::ExecutorRegistry;
use crate::settlement::OrderSettler;

/// Finds the input document an order's `inputHash` refers to
#[async_trait]
pub trait InputResolver: Send + Sync {
    async fn resolve(&self, order: &Order) -> Result<Option<Value>>;
}

/// Looks order inputs up by content address across the given stores
pub struct ContentAddressedInputs {
    stores: Vec<Arc<dyn ResultStore>>,
}

impl ContentAddressedInputs {
    pub fn new(stores: Vec<Arc<dyn ResultStore>>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl InputResolver for ContentAddressedInputs {
    async fn resolve(&self, order: &Order) -> Result<Option<Value>> {
        let locator = ContentAddressedStore::locator_for_digest(order.input_hash);
        Ok(probe(&self.stores, &locator).await?)
    }
}

/// What happened to one dispatched order
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Settled { locator: String, tx_hash: H256 },
    /// Executor reported failure; the order stays pending
    Failed(String),
    Expired,
    AwaitingInput,
    NoExecutor,
}

struct InFlightGuard {
    set: Arc<Mutex<HashSet<U256>>>,
    order_id: U256,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.order_id);
    }
}

fn lock(set: &Mutex<HashSet<U256>>) -> std::sync::MutexGuard<'_, HashSet<U256>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drives orders from ingestion to settlement.
///
/// At most `max_concurrent_tasks` orders execute at once; further work
/// waits for a permit. An order is never dispatched twice concurrently.
pub struct Agent {
    registry: Arc<ExecutorRegistry>,
    proofs: Arc<ProofEngine>,
    store: Arc<dyn ResultStore>,
    settler: Arc<dyn OrderSettler>,
    inputs: Arc<dyn InputResolver>,
    book: OrderBook,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<U256>>>,
    rescan_interval: Duration,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        proofs: Arc<ProofEngine>,
        store: Arc<dyn ResultStore>,
        settler: Arc<dyn OrderSettler>,
        inputs: Arc<dyn InputResolver>,
        book: OrderBook,
        max_concurrent_tasks: usize,
        rescan_interval: Duration,
    ) -> Self {
        Self {
            registry,
            proofs,
            store,
            settler,
            inputs,
            book,
            permits: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            rescan_interval,
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Spawn processing of `order` unless it is already in flight
    pub fn dispatch(self: &Arc<Self>, order: Order) -> Option<JoinHandle<Outcome>> {
        if !lock(&self.in_flight).insert(order.order_id) {
            debug!("Order {} already in flight", order.order_id);
            return None;
        }
        let guard = InFlightGuard {
            set: self.in_flight.clone(),
            order_id: order.order_id,
        };

        let agent = self.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = agent.permits.clone().acquire_owned().await else {
                return Outcome::Failed("agent shutting down".into());
            };

            match agent.process(&order).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Order {} failed: {:#}", order.order_id, e);
                    Outcome::Failed(format!("{:#}", e))
                }
            }
        }))
    }

    /// Run one order through execute → prove → store → settle
    pub async fn process(&self, order: &Order) -> Result<Outcome> {
        let now = chrono::Utc::now().timestamp() as u64;
        if order.is_expired(now) {
            warn!("Order {} passed its deadline {}, abandoning", order.order_id, order.deadline);
            return Ok(Outcome::Expired);
        }

        // a result stored by an earlier attempt is settled as is
        let recorded = self
            .book
            .get(order.order_id)?
            .filter(|o| o.status == OrderStatus::Pending)
            .and_then(|o| Some((o.result_locator?, o.result_hash?)));
        if let Some((locator, result_hash)) = recorded {
            info!(
                "Order {} already stored at {}, re-submitting completion",
                order.order_id, locator
            );
            return self.settle(order, locator, result_hash).await;
        }

        let Some(payload) = self
            .inputs
            .resolve(order)
            .await
            .with_context(|| format!("resolving input of order {}", order.order_id))?
        else {
            info!("Input of order {} not available yet", order.order_id);
            return Ok(Outcome::AwaitingInput);
        };

        let task = TaskInput::for_order(order, payload);

        let Some(executor) = self.registry.route(&task.service_type) else {
            warn!("No executor handles {}", task.service_type);
            return Ok(Outcome::NoExecutor);
        };

        info!("Executing order {} with {}", order.order_id, executor.id());
        let mut result = executor.execute(&task).await;

        let (Some(output), Some(result_hash)) = (result.output.clone(), result.result_hash) else {
            let reason = result.error.unwrap_or_else(|| "executor returned no output".into());
            return Ok(Outcome::Failed(reason));
        };

        let proof = self
            .proofs
            .generate(executor.proof_kind(), &task, &output, result.evidence.clone())
            .context("signing proof of work")?;

        let stored = StoredResult {
            order_id: order.order_id,
            service_type: task.service_type.clone(),
            output,
            result_hash,
            proof: proof.clone(),
            metadata: result.metadata.clone(),
        };
        let document = serde_json::to_value(&stored)?;
        let locator = self
            .store
            .store(&document)
            .await
            .with_context(|| format!("storing result of order {}", order.order_id))?;
        result.attach(proof, locator.clone());
        self.book.record_result(order.order_id, &locator, result_hash)?;
        info!(
            "Order {} executed in {}ms, stored at {}",
            order.order_id, result.metadata.duration_ms, locator
        );

        self.settle(order, locator, result_hash).await
    }

    /// Submit completion for a stored result and mark the order completed
    async fn settle(&self, order: &Order, locator: String, result_hash: H256) -> Result<Outcome> {
        let tx_hash = self
            .settler
            .complete_order(order.order_id, &locator, result_hash)
            .await?;

        let settled_locator = locator.clone();
        self.book.transition(order.order_id, OrderStatus::Completed, move |o| {
            o.result_locator = Some(settled_locator.clone());
            o.result_hash = Some(result_hash);
        })?;

        info!("Order {} settled: {}", order.order_id, locator);
        Ok(Outcome::Settled { locator, tx_hash })
    }

    /// Dispatch every stored pending order that is not running
    pub fn rescan(self: &Arc<Self>) -> Result<usize> {
        let now = chrono::Utc::now().timestamp() as u64;
        let mut dispatched = 0;
        for order in self.book.orders_with_status(OrderStatus::Pending)? {
            if order.is_expired(now) {
                continue;
            }
            if self.dispatch(order).is_some() {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Consume new work until the ingestor side closes
    pub async fn run(self: Arc<Self>, mut work: mpsc::Receiver<Order>) {
        let mut ticker = tokio::time::interval(self.rescan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                next = work.recv() => match next {
                    Some(order) => {
                        self.dispatch(order);
                    }
                    None => break,
                },
                _ = ticker.tick() => match self.rescan() {
                    Ok(0) => {}
                    Ok(n) => debug!("Re-dispatched {} pending orders", n),
                    Err(e) => error!("Pending order scan failed: {:#}", e),
                },
            }
        }

        info!("Work channel closed, agent loop exiting");
    }
}
