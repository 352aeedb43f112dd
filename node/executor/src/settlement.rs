use agora_common::contracts::{
    find_event, AgentRegistry, AgentRegisteredFilter, Client, CrossDomainBridge, OrderCancelledFilter,
    OrderCompletedFilter, OrderCreatedFilter, OrderDisputedFilter, DisputeResolvedFilter,
    ServiceListedFilter, ServiceMarketplace, StreamClaimedFilter, StreamOpenedFilter, StreamStoppedFilter,
    WithdrawalInitiatedFilter,
};
use agora_common::reliability::{retry_with_backoff, ConfirmationPolicy, RetryConfig};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ethers::abi::Detokenize;
use ethers::contract::builders::ContractCall;
use ethers::providers::Middleware;
use ethers::types::{Address, TransactionReceipt, H256, U256};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Contract addresses and write policy
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub registry: Address,
    pub marketplace: Address,
    pub bridge: Option<Address>,
    /// `None` or 0 looks the chain id up once
    pub chain_id: Option<u64>,
    pub retry: RetryConfig,
}

/// Completion hook the agent settles through
#[async_trait]
pub trait OrderSettler: Send + Sync {
    async fn complete_order(&self, order_id: U256, locator: &str, result_hash: H256) -> Result<H256>;
}

/// Submits ledger writes with retry and the chain's confirmation policy
pub struct SettlementClient {
    client: Arc<Client>,
    registry: AgentRegistry<Client>,
    marketplace: ServiceMarketplace<Client>,
    bridge: Option<CrossDomainBridge<Client>>,
    confirmations: ConfirmationPolicy,
    retry: RetryConfig,
}

impl SettlementClient {
    pub fn new(client: Arc<Client>, config: SettlementConfig) -> Self {
        Self {
            registry: AgentRegistry::new(config.registry, client.clone()),
            marketplace: ServiceMarketplace::new(config.marketplace, client.clone()),
            bridge: config
                .bridge
                .map(|address| CrossDomainBridge::new(address, client.clone())),
            confirmations: ConfirmationPolicy::new(config.chain_id),
            retry: config.retry,
            client,
        }
    }

    pub fn address(&self) -> Address {
        self.client.address()
    }

    pub fn marketplace(&self) -> &ServiceMarketplace<Client> {
        &self.marketplace
    }

    async fn required_confirmations(&self) -> Result<usize> {
        let client = self.client.clone();
        self.confirmations
            .confirmations(|| async move {
                let chain_id = client.get_chainid().await?;
                Ok(chain_id.as_u64())
            })
            .await
    }

    /// Send the call built by `build`, retrying transient failures, and wait
    /// for the required confirmations
    async fn submit<D, F>(&self, label: &str, build: F) -> Result<TransactionReceipt>
    where
        D: Detokenize + Send + Sync,
        F: Fn() -> ContractCall<Client, D>,
    {
        let confirmations = self.required_confirmations().await?;

        confirm_write(label, &self.retry, || {
            let call = build();
            async move {
                let pending = call.send().await?;
                let tx_hash = *pending;
                let receipt = pending.confirmations(confirmations).await?;
                Ok::<_, anyhow::Error>((tx_hash, receipt))
            }
        })
        .await
    }

    pub async fn register_agent(&self, did: &str, metadata_uri: &str) -> Result<H256> {
        let receipt = self
            .submit("registerAgent", || {
                self.registry
                    .register_agent(did.to_string(), metadata_uri.to_string())
            })
            .await?;
        let registered = find_event::<AgentRegisteredFilter>(&receipt);
        info!(
            "Registered agent {} in tx {:?} ({:?})",
            did,
            receipt.transaction_hash,
            registered.map(|e| e.agent)
        );
        Ok(receipt.transaction_hash)
    }

    pub async fn is_registered(&self) -> Result<bool> {
        Ok(self.registry.is_registered(self.address()).call().await?)
    }

    /// List a capability; returns the new service id
    pub async fn list_service(&self, service_type: &str, price_per_unit: U256, metadata_uri: &str) -> Result<U256> {
        let receipt = self
            .submit("listService", || {
                self.marketplace
                    .list_service(service_type.to_string(), price_per_unit, metadata_uri.to_string())
            })
            .await?;
        let listed = find_event::<ServiceListedFilter>(&receipt)
            .ok_or_else(|| anyhow!("no ServiceListed event in tx {:?}", receipt.transaction_hash))?;
        info!(
            "Listed {} as service {} in tx {:?}",
            service_type, listed.service_id, receipt.transaction_hash
        );
        Ok(listed.service_id)
    }

    /// Buyer-side order creation; returns the new order id
    pub async fn create_order(&self, service_id: U256, units: U256, deadline: u64, value: U256) -> Result<U256> {
        let receipt = self
            .submit("createOrder", || {
                self.marketplace
                    .create_order(service_id, units, deadline)
                    .value(value)
            })
            .await?;
        let created = find_event::<OrderCreatedFilter>(&receipt)
            .ok_or_else(|| anyhow!("no OrderCreated event in tx {:?}", receipt.transaction_hash))?;
        info!("Created order {} in tx {:?}", created.order_id, receipt.transaction_hash);
        Ok(created.order_id)
    }

    pub async fn dispute_order(&self, order_id: U256, reason: &str) -> Result<H256> {
        let receipt = self
            .submit("disputeOrder", || {
                self.marketplace.dispute_order(order_id, reason.to_string())
            })
            .await?;
        let disputed = find_event::<OrderDisputedFilter>(&receipt);
        info!(
            "Disputed order {} in tx {:?}",
            disputed.map(|e| e.order_id).unwrap_or(order_id),
            receipt.transaction_hash
        );
        Ok(receipt.transaction_hash)
    }

    pub async fn resolve_dispute(&self, order_id: U256, refund_buyer: bool) -> Result<H256> {
        let receipt = self
            .submit("resolveDispute", || {
                self.marketplace.resolve_dispute(order_id, refund_buyer)
            })
            .await?;
        let resolved = find_event::<DisputeResolvedFilter>(&receipt);
        info!(
            "Resolved dispute on order {} (refund: {:?}) in tx {:?}",
            order_id,
            resolved.map(|e| e.refund_buyer),
            receipt.transaction_hash
        );
        Ok(receipt.transaction_hash)
    }

    pub async fn cancel_order(&self, order_id: U256) -> Result<H256> {
        let receipt = self
            .submit("cancelOrder", || self.marketplace.cancel_order(order_id))
            .await?;
        let cancelled = find_event::<OrderCancelledFilter>(&receipt);
        info!(
            "Cancelled order {} in tx {:?}",
            cancelled.map(|e| e.order_id).unwrap_or(order_id),
            receipt.transaction_hash
        );
        Ok(receipt.transaction_hash)
    }

    /// Open a payment stream funded with `deposit`; returns the stream id
    pub async fn open_stream(&self, payee: Address, rate_per_second: U256, deposit: U256) -> Result<U256> {
        let receipt = self
            .submit("openStream", || {
                self.marketplace
                    .open_stream(payee, rate_per_second)
                    .value(deposit)
            })
            .await?;
        let opened = find_event::<StreamOpenedFilter>(&receipt)
            .ok_or_else(|| anyhow!("no StreamOpened event in tx {:?}", receipt.transaction_hash))?;
        info!(
            "Opened stream {} to {:?} at {} wei/s in tx {:?}",
            opened.stream_id, payee, rate_per_second, receipt.transaction_hash
        );
        Ok(opened.stream_id)
    }

    /// Claim accrued stream funds; returns the claimed amount
    pub async fn claim_stream(&self, stream_id: U256) -> Result<U256> {
        let receipt = self
            .submit("claimStream", || self.marketplace.claim_stream(stream_id))
            .await?;
        let claimed = find_event::<StreamClaimedFilter>(&receipt)
            .ok_or_else(|| anyhow!("no StreamClaimed event in tx {:?}", receipt.transaction_hash))?;
        info!(
            "Claimed {} wei from stream {} in tx {:?}",
            claimed.amount, claimed.stream_id, receipt.transaction_hash
        );
        Ok(claimed.amount)
    }

    pub async fn stop_stream(&self, stream_id: U256) -> Result<H256> {
        let receipt = self
            .submit("stopStream", || self.marketplace.stop_stream(stream_id))
            .await?;
        let stopped = find_event::<StreamStoppedFilter>(&receipt);
        info!(
            "Stopped stream {} (refunded {:?}) in tx {:?}",
            stream_id,
            stopped.map(|e| e.refunded),
            receipt.transaction_hash
        );
        Ok(receipt.transaction_hash)
    }

    fn bridge(&self) -> Result<&CrossDomainBridge<Client>> {
        self.bridge
            .as_ref()
            .ok_or_else(|| anyhow!("no bridge address configured"))
    }

    pub async fn bridge_balance(&self) -> Result<U256> {
        let bridge = self.bridge()?;
        Ok(bridge.balance_of(self.address()).call().await?)
    }

    pub async fn bridge_withdraw(&self, amount: U256, recipient: Address) -> Result<U256> {
        let bridge = self.bridge()?;
        let receipt = self
            .submit("withdraw", || bridge.withdraw(amount, recipient))
            .await?;
        let initiated = find_event::<WithdrawalInitiatedFilter>(&receipt)
            .ok_or_else(|| anyhow!("no WithdrawalInitiated event in tx {:?}", receipt.transaction_hash))?;
        info!(
            "Withdrawal {} of {} wei to {:?} in tx {:?}",
            initiated.withdrawal_id, amount, recipient, receipt.transaction_hash
        );
        Ok(initiated.withdrawal_id)
    }
}

/// Drive one ledger write: `attempt` sends the transaction and waits for
/// its receipt (`None` when it left the mempool). Transient failures are
/// retried; a receipt with status 0 is a revert.
pub(crate) async fn confirm_write<F, Fut>(label: &str, retry: &RetryConfig, attempt: F) -> Result<TransactionReceipt>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(H256, Option<TransactionReceipt>)>>,
{
    let receipt = retry_with_backoff(
        || {
            let sent = attempt();
            async move {
                let (tx_hash, receipt) = sent.await?;
                receipt.ok_or_else(|| anyhow!("transaction {:?} dropped from mempool", tx_hash))
            }
        },
        retry,
    )
    .await
    .with_context(|| format!("{} failed", label))?;

    if receipt.status == Some(0u64.into()) {
        bail!("{} reverted in tx {:?}", label, receipt.transaction_hash);
    }
    Ok(receipt)
}

#[async_trait]
impl OrderSettler for SettlementClient {
    async fn complete_order(&self, order_id: U256, locator: &str, result_hash: H256) -> Result<H256> {
        let receipt = self
            .submit("completeOrder", || {
                self.marketplace
                    .complete_order(order_id, locator.to_string(), result_hash.0)
            })
            .await?;
        let completed = find_event::<OrderCompletedFilter>(&receipt);
        info!(
            "Completed order {} in tx {:?} (locator {})",
            completed.map(|e| e.order_id).unwrap_or(order_id),
            receipt.transaction_hash,
            locator
        );
        Ok(receipt.transaction_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::middleware::SignerMiddleware;
    use ethers::providers::{Http, Provider};
    use ethers::signers::LocalWallet;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    // anvil/hardhat account #0
    const KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn settlement(chain_id: Option<u64>, bridge: Option<Address>) -> SettlementClient {
        // nothing listens here
        let provider = Provider::<Http>::try_from("http://127.0.0.1:1").unwrap();
        let wallet: LocalWallet = KEY.parse().unwrap();
        SettlementClient::new(
            Arc::new(SignerMiddleware::new(provider, wallet)),
            SettlementConfig {
                registry: Address::repeat_byte(0x01),
                marketplace: Address::repeat_byte(0x02),
                bridge,
                chain_id,
                retry: RetryConfig::default(),
            },
        )
    }

    #[tokio::test]
    async fn configured_chain_ids_skip_the_lookup() {
        assert_eq!(settlement(Some(1337), None).required_confirmations().await.unwrap(), 0);
        assert_eq!(settlement(Some(42161), None).required_confirmations().await.unwrap(), 1);

        let err = settlement(Some(0), None).required_confirmations().await.unwrap_err();
        assert!(format!("{:#}", err).contains("chain id lookup failed"));
    }

    #[tokio::test]
    async fn bridge_calls_need_a_bridge_address() {
        let client = settlement(Some(1337), None);
        let err = client.bridge_balance().await.unwrap_err();
        assert_eq!(err.to_string(), "no bridge address configured");

        let err = client
            .bridge_withdraw(U256::from(1), Address::zero())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no bridge address configured");
    }

    fn quick_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            exponential_base: 2.0,
        }
    }

    fn receipt(status: u64) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: H256::repeat_byte(0xab),
            status: Some(status.into()),
            ..Default::default()
        }
    }

    /// Replays scripted attempt results in order
    struct Script {
        steps: Mutex<VecDeque<Result<Option<TransactionReceipt>>>>,
        sent: AtomicU32,
    }

    impl Script {
        fn new(steps: Vec<Result<Option<TransactionReceipt>>>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                sent: AtomicU32::new(0),
            }
        }

        async fn run(&self, label: &str) -> Result<TransactionReceipt> {
            confirm_write(label, &quick_retry(), || {
                let n = self.sent.fetch_add(1, Ordering::SeqCst);
                let step = self.steps.lock().unwrap().pop_front();
                async move {
                    let receipt = step.unwrap_or_else(|| Err(anyhow!("script exhausted")))?;
                    Ok::<_, anyhow::Error>((H256::from_low_u64_be(n as u64), receipt))
                }
            })
            .await
        }
    }

    #[tokio::test]
    async fn transient_send_failures_are_retried_until_mined() {
        let script = Script::new(vec![
            Err(anyhow!("error sending request: connection refused")),
            Err(anyhow!("(code: -32000, message: nonce too low)")),
            Ok(Some(receipt(1))),
        ]);

        let mined = script.run("completeOrder").await.unwrap();
        assert_eq!(mined.transaction_hash, H256::repeat_byte(0xab));
        assert_eq!(script.sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reverted_receipts_are_not_retried() {
        let script = Script::new(vec![Ok(Some(receipt(0))), Ok(Some(receipt(1)))]);

        let err = script.run("completeOrder").await.unwrap_err();
        assert!(err.to_string().starts_with("completeOrder reverted in tx"));
        assert_eq!(script.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_and_exhausted_writes_carry_the_label() {
        let dropped = Script::new(vec![Ok(None)]);
        let err = dropped.run("claimStream").await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.starts_with("claimStream failed"), "{}", message);
        assert!(message.contains("dropped from mempool"));

        let flaky = Script::new(vec![
            Err(anyhow!("request timed out")),
            Err(anyhow!("request timed out")),
            Err(anyhow!("request timed out")),
            Ok(Some(receipt(1))),
        ]);
        let err = flaky.run("listService").await.unwrap_err();
        assert!(format!("{:#}", err).contains("failed after 3 attempts"));
        assert_eq!(flaky.sent.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn writes_come_from_the_agent_wallet() {
        let client = settlement(Some(1337), Some(Address::repeat_byte(0x03)));
        let expected: Address = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".parse().unwrap();
        assert_eq!(client.address(), expected);
        assert_eq!(client.marketplace().address(), Address::repeat_byte(0x02));
    }
}
