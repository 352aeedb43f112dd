use agora_common::contracts::ServiceMarketplace;
use agora_common::reliability::RetryConfig;
use agora_common::storage::{self, ContentAddressedStore};
use agora_common::{ProofEngine, ResultStore};
use agora_executor::events::LedgerEventSource;
use agora_executor::{
    Agent, AgentConfig, Args, ContentAddressedInputs, ExecutorRegistry, OrderBook, OrderIngestor,
    SettlementClient, SettlementConfig,
};
use anyhow::{Context, Result};
use clap::Parser;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::Signer;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const WORK_QUEUE: usize = 1000;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AgentConfig::try_from(Args::parse()).context("invalid configuration")?;

    info!("Starting Agora provider agent");
    info!("Marketplace: {:?}", config.marketplace);
    info!("RPC: {}", config.rpc_url);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

    let provider = Provider::<Http>::try_from(config.rpc_url.as_str())?;
    let client = match config.chain_id.filter(|id| *id != 0) {
        Some(chain_id) => SignerMiddleware::new(provider, config.wallet.clone().with_chain_id(chain_id)),
        None => SignerMiddleware::new_with_provider_chain(provider, config.wallet.clone()).await?,
    };
    let client = Arc::new(client);
    let address = client.address();
    info!("Agent address: {:?}", address);

    let settlement = Arc::new(SettlementClient::new(
        client.clone(),
        SettlementConfig {
            registry: config.registry,
            marketplace: config.marketplace,
            bridge: config.bridge,
            chain_id: config.chain_id,
            retry: RetryConfig::default(),
        },
    ));

    if let Some(did) = &config.did {
        if settlement.is_registered().await? {
            info!("Agent already registered");
        } else {
            settlement.register_agent(did, &config.metadata_uri).await?;
        }
    }

    if config.services.is_empty() {
        warn!("AGENT_SERVICES is empty; no orders will be accepted");
    }

    let registry = Arc::new(ExecutorRegistry::new());
    for executor in config.executors()? {
        registry.register(executor);
    }
    for (id, healthy) in registry.health_check().await {
        if healthy {
            info!("Executor {} healthy", id);
        } else {
            warn!("Executor {} failed its health check", id);
        }
    }

    let store = storage::open(config.storage_backend, config.storage_target.clone())?;
    info!("Storing results with the {} backend", config.storage_backend);

    let input_stores: Vec<Arc<dyn ResultStore>> = vec![
        Arc::new(ContentAddressedStore::new(config.data_dir.join("pins"))),
        store.clone(),
    ];

    let book = OrderBook::open(config.order_book_path())?;
    let (work_tx, work_rx) = mpsc::channel(WORK_QUEUE);

    let ingestor = Arc::new(OrderIngestor::new(
        book.clone(),
        address,
        config.services.clone(),
        work_tx,
    ));

    let mut source = LedgerEventSource::new(
        ServiceMarketplace::new(config.marketplace, client.clone()),
        ingestor,
        book.clone(),
        config.poll_interval,
    );
    if let Some(block) = config.start_block {
        source = source.with_start_block(block);
    }
    tokio::spawn(async move { source.run().await });

    let agent = Arc::new(Agent::new(
        registry,
        Arc::new(ProofEngine::new(config.wallet.clone())),
        store,
        settlement,
        Arc::new(ContentAddressedInputs::new(input_stores)),
        book.clone(),
        config.max_concurrent_tasks,
        config.poll_interval,
    ));

    tokio::select! {
        _ = agent.run(work_rx) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    book.flush().await?;
    Ok(())
}
