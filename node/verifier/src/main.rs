mod verifier;

use agora_common::contracts::ServiceMarketplace;
use agora_common::storage::{ContentAddressedStore, HttpStore, LocalStore, ResultStore};
use anyhow::{Context, Result};
use clap::Parser;
use ethers::providers::{Http, Provider};
use ethers::types::Address;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use verifier::{CompletionWatcher, ResultVerifier};

/// Independent checker for results settled by a provider agent
#[derive(Parser, Debug)]
#[clap(name = "verifier", about = "Audits completed marketplace orders")]
struct Args {
    #[clap(long, env = "RPC_URL")]
    rpc_url: String,

    #[clap(long, env = "MARKETPLACE_ADDRESS")]
    marketplace: String,

    /// Address whose proofs are accepted
    #[clap(long, env = "AGENT_ADDRESS")]
    agent: String,

    /// Directory of content-addressed pins
    #[clap(long, env = "STORAGE_PIN_DIR")]
    pin_dir: Option<PathBuf>,

    /// Directory written by the local result backend
    #[clap(long, env = "STORAGE_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    #[clap(long, env = "STORAGE_URL")]
    storage_url: Option<String>,

    #[clap(long, env = "START_BLOCK")]
    start_block: Option<u64>,

    #[clap(long, env = "POLL_INTERVAL_SECS", default_value = "12")]
    poll_interval_secs: u64,

    /// Oldest proof accepted, relative to the moment it is checked
    #[clap(long, env = "MAX_PROOF_AGE_SECS", default_value = "86400")]
    max_proof_age_secs: u64,
}

impl Args {
    fn address(name: &str, value: &str) -> Result<Address> {
        value
            .parse()
            .with_context(|| format!("invalid {}: {}", name, value))
    }

    fn stores(&self) -> Result<Vec<Arc<dyn ResultStore>>> {
        let mut stores: Vec<Arc<dyn ResultStore>> = Vec::new();
        if let Some(dir) = &self.pin_dir {
            stores.push(Arc::new(ContentAddressedStore::new(dir)));
        }
        if let Some(dir) = &self.results_dir {
            stores.push(Arc::new(LocalStore::new(dir)));
        }
        if let Some(url) = &self.storage_url {
            stores.push(Arc::new(HttpStore::new(url)?));
        }
        if stores.is_empty() {
            anyhow::bail!("no result storage configured");
        }
        Ok(stores)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let agent = Args::address("AGENT_ADDRESS", &args.agent)?;
    let marketplace = Args::address("MARKETPLACE_ADDRESS", &args.marketplace)?;
    info!("Starting Agora verifier for agent {:?}", agent);

    let provider = Provider::<Http>::try_from(args.rpc_url.as_str()).context("invalid RPC URL")?;
    let marketplace = ServiceMarketplace::new(marketplace, Arc::new(provider));

    let verifier = ResultVerifier::new(
        args.stores()?,
        agent,
        Duration::from_secs(args.max_proof_age_secs),
    );
    let mut watcher = CompletionWatcher::new(
        marketplace,
        verifier,
        Duration::from_secs(args.poll_interval_secs.max(1)),
    );
    if let Some(block) = args.start_block {
        watcher = watcher.with_start_block(block);
    }

    tokio::select! {
        res = watcher.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_follow_configured_locations() {
        let args = Args::parse_from([
            "verifier",
            "--rpc-url",
            "http://localhost:8545",
            "--marketplace",
            "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "--agent",
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
            "--pin-dir",
            "/tmp/pins",
            "--storage-url",
            "http://localhost:9000",
        ]);
        let stores = args.stores().unwrap();
        let schemes: Vec<&str> = stores.iter().map(|s| s.scheme()).collect();
        assert_eq!(schemes.len(), 2);
        assert_eq!(schemes[0], "ipfs://");
        assert_eq!(args.max_proof_age_secs, 86400);
    }

    #[test]
    fn storage_is_required() {
        let args = Args::parse_from([
            "verifier",
            "--rpc-url",
            "http://localhost:8545",
            "--marketplace",
            "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "--agent",
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
        ]);
        assert!(args.stores().is_err());
        assert!(Args::address("AGENT_ADDRESS", &args.agent).is_ok());
        assert!(Args::address("AGENT_ADDRESS", "0x1234").is_err());
    }
}
