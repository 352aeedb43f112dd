use agora_common::storage::{StorageBackend, StorageTarget};
use clap::Parser;
use ethers::signers::LocalWallet;
use ethers::types::{Address, U256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::executors::{
    BenchmarkExecutor, DelegatedExecutor, Executor, ExecutorError, LlmExecutor, ProviderConfig,
    WasmExecutor,
};

/// Service types the hosted-model executors take
pub const LLM_CAPABILITIES: &[&str] = &[
    "sentiment-analysis",
    "summarization",
    "translation",
    "image-analysis",
    "llm-*",
];

#[derive(Parser, Debug, Clone)]
#[clap(name = "agent")]
#[clap(about = "Agora provider agent - executes marketplace orders and settles them on-chain")]
pub struct Args {
    #[clap(long, env = "AGENT_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: String,

    #[clap(long, env = "RPC_URL", default_value = "http://127.0.0.1:8545")]
    pub rpc_url: String,

    #[clap(long, env = "CHAIN_ID")]
    pub chain_id: Option<u64>,

    #[clap(long, env = "REGISTRY_ADDRESS")]
    pub registry_address: String,

    #[clap(long, env = "MARKETPLACE_ADDRESS")]
    pub marketplace_address: String,

    #[clap(long, env = "BRIDGE_ADDRESS")]
    pub bridge_address: Option<String>,

    #[clap(long, env = "POLL_INTERVAL_MS", default_value = "5000")]
    pub poll_interval_ms: u64,

    #[clap(long, env = "MAX_CONCURRENT_TASKS", default_value = "4")]
    pub max_concurrent_tasks: usize,

    #[clap(long, env = "AGENT_DATA_DIR", default_value = "./agent-data")]
    pub data_dir: PathBuf,

    #[clap(long, env = "STORAGE_BACKEND", default_value = "ipfs")]
    pub storage_backend: String,

    #[clap(long, env = "STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    #[clap(long, env = "STORAGE_URL")]
    pub storage_url: Option<String>,

    #[clap(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[clap(long, env = "OPENAI_BASE_URL")]
    pub openai_base_url: Option<String>,

    #[clap(long, env = "OPENAI_MODEL", default_value = "gpt-4o-mini")]
    pub openai_model: String,

    #[clap(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    #[clap(long, env = "ANTHROPIC_BASE_URL")]
    pub anthropic_base_url: Option<String>,

    #[clap(long, env = "ANTHROPIC_MODEL", default_value = "claude-3-5-sonnet-latest")]
    pub anthropic_model: String,

    #[clap(long, env = "DELEGATE_URL")]
    pub delegate_url: Option<String>,

    /// Listed services as `serviceId=serviceType`, comma separated
    #[clap(long, env = "AGENT_SERVICES", default_value = "")]
    pub services: String,

    #[clap(long, env = "AGENT_DID")]
    pub did: Option<String>,

    #[clap(long, env = "AGENT_METADATA_URI", default_value = "")]
    pub metadata_uri: String,

    /// First block to scan on a fresh data directory
    #[clap(long)]
    pub start_block: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("invalid {name} address: {value}")]
    InvalidAddress { name: &'static str, value: String },

    #[error("invalid service entry `{0}`, expected serviceId=serviceType")]
    InvalidService(String),

    #[error("invalid storage configuration: {0}")]
    InvalidStorage(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("executor setup failed: {0}")]
    Executor(String),
}

/// Validated agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub wallet: LocalWallet,
    pub rpc_url: String,
    pub chain_id: Option<u64>,
    pub registry: Address,
    pub marketplace: Address,
    pub bridge: Option<Address>,
    pub poll_interval: Duration,
    pub max_concurrent_tasks: usize,
    pub data_dir: PathBuf,
    pub storage_backend: StorageBackend,
    pub storage_target: StorageTarget,
    pub openai: Option<ProviderConfig>,
    pub anthropic: Option<ProviderConfig>,
    pub delegate_url: Option<String>,
    pub services: HashMap<U256, String>,
    pub did: Option<String>,
    pub metadata_uri: String,
    pub start_block: Option<u64>,
}

fn parse_address(name: &'static str, value: &str) -> Result<Address, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidAddress {
        name,
        value: value.to_string(),
    })
}

/// Parse `1=sentiment-analysis,2=translation`
pub fn parse_services(raw: &str) -> Result<HashMap<U256, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, service_type) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidService(entry.to_string()))?;
            let id = U256::from_dec_str(id.trim())
                .map_err(|_| ConfigError::InvalidService(entry.to_string()))?;
            let service_type = service_type.trim();
            if service_type.is_empty() {
                return Err(ConfigError::InvalidService(entry.to_string()));
            }
            Ok((id, service_type.to_string()))
        })
        .collect()
}

impl TryFrom<Args> for AgentConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let wallet: LocalWallet = args
            .private_key
            .trim()
            .trim_start_matches("0x")
            .parse()
            .map_err(|e: ethers::signers::WalletError| ConfigError::InvalidKey(e.to_string()))?;

        if args.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("POLL_INTERVAL_MS"));
        }
        if args.max_concurrent_tasks == 0 {
            return Err(ConfigError::Zero("MAX_CONCURRENT_TASKS"));
        }

        let storage_backend: StorageBackend = args
            .storage_backend
            .parse()
            .map_err(ConfigError::InvalidStorage)?;
        let storage_target = match storage_backend {
            StorageBackend::Ipfs => StorageTarget::Directory(
                args.storage_path.clone().unwrap_or_else(|| args.data_dir.join("pins")),
            ),
            StorageBackend::Local => StorageTarget::Directory(
                args.storage_path.clone().unwrap_or_else(|| args.data_dir.join("results")),
            ),
            StorageBackend::Http => StorageTarget::Url(args.storage_url.clone().ok_or_else(|| {
                ConfigError::InvalidStorage("STORAGE_URL is required for the http backend".into())
            })?),
            StorageBackend::Memory => StorageTarget::None,
        };

        let openai = args.openai_api_key.filter(|k| !k.is_empty()).map(|key| {
            let config = ProviderConfig::openai(key, args.openai_model.clone());
            match &args.openai_base_url {
                Some(url) => config.with_base_url(url.as_str()),
                None => config,
            }
        });
        let anthropic = args.anthropic_api_key.filter(|k| !k.is_empty()).map(|key| {
            let config = ProviderConfig::anthropic(key, args.anthropic_model.clone());
            match &args.anthropic_base_url {
                Some(url) => config.with_base_url(url.as_str()),
                None => config,
            }
        });

        Ok(Self {
            wallet,
            rpc_url: args.rpc_url,
            chain_id: args.chain_id,
            registry: parse_address("registry", &args.registry_address)?,
            marketplace: parse_address("marketplace", &args.marketplace_address)?,
            bridge: args
                .bridge_address
                .as_deref()
                .filter(|a| !a.trim().is_empty())
                .map(|a| parse_address("bridge", a))
                .transpose()?,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            max_concurrent_tasks: args.max_concurrent_tasks,
            data_dir: args.data_dir,
            storage_backend,
            storage_target,
            openai,
            anthropic,
            delegate_url: args.delegate_url.filter(|u| !u.is_empty()),
            services: parse_services(&args.services)?,
            did: args.did.filter(|d| !d.is_empty()),
            metadata_uri: args.metadata_uri,
            start_block: args.start_block,
        })
    }
}

impl AgentConfig {
    pub fn order_book_path(&self) -> PathBuf {
        self.data_dir.join("orders.db")
    }

    /// Executors in routing priority order: sandboxed and benchmark work
    /// first, hosted models next, the delegate as catch-all
    pub fn executors(&self) -> Result<Vec<Arc<dyn Executor>>, ConfigError> {
        let setup = |e: ExecutorError| ConfigError::Executor(e.to_string());
        let llm_capabilities: Vec<String> = LLM_CAPABILITIES.iter().map(|c| c.to_string()).collect();

        let mut executors: Vec<Arc<dyn Executor>> = vec![
            Arc::new(WasmExecutor::new("wasm").map_err(|e| ConfigError::Executor(format!("{:#}", e)))?),
            Arc::new(BenchmarkExecutor::new("benchmark")),
        ];
        if let Some(provider) = &self.openai {
            executors.push(Arc::new(
                LlmExecutor::new("openai", provider.clone(), llm_capabilities.clone()).map_err(setup)?,
            ));
        }
        if let Some(provider) = &self.anthropic {
            executors.push(Arc::new(
                LlmExecutor::new("anthropic", provider.clone(), llm_capabilities.clone()).map_err(setup)?,
            ));
        }
        if let Some(url) = &self.delegate_url {
            executors.push(Arc::new(
                DelegatedExecutor::new("delegate", url, vec!["*".to_string()]).map_err(setup)?,
            ));
        }
        Ok(executors)
    }
}
