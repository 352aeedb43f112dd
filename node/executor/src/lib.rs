//! Agora provider agent.
//!
//! Watches the marketplace for orders addressed to this agent, routes each
//! to a capable executor, signs a proof of work, stores the result and
//! completes the order on-chain.

pub mod agent;
pub mod config;
pub mod events;
pub mod executors;
pub mod ingestor;
pub mod orderbook;
pub mod registry;
pub mod settlement;

pub use agent::{Agent, ContentAddressedInputs, InputResolver, Outcome};
pub use config::{AgentConfig, Args, ConfigError};
pub use executors::{Executor, ExecutorError};
pub use ingestor::{Ingested, OrderIngestor};
pub use orderbook::OrderBook;
pub use registry::{CapabilityPattern, ExecutorRegistry};
pub use settlement::{OrderSettler, SettlementClient, SettlementConfig};
