use agora_common::{crypto::hash_canonical, Estimate, TaskInput, TaskResult};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use super::{conclude, Completed, Executor, ExecutorError};

/// Deterministic executor used for load tests and local networks.
///
/// The output depends only on the payload, so repeated runs of the same
/// order produce the same result hash.
pub struct BenchmarkExecutor {
    id: String,
    capabilities: Vec<String>,
    latency: Duration,
}

impl BenchmarkExecutor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: vec!["benchmark-*".to_string()],
            latency: Duration::ZERO,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Simulated processing time per task
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl Executor for BenchmarkExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn execute(&self, task: &TaskInput) -> TaskResult {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let outcome = if task.payload.is_null() {
            Err(ExecutorError::InvalidInput("missing task input".into()))
        } else {
            let digest = hash_canonical(&task.payload);
            Ok(Completed {
                output: json!({
                    "serviceType": task.service_type,
                    "digest": format!("{:?}", digest),
                }),
                evidence: json!({ "simulatedLatencyMs": self.latency.as_millis() as u64 }),
            })
        };

        conclude(self, task, outcome)
    }

    async fn estimate(&self, task: &TaskInput) -> Estimate {
        Estimate {
            estimated_duration_ms: self.latency.as_millis() as u64,
            estimated_cost: task.total_price,
            confidence: 1.0,
        }
    }
}
