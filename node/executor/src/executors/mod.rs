//! Pluggable executors.
//!
//! Every executor implements [`Executor`]. Concrete variants:
//! * [`LlmExecutor`] calls an AI provider (OpenAI-compatible or Anthropic)
//! * [`DelegatedExecutor`] forwards the task to an external HTTP sink
//! * [`BenchmarkExecutor`] produces deterministic output without network
//! * [`WasmExecutor`] runs a deterministic wasm module in a fuel-metered sandbox

mod benchmark;
mod delegated;
mod llm;
mod sse;
mod wasm;

pub use benchmark::BenchmarkExecutor;
pub use delegated::DelegatedExecutor;
pub use llm::{Attachment, LlmExecutor, Pricing, Prompt, ProviderConfig, ProviderKind, TokenUsage};
pub use sse::{SseDecoder, TextStream};
pub use wasm::{SandboxRun, WasmExecutor, WasmSandbox};

use agora_common::{Estimate, ExecutionMetadata, ProofKind, TaskInput, TaskResult};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::registry::CapabilityPattern;

/// Duration reported by the default estimate
pub const DEFAULT_ESTIMATE_MS: u64 = 30_000;

/// Confidence reported by the default estimate
pub const DEFAULT_ESTIMATE_CONFIDENCE: f64 = 0.1;

/// Failures inside an executor. These never escape `execute`; they become
/// failed [`TaskResult`]s.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("provider returned HTTP {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("invalid task input: {0}")]
    InvalidInput(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),
}

/// Output of a successful run: result document plus proof evidence
pub struct Completed {
    pub output: Value,
    pub evidence: Value,
}

/// Capability contract shared by all executors
#[async_trait]
pub trait Executor: Send + Sync {
    fn id(&self) -> &str;

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    /// Declared capability patterns (exact, `prefix-*` or `*`)
    fn capabilities(&self) -> &[String];

    fn proof_kind(&self) -> ProofKind {
        ProofKind::Completion
    }

    fn handles(&self, service_type: &str) -> bool {
        self.capabilities()
            .iter()
            .any(|c| CapabilityPattern::parse(c).matches(service_type))
    }

    /// Run one task. Failures are reported in the result, never raised.
    async fn execute(&self, task: &TaskInput) -> TaskResult;

    async fn estimate(&self, task: &TaskInput) -> Estimate {
        default_estimate(task)
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Low-confidence estimate equal to the order's declared price
pub fn default_estimate(task: &TaskInput) -> Estimate {
    Estimate {
        estimated_duration_ms: DEFAULT_ESTIMATE_MS,
        estimated_cost: task.total_price,
        confidence: DEFAULT_ESTIMATE_CONFIDENCE,
    }
}

/// Turn an executor outcome into a [`TaskResult`] with timing metadata
pub fn conclude<E: Executor + ?Sized>(
    executor: &E,
    task: &TaskInput,
    outcome: Result<Completed, ExecutorError>,
) -> TaskResult {
    let metadata = ExecutionMetadata::finish(executor.id(), executor.version(), task.start_time);

    match outcome {
        Ok(Completed { output, evidence }) => TaskResult::succeeded(output, evidence, metadata),
        Err(e) => {
            warn!(
                "Executor {} failed order {}: {}",
                executor.id(),
                task.order_id,
                e
            );
            TaskResult::failed(e.to_string(), metadata)
        }
    }
}

/// Text a task asks to be processed: `prompt`, then `text`, then a bare
/// string payload, then the payload's canonical JSON.
pub(crate) fn task_text(payload: &Value) -> Result<String, ExecutorError> {
    if let Some(s) = payload.get("prompt").and_then(Value::as_str) {
        return Ok(s.to_string());
    }
    if let Some(s) = payload.get("text").and_then(Value::as_str) {
        return Ok(s.to_string());
    }
    match payload {
        Value::Null => Err(ExecutorError::InvalidInput("missing task input".into())),
        Value::String(s) if s.is_empty() => {
            Err(ExecutorError::InvalidInput("empty task input".into()))
        }
        Value::String(s) => Ok(s.clone()),
        other => Ok(agora_common::crypto::canonical_json(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;
    use serde_json::json;

    struct Fixed(Vec<String>);

    #[async_trait]
    impl Executor for Fixed {
        fn id(&self) -> &str {
            "fixed"
        }

        fn capabilities(&self) -> &[String] {
            &self.0
        }

        async fn execute(&self, task: &TaskInput) -> TaskResult {
            conclude(
                self,
                task,
                Ok(Completed {
                    output: json!("ok"),
                    evidence: Value::Null,
                }),
            )
        }
    }

    fn task() -> TaskInput {
        TaskInput {
            order_id: U256::from(1),
            service_type: "llm-completion".into(),
            payload: json!({ "prompt": "hi" }),
            total_price: U256::from(500),
            start_time: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn defaults_apply() {
        let exec = Fixed(vec!["llm-*".into(), "translation".into()]);
        assert!(exec.handles("llm-completion"));
        assert!(exec.handles("translation"));
        assert!(!exec.handles("translation-pro"));

        let estimate = exec.estimate(&task()).await;
        assert_eq!(estimate.estimated_cost, U256::from(500));
        assert!(estimate.confidence < 0.5);
        assert!(exec.health_check().await.unwrap());
        assert_eq!(exec.proof_kind(), ProofKind::Completion);
    }

    #[tokio::test]
    async fn conclude_builds_metadata() {
        let exec = Fixed(vec!["*".into()]);
        let result = exec.execute(&task()).await;
        assert!(result.success);
        assert_eq!(result.metadata.executor_id, "fixed");
        assert!(result.metadata.end_time >= result.metadata.start_time);

        let failed = conclude(&exec, &task(), Err(ExecutorError::InvalidInput("x".into())));
        assert!(!failed.success);
        assert!(failed.result_locator.is_none());
        assert_eq!(failed.error.as_deref(), Some("invalid task input: x"));
    }

    #[test]
    fn task_text_precedence() {
        assert_eq!(task_text(&json!({ "prompt": "p", "text": "t" })).unwrap(), "p");
        assert_eq!(task_text(&json!({ "text": "t" })).unwrap(), "t");
        assert_eq!(task_text(&json!("bare")).unwrap(), "bare");
        assert_eq!(task_text(&json!({ "b": 1, "a": 2 })).unwrap(), r#"{"a":2,"b":1}"#);
        assert!(task_text(&Value::Null).is_err());
    }
}
