use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::hash_canonical;

/// Serde adapter writing 256-bit amounts and ids as decimal strings.
///
/// Accepts decimal strings, `0x` hex strings and plain JSON integers on input.
pub mod decimal {
    use ethers::types::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => parse(&s),
            Value::Number(n) => parse(&n.to_string()),
            other => Err(format!("expected an integer, got {}", other)),
        }
        .map_err(de::Error::custom)
    }

    pub fn parse(s: &str) -> Result<U256, String> {
        let s = s.trim();
        match s.strip_prefix("0x") {
            Some(hex) => U256::from_str_radix(hex, 16).map_err(|e| e.to_string()),
            None => U256::from_dec_str(s).map_err(|e| e.to_string()),
        }
    }
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
    Disputed,
}

impl OrderStatus {
    /// Transitions are monotonic: nothing goes back to pending and
    /// completed/cancelled are terminal.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Completed)
                | (Pending, Cancelled)
                | (Pending, Disputed)
                | (Disputed, Completed)
                | (Disputed, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Disputed => "disputed",
        };
        f.write_str(s)
    }
}

/// Order addressed to this agent, materialized from a ledger event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(with = "decimal")]
    pub order_id: U256,
    #[serde(with = "decimal")]
    pub service_id: U256,
    pub service_type: String,
    pub buyer: Address,
    pub seller: Address,
    #[serde(with = "decimal")]
    pub total_price: U256,
    pub input_hash: H256,
    /// Unix seconds, 0 when the order has no deadline
    pub deadline: u64,
    pub status: OrderStatus,
    pub created_tx: H256,
    pub created_block: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_locator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<H256>,
}

impl Order {
    /// Whether the deadline has passed at `now` (unix seconds)
    pub fn is_expired(&self, now: u64) -> bool {
        self.deadline != 0 && now > self.deadline
    }
}

/// Execution unit handed to an executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInput {
    #[serde(with = "decimal")]
    pub order_id: U256,
    pub service_type: String,
    pub payload: Value,
    #[serde(with = "decimal")]
    pub total_price: U256,
    /// Unix milliseconds
    pub start_time: i64,
}

impl TaskInput {
    pub fn for_order(order: &Order, payload: Value) -> Self {
        Self {
            order_id: order.order_id,
            service_type: order.service_type.clone(),
            payload,
            total_price: order.total_price,
            start_time: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Observability data attached to every result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: u64,
    pub executor_id: String,
    pub executor_version: String,
}

impl ExecutionMetadata {
    /// Close the timing window opened at `start_time` (unix ms)
    pub fn finish(executor_id: &str, executor_version: &str, start_time: i64) -> Self {
        let end_time = chrono::Utc::now().timestamp_millis().max(start_time);
        Self {
            start_time,
            end_time,
            duration_ms: (end_time - start_time) as u64,
            executor_id: executor_id.to_string(),
            executor_version: executor_version.to_string(),
        }
    }
}

/// Outcome of one dispatched task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_locator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<H256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofOfWork>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub evidence: Value,
    pub metadata: ExecutionMetadata,
}

impl TaskResult {
    pub fn succeeded(output: Value, evidence: Value, metadata: ExecutionMetadata) -> Self {
        Self {
            success: true,
            result_hash: Some(hash_canonical(&output)),
            output: Some(output),
            result_locator: None,
            proof: None,
            error: None,
            evidence,
            metadata,
        }
    }

    pub fn failed(error: impl Into<String>, metadata: ExecutionMetadata) -> Self {
        Self {
            success: false,
            output: None,
            result_locator: None,
            result_hash: None,
            proof: None,
            error: Some(error.into()),
            evidence: Value::Null,
            metadata,
        }
    }

    /// Bind proof and storage locator to a successful result.
    /// Failed results never carry a locator, so this is a no-op for them.
    pub fn attach(&mut self, proof: ProofOfWork, locator: String) {
        if !self.success {
            return;
        }
        self.proof = Some(proof);
        self.result_locator = Some(locator);
    }
}

/// Closed set of proof kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProofKind {
    Completion,
    DeterministicReplay,
    MultiPartyAttested,
    TeeAttested,
}

/// Signed record binding hashed input and output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofOfWork {
    #[serde(rename = "type")]
    pub kind: ProofKind,
    /// Unix milliseconds
    pub timestamp: i64,
    pub input_hash: H256,
    pub output_hash: H256,
    pub evidence: Value,
    /// 0x-prefixed 65-byte recoverable signature
    pub signature: String,
}

/// Cost and duration forecast for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Estimate {
    pub estimated_duration_ms: u64,
    #[serde(with = "decimal")]
    pub estimated_cost: U256,
    pub confidence: f64,
}

/// Document persisted for every completed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    #[serde(with = "decimal")]
    pub order_id: U256,
    pub service_type: String,
    pub output: Value,
    pub result_hash: H256,
    pub proof: ProofOfWork,
    pub metadata: ExecutionMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_never_regresses_to_pending() {
        for from in [
            OrderStatus::Pending,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Disputed,
        ] {
            assert!(!from.can_transition_to(OrderStatus::Pending));
        }
        assert!(!OrderStatus::Completed.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Disputed.can_transition_to(OrderStatus::Completed));
    }

    #[test]
    fn amounts_serialize_as_decimal_strings() {
        let estimate = Estimate {
            estimated_duration_ms: 10,
            estimated_cost: U256::from(1_000_000_000_000_000u64),
            confidence: 0.3,
        };
        let json = serde_json::to_value(&estimate).unwrap();
        assert_eq!(json["estimatedCost"], "1000000000000000");

        let back: Estimate = serde_json::from_value(json).unwrap();
        assert_eq!(back, estimate);
    }

    #[test]
    fn decimal_accepts_hex_and_numbers() {
        assert_eq!(decimal::parse("0x10").unwrap(), U256::from(16));
        assert_eq!(decimal::parse("42").unwrap(), U256::from(42));
        assert!(decimal::parse("forty").is_err());

        let estimate: Estimate = serde_json::from_str(
            r#"{"estimatedDurationMs":1,"estimatedCost":100000000000000000001,"confidence":0.5}"#,
        )
        .unwrap();
        assert_eq!(
            estimate.estimated_cost,
            U256::from_dec_str("100000000000000000001").unwrap()
        );
    }

    #[test]
    fn failed_result_ignores_locator() {
        let meta = ExecutionMetadata::finish("stub", "1.0.0", 0);
        let mut result = TaskResult::failed("boom", meta);
        let proof = ProofOfWork {
            kind: ProofKind::Completion,
            timestamp: 0,
            input_hash: H256::zero(),
            output_hash: H256::zero(),
            evidence: Value::Null,
            signature: String::new(),
        };
        result.attach(proof, "memory://1".into());
        assert!(result.result_locator.is_none());
        assert!(result.proof.is_none());
    }
}
