use agora_common::{TaskInput, TaskResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::{conclude, Completed, Executor, ExecutorError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Forwards tasks to an external service.
///
/// The service receives the [`TaskInput`] as JSON at `POST {base}/execute`
/// and answers with `{ "output": ..., "evidence"?: ... }`. Liveness is
/// `GET {base}/health`.
pub struct DelegatedExecutor {
    id: String,
    capabilities: Vec<String>,
    base_url: String,
    client: Client,
}

impl DelegatedExecutor {
    pub fn new(
        id: impl Into<String>,
        base_url: &str,
        capabilities: Vec<String>,
    ) -> Result<Self, ExecutorError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            id: id.into(),
            capabilities,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn forward(&self, task: &TaskInput) -> Result<Completed, ExecutorError> {
        let response = self
            .client
            .post(format!("{}/execute", self.base_url))
            .json(task)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Provider {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let mut body: Value = response
            .json()
            .await
            .map_err(|e| ExecutorError::MalformedResponse(e.to_string()))?;

        let output = match body.get_mut("output").map(Value::take) {
            Some(Value::Null) | None => {
                return Err(ExecutorError::MalformedResponse("missing output".into()))
            }
            Some(output) => output,
        };
        let remote = body.get_mut("evidence").map(Value::take).unwrap_or(Value::Null);

        Ok(Completed {
            output,
            evidence: json!({ "delegate": self.base_url, "remote": remote }),
        })
    }
}

#[async_trait]
impl Executor for DelegatedExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn execute(&self, task: &TaskInput) -> TaskResult {
        let outcome = self.forward(task).await;
        conclude(self, task, outcome)
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}
