use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::ResultStore;
use crate::error::StoreError;

/// Remote HTTP sink: POST `{base}/results` stores, GET the returned
/// `{base}/results/{id}` retrieves.
pub struct HttpStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn results_prefix(&self) -> String {
        format!("{}/results/", self.base_url)
    }
}

#[async_trait]
impl ResultStore for HttpStore {
    fn scheme(&self) -> &'static str {
        if self.base_url.starts_with("https://") {
            "https://"
        } else {
            "http://"
        }
    }

    async fn store(&self, result: &Value) -> Result<String, StoreError> {
        let response = self
            .client
            .post(format!("{}/results", self.base_url))
            .json(result)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await?;
        let id = match body.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(StoreError::InvalidLocator(format!(
                    "sink response without id: {}",
                    body
                )))
            }
        };

        let locator = format!("{}{}", self.results_prefix(), id);
        debug!("Stored result at {}", locator);
        Ok(locator)
    }

    async fn retrieve(&self, locator: &str) -> Result<Option<Value>, StoreError> {
        if !locator.starts_with(&self.results_prefix()) {
            return Ok(None);
        }

        let response = self.client.get(locator).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                status: status.as_u16(),
                message,
            });
        }

        Ok(Some(response.json().await?))
    }
}
