use agora_common::{TaskInput, TaskResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::sse::{SseDecoder, TextStream};
use super::{conclude, task_text, Completed, Executor, ExecutorError};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        })
    }
}

/// USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Pricing {
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_million
            + usage.output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub pricing: Pricing,
    pub max_tokens: u32,
}

impl ProviderConfig {
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            model: model.into(),
            pricing: Pricing {
                input_per_million: 0.15,
                output_per_million: 0.60,
            },
            max_tokens: 1024,
        }
    }

    pub fn anthropic(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind: ProviderKind::Anthropic,
            api_key: api_key.into(),
            base_url: ANTHROPIC_BASE_URL.to_string(),
            model: model.into(),
            pricing: Pricing {
                input_per_million: 3.0,
                output_per_million: 15.0,
            },
            max_tokens: 1024,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

/// Image supplied alongside the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Url(String),
    Inline { media_type: String, data: String },
}

impl Attachment {
    fn parse(value: &Value) -> Result<Self, ExecutorError> {
        if let Some(url) = value.as_str().or_else(|| value.get("url").and_then(Value::as_str)) {
            return Ok(Self::Url(url.to_string()));
        }

        let data = value
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::InvalidInput("image needs `url` or `data`".into()))?;
        STANDARD
            .decode(data)
            .map_err(|e| ExecutorError::InvalidInput(format!("image data is not base64: {}", e)))?;
        let media_type = value
            .get("mediaType")
            .and_then(Value::as_str)
            .unwrap_or("image/png");

        Ok(Self::Inline {
            media_type: media_type.to_string(),
            data: data.to_string(),
        })
    }

    fn openai_part(&self) -> Value {
        let url = match self {
            Self::Url(url) => url.clone(),
            Self::Inline { media_type, data } => format!("data:{};base64,{}", media_type, data),
        };
        json!({ "type": "image_url", "image_url": { "url": url } })
    }

    fn anthropic_part(&self) -> Value {
        match self {
            Self::Url(url) => json!({ "type": "image", "source": { "type": "url", "url": url } }),
            Self::Inline { media_type, data } => json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data },
            }),
        }
    }
}

/// System instruction, user text and images for one completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl Prompt {
    /// Build the prompt for a task from its service-type template
    pub fn from_task(task: &TaskInput) -> Result<Self, ExecutorError> {
        let payload = &task.payload;
        let system = match task.service_type.as_str() {
            "sentiment-analysis" => "Classify the sentiment of the user's text as positive, \
                negative or neutral. Reply with the label first, then one short sentence of reasoning."
                .to_string(),
            "summarization" => "Summarize the user's text concisely, keeping key facts.".to_string(),
            "translation" => {
                let target = payload
                    .get("targetLanguage")
                    .and_then(Value::as_str)
                    .unwrap_or("English");
                format!("Translate the user's text into {}. Reply with the translation only.", target)
            }
            "image-analysis" => "Describe the attached images and answer the user's question about them."
                .to_string(),
            _ => "You are completing a paid task for a marketplace buyer. Answer the request directly."
                .to_string(),
        };

        let attachments = match payload.get("images") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(images)) => images
                .iter()
                .map(Attachment::parse)
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(ExecutorError::InvalidInput("`images` must be an array".into())),
        };

        let text = match task_text(payload) {
            Ok(text) => text,
            Err(_) if !attachments.is_empty() => String::new(),
            Err(e) => return Err(e),
        };

        Ok(Self {
            system,
            text,
            attachments,
        })
    }
}

/// Executor backed by a hosted language model
pub struct LlmExecutor {
    id: String,
    capabilities: Vec<String>,
    provider: ProviderConfig,
    client: Client,
}

struct Completion {
    text: String,
    usage: TokenUsage,
}

impl LlmExecutor {
    pub fn new(
        id: impl Into<String>,
        provider: ProviderConfig,
        capabilities: Vec<String>,
    ) -> Result<Self, ExecutorError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            id: id.into(),
            capabilities,
            provider,
            client,
        })
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    fn endpoint(&self) -> String {
        match self.provider.kind {
            ProviderKind::OpenAi => format!("{}/chat/completions", self.provider.base_url),
            ProviderKind::Anthropic => format!("{}/messages", self.provider.base_url),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.provider.kind {
            ProviderKind::OpenAi => request.bearer_auth(&self.provider.api_key),
            ProviderKind::Anthropic => request
                .header("x-api-key", &self.provider.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        }
    }

    fn request_body(&self, prompt: &Prompt, stream: bool) -> Value {
        match self.provider.kind {
            ProviderKind::OpenAi => {
                let content = if prompt.attachments.is_empty() {
                    json!(prompt.text)
                } else {
                    let mut parts = vec![json!({ "type": "text", "text": prompt.text })];
                    parts.extend(prompt.attachments.iter().map(Attachment::openai_part));
                    Value::Array(parts)
                };
                json!({
                    "model": self.provider.model,
                    "max_tokens": self.provider.max_tokens,
                    "stream": stream,
                    "messages": [
                        { "role": "system", "content": prompt.system },
                        { "role": "user", "content": content },
                    ],
                })
            }
            ProviderKind::Anthropic => {
                let mut parts: Vec<Value> = prompt
                    .attachments
                    .iter()
                    .map(Attachment::anthropic_part)
                    .collect();
                if !prompt.text.is_empty() {
                    parts.push(json!({ "type": "text", "text": prompt.text }));
                }
                json!({
                    "model": self.provider.model,
                    "max_tokens": self.provider.max_tokens,
                    "stream": stream,
                    "system": prompt.system,
                    "messages": [{ "role": "user", "content": parts }],
                })
            }
        }
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ExecutorError> {
        let response = self
            .authorize(self.client.post(self.endpoint()))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExecutorError::Provider {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion, ExecutorError> {
        let response = self.send(&self.request_body(prompt, false)).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ExecutorError::MalformedResponse(e.to_string()))?;
        parse_completion(self.provider.kind, &body)
    }

    /// Stream the completion for `task` as incremental text fragments
    pub async fn stream(&self, task: &TaskInput) -> Result<TextStream, ExecutorError> {
        let prompt = Prompt::from_task(task)?;
        let response = self.send(&self.request_body(&prompt, true)).await?;
        let kind = self.provider.kind;
        let (tx, stream) = TextStream::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(ExecutorError::Transport(e))).await;
                        return;
                    }
                };
                for data in decoder.push(&chunk) {
                    match stream_delta(kind, &data) {
                        Delta::Text(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        Delta::Done => return,
                        Delta::Skip => {}
                    }
                }
            }

            if let Some(data) = decoder.finish() {
                if let Delta::Text(text) = stream_delta(kind, &data) {
                    let _ = tx.send(Ok(text)).await;
                }
            }
        });

        Ok(stream)
    }

    async fn run(&self, task: &TaskInput) -> Result<Completed, ExecutorError> {
        let prompt = Prompt::from_task(task)?;
        let completion = self.complete(&prompt).await?;
        let cost = self.provider.pricing.cost(&completion.usage);

        info!(
            "{} completion for order {}: {} in / {} out tokens",
            self.provider.kind,
            task.order_id,
            completion.usage.input_tokens,
            completion.usage.output_tokens
        );

        let mut output = json!({
            "text": completion.text,
            "model": self.provider.model,
            "usage": completion.usage,
            "cost": cost,
        });
        if task.service_type == "sentiment-analysis" {
            if let Some(label) = sentiment_label(&completion.text) {
                output["label"] = json!(label);
            }
        }

        Ok(Completed {
            output,
            evidence: json!({
                "provider": self.provider.kind.to_string(),
                "model": self.provider.model,
                "usage": completion.usage,
            }),
        })
    }
}

fn parse_completion(kind: ProviderKind, body: &Value) -> Result<Completion, ExecutorError> {
    let missing = |field: &str| ExecutorError::MalformedResponse(format!("missing {}", field));

    match kind {
        ProviderKind::OpenAi => {
            let text = body
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .ok_or_else(|| missing("choices[0].message.content"))?;
            Ok(Completion {
                text: text.to_string(),
                usage: TokenUsage {
                    input_tokens: body.pointer("/usage/prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                    output_tokens: body
                        .pointer("/usage/completion_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                },
            })
        }
        ProviderKind::Anthropic => {
            let blocks = body
                .get("content")
                .and_then(Value::as_array)
                .ok_or_else(|| missing("content"))?;
            let text: String = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            Ok(Completion {
                text,
                usage: TokenUsage {
                    input_tokens: body.pointer("/usage/input_tokens").and_then(Value::as_u64).unwrap_or(0),
                    output_tokens: body.pointer("/usage/output_tokens").and_then(Value::as_u64).unwrap_or(0),
                },
            })
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Delta {
    Text(String),
    Done,
    Skip,
}

fn stream_delta(kind: ProviderKind, data: &str) -> Delta {
    if data == "[DONE]" {
        return Delta::Done;
    }
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        debug!("Ignoring non-JSON stream event: {}", data);
        return Delta::Skip;
    };

    let text = match kind {
        ProviderKind::OpenAi => event.pointer("/choices/0/delta/content").and_then(Value::as_str),
        ProviderKind::Anthropic => match event.get("type").and_then(Value::as_str) {
            Some("message_stop") => return Delta::Done,
            Some("content_block_delta") => event.pointer("/delta/text").and_then(Value::as_str),
            _ => None,
        },
    };

    match text {
        Some(text) if !text.is_empty() => Delta::Text(text.to_string()),
        _ => Delta::Skip,
    }
}

fn sentiment_label(text: &str) -> Option<&'static str> {
    let first = text
        .split(|c: char| !c.is_alphabetic())
        .find(|w| !w.is_empty())?
        .to_lowercase();
    ["positive", "negative", "neutral"]
        .into_iter()
        .find(|label| *label == first)
}

#[async_trait]
impl Executor for LlmExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn execute(&self, task: &TaskInput) -> TaskResult {
        let outcome = self.run(task).await;
        conclude(self, task, outcome)
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        let url = format!("{}/models", self.provider.base_url);
        let response = self.authorize(self.client.get(url)).send().await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn task(service_type: &str, payload: Value) -> TaskInput {
        TaskInput {
            order_id: U256::from(3),
            service_type: service_type.into(),
            payload,
            total_price: U256::from(10),
            start_time: 0,
        }
    }

    #[test]
    fn templates_follow_service_type() {
        let prompt = Prompt::from_task(&task(
            "translation",
            json!({ "text": "hola", "targetLanguage": "French" }),
        ))
        .unwrap();
        assert!(prompt.system.contains("French"));
        assert_eq!(prompt.text, "hola");

        let prompt = Prompt::from_task(&task("sentiment-analysis", json!({ "text": "x" }))).unwrap();
        assert!(prompt.system.contains("sentiment"));
    }

    #[test]
    fn images_are_validated() {
        let ok = Prompt::from_task(&task(
            "image-analysis",
            json!({ "images": ["https://img/1.png", { "data": "aGVsbG8=", "mediaType": "image/jpeg" }] }),
        ))
        .unwrap();
        assert_eq!(ok.text, "");
        assert_eq!(ok.attachments.len(), 2);
        assert_eq!(
            ok.attachments[1],
            Attachment::Inline {
                media_type: "image/jpeg".into(),
                data: "aGVsbG8=".into()
            }
        );

        let bad = Prompt::from_task(&task("image-analysis", json!({ "images": [{ "data": "%%" }] })));
        assert!(matches!(bad, Err(ExecutorError::InvalidInput(_))));
    }

    #[test]
    fn anthropic_body_puts_images_before_text() {
        let exec = LlmExecutor::new(
            "claude",
            ProviderConfig::anthropic("k", "claude-test"),
            vec!["*".into()],
        )
        .unwrap();
        let prompt = Prompt {
            system: "s".into(),
            text: "what is this?".into(),
            attachments: vec![Attachment::Url("https://img/1.png".into())],
        };
        let body = exec.request_body(&prompt, false);
        assert_eq!(body["system"], json!("s"));
        assert_eq!(body["messages"][0]["content"][0]["type"], json!("image"));
        assert_eq!(body["messages"][0]["content"][1]["text"], json!("what is this?"));
    }

    #[test]
    fn parses_both_response_shapes() {
        let openai = json!({
            "choices": [{ "message": { "content": "positive" } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3 },
        });
        let c = parse_completion(ProviderKind::OpenAi, &openai).unwrap();
        assert_eq!(c.text, "positive");
        assert_eq!(c.usage, TokenUsage { input_tokens: 12, output_tokens: 3 });

        let anthropic = json!({
            "content": [{ "type": "text", "text": "Bon" }, { "type": "text", "text": "jour" }],
            "usage": { "input_tokens": 5, "output_tokens": 2 },
        });
        let c = parse_completion(ProviderKind::Anthropic, &anthropic).unwrap();
        assert_eq!(c.text, "Bonjour");

        assert!(parse_completion(ProviderKind::OpenAi, &json!({})).is_err());
    }

    #[test]
    fn stream_deltas() {
        assert_eq!(
            stream_delta(ProviderKind::OpenAi, r#"{"choices":[{"delta":{"content":"Hi"}}]}"#),
            Delta::Text("Hi".into())
        );
        assert_eq!(stream_delta(ProviderKind::OpenAi, "[DONE]"), Delta::Done);
        assert_eq!(
            stream_delta(
                ProviderKind::Anthropic,
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Yo"}}"#
            ),
            Delta::Text("Yo".into())
        );
        assert_eq!(stream_delta(ProviderKind::Anthropic, r#"{"type":"message_stop"}"#), Delta::Done);
        assert_eq!(stream_delta(ProviderKind::Anthropic, r#"{"type":"ping"}"#), Delta::Skip);
    }

    #[test]
    fn pricing_and_labels() {
        let pricing = Pricing {
            input_per_million: 2.0,
            output_per_million: 10.0,
        };
        let cost = pricing.cost(&TokenUsage {
            input_tokens: 500_000,
            output_tokens: 100_000,
        });
        assert!((cost - 2.0).abs() < 1e-9);

        assert_eq!(sentiment_label("Positive. The author is happy."), Some("positive"));
        assert_eq!(sentiment_label("**negative**"), Some("negative"));
        assert_eq!(sentiment_label("mixed"), None);
    }
}
