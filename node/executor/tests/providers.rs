use agora_common::TaskInput;
use agora_executor::executors::{DelegatedExecutor, Executor, LlmExecutor, ProviderConfig};
use axum::{
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ethers::types::U256;
use futures::StreamExt;
use serde_json::{json, Value};

fn serve(app: Router) -> String {
    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    format!("http://{}", addr)
}

fn task(service_type: &str, payload: Value) -> TaskInput {
    TaskInput {
        order_id: U256::from(21),
        service_type: service_type.into(),
        payload,
        total_price: U256::from(5),
        start_time: chrono::Utc::now().timestamp_millis(),
    }
}

fn event_stream(body: &'static str) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

const OPENAI_STREAM: &str = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
data: [DONE]\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n";

const ANTHROPIC_STREAM: &str = "event: message_start\ndata: {\"type\":\"message_start\"}\n\n\
event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Bon\"}}\n\n\
event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"jour\"}}\n\n";

#[tokio::test]
async fn openai_stream_stops_at_done_marker() {
    let base = serve(Router::new().route(
        "/v1/chat/completions",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["stream"], json!(true));
            event_stream(OPENAI_STREAM)
        }),
    ));
    let provider = ProviderConfig::openai("sk", "gpt-test").with_base_url(format!("{}/v1", base));
    let llm = LlmExecutor::new("openai", provider, vec!["llm-*".into()]).unwrap();

    let stream = llm
        .stream(&task("llm-completion", json!({ "prompt": "say hello" })))
        .await
        .unwrap();
    assert_eq!(stream.collect_text().await.unwrap(), "Hello");
}

#[tokio::test]
async fn anthropic_stream_tolerates_missing_terminator() {
    let base = serve(Router::new().route(
        "/v1/messages",
        post(|headers: HeaderMap| async move {
            assert_eq!(headers["x-api-key"], "ak");
            assert!(headers.contains_key("anthropic-version"));
            event_stream(ANTHROPIC_STREAM)
        }),
    ));
    let provider = ProviderConfig::anthropic("ak", "claude-test").with_base_url(format!("{}/v1", base));
    let llm = LlmExecutor::new("anthropic", provider, vec!["translation".into()]).unwrap();

    let mut stream = llm
        .stream(&task("translation", json!({ "text": "hello", "targetLanguage": "French" })))
        .await
        .unwrap();
    let mut parts = Vec::new();
    while let Some(part) = stream.next().await {
        parts.push(part.unwrap());
    }
    assert_eq!(parts, vec!["Bon", "jour"]);
}

#[tokio::test]
async fn anthropic_completion_reports_usage_and_cost() {
    let base = serve(Router::new().route(
        "/v1/messages",
        post(|Json(body): Json<Value>| async move {
            assert!(body["system"].as_str().unwrap().contains("French"));
            Json(json!({
                "content": [{ "type": "text", "text": "Bonjour" }],
                "usage": { "input_tokens": 1_000_000, "output_tokens": 0 },
            }))
        }),
    ));
    let provider = ProviderConfig::anthropic("ak", "claude-test").with_base_url(format!("{}/v1", base));
    let llm = LlmExecutor::new("anthropic", provider, vec!["translation".into()]).unwrap();

    let result = llm
        .execute(&task("translation", json!({ "text": "hello", "targetLanguage": "French" })))
        .await;
    assert!(result.success, "{:?}", result.error);
    let output = result.output.unwrap();
    assert_eq!(output["text"], json!("Bonjour"));
    assert_eq!(output["cost"], json!(3.0));
    assert_eq!(result.evidence["provider"], json!("anthropic"));
}

#[tokio::test]
async fn provider_errors_become_failed_results() {
    let base = serve(Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
    ));
    let provider = ProviderConfig::openai("sk", "gpt-test").with_base_url(format!("{}/v1", base));
    let llm = LlmExecutor::new("openai", provider, vec!["*".into()]).unwrap();

    let result = llm.execute(&task("summarization", json!({ "text": "long text" }))).await;
    assert!(!result.success);
    assert!(result.result_locator.is_none());
    assert_eq!(
        result.error.as_deref(),
        Some("provider returned HTTP 429: slow down")
    );

    let stream = llm.stream(&task("summarization", json!({ "text": "x" }))).await;
    assert!(stream.is_err());
}

#[tokio::test]
async fn health_checks_probe_provider_endpoints() {
    let base = serve(Router::new().route(
        "/v1/models",
        get(|headers: HeaderMap| async move {
            if headers.get(header::AUTHORIZATION).map(|v| *v == "Bearer good").unwrap_or(false) {
                StatusCode::OK
            } else {
                StatusCode::UNAUTHORIZED
            }
        }),
    ));
    let good = LlmExecutor::new(
        "good",
        ProviderConfig::openai("good", "m").with_base_url(format!("{}/v1", base)),
        vec![],
    )
    .unwrap();
    let bad = LlmExecutor::new(
        "bad",
        ProviderConfig::openai("bad", "m").with_base_url(format!("{}/v1", base)),
        vec![],
    )
    .unwrap();

    assert!(good.health_check().await.unwrap());
    assert!(!bad.health_check().await.unwrap());
}

#[tokio::test]
async fn delegated_executor_forwards_task() {
    let base = serve(
        Router::new()
            .route(
                "/execute",
                post(|Json(task): Json<Value>| async move {
                    Json(json!({
                        "output": { "echo": task["payload"], "order": task["orderId"] },
                        "evidence": { "worker": "w-1" },
                    }))
                }),
            )
            .route("/health", get(|| async { StatusCode::OK })),
    );
    let delegate = DelegatedExecutor::new("delegate", &format!("{}/", base), vec!["*".into()]).unwrap();

    let result = delegate.execute(&task("custom-job", json!({ "x": 1 }))).await;
    assert!(result.success, "{:?}", result.error);
    let output = result.output.unwrap();
    assert_eq!(output["echo"], json!({ "x": 1 }));
    assert_eq!(output["order"], json!("21"));
    assert_eq!(result.evidence["remote"]["worker"], json!("w-1"));
    assert!(delegate.health_check().await.unwrap());
}

#[tokio::test]
async fn delegated_executor_requires_output() {
    let base = serve(Router::new().route("/execute", post(|| async { Json(json!({ "status": "ok" })) })));
    let delegate = DelegatedExecutor::new("delegate", &base, vec!["*".into()]).unwrap();

    let result = delegate.execute(&task("custom-job", json!({ "x": 1 }))).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("missing output"));
}
