//! End-to-end tests for the tracecheck harness.
//!
//! Each test runs the full harness sequence against in-process mock
//! endpoints (chat completions, Anthropic messages, Langfuse ingestion) and
//! checks the operator report and the run summary.
//!
//! The exporter switch is process-wide, so every test here asks for the
//! same exporter list (`langfuse`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracecheck::{FailureKind, Harness, HarnessError, HarnessOptions, Outcome, exit_code};
use tracecheck_config::{ConfigError, Mode, Overrides};

// ── Mock endpoints ───────────────────────────────────────────────────────

type Batches = Arc<Mutex<Vec<Value>>>;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Chat-completions endpoint streaming `sse`, plus a Langfuse ingestion
/// endpoint that records every batch it receives.
async fn mock_openai(sse: &'static str) -> (String, Batches) {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let seen = batches.clone();
    let app = Router::new()
        .route(
            "/chat/completions",
            post(move || async move { ([("content-type", "text/event-stream")], sse) }),
        )
        .route(
            "/api/public/ingestion",
            post(move |Json(body): Json<Value>| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(body);
                    (
                        axum::http::StatusCode::MULTI_STATUS,
                        Json(json!({"successes": [], "errors": []})),
                    )
                }
            }),
        );
    (serve(app).await, batches)
}

/// Anthropic messages endpoint answering with the scripted bodies in order.
async fn mock_anthropic(replies: Vec<Value>) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let replies = Arc::new(replies);
    let app = Router::new().route(
        "/v1/messages",
        post(move |headers: HeaderMap, Json(_body): Json<Value>| {
            let counter = counter.clone();
            let replies = replies.clone();
            async move {
                assert!(headers.contains_key("x-api-key"));
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let reply = replies
                    .get(n)
                    .cloned()
                    .unwrap_or_else(|| replies[replies.len() - 1].clone());
                Json(reply)
            }
        }),
    );
    (serve(app).await, calls)
}

const HELLO_STREAM: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hello from tracecheck\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\" with Langfuse!\"},\"finish_reason\":\"stop\"}]}\n\n",
    "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":14,\"completion_tokens\":6,\"total_tokens\":20}}\n\n",
    "data: [DONE]\n\n",
);

const EMPTY_STREAM: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\n",
    "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":14,\"completion_tokens\":0}}\n\n",
    "data: [DONE]\n\n",
);

fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    map.insert("TRACECHECK_EXPORTERS".into(), "langfuse".into());
    map
}

fn options(mode: Mode, env: HashMap<String, String>) -> HarnessOptions {
    HarnessOptions {
        mode,
        env: Some(env),
        ..HarnessOptions::default()
    }
}

async fn run(options: HarnessOptions) -> (Result<tracecheck::RunReport, HarnessError>, String) {
    let mut out = Vec::new();
    let result = Harness::new(options).run(&mut out).await;
    (result, String::from_utf8(out).unwrap())
}

// ── Direct mode ──────────────────────────────────────────────────────────

#[tokio::test]
async fn direct_mode_reports_response_metrics_and_exports_trace() {
    let (base, batches) = mock_openai(HELLO_STREAM).await;
    let (result, out) = run(options(
        Mode::Direct,
        env(&[
            ("ZAI_API_KEY", "sk-test"),
            ("ZAI_BASE_URL", &base),
            ("LLM_MODEL", "glm-4.7"),
            ("LANGFUSE_HOST", &base),
            ("LANGFUSE_PUBLIC_KEY", "pk-lf-test"),
            ("LANGFUSE_SECRET_KEY", "sk-lf-test"),
        ]),
    ))
    .await;

    let report = result.unwrap();
    assert_eq!(
        report.outcome,
        Outcome::Succeeded {
            response: "Hello from tracecheck with Langfuse!".into()
        }
    );
    assert_eq!(report.exporters, vec!["langfuse".to_string()]);
    assert_eq!(report.metrics.accumulated_input_tokens, 14);
    assert_eq!(report.metrics.accumulated_output_tokens, 6);
    assert_eq!(report.metrics.accumulated_total_tokens, 20);
    assert!(report.metrics.accumulated_cost > 0.0);

    assert!(out.contains(&format!("ZAI_BASE_URL: {base}")));
    assert!(out.contains("Telemetry exporters enabled: langfuse"));
    assert!(out.contains("Model: glm-4.7"));
    assert!(out.contains("Response: Hello from tracecheck with Langfuse!"));
    assert!(out.contains("Accumulated cost:   $0.0000"));
    assert!(out.contains("Total tokens:       20"));
    assert!(out.contains(&format!("Check Langfuse at {base} for traces")));
    assert_eq!(exit_code(&Ok(report), true), 0);

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    let events = batches[0]["batch"].as_array().unwrap();
    let trace = events.iter().find(|e| e["type"] == "trace-create").unwrap();
    assert_eq!(trace["body"]["sessionId"], "test_session_001");
    assert_eq!(trace["body"]["tags"], json!(["test", "langfuse-integration", "zai"]));
    let generation = events
        .iter()
        .find(|e| e["type"] == "generation-create")
        .unwrap();
    assert_eq!(generation["body"]["usage"]["total"], 20);
}

#[tokio::test]
async fn missing_langfuse_host_uses_placeholder() {
    let (base, batches) = mock_openai(HELLO_STREAM).await;
    let (result, out) = run(options(
        Mode::Direct,
        env(&[("ZAI_API_KEY", "sk-test"), ("ZAI_BASE_URL", &base)]),
    ))
    .await;

    let report = result.unwrap();
    assert!(report.is_success());
    assert!(out.contains("LANGFUSE_HOST: <not set>"));
    assert!(out.contains("Warning: LANGFUSE_HOST not set"));
    assert!(out.contains("Warning: exporter 'langfuse' will be skipped"));
    assert!(out.contains("Check Langfuse at <not set> for traces"));
    assert!(batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_credential_fails_before_any_request() {
    let (result, out) = run(options(
        Mode::Direct,
        env(&[("ZAI_BASE_URL", "http://127.0.0.1:1")]),
    ))
    .await;

    let err = result.as_ref().unwrap_err();
    assert!(
        matches!(err, HarnessError::Config(ConfigError::MissingKey { key }) if key == "ZAI_API_KEY")
    );
    assert!(err.to_string().contains("ZAI_API_KEY"));
    assert!(!out.contains("Check Langfuse"));
    assert_eq!(exit_code(&result, false), 1);
    assert_eq!(exit_code(&result, true), 2);
}

#[tokio::test]
async fn malformed_base_url_is_a_configuration_error() {
    let (result, _out) = run(options(
        Mode::Direct,
        env(&[("ZAI_API_KEY", "sk-test"), ("ZAI_BASE_URL", "not a url")]),
    ))
    .await;
    assert!(matches!(
        result,
        Err(HarnessError::Config(ConfigError::InvalidValue { .. }))
    ));
}

#[tokio::test]
async fn unreachable_endpoint_still_prints_closing_banner() {
    let (result, out) = run(options(
        Mode::Direct,
        env(&[("ZAI_API_KEY", "sk-test"), ("ZAI_BASE_URL", "http://127.0.0.1:1")]),
    ))
    .await;

    let report = result.unwrap();
    assert_eq!(report.failure_kind(), Some(FailureKind::Unreachable));
    assert!(out.contains("Request failed (endpoint unreachable)"));
    assert!(out.contains("Total tokens:       0"));
    assert!(out.contains("Check Langfuse at <not set> for traces"));

    let result = Ok(report);
    assert_eq!(exit_code(&result, false), 0);
    assert_eq!(exit_code(&result, true), 1);
}

#[tokio::test]
async fn empty_stream_is_reported_as_empty_response() {
    let (base, _batches) = mock_openai(EMPTY_STREAM).await;
    let (result, out) = run(options(
        Mode::Direct,
        env(&[("ZAI_API_KEY", "sk-test"), ("ZAI_BASE_URL", &base)]),
    ))
    .await;

    let report = result.unwrap();
    assert_eq!(report.failure_kind(), Some(FailureKind::EmptyResponse));
    assert!(out.contains("Request failed (empty response)"));
    assert!(!out.contains("Response: \n"));
}

#[tokio::test]
async fn overrides_win_over_environment() {
    let (base, _batches) = mock_openai(HELLO_STREAM).await;
    let mut opts = options(
        Mode::Direct,
        env(&[
            ("MOCK_API_KEY", "sk-test"),
            ("MOCK_BASE_URL", &base),
            ("LLM_MODEL", "glm-4.5"),
        ]),
    );
    opts.overrides = Overrides {
        provider: Some("mock".into()),
        model: Some("openai/glm-4.7".into()),
        session_id: Some("ci-run".into()),
        ..Overrides::default()
    };

    let (result, out) = run(opts).await;
    assert!(result.unwrap().is_success());
    assert!(out.contains(&format!("MOCK_BASE_URL: {base}")));
    assert!(out.contains("Model: openai/glm-4.7"));
}

#[tokio::test]
async fn missing_agent_workspace_fails_before_any_request() {
    let (base, calls) = mock_anthropic(vec![anthropic_text("unused")]).await;
    let workspace = tempfile::tempdir().unwrap();
    let mut opts = options(
        Mode::Agent,
        env(&[("ZAI_API_KEY", "sk-test"), ("ZAI_BASE_URL", &base)]),
    );
    opts.overrides.workspace = Some(workspace.path().join("does-not-exist"));

    let (result, _out) = run(opts).await;
    assert!(matches!(
        result,
        Err(HarnessError::Config(ConfigError::InvalidValue { ref key, .. })) if key == "agent.workspace"
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ── Agent mode ───────────────────────────────────────────────────────────

fn anthropic_text(text: &str) -> Value {
    json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "model": "glm-4.7",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 40, "output_tokens": 9}
    })
}

#[tokio::test]
async fn agent_mode_runs_to_completion_and_accumulates_cost() {
    let (base, calls) = mock_anthropic(vec![anthropic_text("Hello from tracecheck with Langfuse!")]).await;
    let workspace = tempfile::tempdir().unwrap();
    let mut opts = options(
        Mode::Agent,
        env(&[("ZAI_API_KEY", "sk-test"), ("ZAI_BASE_URL", &base)]),
    );
    opts.overrides.workspace = Some(workspace.path().to_path_buf());

    let (result, out) = run(opts).await;
    let report = result.unwrap();

    assert!(report.is_success(), "{out}");
    assert!(out.contains("2 span(s)"), "{out}");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(report.metrics.accumulated_cost > 0.0);
    assert_eq!(report.metrics.accumulated_input_tokens, 40);
    assert_eq!(report.metrics.accumulated_output_tokens, 9);
    assert!(out.contains("Model: anthropic/glm-4.7"));
    assert!(out.contains("Tools: file_editor, task_tracker, terminal"));
    assert!(out.contains("Response: Hello from tracecheck with Langfuse!"));
}

#[tokio::test]
async fn agent_mode_executes_tool_calls() {
    let tool_use = json!({
        "id": "msg_0",
        "type": "message",
        "role": "assistant",
        "model": "glm-4.7",
        "content": [
            {"type": "text", "text": "Creating the file."},
            {
                "type": "tool_use",
                "id": "toolu_1",
                "name": "file_editor",
                "input": {"command": "create", "path": "hello.txt", "file_text": "hi\n"}
            }
        ],
        "stop_reason": "tool_use",
        "usage": {"input_tokens": 50, "output_tokens": 20}
    });
    let (base, calls) = mock_anthropic(vec![tool_use, anthropic_text("Created hello.txt.")]).await;
    let workspace = tempfile::tempdir().unwrap();
    let mut opts = options(
        Mode::Agent,
        env(&[("ZAI_API_KEY", "sk-test"), ("ZAI_BASE_URL", &base)]),
    );
    opts.overrides.workspace = Some(workspace.path().to_path_buf());
    opts.overrides.prompt = Some("Create hello.txt containing 'hi'".into());

    let (result, out) = run(opts).await;
    let report = result.unwrap();

    assert!(report.is_success(), "{out}");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        std::fs::read_to_string(workspace.path().join("hello.txt")).unwrap(),
        "hi\n"
    );
    assert_eq!(report.metrics.accumulated_total_tokens, 50 + 20 + 40 + 9);
    assert_eq!(report.metrics.tool_executions, 1);
    assert!(out.contains("2 model call(s), 1 tool call(s)"));
}

#[tokio::test]
async fn agent_mode_auth_failure_is_caught() {
    let app = Router::new().route(
        "/v1/messages",
        post(|| async { (axum::http::StatusCode::UNAUTHORIZED, "invalid x-api-key") }),
    );
    let base = serve(app).await;
    let workspace = tempfile::tempdir().unwrap();
    let mut opts = options(
        Mode::Agent,
        env(&[("ZAI_API_KEY", "bad"), ("ZAI_BASE_URL", &base)]),
    );
    opts.overrides.workspace = Some(workspace.path().to_path_buf());

    let (result, out) = run(opts).await;
    let report = result.unwrap();
    assert_eq!(report.failure_kind(), Some(FailureKind::Auth));
    assert!(out.contains("Request failed (authentication failed)"));
    assert!(out.contains("Check Langfuse at"));
}
