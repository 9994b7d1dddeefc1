//! OpenAI-compatible HTTP server.
//!
//! # Example
//!
//! ```bash
//! # Start the server with two warm CLI workers
//! clirelay serve --port 8000 --pool-size 2
//!
//! # Ask for a completion
//! curl http://localhost:8000/v1/chat/completions \
//!   -H 'Content-Type: application/json' \
//!   -d '{"model":"clirelay","messages":[{"role":"user","content":"hi"}]}'
//!
//! # View API documentation
//! open "http://localhost:8000/docs"
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::backend::Backend;
use crate::config::RelayConfig;
use crate::dump::DebugDumper;
use crate::error::Result;

/// Shared application state.
pub struct AppState {
    pub backend: Backend,
    /// Configuration, with `default_model` already resolved against the backend.
    pub config: RelayConfig,
    pub dumper: DebugDumper,
}

impl AppState {
    pub fn new(backend: Backend, config: RelayConfig) -> Self {
        let dumper = DebugDumper::new(config.debug_dump_dir.clone());
        Self {
            backend,
            config,
            dumper,
        }
    }
}

/// Server configuration.
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Enable CORS for all origins.
    pub cors: bool,
    /// Specific CORS origins.
    pub cors_origins: Option<Vec<String>>,
    pub relay: RelayConfig,
}

/// Build the router with API routes, OpenAPI docs, request IDs and tracing.
fn build_router(state: Arc<AppState>, cors: Option<CorsLayer>) -> Router {
    let mut app = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health_check))
        .merge(Scalar::with_url("/docs", openapi::ApiDoc::openapi()))
        .route(
            "/openapi.json",
            get(|| async { axum::Json(openapi::ApiDoc::openapi()) }),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .with_state(state);

    if let Some(cors_layer) = cors {
        app = app.layer(cors_layer);
    }

    app
}

fn cors_layer(config: &ServerConfig) -> Option<CorsLayer> {
    let base = || {
        CorsLayer::new()
            .allow_methods(Any)
            .allow_headers(Any)
            .max_age(Duration::from_secs(3600))
    };
    if config.cors {
        return Some(base().allow_origin(Any));
    }
    let origins: Vec<axum::http::HeaderValue> = config
        .cors_origins
        .as_ref()?
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    if origins.is_empty() {
        None
    } else {
        Some(base().allow_origin(origins))
    }
}

/// Start the backend and serve until Ctrl+C or SIGTERM.
///
/// Fails before binding if no pooled worker can be started. On shutdown the
/// pool's processes are stopped after the listener closes.
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let mut relay = config.relay.clone();
    let backend = Backend::from_config(&relay).await?;
    relay.default_model = backend.default_model(&relay.default_model).await;
    info!(
        mode = %backend.mode(),
        default_model = %relay.default_model,
        "backend ready"
    );

    let state = Arc::new(AppState::new(backend, relay));
    if let Some(dir) = state.dumper.dir() {
        info!(dir = %dir.display(), "writing request dumps");
    }
    let app = build_router(state.clone(), cors_layer(&config));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            state.backend.shutdown().await;
            return Err(e.into());
        }
    };

    eprintln!("Starting clirelay on http://{}", addr);
    eprintln!("Chat completions: http://{}/v1/chat/completions", addr);
    eprintln!("API documentation: http://{}/docs", addr);
    eprintln!("OpenAPI spec: http://{}/openapi.json", addr);
    eprintln!();
    eprintln!("Press Ctrl+C to stop");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    state.backend.shutdown().await;
    served?;

    eprintln!("\nServer stopped");

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendMode;
    use crate::worker::test_support::FAKE_REPL;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn pooled_config() -> RelayConfig {
        RelayConfig {
            cli_path: "sh".to_string(),
            cli_args: vec!["-c".to_string(), FAKE_REPL.to_string()],
            pool_size: 1,
            default_model: "fake-model".to_string(),
            ..RelayConfig::default()
        }
    }

    async fn app_with(config: RelayConfig) -> (Router, Arc<AppState>) {
        let backend = Backend::from_config(&config).await.unwrap();
        let state = Arc::new(AppState::new(backend, config));
        (build_router(state.clone(), None), state)
    }

    fn chat_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// `data:` payloads of an SSE body, in order.
    fn sse_data(body: &str) -> Vec<String> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_chat_completion() {
        let (app, state) = app_with(pooled_config()).await;

        let response = app
            .oneshot(chat_request(json!({
                "model": "clirelay",
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "fake-model");
        assert_eq!(body["choices"][0]["message"]["content"], "reply: hello");
        assert!(body["usage"]["total_tokens"].as_u64().unwrap() > 0);

        state.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_chat_completion_sends_every_user_turn() {
        let (app, state) = app_with(pooled_config()).await;

        let response = app
            .oneshot(chat_request(json!({
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "first"},
                    {"role": "assistant", "content": "ok"},
                    {"role": "user", "content": "second"}
                ]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        // The interactive CLI takes one line, so the turns arrive space-joined.
        assert_eq!(body["choices"][0]["message"]["content"], "reply: first second");

        state.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_chat_completion_without_user_message() {
        let (app, state) = app_with(pooled_config()).await;

        let response = app
            .oneshot(chat_request(json!({
                "messages": [{"role": "system", "content": "be brief"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["code"], "BAD_REQUEST");

        state.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_chat_completion_stream() {
        let (app, state) = app_with(pooled_config()).await;

        let response = app
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "content": "hello there"}],
                "stream": true
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let events = sse_data(&body_text(response).await);
        assert_eq!(events.last().map(String::as_str), Some("[DONE]"));

        let chunks: Vec<Value> = events[..events.len() - 1]
            .iter()
            .map(|e| serde_json::from_str(e).unwrap())
            .collect();
        let text: String = chunks
            .iter()
            .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
            .collect();
        assert_eq!(text.trim(), "reply: hello there");

        let last = chunks.last().unwrap();
        assert_eq!(last["object"], "chat.completion.chunk");
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert!(last["usage"]["completion_tokens"].as_u64().is_some());

        state.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_failure_sends_error_event() {
        let config = RelayConfig {
            mode: BackendMode::Oneshot,
            cli_path: "sh".to_string(),
            cli_args: vec!["-c".to_string(), "printf 'partial\\n'; exit 1".to_string()],
            ..RelayConfig::default()
        };
        let (app, _state) = app_with(config).await;

        let response = app
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let events = sse_data(&body_text(response).await);
        assert_eq!(events.last().map(String::as_str), Some("[DONE]"));
        let error: Value = serde_json::from_str(&events[events.len() - 2]).unwrap();
        assert_eq!(error["error"]["code"], "INTERNAL_ERROR");
        assert!(error["error"]["message"].as_str().unwrap().contains("code 1"));
    }

    #[tokio::test]
    async fn test_oneshot_failure_status() {
        let config = RelayConfig {
            mode: BackendMode::Oneshot,
            cli_path: "/nonexistent/clirelay-cli".to_string(),
            ..RelayConfig::default()
        };
        let (app, _state) = app_with(config).await;

        let response = app
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_debug_dump_written() {
        let tmp = TempDir::new().unwrap();
        let config = RelayConfig {
            debug_dump_dir: Some(tmp.path().to_path_buf()),
            ..pooled_config()
        };
        let (app, state) = app_with(config).await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header("x-request-id", "dump-test")
                    .body(Body::from(
                        json!({"messages": [{"role": "user", "content": "hi"}]}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let dump: Value = serde_json::from_slice(
            &std::fs::read(tmp.path().join("dump-test_ok.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(dump["response"], "reply: hi");
        assert_eq!(dump["request"]["messages"][0]["content"], "hi");

        state.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_models() {
        let (app, state) = app_with(pooled_config()).await;

        let response = app
            .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["object"], "list");
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|m| m["id"].as_str())
            .collect();
        assert_eq!(ids, vec!["clirelay", "fake-model"]);

        state.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_reports_pool() {
        let (app, state) = app_with(pooled_config()).await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mode"], "pooled");
        assert_eq!(body["pool"]["capacity"], 1);

        state.backend.shutdown().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_openapi_json() {
        let (app, _state) = app_with(RelayConfig {
            mode: BackendMode::Oneshot,
            ..RelayConfig::default()
        })
        .await;

        let response = app
            .oneshot(Request::builder().uri("/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(body["paths"]["/v1/chat/completions"].is_object());
    }

    #[test]
    fn test_cors_layer_selection() {
        let mut config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            cors: false,
            cors_origins: None,
            relay: RelayConfig::default(),
        };
        assert!(cors_layer(&config).is_none());

        config.cors_origins = Some(vec!["http://localhost:3000".into()]);
        assert!(cors_layer(&config).is_some());

        config.cors_origins = Some(vec!["not a header\n".into()]);
        assert!(cors_layer(&config).is_none());

        config.cors = true;
        assert!(cors_layer(&config).is_some());
    }
}
