//! API request handlers.
//!
//! Chat completions go through the configured [`Backend`](crate::backend::Backend).
//! Streaming replies are sent as server-sent events: one
//! `chat.completion.chunk` per text fragment, a terminal chunk carrying
//! `finish_reason = "stop"` and usage, then `[DONE]`. A failure after the
//! stream has started is sent as an `{"error": {...}}` event followed by
//! `[DONE]`, since the status line is already gone.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::Stream;
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::MODEL_ALIAS;
use crate::dump::DumpRecord;
use crate::session::{CompletionStream, StreamEvent};
use crate::version;

use super::AppState;
use super::error::{ApiError, ApiErrorEnvelope};
use super::middleware::RequestId;
use super::types::*;

/// Terminal SSE payload.
const DONE: &str = "[DONE]";

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

fn json_event<T: Serialize>(value: &T) -> Event {
    match serde_json::to_string(value) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            error!(error = %e, "failed to serialize SSE event");
            Event::default()
                .data(r#"{"error":{"code":"INTERNAL_ERROR","message":"serialization failed"}}"#)
        }
    }
}

/// Create a chat completion.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion, or an SSE stream of chunks when `stream` is set", body = ChatCompletionResponse),
        (status = 400, description = "No user message", body = ApiErrorEnvelope),
        (status = 500, description = "CLI failure", body = ApiErrorEnvelope),
        (status = 503, description = "No worker available", body = ApiErrorEnvelope),
        (status = 504, description = "CLI timed out", body = ApiErrorEnvelope),
    ),
    tag = "chat"
)]
#[instrument(skip_all)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let request: ChatCompletionRequest = serde_json::from_value(raw.clone())
        .map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))?;
    let model = state.config.resolve_model(request.model.as_deref());
    let record = DumpRecord::new(
        &request_id,
        state.backend.mode(),
        &model,
        request.stream,
        raw,
    );

    let Some(prompt) = request.user_prompt() else {
        let err = ApiError::bad_request("No user message found in request");
        state.dumper.write(&record.fail(None, &err.message)).await;
        return Err(err);
    };

    if request.stream {
        return match state.backend.complete_stream(&prompt, &model).await {
            Ok(rx) => {
                let events = sse_events(state.clone(), rx, model, record);
                Ok(Sse::new(events)
                    .keep_alive(KeepAlive::default())
                    .into_response())
            }
            Err(e) => {
                warn!(error = %e, "streaming completion could not start");
                state.dumper.write(&record.fail(None, &e)).await;
                Err(e.into())
            }
        };
    }

    let started = Instant::now();
    match state.backend.complete(&prompt, &model).await {
        Ok(completion) => {
            info!(
                model = %model,
                elapsed_ms = started.elapsed().as_millis() as u64,
                completion_tokens = completion.usage.completion_tokens,
                usage_estimated = completion.usage_estimated,
                "completion finished"
            );
            state
                .dumper
                .write(&record.succeed(&completion.text, completion.usage))
                .await;
            let response = ChatCompletionResponse::new(
                &completion_id(),
                chrono::Utc::now().timestamp(),
                &model,
                completion.text,
                completion.usage,
            );
            Ok(Json(response).into_response())
        }
        Err(e) => {
            warn!(error = %e, elapsed_ms = started.elapsed().as_millis() as u64, "completion failed");
            state.dumper.write(&record.fail(None, &e)).await;
            Err(e.into())
        }
    }
}

/// Turn backend stream events into SSE events.
fn sse_events(
    state: Arc<AppState>,
    mut rx: CompletionStream,
    model: String,
    record: DumpRecord,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let id = completion_id();
    let created = chrono::Utc::now().timestamp();

    async_stream::stream! {
        let mut text = String::new();
        let mut failure: Option<String> = None;
        let mut finished = false;

        while let Some(event) = rx.recv().await {
            match event {
                Ok(StreamEvent::Delta(delta)) => {
                    text.push_str(&delta);
                    yield Ok(json_event(&ChatCompletionChunk::delta(&id, created, &model, delta)));
                }
                Ok(StreamEvent::Done(usage)) => {
                    yield Ok(json_event(&ChatCompletionChunk::stop(&id, created, &model, usage)));
                    state.dumper.write(&record.clone().succeed(&text, usage)).await;
                    finished = true;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, streamed_chars = text.chars().count(), "stream failed");
                    failure = Some(e.to_string());
                    yield Ok(json_event(&ApiError::from(e).body()));
                    break;
                }
            }
        }

        if !finished {
            let message = match failure {
                Some(message) => message,
                None => {
                    let message = "stream ended before the reply was complete".to_string();
                    error!("{}", message);
                    yield Ok(json_event(&ApiError::internal(&message).body()));
                    message
                }
            };
            state.dumper.write(&record.clone().fail(Some(text.clone()), &message)).await;
        }

        yield Ok(Event::default().data(DONE));
    }
}

/// List models.
#[utoipa::path(
    get,
    path = "/v1/models",
    responses(
        (status = 200, description = "Available models", body = ModelList),
    ),
    tag = "models"
)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let mut data = vec![ModelInfo::new(MODEL_ALIAS)];
    if state.config.default_model != MODEL_ALIAS {
        data.push(ModelInfo::new(&state.config.default_model));
    }
    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// Health check.
///
/// Returns 503 with `degraded` when no worker is alive or the pool is shut down.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is degraded", body = HealthResponse),
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = state.backend.is_healthy();
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: version::full_version(),
        mode: state.backend.mode().to_string(),
        pool: state.backend.pool_stats().map(PoolStatsSchema::from),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
