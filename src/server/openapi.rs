//! OpenAPI specification for the clirelay API.

use utoipa::OpenApi;

use super::error::{ApiErrorBody, ApiErrorEnvelope};
use super::handlers;
use super::types::*;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "clirelay API",
        description = "OpenAI-compatible chat completions served by an interactive command-line model client.",
        version = "1.0.0",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local server")
    ),
    paths(
        handlers::chat_completions,
        handlers::list_models,
        handlers::health_check,
    ),
    components(schemas(
        ChatMessage,
        ChatCompletionRequest,
        ChatCompletionResponse,
        ChatChoice,
        ChatCompletionChunk,
        ChunkChoice,
        ChunkDelta,
        UsageSchema,
        ModelInfo,
        ModelList,
        HealthResponse,
        PoolStatsSchema,
        ApiErrorBody,
        ApiErrorEnvelope,
    )),
    tags(
        (name = "chat", description = "Chat completions"),
        (name = "models", description = "Model listing"),
        (name = "health", description = "Health checks")
    )
)]
pub struct ApiDoc;
