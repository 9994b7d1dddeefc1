//! OpenAI-compatible request and response types.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::usage::TokenUsage;
use crate::worker::WorkerPoolStats;

/// One message of a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Body of `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    /// Model name. Omitted or `clirelay` means the backend default.
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Stream the reply as server-sent events.
    #[serde(default)]
    pub stream: bool,
}

impl ChatCompletionRequest {
    /// Contents of every user message, joined by newlines.
    ///
    /// `None` when there is no user text at all.
    pub fn user_prompt(&self) -> Option<String> {
        let prompt = self
            .messages
            .iter()
            .filter(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        (!prompt.trim().is_empty()).then_some(prompt)
    }
}

/// Token counts in OpenAI's shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct UsageSchema {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl From<TokenUsage> for UsageSchema {
    fn from(usage: TokenUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

/// Non-streaming reply.
#[derive(Debug, Serialize, ToSchema)]
pub struct ChatCompletionResponse {
    pub id: String,
    /// Always `chat.completion`.
    pub object: String,
    /// Unix seconds.
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: UsageSchema,
}

impl ChatCompletionResponse {
    pub fn new(id: &str, created: i64, model: &str, text: String, usage: TokenUsage) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: text,
                },
                finish_reason: "stop".to_string(),
            }],
            usage: usage.into(),
        }
    }
}

/// Incremental content of a streamed choice.
#[derive(Debug, Default, Serialize, ToSchema)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

/// One server-sent event of a streamed reply.
#[derive(Debug, Serialize, ToSchema)]
pub struct ChatCompletionChunk {
    pub id: String,
    /// Always `chat.completion.chunk`.
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    /// Present on the terminal chunk only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSchema>,
}

impl ChatCompletionChunk {
    fn with_choice(id: &str, created: i64, model: &str, choice: ChunkChoice) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![choice],
            usage: None,
        }
    }

    /// A chunk carrying the next piece of text.
    pub fn delta(id: &str, created: i64, model: &str, content: String) -> Self {
        Self::with_choice(
            id,
            created,
            model,
            ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(content),
                },
                finish_reason: None,
            },
        )
    }

    /// The terminal chunk: empty delta, `stop`, and usage.
    pub fn stop(id: &str, created: i64, model: &str, usage: TokenUsage) -> Self {
        let mut chunk = Self::with_choice(
            id,
            created,
            model,
            ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some("stop".to_string()),
            },
        );
        chunk.usage = Some(usage.into());
        chunk
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ModelInfo {
    pub id: String,
    /// Always `model`.
    pub object: String,
    pub owned_by: String,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            owned_by: "clirelay".to_string(),
        }
    }
}

/// Body of `GET /v1/models`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ModelList {
    /// Always `list`.
    pub object: String,
    pub data: Vec<ModelInfo>,
}

/// Worker pool counters.
#[derive(Debug, Serialize, ToSchema)]
pub struct PoolStatsSchema {
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub commands_completed: usize,
    pub restarts: usize,
    pub discarded: usize,
}

impl From<WorkerPoolStats> for PoolStatsSchema {
    fn from(stats: WorkerPoolStats) -> Self {
        Self {
            capacity: stats.capacity,
            live: stats.live,
            idle: stats.idle,
            checked_out: stats.checked_out,
            commands_completed: stats.commands_completed,
            restarts: stats.restarts,
            discarded: stats.discarded,
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `ok` or `degraded`.
    pub status: String,
    /// clirelay version.
    pub version: String,
    /// `pooled` or `oneshot`.
    pub mode: String,
    /// Present in pooled mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatsSchema>,
}
