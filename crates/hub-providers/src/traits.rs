//! The adapter contract every LLM backend implements.
//!
//! Request/response shapes are the canonical ones from [`hub_domain::tool`]
//! and [`hub_domain::stream`] — an adapter's only job is translating them
//! to and from one provider's wire format.

use hub_domain::error::Result;
use hub_domain::stream::{BoxStream, ProviderStreamEvent, Usage};
use hub_domain::tool::{Message, ToolCall, ToolDefinition};

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Overrides the provider's configured default model for this call.
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// One configured LLM backend: the deployed chat API, a hosted model
/// provider, or a local fallback. Each adapter knows how to translate
/// the canonical request/response shapes to and from its own wire format.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderStreamEvent>>>;

    fn provider_id(&self) -> &str;
}
