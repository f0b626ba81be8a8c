//! Adapter for any OpenAI-compatible chat completions endpoint — the
//! deployed chat API, a local vLLM/Ollama instance, or similar.

use hub_domain::config::ProviderConfig;
use hub_domain::error::{Error, Result};
use hub_domain::stream::{BoxStream, ProviderStreamEvent, Usage};
use hub_domain::tool::{Message, Role, ToolCall, ToolDefinition};
use serde_json::Value;

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use crate::util::{from_reqwest, resolve_api_key};

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: resolve_api_key(&cfg.api_key_env)?,
            default_model: cfg.model.clone(),
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        builder
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();
        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
        Role::Assistant => {
            let mut obj = serde_json::json!({
                "role": "assistant",
                "content": if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) },
            });
            if !msg.tool_calls.is_empty() {
                obj["tool_calls"] = Value::Array(msg.tool_calls.iter().map(tool_call_to_openai).collect());
            }
            obj
        }
        _ => serde_json::json!({
            "role": role_to_str(msg.role),
            "content": msg.content,
        }),
    }
}

fn tool_call_to_openai(tc: &ToolCall) -> Value {
    serde_json::json!({
        "id": tc.call_id,
        "type": "function",
        "function": { "name": tc.tool_name, "arguments": tc.arguments.to_string() },
    })
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn parse_chat_response(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::ProviderFatal("no choices in response".into()))?;

    let message = choice
        .get("message")
        .ok_or_else(|| Error::ProviderFatal("no message in choice".into()))?;

    let content = message.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str()).map(String::from);
    let model = body.get("model").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
    let tool_calls = parse_openai_tool_calls(message);
    let usage = body.get("usage").and_then(parse_openai_usage);

    Ok(ChatResponse { content, tool_calls, usage, model, finish_reason })
}

fn parse_openai_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
            let arguments: Value = serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall { call_id, tool_name, arguments })
        })
        .collect()
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()?,
        completion_tokens: v.get("completion_tokens")?.as_u64()?,
        total_tokens: v.get("total_tokens")?.as_u64()?,
    })
}

fn parse_sse_data(data: &str) -> Vec<Result<ProviderStreamEvent>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(ProviderStreamEvent::Done { usage: None })];
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let choice = v.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first());

    let choice = match choice {
        Some(c) => c,
        None => {
            return match v.get("usage").and_then(parse_openai_usage) {
                Some(usage) => vec![Ok(ProviderStreamEvent::Done { usage: Some(usage) })],
                None => Vec::new(),
            };
        }
    };

    let delta = choice.get("delta").unwrap_or(&Value::Null);

    if choice.get("finish_reason").and_then(|f| f.as_str()).is_some() {
        let usage = v.get("usage").and_then(parse_openai_usage);
        return vec![Ok(ProviderStreamEvent::Done { usage })];
    }

    let mut events = Vec::new();
    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let call_id = tc
                .get("id")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0).to_string());
            if let Some(args) = tc.get("function").and_then(|f| f.get("arguments")).and_then(|v| v.as_str()) {
                events.push(Ok(ProviderStreamEvent::ToolCallDelta { call_id, delta: args.to_string() }));
            }
        }
    }
    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(ProviderStreamEvent::Token { text: text.to_string() }));
        }
    }
    events
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(req, false);

        tracing::debug!(provider = %self.id, "openai_compat chat request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(classify_http_error(&self.id, status, &resp_text));
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&resp_json)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderStreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(req, true);

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(classify_http_error(&self.id, status, &err_text));
        }

        Ok(crate::sse::sse_response_stream(resp, parse_sse_data))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

/// 429 and 5xx are treated as transient (worth falling back); everything
/// else (bad request, auth) is fatal and stops the chain immediately.
pub(crate) fn classify_http_error(provider_id: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let message = format!("{provider_id}: HTTP {} - {body}", status.as_u16());
    if status.as_u16() == 429 || status.is_server_error() {
        Error::ProviderTransient(message)
    } else {
        Error::ProviderFatal(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_domain::tool::Message;

    #[test]
    fn assistant_message_with_no_tool_calls_serializes_plain() {
        let msg = Message::assistant("hi there");
        let v = msg_to_openai(&msg);
        assert_eq!(v["content"], "hi there");
        assert!(v.get("tool_calls").is_none());
    }

    #[test]
    fn tool_result_message_carries_call_id() {
        let msg = Message::tool_result("call-1", "42");
        let v = msg_to_openai(&msg);
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call-1");
    }

    #[test]
    fn parses_tool_calls_from_response() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call-1",
                        "function": { "name": "search_skills", "arguments": "{\"query\":\"lights\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let resp = parse_chat_response(&body).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].tool_name, "search_skills");
    }

    #[test]
    fn server_error_is_transient() {
        let err = classify_http_error("p1", reqwest::StatusCode::SERVICE_UNAVAILABLE, "down");
        assert!(err.is_retriable());
    }

    #[test]
    fn bad_request_is_fatal() {
        let err = classify_http_error("p1", reqwest::StatusCode::BAD_REQUEST, "bad input");
        assert!(!err.is_retriable());
    }
}
