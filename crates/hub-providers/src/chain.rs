//! Builds the ordered provider chain from config and runs inference with
//! fallback.
//!
//! Providers are tried in the order they appear in config. A transient
//! failure (rate limited, 5xx, timeout) advances to the next provider in
//! the chain; a fatal one (bad request, auth) stops the chain immediately
//! and is returned to the caller. The whole chain is bounded by a single
//! deadline so a hung provider can't stall a turn indefinitely.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hub_domain::config::{LlmConfig, ProviderKind};
use hub_domain::error::{Error, ErrorKind, Result};
use hub_domain::trace::TraceEvent;

use crate::anthropic::AnthropicProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

/// How many times a single provider is retried on a transient error
/// before the chain moves on to the next one.
const MAX_RETRIES_PER_PROVIDER: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

pub struct LlmGateway {
    chain: Vec<Arc<dyn LlmProvider>>,
    turn_deadline: Duration,
}

impl LlmGateway {
    /// Instantiate every configured provider in order. A provider that
    /// fails to construct (e.g. missing API key env var) is dropped with
    /// a warning rather than failing the whole gateway — it simply never
    /// appears in the fallback chain.
    pub fn from_config(config: &LlmConfig, turn_deadline: Duration) -> Self {
        let mut chain: Vec<Arc<dyn LlmProvider>> = Vec::new();
        for pc in &config.providers {
            let built: Result<Arc<dyn LlmProvider>> = match pc.kind {
                ProviderKind::OpenaiCompat => {
                    OpenAiCompatProvider::from_config(pc).map(|p| Arc::new(p) as Arc<dyn LlmProvider>)
                }
                ProviderKind::Anthropic => {
                    AnthropicProvider::from_config(pc).map(|p| Arc::new(p) as Arc<dyn LlmProvider>)
                }
            };
            match built {
                Ok(provider) => chain.push(provider),
                Err(e) => tracing::warn!(provider_id = %pc.id, error = %e, "provider failed to initialize, excluded from chain"),
            }
        }
        Self { chain, turn_deadline }
    }

    #[cfg(test)]
    fn from_providers(chain: Vec<Arc<dyn LlmProvider>>, turn_deadline: Duration) -> Self {
        Self { chain, turn_deadline }
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Send one chat request through the provider chain, falling back on
    /// transient failures until either a provider succeeds, a fatal error
    /// is hit, or the turn deadline elapses.
    pub async fn infer(&self, req: ChatRequest) -> Result<ChatResponse> {
        if self.chain.is_empty() {
            return Err(Error::ProviderFatal("no LLM providers configured".into()));
        }

        let deadline = Instant::now() + self.turn_deadline;
        let mut last_err = Error::ProviderFatal("no providers attempted".into());

        for (idx, provider) in self.chain.iter().enumerate() {
            if idx > 0 {
                TraceEvent::LlmFallback {
                    from_provider: self.chain[idx - 1].provider_id().to_string(),
                    to_provider: provider.provider_id().to_string(),
                    reason: last_err.to_string(),
                }
                .emit();
            }

            for attempt in 0..=MAX_RETRIES_PER_PROVIDER {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::ProviderTransient("turn deadline exceeded".into()));
                }

                let start = Instant::now();
                let result = tokio::time::timeout(remaining, provider.chat(&req)).await;
                let duration_ms = start.elapsed().as_millis() as u64;

                let outcome = match result {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::ProviderTransient(format!(
                        "{} timed out after {}ms",
                        provider.provider_id(),
                        remaining.as_millis()
                    ))),
                };

                match outcome {
                    Ok(resp) => {
                        TraceEvent::LlmRequest {
                            provider: provider.provider_id().to_string(),
                            model: resp.model.clone(),
                            duration_ms,
                            prompt_tokens: resp.usage.as_ref().map(|u| u.prompt_tokens),
                            completion_tokens: resp.usage.as_ref().map(|u| u.completion_tokens),
                        }
                        .emit();
                        return Ok(resp);
                    }
                    Err(e) if e.kind() == ErrorKind::ProviderTransient && attempt < MAX_RETRIES_PER_PROVIDER => {
                        tracing::warn!(provider = %provider.provider_id(), attempt, error = %e, "transient failure, retrying");
                        last_err = e;
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                    Err(e) if e.kind() == ErrorKind::ProviderFatal => {
                        return Err(e);
                    }
                    Err(e) => {
                        last_err = e;
                        break;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Look up the list of configured provider ids, in chain order.
    pub fn provider_ids(&self) -> Vec<&str> {
        self.chain.iter().map(|p| p.provider_id()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_domain::stream::{BoxStream, ProviderStreamEvent};
    use hub_domain::tool::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        id: &'static str,
        calls: AtomicUsize,
        behavior: fn(usize) -> Result<ChatResponse>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for StubProvider {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.behavior)(n)
        }

        async fn chat_stream(&self, _req: &ChatRequest) -> Result<BoxStream<'static, Result<ProviderStreamEvent>>> {
            unimplemented!("not exercised in these tests")
        }

        fn provider_id(&self) -> &str {
            self.id
        }
    }

    fn request() -> ChatRequest {
        ChatRequest { messages: vec![Message::user("hi")], ..Default::default() }
    }

    fn ok_response() -> ChatResponse {
        ChatResponse { content: "hello".into(), tool_calls: vec![], usage: None, model: "m".into(), finish_reason: None }
    }

    #[tokio::test]
    async fn succeeds_on_primary_provider() {
        let primary = Arc::new(StubProvider { id: "primary", calls: AtomicUsize::new(0), behavior: |_| Ok(ok_response()) });
        let gateway = LlmGateway::from_providers(vec![primary], Duration::from_secs(5));
        let resp = gateway.infer(request()).await.unwrap();
        assert_eq!(resp.content, "hello");
    }

    #[tokio::test]
    async fn falls_back_to_second_provider_on_transient_error() {
        let primary = Arc::new(StubProvider {
            id: "primary",
            calls: AtomicUsize::new(0),
            behavior: |_| Err(Error::ProviderTransient("rate limited".into())),
        });
        let secondary = Arc::new(StubProvider { id: "secondary", calls: AtomicUsize::new(0), behavior: |_| Ok(ok_response()) });
        let gateway = LlmGateway::from_providers(vec![primary, secondary], Duration::from_secs(5));
        let resp = gateway.infer(request()).await.unwrap();
        assert_eq!(resp.model, "m");
    }

    #[tokio::test]
    async fn fatal_error_stops_the_chain_immediately() {
        let primary = Arc::new(StubProvider {
            id: "primary",
            calls: AtomicUsize::new(0),
            behavior: |_| Err(Error::ProviderFatal("bad request".into())),
        });
        let secondary = Arc::new(StubProvider { id: "secondary", calls: AtomicUsize::new(0), behavior: |_| Ok(ok_response()) });
        let gateway = LlmGateway::from_providers(vec![primary, secondary.clone()], Duration::from_secs(5));
        let err = gateway.infer(request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderFatal);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_before_falling_back() {
        let primary = Arc::new(StubProvider {
            id: "primary",
            calls: AtomicUsize::new(0),
            behavior: |n| if n < 2 { Err(Error::ProviderTransient("flaky".into())) } else { Ok(ok_response()) },
        });
        let gateway = LlmGateway::from_providers(vec![primary.clone()], Duration::from_secs(5));
        let resp = gateway.infer(request()).await.unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_chain_is_a_fatal_error() {
        let gateway = LlmGateway::from_providers(vec![], Duration::from_secs(5));
        let err = gateway.infer(request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderFatal);
    }
}
