use crate::config::Settings;
use crate::models::{ChatChoice, ChatMessage, ChatRequest, ChatResponse, Role};
use anyhow::{Context, Result};
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    CreateEmbeddingRequestArgs,
};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Anything that can answer an OpenAI-style chat completion
#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(
        &self,
        request: CreateChatCompletionRequest,
    ) -> Result<CreateChatCompletionResponse>;
}

/// Anything that can turn text into an embedding vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>>;
}

/// OpenAI-compatible client bound to the AI proxy, with rate limiting
pub struct ProxyClient {
    client: Client<OpenAIConfig>,
    rate_limit_rps: f64,
    /// Last request time, shared by every caller of this client
    last_request: Mutex<Option<Instant>>,
}

impl ProxyClient {
    /// Create a client for the configured proxy
    pub fn new(settings: &Settings) -> Self {
        Self::with_endpoint(&settings.api_key, &settings.proxy_url, settings.rate_limit_rps)
    }

    /// Create a client for an explicit endpoint
    pub fn with_endpoint(api_key: &str, api_base: &str, rate_limit_rps: f64) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base);

        Self {
            client: Client::with_config(openai_config),
            rate_limit_rps,
            last_request: Mutex::new(None),
        }
    }

    /// Enforce rate limiting for API requests
    async fn enforce_rate_limit(last_request: &mut Option<Instant>, rate_limit_rps: f64) {
        if rate_limit_rps <= 0.0 {
            return;
        }

        let min_interval = Duration::from_secs_f64(1.0 / rate_limit_rps);

        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < min_interval {
                let sleep_duration = min_interval - elapsed;
                sleep(sleep_duration).await;
            }
        }

        *last_request = Some(Instant::now());
    }

    async fn throttle(&self) {
        let mut last_request = self.last_request.lock().await;
        Self::enforce_rate_limit(&mut last_request, self.rate_limit_rps).await;
    }

    /// Send a chat request and reduce the response to its choices
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let openai_request = build_chat_request(request)?;
        let response = self.complete(openai_request).await?;
        Ok(to_chat_response(response))
    }
}

#[async_trait]
impl ChatCompleter for ProxyClient {
    async fn complete(
        &self,
        request: CreateChatCompletionRequest,
    ) -> Result<CreateChatCompletionResponse> {
        self.throttle().await;
        tracing::debug!(model = %request.model, messages = request.messages.len(), "sending chat completion");

        self.client
            .chat()
            .create(request)
            .await
            .context("Failed to generate response")
    }
}

#[async_trait]
impl Embedder for ProxyClient {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        self.throttle().await;
        tracing::debug!(model, "requesting embedding");

        let request = CreateEmbeddingRequestArgs::default()
            .model(model)
            .input(text.to_string())
            .build()
            .context("Failed to build embedding request")?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .context("Failed to create embedding")?;

        response
            .data
            .into_iter()
            .next()
            .map(|embedding| embedding.embedding)
            .context("Embedding response contained no vectors")
    }
}

/// Convert one message into the OpenAI request type
pub fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage> {
    let built: ChatCompletionRequestMessage = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(message.content.clone())
            .build()
            .context("Failed to build system message")?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(message.content.clone())
            .build()
            .context("Failed to build user message")?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(message.content.clone())
            .build()
            .context("Failed to build assistant message")?
            .into(),
    };
    Ok(built)
}

/// Build the chat completion request for the proxy
pub fn build_chat_request(request: &ChatRequest) -> Result<CreateChatCompletionRequest> {
    let messages = request
        .messages
        .iter()
        .map(to_request_message)
        .collect::<Result<Vec<_>>>()?;

    let mut args = CreateChatCompletionRequestArgs::default();
    args.model(&request.model).messages(messages);
    if let Some(seed) = request.seed {
        args.seed(seed);
    }
    args.build().context("Failed to build chat completion request")
}

/// Content of the first choice of a raw completion, empty when absent
pub fn first_content(response: &CreateChatCompletionResponse) -> String {
    response
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .unwrap_or_default()
}

/// Reduce a raw completion to the choices and usage
pub fn to_chat_response(response: CreateChatCompletionResponse) -> ChatResponse {
    let choices = response
        .choices
        .iter()
        .map(|choice| ChatChoice {
            role: serde_json::to_value(&choice.message.role)
                .ok()
                .and_then(|role| role.as_str().map(str::to_string))
                .unwrap_or_else(|| "assistant".to_string()),
            content: choice.message.content.clone().unwrap_or_default(),
        })
        .collect();

    let mut usage = HashMap::new();
    if let Some(counts) = response.usage {
        usage.insert("prompt_tokens".to_string(), json!(counts.prompt_tokens));
        usage.insert("completion_tokens".to_string(), json!(counts.completion_tokens));
        usage.insert("total_tokens".to_string(), json!(counts.total_tokens));
    }

    ChatResponse { choices, usage }
}
