use crate::models::ChatMessage;
use crate::platform::PlatformClient;
use crate::proxy::{ChatCompleter, to_request_message};
use anyhow::{Context, Result, bail};
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestToolMessageArgs, ChatCompletionTool, ChatCompletionToolArgs,
    ChatCompletionToolType, CreateChatCompletionRequestArgs, FunctionObjectArgs,
};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;

pub const TOOLS_CALLED_KEY: &str = "tools_called";
pub const ESCALATE_TOOL: &str = "escalate";

const ESCALATION_REPLY: &str =
    "I've escalated this conversation to a human agent who will assist you shortly.";

pub const SUPPORT_AGENT_INSTRUCTIONS: &str = "You are a customer support agent. You are an AI assistant, not a human. Never pretend to be human. If a customer asks to speak with a human or expresses frustration that requires human intervention, use the escalate tool.";

/// Lets a task annotate the case it is running on
#[derive(Debug, Default)]
pub struct Hooks {
    /// Case metadata; scorers see whatever the task leaves here
    pub metadata: Map<String, Value>,
}

impl Hooks {
    pub fn new(metadata: Map<String, Value>) -> Self {
        Self { metadata }
    }
}

/// The function under evaluation
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, input: &Value, hooks: &mut Hooks) -> Result<Value>;
}

/// Returns its input, optionally annotating the case metadata
#[derive(Debug, Default)]
pub struct IdentityTask {
    annotations: HashMap<String, String>,
    record_input_as: Option<String>,
}

impl IdentityTask {
    pub fn new(annotations: HashMap<String, String>, record_input_as: Option<String>) -> Self {
        Self {
            annotations,
            record_input_as,
        }
    }
}

#[async_trait]
impl Task for IdentityTask {
    async fn run(&self, input: &Value, hooks: &mut Hooks) -> Result<Value> {
        for (key, value) in &self.annotations {
            hooks.metadata.insert(key.clone(), json!(value));
        }
        if let Some(key) = &self.record_input_as {
            hooks.metadata.insert(key.clone(), input.clone());
        }
        Ok(input.clone())
    }
}

/// Invokes a prompt or function stored on the platform
pub struct FunctionTask {
    platform: Arc<PlatformClient>,
    project: String,
    slug: String,
}

impl FunctionTask {
    pub fn new(platform: Arc<PlatformClient>, project: &str, slug: &str) -> Self {
        Self {
            platform,
            project: project.to_string(),
            slug: slug.to_string(),
        }
    }
}

#[async_trait]
impl Task for FunctionTask {
    async fn run(&self, input: &Value, _hooks: &mut Hooks) -> Result<Value> {
        self.platform
            .invoke_function(&self.project, &self.slug, input)
            .await
            .with_context(|| format!("Failed to invoke function '{}'", self.slug))
    }
}

/// Customer support agent answering a multiturn conversation.
///
/// The input must carry a `messages` array of role/content pairs. Calls to
/// the escalation tool are answered locally and the conversation continues
/// until the model produces a plain reply.
pub struct SupportAgentTask {
    completer: Arc<dyn ChatCompleter>,
    model: String,
    instructions: String,
    max_turns: usize,
}

impl SupportAgentTask {
    pub fn new(
        completer: Arc<dyn ChatCompleter>,
        model: &str,
        instructions: Option<&str>,
        max_turns: usize,
    ) -> Self {
        Self {
            completer,
            model: model.to_string(),
            instructions: instructions.unwrap_or(SUPPORT_AGENT_INSTRUCTIONS).to_string(),
            max_turns: max_turns.max(1),
        }
    }

    fn escalate_tool() -> Result<ChatCompletionTool> {
        let function = FunctionObjectArgs::default()
            .name(ESCALATE_TOOL)
            .description("Escalate the conversation to a human agent")
            .parameters(json!({"type": "object", "properties": {}}))
            .build()
            .context("Failed to build escalate function")?;

        ChatCompletionToolArgs::default()
            .r#type(ChatCompletionToolType::Function)
            .function(function)
            .build()
            .context("Failed to build escalate tool")
    }

    fn conversation(&self, input: &Value) -> Result<Vec<ChatCompletionRequestMessage>> {
        let history = input
            .get("messages")
            .and_then(Value::as_array)
            .context("Support agent input has no 'messages' array")?;

        let mut messages = vec![to_request_message(&ChatMessage::system(self.instructions.clone()))?];
        for entry in history {
            let message: ChatMessage = serde_json::from_value(entry.clone())
                .with_context(|| format!("Invalid conversation message: {}", entry))?;
            messages.push(to_request_message(&message)?);
        }
        Ok(messages)
    }
}

#[async_trait]
impl Task for SupportAgentTask {
    async fn run(&self, input: &Value, hooks: &mut Hooks) -> Result<Value> {
        let mut messages = self.conversation(input)?;
        let tool = Self::escalate_tool()?;
        let mut tools_called: Vec<String> = Vec::new();

        for turn in 1..=self.max_turns {
            let request = CreateChatCompletionRequestArgs::default()
                .model(&self.model)
                .messages(messages.clone())
                .tools(vec![tool.clone()])
                .build()
                .context("Failed to build agent request")?;

            let response = self.completer.complete(request).await?;
            let Some(choice) = response.choices.into_iter().next() else {
                bail!("Agent response on turn {} contained no choices", turn);
            };

            let calls = choice.message.tool_calls.unwrap_or_default();
            if calls.is_empty() {
                hooks.metadata.insert(TOOLS_CALLED_KEY.to_string(), json!(tools_called));
                return Ok(Value::String(choice.message.content.unwrap_or_default()));
            }

            messages.push(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .tool_calls(calls.clone())
                    .build()
                    .context("Failed to build assistant tool call message")?
                    .into(),
            );

            for call in &calls {
                tracing::info!(turn, tool = %call.function.name, "agent called tool");
                tools_called.push(call.function.name.clone());
                let reply = if call.function.name == ESCALATE_TOOL {
                    ESCALATION_REPLY.to_string()
                } else {
                    format!("Unknown tool: {}", call.function.name)
                };
                messages.push(
                    ChatCompletionRequestToolMessageArgs::default()
                        .content(reply)
                        .tool_call_id(call.id.clone())
                        .build()
                        .context("Failed to build tool reply message")?
                        .into(),
                );
            }
        }

        hooks.metadata.insert(TOOLS_CALLED_KEY.to_string(), json!(tools_called));
        bail!("Agent gave no final answer within {} turns", self.max_turns)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::proxy::ChatCompleter;
    use anyhow::{Result, bail};
    use async_openai::types::{CreateChatCompletionRequest, CreateChatCompletionResponse};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    /// Replays canned completion messages and records the requests
    pub struct ScriptedCompleter {
        replies: Mutex<Vec<Value>>,
        pub requests: Mutex<Vec<CreateChatCompletionRequest>>,
    }

    impl ScriptedCompleter {
        /// Each reply is the `message` object of one response
        pub fn new(replies: Vec<Value>) -> Self {
            let mut replies = replies;
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn text(content: &str) -> Value {
            json!({"role": "assistant", "content": content})
        }

        pub fn tool_call(name: &str, arguments: &str) -> Value {
            json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": format!("call_{}", name),
                    "type": "function",
                    "function": {"name": name, "arguments": arguments}
                }]
            })
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatCompleter for ScriptedCompleter {
        async fn complete(
            &self,
            request: CreateChatCompletionRequest,
        ) -> Result<CreateChatCompletionResponse> {
            self.requests.lock().unwrap().push(request);
            let Some(message) = self.replies.lock().unwrap().pop() else {
                bail!("no scripted reply left");
            };
            let response = json!({
                "id": "chatcmpl-test",
                "object": "chat.completion",
                "created": 1_700_000_000u32,
                "model": "gpt-4o-mini",
                "choices": [{"index": 0, "message": message, "finish_reason": "stop"}]
            });
            Ok(serde_json::from_value(response)?)
        }
    }
}
