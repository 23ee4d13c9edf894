use crate::proxy::{ChatCompleter, first_content};
use crate::template;
use anyhow::{Context, Result, bail};
use async_openai::types::CreateChatCompletionRequest;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Params the platform stores alongside a prompt that providers reject
const PLATFORM_ONLY_PARAMS: &[&str] = &["use_cache"];

/// Body of a stored prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptBlock {
    Chat { messages: Vec<Value> },
    Completion { content: String },
}

/// Model and provider parameters of a stored prompt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptBlock>,
    #[serde(default)]
    pub options: PromptOptions,
}

/// A prompt as stored on the platform
#[derive(Debug, Clone, Deserialize)]
pub struct Prompt {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub prompt_data: PromptData,
}

impl Prompt {
    /// Render the prompt into an OpenAI-compatible request body
    pub fn build(&self, vars: &Value) -> Result<Value> {
        let messages = match &self.prompt_data.prompt {
            Some(PromptBlock::Chat { messages }) => messages
                .iter()
                .map(|message| render_message(message, vars))
                .collect::<Vec<_>>(),
            Some(PromptBlock::Completion { .. }) => {
                bail!("Prompt '{}' is a completion prompt; only chat prompts can be built", self.slug)
            }
            None => bail!("Prompt '{}' has no prompt body", self.slug),
        };

        let options = &self.prompt_data.options;
        let Some(model) = &options.model else {
            bail!("Prompt '{}' does not specify a model", self.slug);
        };

        let mut body = Map::new();
        for (key, value) in &options.params {
            if !PLATFORM_ONLY_PARAMS.contains(&key.as_str()) {
                body.insert(key.clone(), value.clone());
            }
        }
        body.insert("model".to_string(), json!(model));
        body.insert("messages".to_string(), Value::Array(messages));

        Ok(Value::Object(body))
    }

    /// Render the prompt into a typed chat completion request
    pub fn build_request(&self, vars: &Value) -> Result<CreateChatCompletionRequest> {
        let body = self.build(vars)?;
        serde_json::from_value(body)
            .with_context(|| format!("Prompt '{}' does not build into a chat completion request", self.slug))
    }
}

/// Render the text of a message, whether plain or split into parts
fn render_message(message: &Value, vars: &Value) -> Value {
    let mut message = message.clone();
    match message.get_mut("content") {
        Some(Value::String(text)) => *text = template::render(text, vars),
        Some(Value::Array(parts)) => {
            for part in parts.iter_mut() {
                if let Some(Value::String(text)) = part.get_mut("text") {
                    *text = template::render(text, vars);
                }
            }
        }
        _ => {}
    }
    message
}

/// Request body for creating or replacing a prompt
#[derive(Debug, Clone, Serialize)]
pub struct PromptDefinition {
    pub project_id: String,
    pub name: String,
    pub slug: String,
    pub prompt_data: PromptData,
}

impl PromptDefinition {
    /// Chat prompt with the given messages, model and params
    pub fn chat(
        project_id: &str,
        name: &str,
        slug: &str,
        messages: Vec<Value>,
        model: &str,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            name: name.to_string(),
            slug: slug.to_string(),
            prompt_data: PromptData {
                prompt: Some(PromptBlock::Chat { messages }),
                options: PromptOptions {
                    model: Some(model.to_string()),
                    params,
                },
            },
        }
    }
}

/// Build a prompt against `vars`, send it, and return the first reply
pub async fn complete_prompt(prompt: &Prompt, vars: &Value, completer: &dyn ChatCompleter) -> Result<String> {
    let request = prompt.build_request(vars)?;
    tracing::info!("Invoking prompt '{}' ({}) with model {}", prompt.name, prompt.slug, request.model);
    let response = completer
        .complete(request)
        .await
        .with_context(|| format!("Prompt '{}' completion failed", prompt.slug))?;
    Ok(first_content(&response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing::ScriptedCompleter;

    fn country_prompt() -> Prompt {
        serde_json::from_value(json!({
            "id": "p-1",
            "name": "Country Structured Prompt",
            "slug": "country-structured-prompt",
            "prompt_data": {
                "prompt": {
                    "type": "chat",
                    "messages": [
                        {"role": "system", "content": "You are a high school geography teacher."},
                        {"role": "user", "content": "{{input}}"}
                    ]
                },
                "options": {
                    "model": "gpt-4o-mini",
                    "params": {
                        "use_cache": true,
                        "temperature": 0,
                        "response_format": {
                            "type": "json_schema",
                            "json_schema": {
                                "name": "CountryStructure",
                                "schema": {"type": "object", "properties": {"capital": {"type": "string"}}},
                                "strict": true
                            }
                        }
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_build_renders_input() {
        let body = country_prompt().build(&json!({"input": "France"})).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][1]["content"], "France");
        assert_eq!(body["messages"][0]["content"], "You are a high school geography teacher.");
    }

    #[test]
    fn test_build_drops_platform_params() {
        let body = country_prompt().build(&json!({"input": "France"})).unwrap();
        assert!(body.get("use_cache").is_none());
        assert_eq!(body["temperature"], 0);
        assert_eq!(body["response_format"]["type"], "json_schema");
    }

    #[test]
    fn test_build_request_is_typed() {
        let request = country_prompt().build_request(&json!({"input": "Japan"})).unwrap();
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.temperature, Some(0.0));
    }

    #[test]
    fn test_build_renders_content_parts() {
        let prompt: Prompt = serde_json::from_value(json!({
            "name": "Parts",
            "slug": "parts",
            "prompt_data": {
                "prompt": {"type": "chat", "messages": [
                    {"role": "user", "content": [{"type": "text", "text": "Describe {{input}}"}]}
                ]},
                "options": {"model": "gpt-4o-mini"}
            }
        }))
        .unwrap();

        let body = prompt.build(&json!({"input": "Egypt"})).unwrap();
        assert_eq!(body["messages"][0]["content"][0]["text"], "Describe Egypt");
    }

    #[test]
    fn test_build_rejects_completion_prompt() {
        let prompt: Prompt = serde_json::from_value(json!({
            "name": "Legacy",
            "slug": "legacy",
            "prompt_data": {
                "prompt": {"type": "completion", "content": "{{input}}"},
                "options": {"model": "gpt-3.5-turbo-instruct"}
            }
        }))
        .unwrap();

        let err = prompt.build(&json!({"input": "x"})).unwrap_err();
        assert!(err.to_string().contains("completion prompt"));
    }

    #[test]
    fn test_build_requires_model() {
        let prompt: Prompt = serde_json::from_value(json!({
            "name": "No model",
            "slug": "no-model",
            "prompt_data": {"prompt": {"type": "chat", "messages": []}}
        }))
        .unwrap();

        assert!(prompt.build(&json!({})).is_err());
    }

    #[test]
    fn test_definition_serializes_chat_block() {
        let definition = PromptDefinition::chat(
            "proj-1",
            "Country Structured Prompt",
            "country-structured-prompt",
            vec![json!({"role": "user", "content": "{{input}}"})],
            "gpt-4o-mini",
            Map::new(),
        );

        let body = serde_json::to_value(&definition).unwrap();
        assert_eq!(body["prompt_data"]["prompt"]["type"], "chat");
        assert_eq!(body["prompt_data"]["options"]["model"], "gpt-4o-mini");
        assert_eq!(body["project_id"], "proj-1");
    }

    #[tokio::test]
    async fn test_complete_prompt_returns_first_reply() {
        let completer = ScriptedCompleter::new(vec![ScriptedCompleter::text(r#"{"capital": "Paris"}"#)]);

        let reply = complete_prompt(&country_prompt(), &json!({"input": "France"}), &completer)
            .await
            .unwrap();

        assert_eq!(reply, r#"{"capital": "Paris"}"#);
        let requests = completer.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "gpt-4o-mini");
    }
}
