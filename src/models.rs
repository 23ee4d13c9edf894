use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single role/content pair sent to a chat model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Chat completion request routed through the AI proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier understood by the proxy
    pub model: String,
    /// Ordered conversation
    pub messages: Vec<ChatMessage>,
    /// Deterministic seed; the proxy caches responses keyed on it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

/// One candidate completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub role: String,
    pub content: String,
}

/// Chat completion response, reduced to what the walkthroughs print
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
    /// Token usage reported by the provider
    #[serde(default)]
    pub usage: HashMap<String, Value>,
}

impl ChatResponse {
    /// Content of the first choice, empty when the model returned none
    pub fn first_content(&self) -> &str {
        self.choices
            .first()
            .map(|choice| choice.content.as_str())
            .unwrap_or_default()
    }
}

/// A record of an evaluation dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetCase {
    /// Remote record id, present for cases fetched from the platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    /// Rows inserted without metadata come back with `null` here
    #[serde(default, deserialize_with = "null_as_empty_map")]
    pub metadata: Map<String, Value>,
}

fn null_as_empty_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
impl DatasetCase {
    pub fn new(input: impl Into<Value>, expected: impl Into<Value>) -> Self {
        Self {
            id: None,
            input: input.into(),
            expected: Some(expected.into()),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Result of a single scorer on a single case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub name: String,
    /// `None` when the scorer declined to score the case
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Score {
    pub fn new(name: impl Into<String>, score: f64) -> Self {
        Self {
            name: name.into(),
            score: Some(score),
            metadata: Map::new(),
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            score: None,
            metadata: Map::new(),
        }
    }
}

/// Complete result for a single task-and-score cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub input: Value,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    /// Case metadata after the task's hook writes
    pub metadata: Map<String, Value>,
    pub scores: Vec<Score>,
}

impl CaseResult {
    pub fn score(&self, name: &str) -> Option<f64> {
        self.scores
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.score)
    }
}

/// Statistics calculated across the cases of an experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    /// Mean score for each scorer
    pub mean: HashMap<String, f64>,
    /// Median score for each scorer
    pub median: HashMap<String, f64>,
    /// Mode for each scorer (most frequent score)
    pub mode: HashMap<String, f64>,
}

/// Final results of one eval run
#[derive(Debug, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,
    /// Id assigned by the platform when results were submitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    pub statistics: Statistics,
    pub results: Vec<CaseResult>,
}
