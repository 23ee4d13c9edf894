use crate::models::DatasetCase;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const API_KEY_VAR: &str = "BRAINTRUST_API_KEY";
pub const PROJECT_VAR: &str = "BRAINTRUST_PROJECT";
pub const API_URL_VAR: &str = "BRAINTRUST_API_URL";
pub const PROXY_URL_VAR: &str = "BRAINTRUST_PROXY_URL";
pub const PREFERRED_MODEL_VAR: &str = "PREFERRED_MODEL";
pub const RATE_LIMIT_VAR: &str = "PROXY_RATE_LIMIT_RPS";

const DEFAULT_PROJECT: &str = "My App";
const DEFAULT_API_URL: &str = "https://api.braintrust.dev";

/// Connection settings read from the process environment
#[derive(Debug, Clone)]
pub struct Settings {
    /// Key used both for the platform API and the AI proxy
    pub api_key: String,
    /// Default project for prompts, datasets and experiments
    pub project: String,
    /// Platform REST API root
    pub api_url: String,
    /// OpenAI-compatible proxy base URL
    pub proxy_url: String,
    /// Model used when creating prompts during setup
    pub preferred_model: Option<String>,
    /// Rate limit for proxy requests per second
    pub rate_limit_rps: f64,
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let Some(api_key) = get(API_KEY_VAR) else {
            bail!("Environment variable {} not found", API_KEY_VAR);
        };

        let api_url = get(API_URL_VAR)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let proxy_url = get(PROXY_URL_VAR)
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("{}/v1/proxy", api_url));

        let rate_limit_rps = match get(RATE_LIMIT_VAR) {
            Some(raw) => raw
                .parse::<f64>()
                .with_context(|| format!("Invalid {} value: {}", RATE_LIMIT_VAR, raw))?,
            None => default_rate_limit(),
        };

        Ok(Self {
            api_key,
            project: get(PROJECT_VAR).unwrap_or_else(|| DEFAULT_PROJECT.to_string()),
            api_url,
            proxy_url,
            preferred_model: get(PREFERRED_MODEL_VAR),
            rate_limit_rps,
        })
    }

    /// Load a `.env` file into the process environment.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load_dotenv(path: &Path) -> Result<bool> {
        match dotenvy::from_path(path) {
            Ok(()) => {
                tracing::info!("loaded environment from {}", path.display());
                Ok(true)
            }
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!("no env file at {}", path.display());
                Ok(false)
            }
            Err(e) => Err(e).with_context(|| format!("Malformed env file: {}", path.display())),
        }
    }
}

fn default_rate_limit() -> f64 {
    10.0
}

fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}

fn default_classifier_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_turns() -> usize {
    4
}

/// Where the cases of an eval come from
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSpec {
    /// Cases written directly in the run file
    Inline { cases: Vec<DatasetCase> },
    /// A dataset stored on the platform
    Dataset {
        name: String,
        /// Project owning the dataset, defaults to the eval's project
        #[serde(default)]
        project: Option<String>,
    },
}

/// The function under evaluation
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    /// Return the input unchanged
    Identity {
        /// Fixed values written to the case metadata
        #[serde(default)]
        metadata: HashMap<String, String>,
        /// Metadata key that receives a copy of the input
        #[serde(default)]
        record_input_as: Option<String>,
    },
    /// A prompt or function stored on the platform
    Function {
        slug: String,
        #[serde(default)]
        project: Option<String>,
    },
    /// Customer support agent with an escalation tool
    SupportAgent {
        #[serde(default = "default_classifier_model")]
        model: String,
        #[serde(default)]
        instructions: Option<String>,
        #[serde(default = "default_max_turns")]
        max_turns: usize,
    },
}

/// A scorer applied to every case
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScorerSpec {
    ExactMatch,
    CustomExactMatch,
    EmbeddingSimilarity {
        #[serde(default = "default_embedding_model")]
        model: String,
        /// Path such as `metadata.next` used instead of the case's expected value
        #[serde(default)]
        expected_from: Option<String>,
    },
    NumericDiff,
    LlmClassifier {
        name: String,
        prompt_template: String,
        choice_scores: HashMap<String, f64>,
        #[serde(default = "default_classifier_model")]
        model: String,
    },
    BrevityCheck {
        #[serde(default = "default_classifier_model")]
        model: String,
    },
    NotImpersonating {
        #[serde(default = "default_classifier_model")]
        model: String,
    },
    ProperEscalation {
        #[serde(default = "default_classifier_model")]
        model: String,
    },
}

/// Configuration for a single eval
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvalDefinition {
    /// Project name, defaults to the configured project
    #[serde(default)]
    pub project: Option<String>,
    /// Name of the experiment created for this run
    #[serde(default)]
    pub experiment_name: Option<String>,
    pub data: DataSpec,
    pub task: TaskSpec,
    pub scorers: Vec<ScorerSpec>,
    /// Optional local path to store results as JSON
    #[serde(default)]
    pub storage_path: Option<String>,
}

/// Root of an eval run file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunFile {
    pub evals: Vec<EvalDefinition>,
}

impl RunFile {
    /// Load a run file from TOML
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run file: {}", path.display()))?;

        let run: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML run file: {}", path.display()))?;

        if run.evals.is_empty() {
            bail!("Run file {} defines no evals", path.display());
        }
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_settings_missing_api_key() {
        let result = Settings::from_lookup(lookup_from(&[(PROJECT_VAR, "Demo")]));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(err.to_string().contains(API_KEY_VAR));
    }

    #[test]
    fn test_settings_blank_api_key_is_missing() {
        let result = Settings::from_lookup(lookup_from(&[(API_KEY_VAR, "   ")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_lookup(lookup_from(&[(API_KEY_VAR, "sk-test")])).unwrap();
        assert_eq!(settings.api_key, "sk-test");
        assert_eq!(settings.project, "My App");
        assert_eq!(settings.api_url, "https://api.braintrust.dev");
        assert_eq!(settings.proxy_url, "https://api.braintrust.dev/v1/proxy");
        assert_eq!(settings.preferred_model, None);
        assert_eq!(settings.rate_limit_rps, 10.0);
    }

    #[test]
    fn test_settings_proxy_follows_api_url() {
        let settings = Settings::from_lookup(lookup_from(&[
            (API_KEY_VAR, "sk-test"),
            (API_URL_VAR, "http://localhost:8000/"),
        ]))
        .unwrap();
        assert_eq!(settings.api_url, "http://localhost:8000");
        assert_eq!(settings.proxy_url, "http://localhost:8000/v1/proxy");
    }

    #[test]
    fn test_settings_overrides() {
        let settings = Settings::from_lookup(lookup_from(&[
            (API_KEY_VAR, "sk-test"),
            (PROJECT_VAR, "Countries"),
            (PROXY_URL_VAR, "http://proxy.local/v1/"),
            (PREFERRED_MODEL_VAR, "gpt-4o"),
            (RATE_LIMIT_VAR, "2.5"),
        ]))
        .unwrap();
        assert_eq!(settings.project, "Countries");
        assert_eq!(settings.proxy_url, "http://proxy.local/v1");
        assert_eq!(settings.preferred_model.as_deref(), Some("gpt-4o"));
        assert_eq!(settings.rate_limit_rps, 2.5);
    }

    #[test]
    fn test_settings_invalid_rate_limit() {
        let result = Settings::from_lookup(lookup_from(&[
            (API_KEY_VAR, "sk-test"),
            (RATE_LIMIT_VAR, "fast"),
        ]));
        assert!(result.unwrap_err().to_string().contains(RATE_LIMIT_VAR));
    }

    #[test]
    fn test_load_dotenv_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Settings::load_dotenv(&dir.path().join(".env")).unwrap();
        assert!(!loaded);
    }

    #[test]
    fn test_run_file_parsing() {
        let toml_content = r#"
[[evals]]
project = "Demo"
experiment_name = "Customizing AutoEvals"
storage_path = "/tmp/results.json"

[evals.data]
kind = "inline"
cases = [
    { input = "foo", expected = "foo", metadata = { next = "bar" } },
    { input = "bar", expected = "bar", metadata = { next = "baz" } },
]

[evals.task]
kind = "identity"
record_input_as = "result"

[[evals.scorers]]
kind = "custom_exact_match"

[[evals.scorers]]
kind = "exact_match"

[[evals.scorers]]
kind = "embedding_similarity"
expected_from = "metadata.next"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let run = RunFile::from_file(temp_file.path()).unwrap();
        assert_eq!(run.evals.len(), 1);
        let eval = &run.evals[0];
        assert_eq!(eval.project.as_deref(), Some("Demo"));
        assert_eq!(eval.scorers.len(), 3);

        match &eval.data {
            DataSpec::Inline { cases } => {
                assert_eq!(cases.len(), 2);
                assert_eq!(cases[0].input, "foo");
                assert_eq!(cases[1].metadata.get("next").unwrap(), "baz");
            }
            other => panic!("unexpected data spec: {:?}", other),
        }

        match &eval.task {
            TaskSpec::Identity {
                metadata,
                record_input_as,
            } => {
                assert!(metadata.is_empty());
                assert_eq!(record_input_as.as_deref(), Some("result"));
            }
            other => panic!("unexpected task spec: {:?}", other),
        }

        match &eval.scorers[2] {
            ScorerSpec::EmbeddingSimilarity {
                model,
                expected_from,
            } => {
                assert_eq!(model, "text-embedding-ada-002");
                assert_eq!(expected_from.as_deref(), Some("metadata.next"));
            }
            other => panic!("unexpected scorer spec: {:?}", other),
        }
    }

    #[test]
    fn test_run_file_defaults() {
        let toml_content = r#"
[[evals]]
data = { kind = "dataset", name = "Countries" }
task = { kind = "function", slug = "country-structured-prompt" }
scorers = [{ kind = "exact_match" }, { kind = "brevity_check" }]
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let run = RunFile::from_file(temp_file.path()).unwrap();
        let eval = &run.evals[0];
        assert!(eval.project.is_none());
        assert!(eval.experiment_name.is_none());
        assert!(eval.storage_path.is_none());
        match &eval.scorers[1] {
            ScorerSpec::BrevityCheck { model } => assert_eq!(model, "gpt-4o-mini"),
            other => panic!("unexpected scorer spec: {:?}", other),
        }
    }

    #[test]
    fn test_run_file_without_evals() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "evals = []").unwrap();

        assert!(RunFile::from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_demo_run_files_parse() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");
        let mut count = 0;
        for entry in std::fs::read_dir(&demos).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                let run = RunFile::from_file(&path).unwrap();
                assert!(!run.evals[0].scorers.is_empty(), "{}", path.display());
                count += 1;
            }
        }
        assert_eq!(count, 5);
    }
}
