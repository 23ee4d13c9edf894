//! Seeds a project with the prompt and datasets the demo evals use.

use crate::config::Settings;
use crate::models::DatasetCase;
use crate::platform::PlatformClient;
use crate::prompt::PromptDefinition;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

pub const COUNTRY_PROMPT_SLUG: &str = "country-structured-prompt";
pub const COUNTRIES_DATASET: &str = "Countries";
pub const MULTITURN_DATASET: &str = "Multiturn";

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const COUNTRIES_JSON: &str = include_str!("../data/countries.json");

const COUNTRY_SYSTEM_PROMPT: &str = "You are a high school geography teacher and are helping students with their class projects. When a student asks you about a country, you will give facts about that country in a structured format.";

/// What the setup command should create
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    pub skip_countries: bool,
    pub multiturn_file: Option<PathBuf>,
}

/// Messages of the country prompt
fn country_prompt_messages() -> Vec<Value> {
    vec![
        json!({"role": "system", "content": COUNTRY_SYSTEM_PROMPT}),
        json!({"role": "user", "content": "{{input}}"}),
    ]
}

/// Params of the country prompt: cached, deterministic, JSON-schema output
fn country_prompt_params() -> Map<String, Value> {
    let params = json!({
        "use_cache": true,
        "temperature": 0,
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": "CountryStructure",
                "schema": {
                    "type": "object",
                    "required": [
                        "capital", "population", "currency", "language",
                        "government", "area", "short_history"
                    ],
                    "properties": {
                        "area": {"type": "number"},
                        "capital": {"type": "string"},
                        "currency": {"type": "string"},
                        "language": {"type": "string"},
                        "government": {"type": "string"},
                        "population": {"type": "number"},
                        "short_history": {"type": "string"}
                    },
                    "additionalProperties": false
                },
                "strict": true
            }
        }
    });
    match params {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// The bundled country cases
pub fn countries_cases() -> Result<Vec<DatasetCase>> {
    serde_json::from_str(COUNTRIES_JSON).context("Bundled countries data is not valid JSON")
}

#[derive(Debug, Deserialize)]
struct MultiturnEntry {
    input: Value,
}

/// Read conversations from a JSON array of `{ "input": ... }` objects
pub fn multiturn_cases(path: &Path) -> Result<Vec<DatasetCase>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read multiturn file: {}", path.display()))?;
    let entries: Vec<MultiturnEntry> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse multiturn file: {}", path.display()))?;

    Ok(entries
        .into_iter()
        .map(|entry| DatasetCase {
            id: None,
            input: entry.input,
            expected: None,
            metadata: Map::new(),
        })
        .collect())
}

/// Create the project, the country prompt and the demo datasets
pub async fn run_setup(settings: &Settings, platform: &PlatformClient, options: &SetupOptions) -> Result<()> {
    let project = platform
        .register_project(&settings.project)
        .await
        .context("Failed to register project")?;
    tracing::info!("Using project '{}' ({})", project.name, project.id);

    let model = settings.preferred_model.as_deref().unwrap_or(DEFAULT_MODEL);
    let definition = PromptDefinition::chat(
        &project.id,
        "Country Structured Prompt",
        COUNTRY_PROMPT_SLUG,
        country_prompt_messages(),
        model,
        country_prompt_params(),
    );
    platform
        .upsert_prompt(&definition)
        .await
        .context("Failed to create country prompt")?;
    println!("Prompt '{}' saved with model {}", COUNTRY_PROMPT_SLUG, model);

    if !options.skip_countries {
        let inserted = seed_dataset(platform, &project.id, COUNTRIES_DATASET, &countries_cases()?).await?;
        println!("{} dataset created successfully! ({} records)", COUNTRIES_DATASET, inserted);
    }

    if let Some(path) = &options.multiturn_file {
        let cases = multiturn_cases(path)?;
        let inserted = seed_dataset(platform, &project.id, MULTITURN_DATASET, &cases).await?;
        println!("{} dataset created successfully! ({} records)", MULTITURN_DATASET, inserted);
    }

    Ok(())
}

async fn seed_dataset(platform: &PlatformClient, project_id: &str, name: &str, cases: &[DatasetCase]) -> Result<usize> {
    let dataset = platform
        .register_dataset(project_id, name)
        .await
        .with_context(|| format!("Failed to register dataset '{}'", name))?;
    platform
        .insert_dataset(&dataset.id, cases)
        .await
        .with_context(|| format!("Failed to insert into dataset '{}'", name))
}
