use crate::config::Settings;
use crate::models::{CaseResult, DatasetCase};
use crate::prompt::{Prompt, PromptDefinition};
use anyhow::{Context, Result, bail};
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

const FETCH_PAGE_SIZE: usize = 1000;

/// A project registered on the platform
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRef {
    pub id: String,
    pub name: String,
}

/// A dataset registered on the platform
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRef {
    pub id: String,
    pub name: String,
}

/// An experiment registered on the platform
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    objects: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct FetchPage {
    events: Vec<DatasetCase>,
    #[serde(default)]
    cursor: Option<String>,
}

/// REST client for the observability platform
pub struct PlatformClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl PlatformClient {
    /// Create a client for the configured platform
    pub fn new(settings: &Settings) -> Self {
        Self::with_endpoint(&settings.api_url, &settings.api_key)
    }

    /// Create a client for an explicit API root
    pub fn with_endpoint(api_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(&self.api_key)
    }

    /// Send a request and decode a JSON body, failing on non-success status
    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder, what: &str) -> Result<T> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{} request failed with status {}: {}", what, status, body);
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to decode {} response", what))
    }

    /// Register a project, returning the existing one when the name is taken
    pub async fn register_project(&self, name: &str) -> Result<ProjectRef> {
        let builder = self
            .request(Method::POST, "/v1/project")
            .json(&json!({ "name": name }));
        self.send(builder, "project registration").await
    }

    /// Load the latest version of a prompt by project name and slug
    pub async fn load_prompt(&self, project: &str, slug: &str) -> Result<Prompt> {
        let builder = self
            .request(Method::GET, "/v1/prompt")
            .query(&[("project_name", project), ("slug", slug)]);
        let list: ObjectList<Prompt> = self.send(builder, "prompt lookup").await?;

        match list.objects.into_iter().next() {
            Some(prompt) => Ok(prompt),
            None => bail!("Prompt '{}' not found in project '{}'", slug, project),
        }
    }

    /// Create or replace a prompt
    pub async fn upsert_prompt(&self, definition: &PromptDefinition) -> Result<Prompt> {
        let builder = self.request(Method::PUT, "/v1/prompt").json(definition);
        self.send(builder, "prompt upsert").await
    }

    /// Register a dataset, returning the existing one when the name is taken
    pub async fn register_dataset(&self, project_id: &str, name: &str) -> Result<DatasetRef> {
        let builder = self
            .request(Method::POST, "/v1/dataset")
            .json(&json!({ "project_id": project_id, "name": name }));
        self.send(builder, "dataset registration").await
    }

    /// Find a dataset by project and dataset name
    pub async fn find_dataset(&self, project: &str, name: &str) -> Result<DatasetRef> {
        let builder = self
            .request(Method::GET, "/v1/dataset")
            .query(&[("project_name", project), ("dataset_name", name)]);
        let list: ObjectList<DatasetRef> = self.send(builder, "dataset lookup").await?;

        match list.objects.into_iter().next() {
            Some(dataset) => Ok(dataset),
            None => bail!("Dataset '{}' not found in project '{}'", name, project),
        }
    }

    /// Fetch every record of a dataset, following the pagination cursor
    pub async fn fetch_dataset(&self, dataset_id: &str) -> Result<Vec<DatasetCase>> {
        let path = format!("/v1/dataset/{}/fetch", dataset_id);
        let mut cases = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = Map::new();
            body.insert("limit".to_string(), json!(FETCH_PAGE_SIZE));
            if let Some(cursor) = &cursor {
                body.insert("cursor".to_string(), json!(cursor));
            }

            let builder = self.request(Method::POST, &path).json(&body);
            let page: FetchPage = self.send(builder, "dataset fetch").await?;
            let received = page.events.len();
            cases.extend(page.events);
            tracing::debug!(dataset_id, received, total = cases.len(), "fetched dataset page");

            match page.cursor {
                Some(next) if received > 0 => cursor = Some(next),
                _ => break,
            }
        }

        Ok(cases)
    }

    /// Insert records into a dataset
    pub async fn insert_dataset(&self, dataset_id: &str, cases: &[DatasetCase]) -> Result<usize> {
        let path = format!("/v1/dataset/{}/insert", dataset_id);
        let builder = self
            .request(Method::POST, &path)
            .json(&json!({ "events": cases }));
        let _: Value = self.send(builder, "dataset insert").await?;
        Ok(cases.len())
    }

    /// Invoke a stored prompt or function by project name and slug
    pub async fn invoke_function(&self, project: &str, slug: &str, input: &Value) -> Result<Value> {
        let builder = self.request(Method::POST, "/v1/function/invoke").json(&json!({
            "project_name": project,
            "slug": slug,
            "input": input,
        }));
        self.send(builder, "function invoke").await
    }

    /// Register an experiment in a project
    pub async fn register_experiment(&self, project_id: &str, name: Option<&str>) -> Result<ExperimentRef> {
        let mut body = Map::new();
        body.insert("project_id".to_string(), json!(project_id));
        if let Some(name) = name {
            body.insert("name".to_string(), json!(name));
        }

        let builder = self.request(Method::POST, "/v1/experiment").json(&body);
        self.send(builder, "experiment registration").await
    }

    /// Log one event per case result to an experiment
    pub async fn insert_experiment_events(&self, experiment_id: &str, results: &[CaseResult]) -> Result<()> {
        let events: Vec<Value> = results.iter().map(experiment_event).collect();
        let path = format!("/v1/experiment/{}/insert", experiment_id);
        let builder = self
            .request(Method::POST, &path)
            .json(&json!({ "events": events }));
        let _: Value = self.send(builder, "experiment insert").await?;
        Ok(())
    }
}

/// Experiment event for a case; scorers that declined are left out
fn experiment_event(result: &CaseResult) -> Value {
    let scores: Map<String, Value> = result
        .scores
        .iter()
        .filter_map(|s| s.score.map(|score| (s.name.clone(), json!(score))))
        .collect();

    json!({
        "input": result.input,
        "output": result.output,
        "expected": result.expected,
        "metadata": result.metadata,
        "scores": scores,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Score;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_load_prompt() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({
            "objects": [{
                "id": "p-1",
                "name": "Country Structured Prompt",
                "slug": "country-structured-prompt",
                "prompt_data": {
                    "prompt": {"type": "chat", "messages": [{"role": "user", "content": "{{input}}"}]},
                    "options": {"model": "gpt-4o-mini", "params": {"temperature": 0}}
                }
            }]
        });
        let mock = server
            .mock("GET", "/v1/prompt")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("project_name".into(), "My App".into()),
                Matcher::UrlEncoded("slug".into(), "country-structured-prompt".into()),
            ]))
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let client = PlatformClient::with_endpoint(&server.url(), "sk-test");
        let prompt = client
            .load_prompt("My App", "country-structured-prompt")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(prompt.slug, "country-structured-prompt");
    }

    #[tokio::test]
    async fn test_load_prompt_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/prompt")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"objects": []}"#)
            .create_async()
            .await;

        let client = PlatformClient::with_endpoint(&server.url(), "sk-test");
        let err = client.load_prompt("My App", "missing").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_unauthorized_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/project")
            .with_status(401)
            .with_body("invalid api key")
            .create_async()
            .await;

        let client = PlatformClient::with_endpoint(&server.url(), "bad-key");
        let err = client.register_project("My App").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("401"));
        assert!(message.contains("invalid api key"));
    }

    #[tokio::test]
    async fn test_fetch_dataset_follows_cursor() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/v1/dataset/ds-1/fetch")
            .match_body(Matcher::Json(json!({"limit": FETCH_PAGE_SIZE})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "events": [{"id": "r1", "input": "France", "expected": {"capital": "Paris"}, "metadata": {"continent": "Europe"}}],
                    "cursor": "page-2"
                })
                .to_string(),
            )
            .create_async()
            .await;
        let second = server
            .mock("POST", "/v1/dataset/ds-1/fetch")
            .match_body(Matcher::Json(json!({"limit": FETCH_PAGE_SIZE, "cursor": "page-2"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"events": [{"id": "r2", "input": "Japan"}], "cursor": null}).to_string())
            .create_async()
            .await;

        let client = PlatformClient::with_endpoint(&server.url(), "sk-test");
        let cases = client.fetch_dataset("ds-1").await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].expected, Some(json!({"capital": "Paris"})));
        assert_eq!(cases[1].input, json!("Japan"));
        assert!(cases[1].expected.is_none());
        assert!(cases[1].metadata.is_empty());
    }

    #[tokio::test]
    async fn test_invoke_function() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/function/invoke")
            .match_body(Matcher::Json(json!({
                "project_name": "My App",
                "slug": "country-structured-prompt",
                "input": "France"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"capital": "Paris", "population": 68000000}"#)
            .create_async()
            .await;

        let client = PlatformClient::with_endpoint(&server.url(), "sk-test");
        let output = client
            .invoke_function("My App", "country-structured-prompt", &json!("France"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(output["capital"], "Paris");
    }

    #[tokio::test]
    async fn test_insert_experiment_events_skips_declined_scores() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/experiment/exp-1/insert")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#""input":"foo""#.to_string()),
                Matcher::Regex(r#""scores":\{"ExactMatch":1\.0\}"#.to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"row_ids": ["row-1"]}"#)
            .create_async()
            .await;

        let result = CaseResult {
            input: json!("foo"),
            output: json!("foo"),
            expected: Some(json!("foo")),
            metadata: Map::new(),
            scores: vec![Score::new("ExactMatch", 1.0), Score::skipped("NumericDiff")],
        };

        let client = PlatformClient::with_endpoint(&server.url(), "sk-test");
        client.insert_experiment_events("exp-1", &[result]).await.unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn test_experiment_event_shape() {
        let result = CaseResult {
            input: json!("bar"),
            output: json!("bar"),
            expected: Some(json!("baz")),
            metadata: Map::new(),
            scores: vec![Score::new("Custom Exact Match", 0.0), Score::skipped("NumericDiff")],
        };

        let event = experiment_event(&result);
        assert_eq!(event["expected"], "baz");
        assert_eq!(event["scores"], json!({"Custom Exact Match": 0.0}));
    }

    #[tokio::test]
    async fn test_fetch_dataset_accepts_null_metadata() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/dataset/ds-2/fetch")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "events": [{
                        "id": "r1",
                        "input": {"messages": [{"role": "user", "content": "human please"}]},
                        "expected": null,
                        "metadata": null
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = PlatformClient::with_endpoint(&server.url(), "sk-test");
        let cases = client.fetch_dataset("ds-2").await.unwrap();

        assert_eq!(cases.len(), 1);
        assert!(cases[0].metadata.is_empty());
        assert!(cases[0].expected.is_none());
    }
}
