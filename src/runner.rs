use crate::config::{DataSpec, EvalDefinition, RunFile, ScorerSpec, Settings, TaskSpec};
use crate::evaluation::Eval;
use crate::models::{DatasetCase, ExperimentSummary};
use crate::platform::PlatformClient;
use crate::proxy::ProxyClient;
use crate::scorers::{
    CustomExactMatch, EmbeddingSimilarity, ExactMatch, LlmClassifier, NumericDiff,
    ProperEscalation, Scorer,
};
use crate::task::{FunctionTask, IdentityTask, SupportAgentTask, Task};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Main runner that orchestrates the evals of a run file
pub struct Runner {
    settings: Settings,
    platform: Arc<PlatformClient>,
    proxy: Arc<ProxyClient>,
    send_logs: bool,
}

impl Runner {
    /// Create a new runner bound to the configured platform and proxy
    pub fn new(settings: Settings, send_logs: bool) -> Self {
        let platform = Arc::new(PlatformClient::new(&settings));
        let proxy = Arc::new(ProxyClient::new(&settings));
        Self::with_clients(settings, platform, proxy, send_logs)
    }

    pub fn with_clients(
        settings: Settings,
        platform: Arc<PlatformClient>,
        proxy: Arc<ProxyClient>,
        send_logs: bool,
    ) -> Self {
        Self {
            settings,
            platform,
            proxy,
            send_logs,
        }
    }

    /// Run all evals defined in the run file
    pub async fn run_evaluations(&self, run: &RunFile) -> Result<Vec<ExperimentSummary>> {
        let mut all_results = Vec::new();
        let total_evals = run.evals.len();

        for (eval_index, definition) in run.evals.iter().enumerate() {
            let eval_num = eval_index + 1;
            tracing::info!(
                "Running eval {}/{} {:?}",
                eval_num,
                total_evals,
                definition.experiment_name
            );
            let summary = self
                .run_single_eval(definition)
                .await
                .with_context(|| format!("Eval {}/{} failed", eval_num, total_evals))?;
            all_results.push(summary);
        }

        Ok(all_results)
    }

    /// Run one eval: load cases, run, submit, store
    async fn run_single_eval(&self, definition: &EvalDefinition) -> Result<ExperimentSummary> {
        let project = definition
            .project
            .clone()
            .unwrap_or_else(|| self.settings.project.clone());

        let cases = self.load_cases(&definition.data, &project).await?;
        let eval = self.build_eval(definition, &project);
        tracing::info!(
            "Scoring {} cases in project '{}' with {:?}",
            cases.len(),
            eval.project(),
            eval.scorer_names()
        );
        let mut summary = eval.run(cases).await?;

        if self.send_logs {
            self.submit_experiment(&mut summary).await?;
        }
        self.store_results_if_configured(&summary, definition)?;

        Ok(summary)
    }

    /// Assemble the eval described by a definition
    pub fn build_eval(&self, definition: &EvalDefinition, project: &str) -> Eval {
        let task = self.build_task(&definition.task, project);
        definition
            .scorers
            .iter()
            .fold(Eval::new(project, task), |eval, spec| {
                eval.scorer(self.build_scorer(spec))
            })
            .experiment_name(definition.experiment_name.clone())
    }

    /// Resolve the cases of an eval
    async fn load_cases(&self, data: &DataSpec, project: &str) -> Result<Vec<DatasetCase>> {
        match data {
            DataSpec::Inline { cases } => Ok(cases.clone()),
            DataSpec::Dataset {
                name,
                project: dataset_project,
            } => {
                let owner = dataset_project.as_deref().unwrap_or(project);
                let dataset = self.platform.find_dataset(owner, name).await?;
                let cases = self
                    .platform
                    .fetch_dataset(&dataset.id)
                    .await
                    .with_context(|| format!("Failed to load dataset '{}'", name))?;
                tracing::info!("Loaded {} cases from dataset '{}' ({})", cases.len(), dataset.name, dataset.id);
                Ok(cases)
            }
        }
    }

    fn build_task(&self, spec: &TaskSpec, project: &str) -> Box<dyn Task> {
        match spec {
            TaskSpec::Identity {
                metadata,
                record_input_as,
            } => Box::new(IdentityTask::new(metadata.clone(), record_input_as.clone())),
            TaskSpec::Function {
                slug,
                project: function_project,
            } => Box::new(FunctionTask::new(
                self.platform.clone(),
                function_project.as_deref().unwrap_or(project),
                slug,
            )),
            TaskSpec::SupportAgent {
                model,
                instructions,
                max_turns,
            } => Box::new(SupportAgentTask::new(
                self.proxy.clone(),
                model,
                instructions.as_deref(),
                *max_turns,
            )),
        }
    }

    fn build_scorer(&self, spec: &ScorerSpec) -> Box<dyn Scorer> {
        match spec {
            ScorerSpec::ExactMatch => Box::new(ExactMatch),
            ScorerSpec::CustomExactMatch => Box::new(CustomExactMatch),
            ScorerSpec::NumericDiff => Box::new(NumericDiff),
            ScorerSpec::EmbeddingSimilarity {
                model,
                expected_from,
            } => Box::new(EmbeddingSimilarity::new(
                self.proxy.clone(),
                model,
                expected_from.clone(),
            )),
            ScorerSpec::LlmClassifier {
                name,
                prompt_template,
                choice_scores,
                model,
            } => Box::new(LlmClassifier::new(
                self.proxy.clone(),
                name,
                prompt_template,
                choice_scores.clone(),
                model,
            )),
            ScorerSpec::BrevityCheck { model } => {
                Box::new(LlmClassifier::brevity_check(self.proxy.clone(), model))
            }
            ScorerSpec::NotImpersonating { model } => {
                Box::new(LlmClassifier::not_impersonating(self.proxy.clone(), model))
            }
            ScorerSpec::ProperEscalation { model } => {
                Box::new(ProperEscalation::new(self.proxy.clone(), model))
            }
        }
    }

    /// Record the run as an experiment on the platform
    async fn submit_experiment(&self, summary: &mut ExperimentSummary) -> Result<()> {
        let project = self
            .platform
            .register_project(&summary.project)
            .await
            .context("Failed to register project")?;
        let experiment = self
            .platform
            .register_experiment(&project.id, summary.experiment_name.as_deref())
            .await
            .context("Failed to register experiment")?;

        self.platform
            .insert_experiment_events(&experiment.id, &summary.results)
            .await
            .context("Failed to log experiment results")?;

        tracing::info!(
            "Logged {} results to experiment '{}' in project '{}'",
            summary.results.len(),
            experiment.name,
            project.name
        );
        summary.experiment_name = Some(experiment.name);
        summary.experiment_id = Some(experiment.id);
        Ok(())
    }

    /// Store results if storage path is configured
    fn store_results_if_configured(
        &self,
        summary: &ExperimentSummary,
        definition: &EvalDefinition,
    ) -> Result<()> {
        if let Some(storage_path) = &definition.storage_path {
            tracing::info!("Storing results to {}", storage_path);
            self.store_results(summary, storage_path)?;
        }
        Ok(())
    }

    /// Store results to a JSON file
    fn store_results(&self, summary: &ExperimentSummary, path: &str) -> Result<()> {
        let json_content = serde_json::to_string_pretty(summary)
            .context("Failed to serialize results to JSON")?;

        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, json_content)
            .with_context(|| format!("Failed to write results to: {}", path))?;
        tracing::info!("Results stored to: {}", path);

        Ok(())
    }
}
