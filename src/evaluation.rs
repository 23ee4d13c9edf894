use crate::models::{CaseResult, DatasetCase, ExperimentSummary, Statistics};
use crate::scorers::{Scorer, ScorerArgs};
use crate::task::{Hooks, Task};
use anyhow::{Context, Result};
use std::collections::HashMap;

/// A task plus the scorers applied to each of its outputs
pub struct Eval {
    project: String,
    experiment_name: Option<String>,
    task: Box<dyn Task>,
    scorers: Vec<Box<dyn Scorer>>,
}

impl Eval {
    /// Create an eval for a project with no scorers yet
    pub fn new(project: &str, task: Box<dyn Task>) -> Self {
        Self {
            project: project.to_string(),
            experiment_name: None,
            task,
            scorers: Vec::new(),
        }
    }

    pub fn experiment_name(mut self, name: Option<String>) -> Self {
        self.experiment_name = name;
        self
    }

    pub fn scorer(mut self, scorer: Box<dyn Scorer>) -> Self {
        self.scorers.push(scorer);
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn scorer_names(&self) -> Vec<String> {
        self.scorers.iter().map(|s| s.name().to_string()).collect()
    }

    /// Run the task and every scorer over all cases, in order
    pub async fn run(&self, cases: Vec<DatasetCase>) -> Result<ExperimentSummary> {
        let total_cases = cases.len();
        let mut results = Vec::with_capacity(total_cases);

        for (case_index, case) in cases.into_iter().enumerate() {
            let case_num = case_index + 1;
            tracing::info!("Processing case {}/{}", case_num, total_cases);

            let result = self
                .run_case(case)
                .await
                .with_context(|| format!("Failed to evaluate case {}/{}", case_num, total_cases))?;
            results.push(result);
        }

        tracing::info!("Calculating statistics over {} cases", results.len());
        let statistics = calculate_statistics(&results, &self.scorer_names());

        Ok(ExperimentSummary {
            project: self.project.clone(),
            experiment_name: self.experiment_name.clone(),
            experiment_id: None,
            statistics,
            results,
        })
    }

    /// Run the task on one case and score its output
    async fn run_case(&self, case: DatasetCase) -> Result<CaseResult> {
        let mut hooks = Hooks::new(case.metadata);
        let output = self
            .task
            .run(&case.input, &mut hooks)
            .await
            .context("Task failed")?;

        let args = ScorerArgs {
            input: &case.input,
            output: &output,
            expected: case.expected.as_ref(),
            metadata: &hooks.metadata,
        };

        let mut scores = Vec::with_capacity(self.scorers.len());
        for scorer in &self.scorers {
            tracing::debug!(scorer = scorer.name(), "scoring");
            let score = scorer
                .score(&args)
                .await
                .with_context(|| format!("Scorer '{}' failed", scorer.name()))?;
            scores.push(score);
        }

        Ok(CaseResult {
            input: case.input,
            output,
            expected: case.expected,
            metadata: hooks.metadata,
            scores,
        })
    }
}

/// Calculate statistics for each scorer across case results
pub fn calculate_statistics(results: &[CaseResult], scorer_names: &[String]) -> Statistics {
    let mut mean = HashMap::new();
    let mut median = HashMap::new();
    let mut mode = HashMap::new();

    for name in scorer_names {
        let scores = collect_scores(results, name);

        if scores.is_empty() {
            insert_zero_stats(name, &mut mean, &mut median, &mut mode);
            continue;
        }

        mean.insert(name.clone(), calculate_mean(&scores));
        median.insert(name.clone(), calculate_median(&scores));
        mode.insert(name.clone(), calculate_mode(&scores));
    }

    Statistics { mean, median, mode }
}

/// Collect the scores a scorer actually produced
fn collect_scores(results: &[CaseResult], name: &str) -> Vec<f64> {
    results.iter().filter_map(|r| r.score(name)).collect()
}

/// Insert zero values for all statistics
fn insert_zero_stats(
    name: &str,
    mean: &mut HashMap<String, f64>,
    median: &mut HashMap<String, f64>,
    mode: &mut HashMap<String, f64>,
) {
    mean.insert(name.to_string(), 0.0);
    median.insert(name.to_string(), 0.0);
    mode.insert(name.to_string(), 0.0);
}

fn calculate_mean(scores: &[f64]) -> f64 {
    let sum: f64 = scores.iter().sum();
    sum / scores.len() as f64
}

fn calculate_median(scores: &[f64]) -> f64 {
    let mut sorted_scores = scores.to_vec();
    sorted_scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mid = sorted_scores.len() / 2;
    if sorted_scores.len() % 2 == 0 {
        (sorted_scores[mid - 1] + sorted_scores[mid]) / 2.0
    } else {
        sorted_scores[mid]
    }
}

/// Most frequent score, rounded to 1 decimal place; ties go to the lower value
fn calculate_mode(scores: &[f64]) -> f64 {
    let mut frequency: HashMap<u64, usize> = HashMap::new();

    for &score in scores {
        let rounded = ((score * 10.0).round() as i32) as f64 / 10.0;
        *frequency.entry(rounded.to_bits()).or_insert(0) += 1;
    }

    frequency
        .into_iter()
        .map(|(bits, count)| (f64::from_bits(bits), count))
        .max_by(|(a, a_count), (b, b_count)| {
            a_count
                .cmp(b_count)
                .then_with(|| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal))
        })
        .map(|(value, _)| value)
        .unwrap_or(0.0)
}
