use crate::models::{ExperimentSummary, Statistics};
use crate::template::display_value;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Print eval results in the specified format
pub fn print_results(results: &[ExperimentSummary], format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", render_plain(results)),
        OutputFormat::Json => print_json(results),
    }
}

/// Render results as plain text
fn render_plain(results: &[ExperimentSummary]) -> String {
    let mut out = String::new();

    for (i, summary) in results.iter().enumerate() {
        let title = summary
            .experiment_name
            .as_deref()
            .unwrap_or("unnamed experiment");
        out.push_str(&format!("=== {} / {} ===\n", summary.project, title));
        if let Some(id) = &summary.experiment_id {
            out.push_str(&format!("Experiment id: {}\n", id));
        }
        out.push('\n');

        out.push_str("📊 STATISTICS\n");
        out.push_str("-------------\n");
        out.push_str(&render_statistics(&summary.statistics));
        out.push('\n');

        out.push_str("📝 DETAILED RESULTS\n");
        out.push_str("-------------------\n");
        for (j, case) in summary.results.iter().enumerate() {
            out.push_str(&format!("Case #{}\n", j + 1));
            out.push_str(&format!("Input: {}\n", display_value(&case.input)));
            out.push_str(&format!("Output: {}\n", display_value(&case.output)));
            if let Some(expected) = &case.expected {
                out.push_str(&format!("Expected: {}\n", display_value(expected)));
            }
            out.push_str("Scores:\n");
            for score in &case.scores {
                match score.score {
                    Some(value) => out.push_str(&format!("  • {}: {:.3}\n", score.name, value)),
                    None => out.push_str(&format!("  • {}: -\n", score.name)),
                }
            }
            out.push('\n');
        }

        if i + 1 < results.len() {
            out.push_str(&"=".repeat(50));
            out.push_str("\n\n");
        }
    }

    out
}

/// Render statistics as an aligned table, scorers sorted by name
fn render_statistics(stats: &Statistics) -> String {
    let mut names: Vec<_> = stats.mean.keys().collect();
    names.sort();

    if names.is_empty() {
        return "No statistics available.\n".to_string();
    }

    let width = names.iter().map(|n| n.chars().count()).max().unwrap_or(0).max(15);
    let mut out = format!(
        "{:<width$} {:<8} {:<8} {:<8}\n",
        "Scorer",
        "Mean",
        "Median",
        "Mode",
        width = width
    );
    out.push_str(&"-".repeat(width + 30));
    out.push('\n');

    for name in names {
        let mean = stats.mean.get(name).unwrap_or(&0.0);
        let median = stats.median.get(name).unwrap_or(&0.0);
        let mode = stats.mode.get(name).unwrap_or(&0.0);

        out.push_str(&format!(
            "{:<width$} {:<8.3} {:<8.3} {:<8.3}\n",
            name,
            mean,
            median,
            mode,
            width = width
        ));
    }

    out
}

/// Print results in JSON format
fn print_json(results: &[ExperimentSummary]) {
    match serde_json::to_string_pretty(results) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing results to JSON: {}", e),
    }
}
