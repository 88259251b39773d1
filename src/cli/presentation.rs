//! CLI presentation: run report, batch validation and provider listing in text/json.

use crate::batch::BatchSpec;
use crate::status::BatchStatusReport;
use crate::task::{Task, TaskStatus};
use crate::types::TaskId;
use anyhow::{bail, Result};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;

const PROMPT_PREVIEW_CHARS: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn parse(format: &str) -> Result<Self> {
        match format {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => bail!("Invalid format: {} (must be 'text' or 'json')", other),
        }
    }
}

/// A generated image written to disk.
#[derive(Debug, Clone, Serialize)]
pub struct WrittenImage {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub size_bytes: usize,
}

/// One configured provider, as listed by `storyboard providers`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRow {
    pub name: String,
    pub provider_type: String,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub cost_per_image: f64,
    pub is_default: bool,
}

fn preview(prompt: &str) -> String {
    if prompt.chars().count() <= PROMPT_PREVIEW_CHARS {
        return prompt.to_string();
    }
    let cut: String = prompt.chars().take(PROMPT_PREVIEW_CHARS - 3).collect();
    format!("{}...", cut)
}

pub fn format_progress_line(report: &BatchStatusReport) -> String {
    format!(
        "{} [{}] {:>3.0}%  {} done, {} running, {} queued, {} failed",
        report.name,
        report.state.as_str(),
        report.overall_progress * 100.0,
        report.completed_tasks,
        report.running_tasks,
        report.queued_tasks,
        report.failed_tasks
    )
}

pub fn format_run_result(
    report: &BatchStatusReport,
    tasks: &[Task],
    images: &[WrittenImage],
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Json => {
            let out = json!({
                "report": report,
                "tasks": tasks,
                "images": images,
            });
            serde_json::to_string_pretty(&out).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Text => format_run_result_text(report, tasks, images),
    }
}

fn format_run_result_text(
    report: &BatchStatusReport,
    tasks: &[Task],
    images: &[WrittenImage],
) -> String {
    let mut out = format!(
        "{} {} ({})\n",
        "Batch".bold(),
        report.name.bold(),
        report.batch_id
    );
    let state = match report.state.as_str() {
        "completed" => report.state.as_str().green().to_string(),
        "partially_failed" => report.state.as_str().yellow().to_string(),
        other => other.red().to_string(),
    };
    out.push_str(&format!("State: {}\n", state));
    out.push_str(&format!(
        "Tasks: {} total, {} completed, {} failed ({} timed out, {} cancelled)\n\n",
        report.total_tasks,
        report.completed_tasks,
        report.failed_tasks,
        report.timed_out_tasks,
        report.cancelled_tasks
    ));

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["#", "Task", "Status", "Retries", "Time", "Prompt / Error"]);
    for (index, task) in tasks.iter().enumerate() {
        let detail = match (&task.status, &task.error_message) {
            (TaskStatus::Failed | TaskStatus::Timeout, Some(error)) => preview(error),
            _ => preview(&task.request.prompt),
        };
        table.add_row(vec![
            format!("{}", index + 1),
            task.id.to_string(),
            task.status.as_str().to_string(),
            task.retry_count.to_string(),
            format!("{} ms", task.performance_metrics.execution_time_ms),
            detail,
        ]);
    }
    out.push_str(&table.to_string());

    let stats = &report.statistics;
    out.push_str(&format!("\n\n{}\n", "Statistics".bold()));
    out.push_str(&format!(
        "  Average execution: {:.0} ms\n",
        stats.average_execution_time_ms
    ));
    out.push_str(&format!("  API cost: ${:.4}\n", stats.total_api_costs));
    out.push_str(&format!("  Error rate: {:.1}%\n", stats.error_rate * 100.0));
    out.push_str(&format!(
        "  Throughput: {:.1} images/hour\n",
        stats.throughput_per_hour
    ));
    out.push_str(&format!(
        "  Peak concurrency: {}\n",
        stats.peak_concurrent_tasks
    ));

    if !images.is_empty() {
        out.push_str(&format!("\n{} ({})\n", "Images".bold(), images.len()));
        for image in images {
            out.push_str(&format!(
                "  {} ({} bytes)\n",
                image.path.display(),
                image.size_bytes
            ));
        }
    }
    out
}

pub fn format_batch_validation(spec: &BatchSpec, provider: &str) -> String {
    let mut out = format!("{} {}\n", "Batch file is valid:".green(), spec.name);
    out.push_str(&format!("  Provider: {}\n", provider));
    out.push_str(&format!("  Priority: {}\n", spec.priority));
    out.push_str(&format!("  Max parallel: {}\n", spec.max_parallel));
    out.push_str(&format!("  Requests: {}\n\n", spec.requests.len()));

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["#", "Prompt", "Aspect", "Characters"]);
    for (index, request) in spec.requests.iter().enumerate() {
        let characters: Vec<&str> = request.characters.iter().map(|c| c.id.as_str()).collect();
        table.add_row(vec![
            format!("{}", index + 1),
            preview(&request.prompt),
            request.aspect_ratio.to_string(),
            if characters.is_empty() {
                "-".to_string()
            } else {
                characters.join(", ")
            },
        ]);
    }
    out.push_str(&table.to_string());
    out
}

pub fn format_providers(rows: &[ProviderRow], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            let out = json!({ "providers": rows, "total": rows.len() });
            serde_json::to_string_pretty(&out).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Text => {
            if rows.is_empty() {
                return "No providers configured.".to_string();
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Name", "Type", "Model", "Endpoint", "Cost/image"]);
            for row in rows {
                let name = if row.is_default {
                    format!("{} (default)", row.name)
                } else {
                    row.name.clone()
                };
                table.add_row(vec![
                    name,
                    row.provider_type.clone(),
                    row.model.clone().unwrap_or_else(|| "-".to_string()),
                    row.endpoint
                        .clone()
                        .unwrap_or_else(|| "(default endpoint)".to_string()),
                    format!("${:.4}", row.cost_per_image),
                ]);
            }
            format!("{}\n\nTotal: {} provider(s)", table, rows.len())
        }
    }
}
