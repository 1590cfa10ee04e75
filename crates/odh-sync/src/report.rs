use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use odh_core::{AggregationSummary, RunStatus, RunSummary};
use tokio::fs;
use uuid::Uuid;

/// How many warning/error lines the brief shows before truncating.
const BRIEF_MESSAGE_LIMIT: usize = 20;

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn message_section(title: &str, messages: &[String]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let mut out = format!("\n## {title} ({})\n", messages.len());
    for message in messages.iter().take(BRIEF_MESSAGE_LIMIT) {
        out.push_str(&format!("- {message}\n"));
    }
    if messages.len() > BRIEF_MESSAGE_LIMIT {
        out.push_str(&format!("- ... {} more\n", messages.len() - BRIEF_MESSAGE_LIMIT));
    }
    out
}

pub fn render_run_brief(run: &RunSummary) -> String {
    let counts = &run.counts;
    format!(
        "# Harvest run `{}`\n\n- Source: {}\n- Status: {}\n- Started: {}\n- Finished: {}\n\n## Counts\n- processed: {}\n- skipped: {}\n- invalid: {}\n- warnings: {}\n- errors: {}\n{}{}",
        run.run_id,
        run.source_id,
        status_label(run.status),
        run.started_at,
        run.finished_at,
        counts.processed,
        counts.skipped,
        counts.invalid,
        counts.warnings,
        counts.errors,
        message_section("Errors", &run.errors),
        message_section("Warnings", &run.warnings),
    )
}

/// Writes `reports/<run_id>/summary.json` and `run_brief.md`.
pub async fn write_run_report(reports_dir: &Path, run: &RunSummary) -> Result<PathBuf> {
    let dir = reports_dir.join(run.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let summary = serde_json::to_vec_pretty(run).context("serializing run summary")?;
    fs::write(dir.join("summary.json"), summary)
        .await
        .context("writing summary.json")?;
    fs::write(dir.join("run_brief.md"), render_run_brief(run))
        .await
        .context("writing run_brief.md")?;
    Ok(dir)
}

/// Writes `reports/<aggregation_id>/aggregation.json`.
pub async fn write_aggregation_report(
    reports_dir: &Path,
    aggregation_id: Uuid,
    finished_at: DateTime<Utc>,
    scope: Option<&str>,
    summary: &AggregationSummary,
) -> Result<PathBuf> {
    let dir = reports_dir.join(aggregation_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let body = serde_json::to_vec_pretty(&serde_json::json!({
        "aggregation_id": aggregation_id,
        "finished_at": finished_at,
        "source": scope,
        "summary": summary,
    }))
    .context("serializing aggregation summary")?;
    fs::write(dir.join("aggregation.json"), body)
        .await
        .context("writing aggregation.json")?;
    Ok(dir)
}
