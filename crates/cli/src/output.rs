//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use reclaim_lib::{evaluator::POWERED_OFF_RATIO, Phase, VmDecision};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a rounded table, or a notice when there is nothing to show
pub fn print_table<T: Tabled>(rows: Vec<T>, empty_message: &str) {
    if rows.is_empty() {
        println!("{}", empty_message.yellow());
        return;
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format megabytes as a human-readable string
pub fn format_mb(mb: i64) -> String {
    const GB: i64 = 1024;

    if mb.abs() >= GB {
        format!("{:.2}Gi", mb as f64 / GB as f64)
    } else {
        format!("{}Mi", mb)
    }
}

/// Format an idle ratio as a percentage
pub fn format_ratio(ratio: f64) -> String {
    if ratio == POWERED_OFF_RATIO {
        "off".to_string()
    } else if ratio.is_infinite() {
        "∞".to_string()
    } else {
        format!("{:.1}%", ratio * 100.0)
    }
}

/// Color an idle ratio against the threshold
pub fn color_ratio(ratio: f64, threshold: f64) -> String {
    let formatted = format_ratio(ratio);
    if ratio == POWERED_OFF_RATIO {
        formatted.dimmed().to_string()
    } else if ratio > threshold {
        formatted.red().to_string()
    } else {
        formatted.green().to_string()
    }
}

/// Color a phase by how the run is going
pub fn color_phase(phase: Phase) -> String {
    let name = phase.as_str();
    match phase {
        Phase::Idle => name.dimmed().to_string(),
        Phase::Done => name.green().to_string(),
        Phase::Failed => name.red().to_string(),
        _ => name.cyan().to_string(),
    }
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "completed" | "started" => status.green().to_string(),
        "degraded" | "busy" | "cancelling" => status.yellow().to_string(),
        "unhealthy" | "error" | "failed" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Short label for a VM decision
pub fn decision_label(decision: &VmDecision) -> String {
    match decision {
        VmDecision::Skipped { .. } => "skipped".dimmed().to_string(),
        VmDecision::Converged { .. } => "converged".green().to_string(),
        VmDecision::GaveUp { .. } => "gave up".yellow().to_string(),
    }
}
