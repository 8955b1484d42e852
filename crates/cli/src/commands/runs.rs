//! Run control and reporting commands

use anyhow::Result;
use colored::Colorize;
use reclaim_lib::{
    health::HealthResponse, FleetSummary, RunProgress, RunRecord, RunReport, VmDecision,
};
use std::time::Duration;
use tabled::Tabled;

use crate::client::{ApiClient, ControlOutcome};
use crate::output::{
    color_phase, color_status, decision_label, format_mb, format_ratio, print_error, print_info,
    print_json, print_success, print_table, print_warning, OutputFormat,
};

/// How often `run --wait` polls the agent
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Row for per-VM outcomes
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "Decision")]
    decision: String,
    #[tabled(rename = "Limit")]
    limit: String,
    #[tabled(rename = "Initial")]
    initial: String,
    #[tabled(rename = "Final")]
    last: String,
    #[tabled(rename = "Polls")]
    polls: String,
}

impl OutcomeRow {
    fn from_outcome(vm_id: &str, decision: &VmDecision) -> Self {
        match decision {
            VmDecision::Skipped { idle_ratio } => Self {
                vm: vm_id.to_string(),
                decision: decision_label(decision),
                limit: "-".to_string(),
                initial: format_ratio(*idle_ratio),
                last: "-".to_string(),
                polls: "-".to_string(),
            },
            VmDecision::Converged {
                limit_mb,
                initial_ratio,
                final_ratio,
                polls,
            }
            | VmDecision::GaveUp {
                limit_mb,
                initial_ratio,
                final_ratio,
                polls,
            } => Self {
                vm: vm_id.to_string(),
                decision: decision_label(decision),
                limit: format_mb(*limit_mb),
                initial: format_ratio(*initial_ratio),
                last: format_ratio(*final_ratio),
                polls: polls.to_string(),
            },
        }
    }
}

/// Row for host option changes
#[derive(Tabled)]
struct HostChangeRow {
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Option")]
    key: String,
    #[tabled(rename = "Previous")]
    previous: String,
    #[tabled(rename = "Value")]
    value: i64,
}

/// Show agent health and live run progress
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: HealthResponse = client.get("healthz").await?;
    let progress: RunProgress = client.get("api/v1/runs/current").await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "health": health,
            "run": progress,
        })),
        OutputFormat::Table => {
            println!("{}", "Reclaimer Status".bold());
            println!("{}", "=".repeat(50));

            let status = serde_json::to_value(health.status)?;
            println!(
                "Health:       {}",
                color_status(status.as_str().unwrap_or("unknown"))
            );
            let mut components: Vec<_> = health.components.iter().collect();
            components.sort_by(|a, b| a.0.cmp(b.0));
            for (name, component) in components {
                if let Some(message) = &component.message {
                    println!("  {:<24} {}", name, message.dimmed());
                }
            }

            println!("Phase:        {}", color_phase(progress.phase));
            if let Some(run_id) = &progress.run_id {
                println!("Run:          {}", run_id.cyan());
            }
            if let Some(started_at) = progress.started_at {
                println!(
                    "Started:      {}",
                    started_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            if let Some(vm) = &progress.watching {
                println!("Watching:     {}", vm.yellow());
            }
            println!("VMs handled:  {}", progress.outcomes.len());
            if progress.drain_polls > 0 {
                println!("Drain polls:  {}", progress.drain_polls);
            }
            Ok(())
        }
    }
}

/// Ask the agent to start a run, optionally waiting for it to finish
pub async fn start_run(client: &ApiClient, wait: bool, format: OutputFormat) -> Result<()> {
    let outcome = client.control("api/v1/runs").await?;
    report_control(&outcome, "Reclamation run started", format)?;

    if !outcome.accepted || !wait {
        return Ok(());
    }

    loop {
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        let progress: RunProgress = client.get("api/v1/runs/current").await?;
        if !progress.phase.is_active() {
            break;
        }
        if format == OutputFormat::Table {
            match &progress.watching {
                Some(vm) => print_info(&format!("{} (watching {})", progress.phase, vm)),
                None => print_info(progress.phase.as_str()),
            }
        }
    }

    show_report(client, format).await
}

/// Ask the agent to cancel the active run
pub async fn cancel_run(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let outcome = client.control("api/v1/runs/cancel").await?;
    report_control(&outcome, "Cancellation requested", format)
}

fn report_control(outcome: &ControlOutcome, success: &str, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(&outcome.body),
        OutputFormat::Table => {
            let message = outcome.body.message.as_deref().unwrap_or(&outcome.body.status);
            if outcome.accepted {
                print_success(success);
            } else {
                print_warning(message);
            }
            Ok(())
        }
    }
}

/// Show the report (or failure) of the last finished run
pub async fn show_report(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let Some(record) = client.get_optional::<RunRecord>("api/v1/runs/last").await? else {
        print_warning("No run has finished yet");
        return Ok(());
    };

    match format {
        OutputFormat::Json => print_json(&record),
        OutputFormat::Table => {
            match &record {
                RunRecord::Completed(report) => print_completed(report),
                RunRecord::Failed(failure) => {
                    println!("{}", "Run Failed".bold().red());
                    println!("{}", "=".repeat(60));
                    println!("Run:        {}", failure.run_id.cyan());
                    println!("Phase:      {}", color_phase(failure.phase));
                    if let Some(host) = &failure.host {
                        println!("Host:       {}", host);
                    }
                    if let Some(vm) = &failure.vm {
                        println!("VM:         {}", vm);
                    }
                    println!(
                        "Failed at:  {}",
                        failure.failed_at.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                    println!();
                    print_error(&failure.message);
                }
            }
            Ok(())
        }
    }
}

fn print_completed(report: &RunReport) {
    println!("{}", "Reclamation Report".bold());
    println!("{}", "=".repeat(60));
    println!("Run:        {}", report.run_id.cyan());
    println!("Cluster:    {}", report.cluster);
    println!(
        "Started:    {}",
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(finished_at) = report.finished_at {
        let elapsed = finished_at - report.started_at;
        println!(
            "Finished:   {} ({}s)",
            finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
            elapsed.num_seconds()
        );
    }
    println!("Hosts:      {}", report.hosts.len());
    println!();

    println!("{}", "VM Outcomes".bold());
    let rows: Vec<OutcomeRow> = report
        .outcomes
        .iter()
        .map(|o| OutcomeRow::from_outcome(&o.vm_id, &o.decision))
        .collect();
    print_table(rows, "No VMs evaluated");

    let stalled = report.stalled();
    println!(
        "Capped: {}  Converged: {}  Gave up: {}  Drain polls: {}",
        report.capped(),
        report.converged().to_string().green(),
        stalled.len().to_string().yellow(),
        report.drain_polls
    );
    println!();

    println!("{}", "Fleet Memory".bold());
    print_summary("Before", &report.fleet_before);
    print_summary("After", &report.fleet_after);
    let reduction = report.idle_reduction_mb();
    let formatted = format_mb(reduction);
    if reduction > 0 {
        println!("Idle memory reclaimed: {}", formatted.green().bold());
    } else {
        println!("Idle memory reclaimed: {}", formatted);
    }
    println!();

    println!("{}", "Host Option Changes".bold());
    let rows: Vec<HostChangeRow> = report
        .host_changes
        .iter()
        .map(|c| HostChangeRow {
            host: c.host.clone(),
            phase: c.phase.to_string(),
            key: c.key.clone(),
            previous: c
                .previous
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            value: c.value,
        })
        .collect();
    print_table(rows, "No host options changed");
}

fn print_summary(label: &str, summary: &FleetSummary) {
    let ratio = summary
        .idle_ratio()
        .map(format_ratio)
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {:<7} allocated {}  host {}  guest {}  idle {} ({})  ballooned {}",
        label,
        format_mb(summary.allocated_mb),
        format_mb(summary.host_used_mb),
        format_mb(summary.guest_used_mb),
        format_mb(summary.idle_mb),
        ratio,
        format_mb(summary.ballooned_mb),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_row_for_capped_vm() {
        let row = OutcomeRow::from_outcome(
            "web-01",
            &VmDecision::Converged {
                limit_mb: 1750,
                initial_ratio: 0.4883,
                final_ratio: 0.1953,
                polls: 1,
            },
        );
        assert_eq!(row.limit, "1.71Gi");
        assert_eq!(row.initial, "48.8%");
        assert_eq!(row.last, "19.5%");
        assert_eq!(row.polls, "1");
    }

    #[test]
    fn test_outcome_row_for_skipped_vm() {
        let row = OutcomeRow::from_outcome("old-01", &VmDecision::Skipped { idle_ratio: -1.0 });
        assert_eq!(row.initial, "off");
        assert_eq!(row.limit, "-");
    }
}
