//! Offline idle evaluation

use anyhow::Result;
use colored::Colorize;
use reclaim_lib::{evaluate, PowerState, ReclamationThresholds, VmSnapshot};

use crate::output::{color_ratio, format_mb, print_json, OutputFormat};

/// Memory figures for one VM, as reported by the management plane
#[derive(Debug, Clone)]
pub struct EvaluateArgs {
    pub configured_mb: i64,
    pub host_mb: i64,
    pub guest_mb: i64,
    pub powered_off: bool,
    pub idle_threshold: f64,
}

impl EvaluateArgs {
    fn snapshot(&self) -> VmSnapshot {
        VmSnapshot {
            id: "cli".to_string(),
            power_state: if self.powered_off {
                PowerState::PoweredOff
            } else {
                PowerState::PoweredOn
            },
            configured_mb: self.configured_mb,
            host_usage_mb: self.host_mb,
            guest_usage_mb: self.guest_mb,
            ballooned_mb: 0,
            memory_limit_mb: None,
        }
    }
}

/// Evaluate one VM against the idle threshold without contacting the agent
pub fn evaluate_vm(args: &EvaluateArgs, format: OutputFormat) -> Result<()> {
    let thresholds = ReclamationThresholds {
        idle_threshold: args.idle_threshold,
        ..Default::default()
    };
    thresholds.validate()?;

    let snapshot = args.snapshot();
    let evaluation = evaluate(&snapshot, &thresholds);

    match format {
        OutputFormat::Json => print_json(&evaluation),
        OutputFormat::Table => {
            println!("{}", "Idle Evaluation".bold());
            println!("{}", "=".repeat(40));
            println!("Configured:     {}", format_mb(snapshot.configured_mb));
            println!("Host usage:     {}", format_mb(snapshot.host_usage_mb));
            println!("Guest usage:    {}", format_mb(snapshot.guest_usage_mb));
            if snapshot.is_powered_on() {
                println!("Idle memory:    {}", format_mb(snapshot.idle_mb()));
            }
            println!(
                "Idle ratio:     {} (threshold {:.0}%)",
                color_ratio(evaluation.idle_ratio, thresholds.idle_threshold),
                thresholds.idle_threshold * 100.0
            );
            println!();

            match evaluation.proposed_limit_mb {
                Some(limit) if evaluation.exceeds_threshold => println!(
                    "{} would be capped at {}",
                    "Outlier:".red().bold(),
                    format_mb(limit).bold()
                ),
                Some(limit) => println!(
                    "{} no cap needed (limit would be {})",
                    "Within threshold:".green().bold(),
                    format_mb(limit)
                ),
                None => println!("{} never capped", "Powered off:".dimmed()),
            }
            Ok(())
        }
    }
}
