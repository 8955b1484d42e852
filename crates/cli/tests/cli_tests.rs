//! CLI integration tests

use std::process::Command;

fn reclaimctl(args: &[&str]) -> std::process::Output {
    Command::new("cargo")
        .args(["run", "-q", "-p", "reclaim-cli", "--"])
        .args(args)
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = reclaimctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("idle-memory reclaimer"), "Should show about text");
    for command in ["status", "run", "cancel", "report", "evaluate"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = reclaimctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("reclaimctl"), "Should show binary name");
}

/// Test run subcommand help
#[test]
fn test_run_help() {
    let output = reclaimctl(&["run", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Run help should succeed");
    assert!(stdout.contains("--wait"), "Should show wait option");
}

/// Test evaluate subcommand help
#[test]
fn test_evaluate_help() {
    let output = reclaimctl(&["evaluate", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Evaluate help should succeed");
    for option in ["--configured", "--host", "--guest", "--powered-off", "--threshold"] {
        assert!(stdout.contains(option), "Should show {} option", option);
    }
}

/// Evaluate works offline and proposes guest + 25% of host usage
#[test]
fn test_evaluate_outlier_json() {
    let output = reclaimctl(&[
        "--format",
        "json",
        "evaluate",
        "--configured",
        "4096",
        "--host",
        "3000",
        "--guest",
        "1000",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Evaluate should succeed: {}", stdout);
    let evaluation: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(evaluation["exceeds_threshold"], true);
    assert_eq!(evaluation["proposed_limit_mb"], 1750);
}

#[test]
fn test_evaluate_powered_off_json() {
    let output = reclaimctl(&[
        "--format",
        "json",
        "evaluate",
        "--configured",
        "4096",
        "--host",
        "4000",
        "--guest",
        "100",
        "--powered-off",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Evaluate should succeed: {}", stdout);
    let evaluation: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(evaluation["exceeds_threshold"], false);
    assert!(evaluation["proposed_limit_mb"].is_null());
    assert_eq!(evaluation["idle_ratio"], -1.0);
}

/// Missing required evaluate arguments are rejected
#[test]
fn test_evaluate_requires_memory_figures() {
    let output = reclaimctl(&["evaluate", "--configured", "4096"]);

    assert!(!output.status.success(), "Should fail without host/guest");
}

/// Unknown subcommands are rejected
#[test]
fn test_invalid_command() {
    let output = reclaimctl(&["invalid-command"]);

    assert!(!output.status.success(), "Invalid command should fail");
}
