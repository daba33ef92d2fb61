//! End-to-end tests for the request pipeline.
//!
//! Each case wires a fresh pipeline against temp directories and a POSIX
//! shell override, so the suite holds on hosts without PowerShell. The
//! classification-only flows (blocked, confirmation) never spawn a child
//! and run everywhere.

#![cfg(unix)]

use shellgate::models::{Config, SecurityLevel, TerminationReason};
use shellgate::pipeline::{ExecuteArgs, LearnArgs, RequestPipeline};
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    Config {
        data_dir: dir.path().join("data"),
        logs_dir: dir.path().join("logs"),
        shell_override: Some("/bin/sh".to_string()),
        http_port: 0,
        ..Default::default()
    }
}

fn pipeline_with(config: Config) -> RequestPipeline {
    RequestPipeline::new(config).expect("pipeline wiring")
}

fn pipeline(dir: &TempDir) -> RequestPipeline {
    pipeline_with(test_config(dir))
}

fn exec_args(command: &str) -> ExecuteArgs {
    ExecuteArgs {
        command: command.to_string(),
        ..Default::default()
    }
}

fn confirmed_args(command: &str) -> ExecuteArgs {
    ExecuteArgs {
        command: command.to_string(),
        confirmed: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_safe_command_executes_directly() {
    let dir = TempDir::new().unwrap();
    let p = pipeline(&dir);

    let response = p.execute_command(exec_args("echo hello"), "t1").await.unwrap();
    let result = &response.result;
    assert_eq!(result.security_assessment.level, SecurityLevel::Safe);
    assert!(!result.security_assessment.blocked);
    assert!(!result.security_assessment.requires_confirmation);
    assert_eq!(result.termination_reason, TerminationReason::Completed);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.duration_ms >= 1);
    assert!(response.summary.contains("Classification: SAFE"));
    assert!(response.summary.contains("hello"));
}

#[tokio::test]
async fn test_risky_without_confirmation_is_rejected() {
    let dir = TempDir::new().unwrap();
    let p = pipeline(&dir);

    let err = p
        .execute_command(exec_args("Remove-Item ./file.txt"), "t2")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid-argument");
    assert!(err.to_string().contains("confirmed"), "{err}");

    let snap = p.metrics.snapshot(false);
    assert_eq!(snap.confirmation_required, 1);
    // No child was spawned, so nothing fed the duration vector.
    assert_eq!(snap.duration_samples, 0);
}

#[tokio::test]
async fn test_risky_with_confirmation_runs_and_audits() {
    let dir = TempDir::new().unwrap();
    let p = pipeline(&dir);

    // `rm` lands in the risky group and is runnable under /bin/sh.
    let response = p
        .execute_command(confirmed_args("rm -f ./no-such-file-here"), "t3")
        .await
        .unwrap();
    assert_eq!(
        response.result.security_assessment.level,
        SecurityLevel::Risky
    );
    assert_eq!(response.result.exit_code, Some(0));

    p.audit.close();
    let stamp = chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string();
    let ndjson = std::fs::read_to_string(
        dir.path().join("logs").join(format!("audit-{stamp}.ndjson")),
    )
    .unwrap();
    let exec_line = ndjson
        .lines()
        .find(|l| l.contains("POWERSHELL_EXEC"))
        .expect("audit entry for the execution");
    assert!(exec_line.contains("\"confirmed\":true"));
}

#[tokio::test]
async fn test_critical_command_blocked_inline() {
    let dir = TempDir::new().unwrap();
    let p = pipeline(&dir);
    let mut events = p.events.subscribe();

    let response = p
        .execute_command(exec_args("powershell -EncodedCommand abc"), "t4")
        .await
        .unwrap();
    let result = &response.result;
    assert!(result.security_assessment.blocked);
    assert_eq!(result.security_assessment.level, SecurityLevel::Critical);
    assert_eq!(result.duration_ms, 0);
    assert!(result.stdout.is_empty());

    let event = events.try_recv().unwrap();
    assert!(event.blocked);
    assert_eq!(event.duration_ms, 0);

    // Blocked attempts are counted but never feed latency aggregates.
    let snap = p.metrics.snapshot(false);
    assert_eq!(snap.blocked, 1);
    assert_eq!(snap.duration_samples, 0);
}

#[tokio::test]
async fn test_hanging_command_times_out() {
    let dir = TempDir::new().unwrap();
    let p = pipeline(&dir);

    let mut args = confirmed_args("sleep 30");
    args.timeout_seconds = Some(1);
    let started = std::time::Instant::now();
    let response = p.execute_command(args, "t5").await.unwrap();
    let result = &response.result;

    assert!(result.timed_out);
    assert_eq!(result.termination_reason, TerminationReason::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(800));

    let snap = p.metrics.snapshot(false);
    assert_eq!(snap.timeouts, 1);
}

#[tokio::test]
async fn test_overflow_truncates_with_marker() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.max_output_kb = 1;
    let p = pipeline_with(config);

    let response = p
        .execute_command(confirmed_args("head -c 5000 /dev/zero | tr '\\0' 'a'"), "t6")
        .await
        .unwrap();
    let result = &response.result;
    assert!(result.overflow);
    assert!(result.truncated);
    assert_eq!(result.termination_reason, TerminationReason::Overflow);
    assert!(result.stdout.ends_with(shellgate::models::TRUNCATION_MARKER));
}

#[tokio::test]
async fn test_learn_approve_round_trip() {
    let dir = TempDir::new().unwrap();
    let p = pipeline(&dir);

    // Unknown command: rejected pending confirmation, recorded as a
    // learning candidate in the background.
    let err = p
        .execute_command(exec_args("true --status"), "session-a")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid-argument");

    let mut candidates = Vec::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        candidates = match p
            .learn(
                LearnArgs {
                    action: "list".to_string(),
                    ..Default::default()
                },
                "operator",
            )
            .unwrap()
        {
            shellgate::pipeline::LearnResponse::List { candidates } => candidates,
            other => panic!("unexpected learn response: {other:?}"),
        };
        if !candidates.is_empty() {
            break;
        }
    }
    assert_eq!(candidates.len(), 1);
    let form = candidates[0].normalized.clone();
    assert_eq!(form, "true --status");
    assert!(candidates[0].count >= 1);

    let queued = p
        .learn(
            LearnArgs {
                action: "queue".to_string(),
                normalized: vec![form.clone()],
                ..Default::default()
            },
            "operator",
        )
        .unwrap();
    assert!(matches!(
        queued,
        shellgate::pipeline::LearnResponse::Queue { .. }
    ));

    p.learn(
        LearnArgs {
            action: "approve".to_string(),
            normalized: vec![form.clone()],
            ..Default::default()
        },
        "operator",
    )
    .unwrap();

    // The same command now classifies SAFE and runs without confirmation,
    // no restart required.
    let response = p
        .execute_command(exec_args("true --status"), "session-a")
        .await
        .unwrap();
    assert_eq!(
        response.result.security_assessment.level,
        SecurityLevel::Safe
    );
    assert_eq!(response.result.exit_code, Some(0));
}

#[tokio::test]
async fn test_learn_approve_round_trip_with_redacted_path() {
    let dir = TempDir::new().unwrap();
    let p = pipeline(&dir);

    // Unknown command whose path is redacted to OBF_PATH in the journal.
    let raw = "test -d /tmp";
    let err = p.execute_command(exec_args(raw), "session-b").await.unwrap_err();
    assert_eq!(err.kind(), "invalid-argument");

    let mut candidates = Vec::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        candidates = match p
            .learn(
                LearnArgs {
                    action: "list".to_string(),
                    ..Default::default()
                },
                "operator",
            )
            .unwrap()
        {
            shellgate::pipeline::LearnResponse::List { candidates } => candidates,
            other => panic!("unexpected learn response: {other:?}"),
        };
        if !candidates.is_empty() {
            break;
        }
    }
    let form = candidates[0].normalized.clone();
    assert_eq!(form, "test -d OBF_PATH");

    p.learn(
        LearnArgs {
            action: "approve".to_string(),
            normalized: vec![form],
            ..Default::default()
        },
        "operator",
    )
    .unwrap();

    // The exact raw command, path text and all, now classifies SAFE and
    // runs without confirmation.
    let response = p.execute_command(exec_args(raw), "session-b").await.unwrap();
    assert_eq!(
        response.result.security_assessment.level,
        SecurityLevel::Safe
    );
    assert_eq!(response.result.exit_code, Some(0));

    // Any command with the same normalized form is covered too.
    let response = p
        .execute_command(exec_args("test -d /var"), "session-b")
        .await
        .unwrap();
    assert_eq!(
        response.result.security_assessment.level,
        SecurityLevel::Safe
    );
}

#[tokio::test]
async fn test_command_length_boundary() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.max_command_chars = 30;
    let p = pipeline_with(config);

    // "echo " plus filler: exactly 30 chars passes.
    let exact = format!("echo {}", "a".repeat(25));
    assert_eq!(exact.chars().count(), 30);
    let response = p.execute_command(exec_args(&exact), "t8").await.unwrap();
    assert_eq!(response.result.exit_code, Some(0));

    let over = format!("echo {}", "a".repeat(26));
    let err = p.execute_command(exec_args(&over), "t8").await.unwrap_err();
    assert_eq!(err.kind(), "invalid-argument");
}

#[tokio::test]
async fn test_rate_limit_exhaustion() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.rate_capacity = 2;
    config.rate_refill_ms = 60_000;
    config.rate_refill_amount = 2;
    let p = pipeline_with(config);

    for _ in 0..2 {
        p.execute_command(exec_args("echo ok"), "same-caller")
            .await
            .unwrap();
    }
    let err = p
        .execute_command(exec_args("echo ok"), "same-caller")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "rate-limited");
}

#[tokio::test]
async fn test_auth_gate() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.auth_key = Some("sekrit".to_string());
    let p = pipeline_with(config);

    let err = p.execute_command(exec_args("echo hi"), "t9").await.unwrap_err();
    assert_eq!(err.kind(), "unauthorized");

    let mut args = exec_args("echo hi");
    args.auth_key = Some("sekrit".to_string());
    let response = p.execute_command(args, "t9").await.unwrap();
    assert_eq!(response.result.exit_code, Some(0));
}

#[tokio::test]
async fn test_working_directory_policy_enforced() {
    let dir = TempDir::new().unwrap();
    let allowed = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.wd_enforced = true;
    config.wd_allowed_roots = vec![allowed.path().to_string_lossy().into_owned()];
    let p = pipeline_with(config);

    let mut args = confirmed_args("pwd");
    args.working_directory = Some(outside.path().to_string_lossy().into_owned());
    let err = p.execute_command(args, "t10").await.unwrap_err();
    assert_eq!(err.kind(), "invalid-argument");

    let mut args = exec_args("pwd");
    args.working_directory = Some(allowed.path().to_string_lossy().into_owned());
    let response = p.execute_command(args, "t10").await.unwrap();
    assert_eq!(response.result.exit_code, Some(0));
}

#[tokio::test]
async fn test_timeout_cap_and_warnings() {
    let dir = TempDir::new().unwrap();
    let p = pipeline(&dir);

    let mut args = exec_args("echo hi");
    args.timeout_seconds = Some(10_000);
    let err = p.execute_command(args, "t11").await.unwrap_err();
    assert_eq!(err.kind(), "invalid-argument");

    let mut args = exec_args("echo hi");
    args.timeout_seconds = Some(90);
    let response = p.execute_command(args, "t11").await.unwrap();
    assert!(response
        .warnings
        .iter()
        .any(|w| w.contains("long")), "{:?}", response.warnings);

    // Legacy field name still works, with a deprecation warning.
    let mut args = exec_args("echo hi");
    args.timeout = Some(5);
    let response = p.execute_command(args, "t11").await.unwrap();
    assert!(response
        .warnings
        .iter()
        .any(|w| w.contains("deprecated")), "{:?}", response.warnings);
}

#[tokio::test]
async fn test_classification_percentiles_unaffected_by_attempts() {
    let dir = TempDir::new().unwrap();
    let p = pipeline(&dir);

    p.execute_command(exec_args("echo measured"), "t12").await.unwrap();
    let before = p.metrics.snapshot(false);

    // One blocked attempt and one unconfirmed attempt.
    p.execute_command(exec_args("powershell -EncodedCommand abc"), "t12")
        .await
        .unwrap();
    let _ = p.execute_command(exec_args("Remove-Item x"), "t12").await;

    let after = p.metrics.snapshot(false);
    assert_eq!(after.average_duration_ms, before.average_duration_ms);
    assert_eq!(after.p95_duration_ms, before.p95_duration_ms);
    assert_eq!(after.duration_samples, before.duration_samples);
}

#[tokio::test]
async fn test_stats_snapshot_reset_round_trip() {
    let dir = TempDir::new().unwrap();
    let p = pipeline(&dir);

    p.execute_command(exec_args("echo one"), "t13").await.unwrap();
    let first = p.metrics.snapshot(true);
    assert_eq!(first.total_commands, 1);

    let second = p.metrics.snapshot(false);
    assert_eq!(second.total_commands, 0);
    assert_eq!(second.duration_samples, 0);
}

#[tokio::test]
async fn test_check_syntax_tool() {
    let dir = TempDir::new().unwrap();
    let p = pipeline(&dir);

    let report = p
        .check_syntax(
            shellgate::pipeline::CheckSyntaxArgs {
                script: Some("if ($x) { Get-Date }".to_string()),
                ..Default::default()
            },
            "t14",
        )
        .unwrap();
    assert!(report.ok);

    let report = p
        .check_syntax(
            shellgate::pipeline::CheckSyntaxArgs {
                script: Some("while ($true) {".to_string()),
                ..Default::default()
            },
            "t14",
        )
        .unwrap();
    assert!(!report.ok);
    assert!(!report.issues.is_empty());
}
