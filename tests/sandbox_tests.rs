use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use agent_fleet::agent::{AgentSpec, BudgetConstraints};
use agent_fleet::config::SandboxConfig;
use agent_fleet::error::FleetError;
use agent_fleet::worker::SandboxExecutor;

/// Executor running `script` under `/bin/sh -c`.
fn shell(script: &str) -> SandboxExecutor {
    SandboxExecutor::new(
        SandboxConfig::new("/bin/sh")
            .with_args(["-c", script])
            .with_grace_period_ms(300),
    )
}

fn spec(max_duration_seconds: u64) -> AgentSpec {
    AgentSpec::new("shell", "1", BudgetConstraints::new(1_000, max_duration_seconds))
        .with_instructions("answer briefly")
}

/// True once `pid` no longer runs: either gone or a zombie waiting for its
/// new parent to reap it.
fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..40 {
        if process_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_successful_execution() {
    let executor = shell(
        r#"cat >/dev/null; echo '{"success":true,"output":"done","tokensIn":3,"tokensOut":4,"usdCost":0.5,"metadata":{"model":"small"}}'"#,
    );

    let result = executor
        .run(&spec(5), "question", &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.output.as_deref(), Some("done"));
    assert_eq!(result.tokens_in, 3);
    assert_eq!(result.tokens_out, 4);
    assert_eq!(result.total_tokens(), 7);
    assert_eq!(result.usd_cost, 0.5);
    assert_eq!(result.metadata.get("model").map(String::as_str), Some("small"));
    assert_eq!(result.metadata.get("exitCode").map(String::as_str), Some("0"));
}

#[tokio::test]
async fn test_request_is_written_to_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let captured = dir.path().join("request.json");
    let script = format!(
        r#"cat > {}; echo '{{"success":true,"output":"ok"}}'"#,
        captured.display()
    );
    let executor = shell(&script);

    let result = executor
        .run(&spec(5), "the input", &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.error);

    let request: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&captured).unwrap()).unwrap();
    assert_eq!(request["agentId"], "shell");
    assert_eq!(request["version"], "1");
    assert_eq!(request["instructions"], "answer briefly");
    assert_eq!(request["input"], "the input");
    assert_eq!(request["maxTokens"], 1_000);
    assert_eq!(request["maxDurationSeconds"], 5);
}

#[tokio::test]
async fn test_agent_reported_failure() {
    let executor = shell(r#"cat >/dev/null; echo '{"success":false,"error":"quota exhausted"}'"#);

    let result = executor
        .run(&spec(5), "", &CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("quota exhausted"));
}

#[tokio::test]
async fn test_empty_output_is_failure() {
    let executor = shell("cat >/dev/null; echo 'warming up' >&2; exit 0");

    let result = executor
        .run(&spec(5), "", &CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Sandbox produced no output"));
    assert_eq!(result.metadata.get("exitCode").map(String::as_str), Some("0"));
    assert_eq!(
        result.metadata.get("stderr").map(String::as_str),
        Some("warming up")
    );
}

#[tokio::test]
async fn test_crash_without_output_reports_exit_code() {
    let executor = shell("cat >/dev/null; exit 3");

    let result = executor
        .run(&spec(5), "", &CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("code 3"));
    assert_eq!(result.metadata.get("exitCode").map(String::as_str), Some("3"));
}

#[tokio::test]
async fn test_malformed_output_is_failure() {
    let executor = shell("cat >/dev/null; echo 'not json'");

    let result = executor
        .run(&spec(5), "", &CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .unwrap()
        .starts_with("Failed to deserialize sandbox response"));
}

#[tokio::test]
async fn test_missing_program_is_failure() {
    let executor = SandboxExecutor::new(SandboxConfig::new("/nonexistent/agent-host"));

    let result = executor
        .run(&spec(5), "", &CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("Failed to start"));
}

#[tokio::test]
async fn test_timeout_kills_whole_process_tree() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("child.pid");
    let script = format!(
        "sleep 300 & echo $! > {}; wait",
        pidfile.display()
    );
    let executor = shell(&script);

    let started = Instant::now();
    let result = executor
        .run(&spec(1), "", &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("timed out"));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(10));

    let pid: u32 = std::fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(
        wait_until_gone(pid).await,
        "grandchild {} survived the timeout",
        pid
    );
}

#[tokio::test]
async fn test_sigterm_ignoring_tree_is_killed_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("child.pid");
    let script = format!(
        "trap '' TERM; sleep 300 & echo $! > {}; wait",
        pidfile.display()
    );
    let executor = shell(&script);

    let started = Instant::now();
    let result = executor
        .run(&spec(1), "", &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("timed out"));
    // Deadline plus the 300ms grace before SIGKILL.
    assert!(elapsed >= Duration::from_millis(1_300));
    assert!(elapsed < Duration::from_secs(10));

    let pid: u32 = std::fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(wait_until_gone(pid).await, "grandchild {} survived SIGKILL", pid);
}

#[tokio::test]
async fn test_cancellation_kills_tree_and_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("child.pid");
    let script = format!(
        "sleep 300 & echo $! > {}; wait",
        pidfile.display()
    );
    let executor = shell(&script);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let err = executor.run(&spec(60), "", &cancel).await.unwrap_err();
    assert!(matches!(err, FleetError::Cancelled));

    let pid: u32 = std::fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(wait_until_gone(pid).await, "grandchild {} survived", pid);
}
