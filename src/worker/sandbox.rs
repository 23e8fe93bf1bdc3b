use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentExecutionResult, AgentExecutor, AgentSpec};
use crate::config::SandboxConfig;
use crate::error::{FleetError, Result};

/// Longest stderr excerpt kept in result metadata.
const MAX_STDERR_BYTES: usize = 4096;

/// How long to wait for pipes to drain once the process tree is gone.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SandboxRequest<'a> {
    agent_id: &'a str,
    version: &'a str,
    name: &'a str,
    instructions: &'a str,
    input: &'a str,
    max_tokens: u32,
    max_duration_seconds: u64,
    model_profile: &'a HashMap<String, serde_json::Value>,
}

impl<'a> SandboxRequest<'a> {
    fn new(spec: &'a AgentSpec, input: &'a str) -> Self {
        Self {
            agent_id: &spec.agent_id,
            version: &spec.version,
            name: &spec.name,
            instructions: &spec.instructions,
            input,
            max_tokens: spec.budget.max_tokens,
            max_duration_seconds: spec.budget.max_duration_seconds,
            model_profile: &spec.model_profile,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxResponse {
    success: bool,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    tokens_in: u64,
    #[serde(default)]
    tokens_out: u64,
    #[serde(default)]
    usd_cost: f64,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs each agent execution in its own child process.
///
/// The child is placed in a fresh process group so the whole tree can be
/// stopped at once. When `max_duration_seconds` passes or the caller cancels,
/// the group gets SIGTERM, and SIGKILL once the grace period runs out.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.config.program)
            .args(&self.config.args)
            .envs(self.config.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
    }

    /// Execute one request. Every outcome except cancellation comes back as
    /// an [`AgentExecutionResult`]; cancellation kills the tree and returns
    /// [`FleetError::Cancelled`].
    pub async fn run(
        &self,
        spec: &AgentSpec,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentExecutionResult> {
        let started = Instant::now();
        let deadline = spec.budget.max_duration();

        let request = match serde_json::to_vec(&SandboxRequest::new(spec, input)) {
            Ok(request) => request,
            Err(e) => {
                return Ok(AgentExecutionResult::failure(
                    format!("Failed to serialize sandbox request: {}", e),
                    started.elapsed(),
                ))
            }
        };

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    agent_id = %spec.agent_id,
                    program = %self.config.program,
                    error = %e,
                    "Failed to start sandbox"
                );
                return Ok(AgentExecutionResult::failure(
                    format!("Failed to start sandbox process: {}", e),
                    started.elapsed(),
                ));
            }
        };
        let pid = child.id();
        tracing::debug!(agent_id = %spec.agent_id, pid = ?pid, deadline_ms = deadline.as_millis() as u64, "Sandbox started");

        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&request).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        });
        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let outcome = tokio::select! {
            biased;
            _ = tokio::time::sleep(deadline) => Outcome::TimedOut,
            status = child.wait() => Outcome::Exited(status),
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let interrupted = !matches!(outcome, Outcome::Exited(_));
        if let Some(pid) = pid {
            if interrupted {
                signal_process_tree(pid, Signal::SIGTERM);
                let grace = self.config.grace_period();
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    tracing::debug!(pid, grace_ms = grace.as_millis() as u64, "Sandbox ignored SIGTERM");
                }
            }
            // Reap the whole group on every path, stragglers of a clean exit included.
            signal_process_tree(pid, Signal::SIGKILL);
        }
        if interrupted {
            let _ = child.wait().await;
        }
        writer.abort();

        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;
        let duration = started.elapsed();

        match outcome {
            Outcome::Cancelled => {
                tracing::info!(agent_id = %spec.agent_id, pid = ?pid, "Sandbox cancelled, process tree killed");
                Err(FleetError::Cancelled)
            }
            Outcome::TimedOut => {
                tracing::warn!(
                    agent_id = %spec.agent_id,
                    pid = ?pid,
                    max_duration_seconds = spec.budget.max_duration_seconds,
                    "Sandbox timed out, process tree killed"
                );
                Ok(with_stderr(
                    AgentExecutionResult::failure(
                        format!(
                            "Execution timed out: maximum duration of {}s exceeded",
                            spec.budget.max_duration_seconds
                        ),
                        duration,
                    ),
                    &stderr,
                ))
            }
            Outcome::Exited(Err(e)) => Ok(AgentExecutionResult::failure(
                format!("Failed to wait for sandbox process: {}", e),
                duration,
            )),
            Outcome::Exited(Ok(status)) => {
                let result = interpret_output(status, &stdout, &stderr, duration);
                tracing::info!(
                    agent_id = %spec.agent_id,
                    exit_code = ?status.code(),
                    success = result.success,
                    duration_ms = duration.as_millis() as u64,
                    "Sandbox finished"
                );
                Ok(result)
            }
        }
    }
}

#[async_trait]
impl AgentExecutor for SandboxExecutor {
    async fn execute(
        &self,
        spec: &AgentSpec,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentExecutionResult> {
        self.run(spec, input, cancel).await
    }
}

fn interpret_output(
    status: ExitStatus,
    stdout: &[u8],
    stderr: &[u8],
    duration: Duration,
) -> AgentExecutionResult {
    let exit_label = status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let stdout = String::from_utf8_lossy(stdout);
    let stdout = stdout.trim();

    let result = if stdout.is_empty() {
        let message = if status.success() {
            "Sandbox produced no output".to_string()
        } else {
            format!("Sandbox exited with code {} and no output", exit_label)
        };
        AgentExecutionResult::failure(message, duration)
    } else {
        match serde_json::from_str::<SandboxResponse>(stdout) {
            Ok(response) => from_response(response, duration),
            Err(e) => AgentExecutionResult::failure(
                format!("Failed to deserialize sandbox response: {}", e),
                duration,
            ),
        }
    };

    with_stderr(result.with_metadata("exitCode", exit_label), stderr)
}

fn from_response(response: SandboxResponse, duration: Duration) -> AgentExecutionResult {
    let mut result = if response.success {
        AgentExecutionResult::success(response.output.unwrap_or_default(), duration)
    } else {
        let mut failed = AgentExecutionResult::failure(
            response
                .error
                .unwrap_or_else(|| "Agent reported failure".to_string()),
            duration,
        );
        failed.output = response.output;
        failed
    };
    result = result.with_usage(response.tokens_in, response.tokens_out, response.usd_cost);
    for (key, value) in response.metadata {
        let value = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        result = result.with_metadata(key, value);
    }
    result
}

fn with_stderr(result: AgentExecutionResult, stderr: &[u8]) -> AgentExecutionResult {
    if stderr.is_empty() {
        return result;
    }
    let excerpt = &stderr[..stderr.len().min(MAX_STDERR_BYTES)];
    result.with_metadata("stderr", String::from_utf8_lossy(excerpt).trim().to_string())
}

/// Send `signal` to every process in the group led by `pid`.
fn signal_process_tree(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, signal = signal.as_str(), error = %e, "Failed to signal sandbox process group"),
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

async fn drain(handle: tokio::task::JoinHandle<Vec<u8>>) -> Vec<u8> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            abort.abort();
            Vec::new()
        }
    }
}
