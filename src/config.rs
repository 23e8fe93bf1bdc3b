use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::agent::AgentSpec;
use crate::connector::RetryPolicy;

/// Configuration for the child process that hosts one agent execution.
///
/// The program receives a single JSON request on stdin and must answer with a
/// single JSON response on stdout.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Executable to launch per execution
    pub program: String,
    /// Extra arguments passed to the program
    pub args: Vec<String>,
    /// Extra environment variables for the child
    pub env: Vec<(String, String)>,
    /// Time between SIGTERM and SIGKILL when a sandbox is stopped early
    pub grace_period_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            program: "agent-host".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            grace_period_ms: 5_000,
        }
    }
}

impl SandboxConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_grace_period_ms(mut self, grace_period_ms: u64) -> Self {
        self.grace_period_ms = grace_period_ms;
        self
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Control plane settings.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub listen_addr: SocketAddr,
    /// Interval at which workers are expected to heartbeat
    pub heartbeat_interval_ms: u64,
    /// A node silent for `staleness_multiplier * heartbeat_interval_ms` is marked failed
    pub staleness_multiplier: u32,
    /// How often pending runs are placed and stale nodes are swept
    pub dispatch_interval_ms: u64,
    /// Upper bound on how long a lease pull may block
    pub max_pull_wait_ms: u64,
    /// Runs held at once, finished ones included
    pub max_runs: usize,
    /// How long finished runs stay queryable before the sweep drops them
    pub finished_run_retention_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:7070"
                .parse()
                .expect("default listen address is valid"),
            heartbeat_interval_ms: 5_000,
            staleness_multiplier: 3,
            dispatch_interval_ms: 250,
            max_pull_wait_ms: 30_000,
            max_runs: 10_000,
            finished_run_retention_ms: 3_600_000,
        }
    }
}

impl ControlConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval_ms(mut self, heartbeat_interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = heartbeat_interval_ms;
        self
    }

    pub fn with_dispatch_interval_ms(mut self, dispatch_interval_ms: u64) -> Self {
        self.dispatch_interval_ms = dispatch_interval_ms;
        self
    }

    pub fn with_max_runs(mut self, max_runs: usize) -> Self {
        self.max_runs = max_runs;
        self
    }

    pub fn with_finished_run_retention_ms(mut self, finished_run_retention_ms: u64) -> Self {
        self.finished_run_retention_ms = finished_run_retention_ms;
        self
    }

    pub fn finished_run_retention(&self) -> Duration {
        Duration::from_millis(self.finished_run_retention_ms)
    }

    /// Heartbeat age after which a node is considered gone.
    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_interval_ms
                .saturating_mul(u64::from(self.staleness_multiplier)),
        )
    }
}

/// Worker node settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub node_id: String,
    /// Base URL of the control plane, e.g. `http://127.0.0.1:7070`
    pub control_url: String,
    /// Maximum number of runs executing at once on this node
    pub max_concurrent: usize,
    /// Labels matched against placement constraints
    pub metadata: HashMap<String, String>,
    pub heartbeat_interval_ms: u64,
    /// Long-poll wait requested on each lease pull
    pub pull_wait_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// How long in-flight runs may keep going after shutdown is requested
    pub drain_timeout_ms: u64,
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            control_url: "http://127.0.0.1:7070".to_string(),
            max_concurrent: 4,
            metadata: HashMap::new(),
            heartbeat_interval_ms: 5_000,
            pull_wait_ms: 10_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            drain_timeout_ms: 60_000,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(node_id: impl Into<String>, control_url: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            control_url: control_url.into(),
            ..Default::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, heartbeat_interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = heartbeat_interval_ms;
        self
    }

    pub fn with_pull_wait_ms(mut self, pull_wait_ms: u64) -> Self {
        self.pull_wait_ms = pull_wait_ms;
        self
    }

    pub fn with_reconnect_ms(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.reconnect_base_ms = base_ms;
        self.reconnect_max_ms = max_ms;
        self
    }

    pub fn with_drain_timeout_ms(mut self, drain_timeout_ms: u64) -> Self {
        self.drain_timeout_ms = drain_timeout_ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pull_wait(&self) -> Duration {
        Duration::from_millis(self.pull_wait_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Backoff used when the control plane cannot be reached.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            u32::MAX,
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
        .with_jitter(true)
    }
}

/// Settings for the receive → execute → dispose loop.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Messages pulled per receive call
    pub max_messages: usize,
    /// Bounded wait of a single receive call
    pub max_wait_ms: u64,
    /// Deliveries allowed before a message is treated as poison
    pub max_delivery_count: u32,
    /// Agent that every message body is handed to
    pub agent: AgentSpec,
}

impl PipelineConfig {
    pub fn new(agent: AgentSpec) -> Self {
        Self {
            max_messages: 10,
            max_wait_ms: 5_000,
            max_delivery_count: 10,
            agent,
        }
    }

    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count;
        self
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_max_wait_ms(mut self, max_wait_ms: u64) -> Self {
        self.max_wait_ms = max_wait_ms;
        self
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Retry and transport settings for outbound HTTP delivery.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub endpoint: String,
    /// Retries after the first attempt
    pub max_retry_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Adds up to 20% of the computed delay on top of it
    pub use_jitter: bool,
    pub request_timeout_ms: u64,
    /// Fixed seed for the jitter source; `None` seeds from entropy
    pub jitter_seed: Option<u64>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/results".to_string(),
            max_retry_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            use_jitter: true,
            request_timeout_ms: 30_000,
            jitter_seed: None,
        }
    }
}

impl DeliveryConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_retries(mut self, max_retry_attempts: u32) -> Self {
        self.max_retry_attempts = max_retry_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    pub fn with_request_timeout_ms(mut self, request_timeout_ms: u64) -> Self {
        self.request_timeout_ms = request_timeout_ms;
        self
    }
}
