use clap::{Parser, ValueEnum};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use agent_fleet::agent::AgentSpec;
use agent_fleet::client::ControlClient;
use agent_fleet::config::{ControlConfig, SandboxConfig, WorkerConfig};
use agent_fleet::node::{ControlNode, WorkerNode};
use agent_fleet::protocol::CreateRunRequest;
use agent_fleet::scheduler::Run;
use agent_fleet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "agent-fleet")]
#[command(version)]
#[command(about = "Least-loaded scheduling and sandboxed execution of agent runs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the control plane (registry, scheduler, lease API)
    Control(ControlArgs),

    /// Start a worker node
    Worker(WorkerArgs),

    /// Agent definition commands
    Agent {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Run management commands
    Run {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: RunCommands,
    },

    /// Fleet inspection commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ControlArgs {
    /// Address to serve the control API on
    #[arg(long, default_value = "127.0.0.1:7070")]
    listen: SocketAddr,

    /// Interval at which workers are expected to heartbeat
    #[arg(long, default_value = "5000")]
    heartbeat_interval_ms: u64,

    /// How often pending runs are placed
    #[arg(long, default_value = "250")]
    dispatch_interval_ms: u64,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Unique node identifier
    #[arg(long)]
    node_id: String,

    /// Control plane base URL
    #[arg(long, default_value = "http://127.0.0.1:7070")]
    control_url: String,

    /// Maximum number of runs executing at once
    #[arg(long, default_value = "4")]
    max_concurrent: usize,

    /// Labels matched against run constraints (format: "key=value,key=value")
    #[arg(long, default_value = "")]
    labels: String,

    /// Program launched for each execution
    #[arg(long, default_value = "agent-host")]
    sandbox_program: String,

    /// Arguments passed to the sandbox program
    #[arg(long, num_args = 0.., allow_hyphen_values = true)]
    sandbox_arg: Vec<String>,

    /// Seconds added to each agent's duration budget before the process tree is killed
    #[arg(long, default_value = "5")]
    grace_seconds: u64,

    /// Heartbeat interval
    #[arg(long, default_value = "5000")]
    heartbeat_interval_ms: u64,

    /// Time in-flight runs may keep going after shutdown is requested
    #[arg(long, default_value = "60")]
    drain_timeout_seconds: u64,
}

// =============================================================================
// Client Arguments (shared by agent, run and cluster commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Control plane base URL
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:7070")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum AgentCommands {
    /// Register an agent definition from a JSON file
    Register {
        /// Path to the agent definition
        file: PathBuf,
    },
}

#[derive(clap::Subcommand, Debug)]
enum RunCommands {
    /// Create a run of a registered agent version
    Create {
        agent_id: String,
        version: String,

        /// Input handed to the agent
        #[arg(long, default_value = "")]
        input: String,

        /// Placement constraints (format: "key=value,key=value")
        #[arg(long, default_value = "")]
        constraints: String,
    },
    /// Get status of a specific run
    Status {
        /// The run ID (UUID)
        run_id: Uuid,
    },
    /// List all runs
    List,
    /// Cancel a run that has not finished
    Cancel {
        /// The run ID (UUID)
        run_id: Uuid,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// List registered nodes
    Nodes,
    /// Show free slots per node
    Load,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn parse_labels(labels: &str) -> HashMap<String, String> {
    labels
        .split(',')
        .filter(|pair| !pair.trim().is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=').or_else(|| {
                tracing::warn!(pair, "Invalid label format, expected key=value");
                None
            })?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_run(run: &Run) {
    println!("Run ID:    {}", run.run_id);
    println!("Agent:     {}@{}", run.agent_id, run.version);
    println!("Status:    {}", run.status);
    if let Some(node_id) = &run.node_id {
        println!("Node:      {}", node_id);
    }
    if run.costs.tokens > 0 || run.costs.usd > 0.0 {
        println!("Tokens:    {}", run.costs.tokens);
        println!("Cost:      ${:.4}", run.costs.usd);
    }
    if let Some(output) = &run.output {
        println!("Output:");
        for line in output.lines() {
            println!("  {}", line);
        }
    }
    if let Some(error) = &run.error_info {
        println!("Error:");
        for line in error.message.lines() {
            println!("  {}", line);
        }
        if let Some(code) = &error.code {
            println!("Code:      {}", code);
        }
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_control(args: ControlArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ControlConfig::new(args.listen)
        .with_heartbeat_interval_ms(args.heartbeat_interval_ms)
        .with_dispatch_interval_ms(args.dispatch_interval_ms);

    let shutdown = install_shutdown_handler();
    ControlNode::new(config).run(shutdown).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let sandbox = SandboxConfig::new(args.sandbox_program)
        .with_args(args.sandbox_arg)
        .with_grace_period_ms(args.grace_seconds.saturating_mul(1_000));

    let mut config = WorkerConfig::new(args.node_id, args.control_url)
        .with_max_concurrent(args.max_concurrent)
        .with_sandbox(sandbox)
        .with_heartbeat_interval_ms(args.heartbeat_interval_ms)
        .with_drain_timeout_ms(args.drain_timeout_seconds.saturating_mul(1_000));
    config.metadata = parse_labels(&args.labels);

    let shutdown = install_shutdown_handler();
    WorkerNode::new(config).run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_agent(
    client: &ControlClient,
    command: AgentCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        AgentCommands::Register { file } => {
            let raw = tokio::fs::read_to_string(&file).await?;
            let spec: AgentSpec = serde_json::from_str(&raw)?;
            let spec = client.register_agent(&spec).await?;
            match output {
                OutputFormat::Json => print_json(&spec)?,
                OutputFormat::Table => {
                    println!("Agent registered: {}@{}", spec.agent_id, spec.version);
                }
            }
        }
    }
    Ok(())
}

async fn handle_run(
    client: &ControlClient,
    command: RunCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        RunCommands::Create {
            agent_id,
            version,
            input,
            constraints,
        } => {
            let request = CreateRunRequest {
                agent_id,
                version,
                input,
                constraints: parse_labels(&constraints),
            };
            let run = client.create_run(&request).await?;
            match output {
                OutputFormat::Json => print_json(&run)?,
                OutputFormat::Table => {
                    println!("Run created successfully!");
                    println!("Run ID: {}", run.run_id);
                }
            }
        }
        RunCommands::Status { run_id } => {
            let run = client.get_run(run_id).await?;
            match output {
                OutputFormat::Json => print_json(&run)?,
                OutputFormat::Table => print_run(&run),
            }
        }
        RunCommands::Cancel { run_id } => {
            let run = client.cancel_run(run_id).await?;
            match output {
                OutputFormat::Json => print_json(&run)?,
                OutputFormat::Table => println!("Run {} is now {}", run.run_id, run.status),
            }
        }
        RunCommands::List => {
            let runs = client.list_runs().await?;
            match output {
                OutputFormat::Json => print_json(&runs)?,
                OutputFormat::Table => {
                    if runs.is_empty() {
                        println!("No runs found.");
                        return Ok(());
                    }
                    println!("{:<38} {:<11} {:<12} AGENT", "RUN ID", "STATUS", "NODE");
                    println!("{}", "-".repeat(78));
                    for run in &runs {
                        println!(
                            "{:<38} {:<11} {:<12} {}@{}",
                            run.run_id,
                            run.status,
                            run.node_id.as_deref().unwrap_or("-"),
                            run.agent_id,
                            run.version
                        );
                    }
                    println!();
                    println!("{} runs", runs.len());
                }
            }
        }
    }
    Ok(())
}

async fn handle_cluster(
    client: &ControlClient,
    command: ClusterCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ClusterCommands::Nodes => {
            let nodes = client.list_nodes().await?;
            match output {
                OutputFormat::Json => print_json(&nodes)?,
                OutputFormat::Table => {
                    println!("{:<16} {:<8} {:<8} {:<8} LAST HEARTBEAT", "NODE", "STATE", "ACTIVE", "FREE");
                    println!("{}", "-".repeat(70));
                    for node in nodes {
                        let icon = if node.is_failed() { "[-]" } else { "[+]" };
                        println!(
                            "{:<16} {:<8} {:<8} {:<8} {} {}",
                            node.node_id,
                            node.status.state,
                            node.status.active_runs,
                            node.status.available_slots,
                            icon,
                            node.heartbeat_at.to_rfc3339()
                        );
                    }
                }
            }
        }
        ClusterCommands::Load => {
            let load = client.node_load().await?;
            match output {
                OutputFormat::Json => print_json(&load)?,
                OutputFormat::Table => {
                    println!("{:<16} {:<8} {:<8} PLACEABLE", "NODE", "TOTAL", "FREE");
                    println!("{}", "-".repeat(45));
                    for (node_id, l) in load {
                        println!(
                            "{:<16} {:<8} {:<8} {}",
                            node_id,
                            l.total_slots,
                            l.available_slots,
                            if l.has_capacity { "yes" } else { "no" }
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Control(control_args) => run_control(control_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Agent { client, command } => {
            let http = ControlClient::new(client.addr.clone());
            handle_agent(&http, command, &client.output).await?;
        }
        Commands::Run { client, command } => {
            let http = ControlClient::new(client.addr.clone());
            handle_run(&http, command, &client.output).await?;
        }
        Commands::Cluster { client, command } => {
            let http = ControlClient::new(client.addr.clone());
            handle_cluster(&http, command, &client.output).await?;
        }
    }

    Ok(())
}
