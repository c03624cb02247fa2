use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use stevedore::api::ApiClient;
use stevedore::config::{NodeConfig, PeerConfig};
use stevedore::model::JobSpec;
use stevedore::node::Node;
use stevedore::registry::ServiceQuery;
use stevedore::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "stevedore")]
#[command(version)]
#[command(about = "Cluster orchestrator with Raft-replicated scheduling and service discovery")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a stevedore agent (server and client in one process)
    Agent(AgentArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Node commands
    Node {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Service discovery commands
    Catalog {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: CatalogCommands,
    },

    /// Cluster operator commands
    Operator {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: OperatorCommands,
    },
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// TOML configuration file; flags override its values
    #[arg(long, short = 'c', env = "STEVEDORE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    node_id: Option<u64>,

    #[arg(long)]
    node_name: Option<String>,

    #[arg(long)]
    datacenter: Option<String>,

    /// gRPC listen address for cluster traffic
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// RPC address advertised to peers
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Control API listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Static voters, comma-separated "id:host:port"
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// RPC addresses probed while discovering the cluster
    #[arg(long, value_delimiter = ',')]
    retry_join: Vec<String>,

    #[arg(long)]
    bootstrap_expect: Option<usize>,

    #[arg(long, env = "STEVEDORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Default image for the docker driver
    #[arg(long)]
    image: Option<String>,

    /// Only take part in consensus; run no allocations
    #[arg(long)]
    server_only: bool,
}

// =============================================================================
// Client Arguments (shared by every API command)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Control API address of any agent
    #[arg(long, short = 'a', env = "STEVEDORE_ADDR", default_value = "127.0.0.1:4646")]
    addr: String,

    /// ACL token
    #[arg(long, env = "STEVEDORE_TOKEN")]
    token: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

impl ClientArgs {
    fn client(&self) -> ApiClient {
        ApiClient::new(&self.addr).with_token(self.token.clone())
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit or update a job from a JSON or TOML file
    Run {
        file: PathBuf,
        /// Idempotency key; reuse it to retry safely
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Show a job and its allocations
    Status { job_id: String },
    /// List all jobs
    List,
    /// Dispatch a parameterized job
    Dispatch {
        job_id: String,
        /// Meta values as KEY=VALUE
        #[arg(long = "meta", short = 'm', value_parser = parse_meta)]
        meta: Vec<(String, String)>,
        #[arg(long)]
        request_id: Option<String>,
    },
    /// List a job's allocations
    Allocs { job_id: String },
    /// Stop a job
    Stop { job_id: String },
}

#[derive(clap::Subcommand, Debug)]
enum NodeCommands {
    /// List client nodes
    List,
}

#[derive(clap::Subcommand, Debug)]
enum CatalogCommands {
    /// List registered services
    Services,
    /// Show instances of one service
    Service {
        name: String,
        #[arg(long)]
        tag: Option<String>,
        /// Only instances with every check passing
        #[arg(long)]
        passing: bool,
        /// Include critical and stopped instances
        #[arg(long)]
        all: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum OperatorCommands {
    /// Show the current leader
    Leader,
    /// Report agent health; exits 0 healthy, 1 degraded, 2 critical
    Health,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", raw))
}

fn parse_peers(peers: &[String]) -> Result<Vec<PeerConfig>, String> {
    peers
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|peer| {
            let (id, addr) = peer
                .trim()
                .split_once(':')
                .ok_or_else(|| format!("invalid peer {:?}, expected id:host:port", peer))?;
            let node_id = id
                .parse()
                .map_err(|_| format!("invalid peer id in {:?}", peer))?;
            Ok(PeerConfig {
                node_id,
                addr: addr.to_string(),
            })
        })
        .collect()
}

fn load_job(path: &Path) -> Result<JobSpec, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let spec = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        toml::from_str(&raw)?
    } else {
        serde_json::from_str(&raw)?
    };
    Ok(spec)
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn short_id(id: &uuid::Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

// =============================================================================
// Agent
// =============================================================================

fn agent_config(args: AgentArgs) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(id) = args.node_id {
        config.node_id = id;
    }
    if let Some(name) = args.node_name {
        config.node_name = name;
    }
    if let Some(dc) = args.datacenter {
        config.datacenter = dc;
    }
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    if args.advertise_addr.is_some() {
        config.advertise_addr = args.advertise_addr;
    }
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }
    if !args.peers.is_empty() {
        config.peers = parse_peers(&args.peers)?;
    }
    if !args.retry_join.is_empty() {
        config.retry_join = args.retry_join;
    }
    if let Some(expect) = args.bootstrap_expect {
        config.bootstrap_expect = expect;
    }
    if args.data_dir.is_some() {
        config.data_dir = args.data_dir;
    }
    if let Some(image) = args.image {
        config.client.sandbox.image = image;
    }
    if args.server_only {
        config.client.enabled = false;
    }
    config.check()?;
    Ok(config)
}

async fn run_agent(args: AgentArgs) -> CliResult {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = agent_config(args)?;
    tracing::info!(
        node_id = config.node_id,
        datacenter = %config.datacenter,
        listen_addr = %config.listen_addr,
        http_addr = %config.http_addr,
        bootstrap_expect = config.effective_bootstrap_expect(),
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        retry_join = ?config.retry_join,
        "Starting stevedore agent"
    );

    let shutdown = install_shutdown_handler()?;
    let handle = Node::new(config)?.start().await?;
    shutdown.graceful.cancelled().await;

    tokio::select! {
        result = handle.leave() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Could not record graceful leave");
            }
        }
        _ = shutdown.immediate.cancelled() => {}
    }
    if shutdown.immediate.is_cancelled() {
        let mut handle = handle;
        handle.kill();
        return Ok(());
    }
    tokio::select! {
        _ = handle.shutdown(Duration::from_secs(10)) => {}
        _ = shutdown.immediate.cancelled() => {}
    }
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job(client: &ClientArgs, command: JobCommands) -> CliResult {
    let api = client.client();
    match command {
        JobCommands::Run { file, request_id } => {
            let spec = load_job(&file)?;
            let resp = api.submit_job(&spec, request_id).await?;
            match client.output {
                OutputFormat::Json => print_json(&resp)?,
                OutputFormat::Table => {
                    println!("Job {:?} registered at index {}", resp.job_id, resp.index);
                }
            }
        }
        JobCommands::Status { job_id } => {
            let job = api.job(&job_id).await?;
            let allocs = api.allocations(&job_id).await?;
            match client.output {
                OutputFormat::Json => {
                    print_json(&serde_json::json!({ "job": job, "allocations": allocs }))?
                }
                OutputFormat::Table => {
                    println!("ID       = {}", job.spec.id);
                    println!("Type     = {}", job.spec.job_type);
                    println!("Status   = {}", job.status);
                    println!("Version  = {}", job.version);
                    if let Some(parent) = &job.parent_id {
                        println!("Parent   = {}", parent);
                    }
                    if let Some(blocked) = &job.blocked {
                        println!("Blocked  = {} ({})", blocked.reason_code(), blocked);
                    }
                    println!();
                    print_allocs(&allocs);
                }
            }
        }
        JobCommands::List => {
            let jobs = api.jobs().await?;
            match client.output {
                OutputFormat::Json => print_json(&jobs)?,
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{:<32} {:<8} {:<10} {:<8} BLOCKED", "ID", "TYPE", "STATUS", "VERSION");
                        for job in &jobs {
                            let kind = if job.parameterized {
                                "template".to_string()
                            } else {
                                job.job_type.to_string()
                            };
                            println!(
                                "{:<32} {:<8} {:<10} {:<8} {}",
                                job.id,
                                kind,
                                job.status,
                                job.version,
                                job.blocked.as_ref().map(|b| b.reason_code()).unwrap_or("-")
                            );
                        }
                    }
                }
            }
        }
        JobCommands::Dispatch {
            job_id,
            meta,
            request_id,
        } => {
            let meta: BTreeMap<String, String> = meta.into_iter().collect();
            let resp = api.dispatch(&job_id, meta, request_id).await?;
            match client.output {
                OutputFormat::Json => print_json(&resp)?,
                OutputFormat::Table => {
                    println!("Dispatched job {:?} at index {}", resp.job_id, resp.index);
                }
            }
        }
        JobCommands::Allocs { job_id } => {
            let allocs = api.allocations(&job_id).await?;
            match client.output {
                OutputFormat::Json => print_json(&allocs)?,
                OutputFormat::Table => print_allocs(&allocs),
            }
        }
        JobCommands::Stop { job_id } => {
            let resp = api.stop_job(&job_id).await?;
            match client.output {
                OutputFormat::Json => print_json(&resp)?,
                OutputFormat::Table => println!("Job {:?} stopped", resp.job_id),
            }
        }
    }
    Ok(())
}

fn print_allocs(allocs: &[stevedore::model::Allocation]) {
    if allocs.is_empty() {
        println!("No allocations.");
        return;
    }
    println!(
        "{:<10} {:<6} {:<6} {:<8} {:<8} {:<9} {:<8} MESSAGE",
        "ID", "SLOT", "NODE", "VERSION", "DESIRED", "STATUS", "RESTARTS"
    );
    for alloc in allocs {
        let desired = match alloc.desired {
            stevedore::model::DesiredStatus::Run => "run",
            stevedore::model::DesiredStatus::Stop => "stop",
        };
        println!(
            "{:<10} {:<6} {:<6} {:<8} {:<8} {:<9} {:<8} {}",
            short_id(&alloc.id),
            alloc.slot,
            alloc.node_id,
            alloc.job_version,
            desired,
            alloc.status,
            alloc.restarts,
            alloc.message.as_deref().unwrap_or("")
        );
    }
}

async fn handle_node(client: &ClientArgs, command: NodeCommands) -> CliResult {
    let api = client.client();
    match command {
        NodeCommands::List => {
            let nodes = api.nodes().await?;
            match client.output {
                OutputFormat::Json => print_json(&nodes)?,
                OutputFormat::Table => {
                    println!(
                        "{:<6} {:<16} {:<10} {:<8} {:<8} {:<14} ALLOCS",
                        "ID", "NAME", "DC", "CLASS", "STATUS", "CPU (used)"
                    );
                    for node in &nodes {
                        println!(
                            "{:<6} {:<16} {:<10} {:<8} {:<8} {:<14} {}",
                            node.id,
                            node.name,
                            node.datacenter,
                            node.class.as_deref().unwrap_or("-"),
                            node.status,
                            format!("{}/{}", node.used.cpu, node.resources.cpu),
                            node.allocations
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_catalog(client: &ClientArgs, command: CatalogCommands) -> CliResult {
    let api = client.client();
    match command {
        CatalogCommands::Services => {
            let services = api.catalog_services().await?;
            match client.output {
                OutputFormat::Json => print_json(&services)?,
                OutputFormat::Table => {
                    for (name, tags) in &services {
                        let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                        println!("{:<24} {}", name, tags.join(","));
                    }
                }
            }
        }
        CatalogCommands::Service {
            name,
            tag,
            passing,
            all,
        } => {
            let query = ServiceQuery { tag, passing, all };
            let instances = api.catalog_service(&name, &query).await?;
            match client.output {
                OutputFormat::Json => print_json(&instances)?,
                OutputFormat::Table => {
                    println!("{:<16} {:<22} {:<10} {:<9} TAGS", "NODE", "ADDRESS", "ALLOC", "HEALTH");
                    for i in &instances {
                        println!(
                            "{:<16} {:<22} {:<10} {:<9} {}",
                            i.node_name,
                            format!("{}:{}", i.service.address, i.service.port),
                            short_id(&i.alloc_id),
                            i.status,
                            i.service.tags.join(",")
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

/// Returns the process exit code.
async fn handle_operator(client: &ClientArgs, command: OperatorCommands) -> Result<i32, Box<dyn std::error::Error>> {
    let api = client.client();
    match command {
        OperatorCommands::Leader => {
            let leader = api.leader().await?;
            match client.output {
                OutputFormat::Json => print_json(&leader)?,
                OutputFormat::Table => match leader.leader_id {
                    Some(id) => println!("Node {} at {}", id, leader.address),
                    None => println!("No leader"),
                },
            }
            Ok(if leader.leader_id.is_some() { 0 } else { 1 })
        }
        OperatorCommands::Health => match api.health().await {
            Ok(report) => {
                match client.output {
                    OutputFormat::Json => print_json(&report)?,
                    OutputFormat::Table => println!(
                        "{} (leader {:?}, applied index {}, last contact {}ms)",
                        report.status, report.leader_id, report.applied_index, report.last_contact_ms
                    ),
                }
                Ok(report.code as i32)
            }
            Err(e) => {
                eprintln!("critical: {}", e);
                Ok(2)
            }
        },
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> CliResult {
    let args = Args::parse();

    let result = match args.command {
        Commands::Agent(agent_args) => run_agent(agent_args).await,
        Commands::Job { client, command } => handle_job(&client, command).await,
        Commands::Node { client, command } => handle_node(&client, command).await,
        Commands::Catalog { client, command } => handle_catalog(&client, command).await,
        Commands::Operator { client, command } => {
            let code = handle_operator(&client, command).await?;
            std::process::exit(code);
        }
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
