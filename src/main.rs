use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cnc_conductor::config::{LeadershipConfig, MachineSpec, WorkerConfig};
use cnc_conductor::node::Node;
use cnc_conductor::shutdown::install_shutdown_handler;
use cnc_conductor::store::{LockStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "cnc-conductor")]
#[command(version)]
#[command(about = "Leader-elected background worker for a CNC machine fleet")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a worker process (competes for leadership)
    Worker(WorkerArgs),

    /// Inspect the leadership lease
    Lock(LockArgs),
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Owner id written into the lock row (random when omitted)
    #[arg(long, env = "CONDUCTOR_WORKER_ID")]
    worker_id: Option<String>,

    /// SQLite database shared by all workers (in-memory when omitted)
    #[arg(long, env = "CONDUCTOR_DATABASE")]
    database: Option<PathBuf>,

    /// Port for the HTTP dashboard and bridge callbacks (optional)
    #[arg(long, env = "CONDUCTOR_DASHBOARD_PORT")]
    dashboard_port: Option<u16>,

    #[arg(long, env = "CONDUCTOR_LOCK_NAME", default_value = "bg-worker")]
    lock_name: String,

    /// Lease ttl in seconds
    #[arg(long, env = "CONDUCTOR_TTL_SECS", default_value = "60")]
    ttl_secs: u64,

    /// Lease renewal interval in seconds
    #[arg(long, env = "CONDUCTOR_HEARTBEAT_SECS", default_value = "20")]
    heartbeat_secs: u64,

    /// Acquisition retry interval in seconds
    #[arg(long, env = "CONDUCTOR_RETRY_SECS", default_value = "5")]
    retry_secs: u64,

    /// Shared secret bridge callbacks must present in X-Bridge-Secret
    #[arg(long, env = "CONDUCTOR_BRIDGE_SECRET")]
    bridge_secret: Option<String>,

    /// Machines to register on takeover (comma-separated, format: "id[:diameter]")
    /// Example: "M1:8,M2:10,M3"
    #[arg(long, env = "CONDUCTOR_MACHINES", value_delimiter = ',')]
    machines: Vec<MachineSpec>,
}

#[derive(Parser, Debug)]
struct LockArgs {
    /// SQLite database shared by all workers
    #[arg(long, env = "CONDUCTOR_DATABASE")]
    database: PathBuf,

    #[arg(long, env = "CONDUCTOR_LOCK_NAME", default_value = "bg-worker")]
    lock_name: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct LockOutput {
    name: String,
    owner: Option<String>,
    expires_at: Option<String>,
    held: bool,
}

// =============================================================================
// Worker
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let mut config = match args.worker_id {
        Some(id) => WorkerConfig::new(id),
        None => WorkerConfig::default(),
    };
    config = config
        .with_leadership(LeadershipConfig {
            lock_name: args.lock_name,
            ttl: Duration::from_secs(args.ttl_secs),
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            retry_interval: Duration::from_secs(args.retry_secs),
            ..LeadershipConfig::default()
        })
        .with_machines(args.machines);
    if let Some(path) = args.database {
        config = config.with_database(path);
    }
    if let Some(addr) = dashboard_addr {
        config = config.with_dashboard(addr);
    }
    config.bridge.shared_secret = args.bridge_secret;

    tracing::info!(
        worker_id = %config.worker_id,
        lock = %config.leadership.lock_name,
        database = ?config.database_path,
        dashboard_addr = ?config.dashboard_addr,
        machines = ?config.machines.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        "Starting cnc-conductor worker"
    );

    let shutdown = install_shutdown_handler(&config.worker_id)?;
    let (node, completions) = Node::new(config)?;

    if let Err(e) = node.run(completions, shutdown).await {
        tracing::error!(error = %e, fatal = e.is_fatal(), "Worker stopped");
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Lock inspection
// =============================================================================

async fn show_lock(args: LockArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteStore::open(&args.database)?;
    let row = store.get_lock(&args.lock_name).await?;
    let now = chrono::Utc::now();

    let output = LockOutput {
        name: args.lock_name.clone(),
        owner: row.as_ref().and_then(|r| r.owner.clone()),
        expires_at: row.as_ref().map(|r| r.expires_at.to_rfc3339()),
        held: row.as_ref().is_some_and(|r| r.is_held_at(now)),
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => {
            println!("Lock:       {}", output.name);
            println!("Owner:      {}", output.owner.as_deref().unwrap_or("-"));
            println!("Expires At: {}", output.expires_at.as_deref().unwrap_or("-"));
            println!("Held:       {}", if output.held { "yes" } else { "no" });
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
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Lock(lock_args) => show_lock(lock_args).await?,
    }

    Ok(())
}
