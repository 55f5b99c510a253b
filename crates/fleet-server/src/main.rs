// ============================================
// File: crates/fleet-server/src/main.rs
// ============================================
//! # Fleet Control Plane Entry Point
//!
//! ## Creation Reason
//! Operator binary for the control plane. Handles CLI parsing, logging
//! setup, configuration loading and dispatch to [`ControlPlane`].
//!
//! ## Main Functionality
//! - CLI argument parsing with clap
//! - Logging initialization with tracing
//! - One-shot administration commands against the configured store
//! - Long-running `serve` with background status polling
//!
//! ## Usage
//! ```bash
//! fleet-server validate
//! fleet-server node add --name "HK 1" --url https://hk1.example:2053 --username admin --password-env HK1_PW
//! fleet-server node test hk-1
//! fleet-server batch --file disable-inbound.json --yes
//! fleet-server jobs retry <JOB_ID> --group-by server_error
//! fleet-server vault rotate --version 2 --key-env FLEET_VAULT_KEY_V2
//! fleet-server vault retire --version 1
//! fleet-server serve
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Passwords are read from environment variables, never from argv
//! - `batch --yes` issues and spends a confirmation token in one go
//! - After `vault rotate`, move the old key under `[[vault.previous]]`
//!   and set the new one as current before the next start
//!
//! ## Last Modified
//! v0.1.0 - Initial CLI implementation

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleet_common::{JobId, NodeId};
use fleet_core::model::{BatchRequest, GroupBy, Job, NodeDraft, NodeHealth, NodeUpdate};
use fleet_server::config::resolve_material;
use fleet_server::services::{AuditFilter, JobFilter, RetryOptions};
use fleet_server::{ControlPlane, ServerConfig, ServerError};
use fleet_transport::PanelCredentials;

// ============================================
// CLI Definition
// ============================================

/// Fleet control plane for remote proxy panels
#[derive(Parser, Debug)]
#[command(name = "fleet-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "/etc/fleet/control.toml")]
    config: PathBuf,

    /// Actor recorded in the audit log
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane until Ctrl+C
    Serve,

    /// Validate configuration file
    Validate,

    /// Poll every node once and print the cluster snapshot
    Status,

    /// Manage nodes
    #[command(subcommand)]
    Node(NodeCommands),

    /// Execute a batch described by a JSON file
    Batch {
        /// Batch request file
        #[arg(short, long)]
        file: PathBuf,

        /// Confirm a high-risk batch without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect and re-drive job history
    #[command(subcommand)]
    Jobs(JobsCommands),

    /// Inspect the audit log
    #[command(subcommand)]
    Audit(AuditCommands),

    /// Credential vault maintenance
    #[command(subcommand)]
    Vault(VaultCommands),
}

#[derive(Subcommand, Debug)]
enum NodeCommands {
    /// Register a node
    Add(NodeAddArgs),

    /// List nodes
    List,

    /// Change a node's fields; omitted flags are left as they are
    Update(NodeUpdateArgs),

    /// Delete a node
    Remove {
        /// Node id
        id: NodeId,
    },

    /// Test a node's connection, optionally with new credentials
    Test {
        /// Node id
        id: NodeId,

        /// Replacement login user
        #[arg(long, requires = "password_env")]
        username: Option<String>,

        /// Environment variable holding the replacement password
        #[arg(long)]
        password_env: Option<String>,
    },

    /// Set operator health (e.g. maintenance)
    SetHealth {
        /// Node id
        id: NodeId,

        /// unknown, healthy, degraded, unreachable or maintenance
        health: NodeHealth,
    },
}

#[derive(Args, Debug)]
struct NodeAddArgs {
    /// Node id (generated if omitted)
    #[arg(long)]
    id: Option<NodeId>,

    /// Display name
    #[arg(long)]
    name: String,

    /// Panel base URL
    #[arg(long)]
    url: String,

    /// Panel login user
    #[arg(long)]
    username: String,

    /// Environment variable holding the panel password
    #[arg(long)]
    password_env: Option<String>,

    /// Grouping label
    #[arg(long)]
    group: Option<String>,

    /// Tags (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Environment label
    #[arg(long)]
    environment: Option<String>,
}

#[derive(Args, Debug)]
struct NodeUpdateArgs {
    /// Node id
    id: NodeId,

    /// Display name
    #[arg(long)]
    name: Option<String>,

    /// Panel base URL
    #[arg(long)]
    url: Option<String>,

    /// Panel login user
    #[arg(long)]
    username: Option<String>,

    /// Environment variable holding the new panel password
    #[arg(long)]
    password_env: Option<String>,

    /// Grouping label; empty clears it
    #[arg(long)]
    group: Option<String>,

    /// Replacement tags (repeatable)
    #[arg(long = "tag")]
    tags: Option<Vec<String>>,

    /// Environment label; empty clears it
    #[arg(long)]
    environment: Option<String>,
}

#[derive(Subcommand, Debug)]
enum JobsCommands {
    /// List jobs, newest first
    List {
        /// Page number
        #[arg(long, default_value_t = 1)]
        page: usize,

        /// Page size
        #[arg(long, default_value_t = 20)]
        per_page: usize,

        /// Only jobs touching this node
        #[arg(long)]
        node: Option<NodeId>,

        /// Only jobs with failures
        #[arg(long)]
        failed: bool,
    },

    /// Show one job with every result
    Show {
        /// Job id
        id: JobId,
    },

    /// Re-drive a job's failures as a child job
    Retry {
        /// Parent job id
        id: JobId,

        /// Re-drive every result, not just failures
        #[arg(long)]
        all: bool,

        /// none, server, error or server_error
        #[arg(long, default_value = "none")]
        group_by: GroupBy,

        /// Confirm a high-risk retry without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete one job
    Delete {
        /// Job id
        id: JobId,
    },

    /// Delete all job history
    Clear,
}

#[derive(Subcommand, Debug)]
enum AuditCommands {
    /// List audit events, newest first
    List {
        /// Maximum events
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Event type prefix, e.g. `batch.`
        #[arg(long)]
        event_type: Option<String>,

        /// Actor
        #[arg(long = "by")]
        by_actor: Option<String>,

        /// Node
        #[arg(long)]
        node: Option<NodeId>,
    },

    /// Delete all audit events
    Clear,
}

#[derive(Subcommand, Debug)]
enum VaultCommands {
    /// Install a new key version and re-seal every stored secret
    Rotate {
        /// New key version
        #[arg(long)]
        version: u32,

        /// Environment variable holding the base64 key material
        #[arg(long)]
        key_env: String,
    },

    /// Check that nothing is sealed under a previous key, then drop it
    Retire {
        /// Key version to drop
        #[arg(long)]
        version: u32,
    },
}

// ============================================
// Main
// ============================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = run(cli).await;

    if let Err(e) = result {
        // No-op when the command already installed a subscriber.
        init_logging("info");
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Validate = cli.command {
        init_logging("info");
        return cmd_validate(&cli.config).await;
    }

    let config = load_or_default_config(&cli.config).await?;
    init_logging(&config.logging.level);
    let plane = ControlPlane::new(config).await?;
    let actor = cli.actor.as_str();

    match cli.command {
        Commands::Validate => Ok(()),
        Commands::Serve => {
            plane.run().await?;
            Ok(())
        }
        Commands::Status => {
            let snapshot = plane.cluster_status().await;
            print_json(&snapshot)
        }
        Commands::Node(cmd) => cmd_node(&plane, actor, cmd).await,
        Commands::Batch { file, yes } => cmd_batch(&plane, actor, &file, yes).await,
        Commands::Jobs(cmd) => cmd_jobs(&plane, actor, cmd).await,
        Commands::Audit(cmd) => cmd_audit(&plane, actor, cmd).await,
        Commands::Vault(VaultCommands::Rotate { version, key_env }) => {
            let material = resolve_material("vault rotate", None, Some(&key_env))?;
            let report = plane.rotate_vault(actor, version, &material).await?;
            println!("✅ Vault key v{version} installed");
            println!("   Re-sealed:   {}", report.resealed);
            println!("   Current:     {}", report.current);
            println!("   Missing:     {}", report.missing);
            println!("   Unreadable:  {}", report.unreadable);
            println!();
            println!("Update [vault] to key_version = {version} and keep the old key under [[vault.previous]].");
            Ok(())
        }
        Commands::Vault(VaultCommands::Retire { version }) => {
            plane.retire_vault_key(actor, version).await?;
            println!("✅ No secret uses key v{version}; it can be removed from [[vault.previous]]");
            Ok(())
        }
    }
}

// ============================================
// Commands
// ============================================

/// Validates configuration file.
async fn cmd_validate(config_path: &Path) -> anyhow::Result<()> {
    if !config_path.exists() {
        println!("⚠️  Config file not found: {}", config_path.display());
        println!("   Server will use default values.");
        return Ok(());
    }

    let config = ServerConfig::load(config_path).await?;

    println!("✅ Configuration is valid");
    println!();
    println!("Store:");
    println!("   Backend:      {:?}", config.store.backend);
    println!("   Path:         {}", config.store.path.display());
    println!();
    println!("Vault:");
    println!("   Key version:  {}", config.vault.key_version);
    println!("   Previous:     {}", config.vault.previous.len());
    println!();
    println!("Engine:");
    println!("   Concurrency:  {}", config.engine.concurrency);
    println!("   Node timeout: {}s", config.engine.node_timeout_secs);
    println!();
    println!("Risk:");
    println!("   Threshold:    {} nodes", config.risk.cardinality_threshold);
    println!("   Token TTL:    {}s", config.risk.token_ttl_secs);
    println!();

    Ok(())
}

async fn cmd_node(plane: &ControlPlane, actor: &str, cmd: NodeCommands) -> anyhow::Result<()> {
    match cmd {
        NodeCommands::Add(args) => {
            let password = args.password_env.as_deref().map(read_secret_env).transpose()?;
            let draft = NodeDraft {
                name: args.name,
                base_url: args.url,
                username: args.username,
                password,
                group: args.group,
                tags: args.tags,
                environment: args.environment,
            };
            let node = plane.add_node(actor, args.id, &draft).await?;
            println!("✅ Node {} registered (credential {:?})", node.id, node.credential_status);
            Ok(())
        }
        NodeCommands::List => {
            let nodes = plane.registry().list().await?;
            if nodes.is_empty() {
                println!("No nodes registered");
            }
            for node in nodes {
                println!(
                    "{:<20} {:<12} {:<24} {}",
                    node.id, node.health, node.name, node.base_url
                );
            }
            Ok(())
        }
        NodeCommands::Update(args) => {
            let update = NodeUpdate {
                name: args.name,
                base_url: args.url,
                username: args.username,
                password: args.password_env.as_deref().map(read_secret_env).transpose()?,
                group: args.group,
                tags: args.tags,
                environment: args.environment,
            };
            let node = plane.update_node(actor, &args.id, &update).await?;
            println!("✅ Node {} updated", node.id);
            Ok(())
        }
        NodeCommands::Remove { id } => {
            let node = plane.remove_node(actor, &id).await?;
            println!("✅ Node {} ({}) removed", node.id, node.name);
            Ok(())
        }
        NodeCommands::Test {
            id,
            username,
            password_env,
        } => {
            let credentials = match (username, password_env) {
                (Some(username), Some(var)) => Some(PanelCredentials {
                    username,
                    password: read_secret_env(&var)?,
                }),
                (None, Some(var)) => {
                    let node = plane.registry().get(&id).await?;
                    Some(PanelCredentials {
                        username: node.username,
                        password: read_secret_env(&var)?,
                    })
                }
                _ => None,
            };
            let report = plane.test_node(actor, &id, credentials).await?;
            if report.is_ok() {
                println!("✅ {} is {}", id, report.health);
            } else {
                println!(
                    "❌ {} is {}: {}",
                    id,
                    report.health,
                    report.error.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(())
        }
        NodeCommands::SetHealth { id, health } => {
            plane.set_node_health(actor, &id, health).await?;
            println!("✅ Node {id} set to {health}");
            Ok(())
        }
    }
}

async fn cmd_batch(plane: &ControlPlane, actor: &str, file: &Path, yes: bool) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let request: BatchRequest =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", file.display()))?;
    let request = request.with_actor(actor);

    let job = execute_confirmed(plane, actor, request, yes).await?;
    print_job(&job)
}

/// Executes, confirming once with a fresh token when allowed.
async fn execute_confirmed(
    plane: &ControlPlane,
    actor: &str,
    request: BatchRequest,
    yes: bool,
) -> anyhow::Result<Job> {
    match plane.execute(request.clone()).await {
        Err(ServerError::ConfirmationRequired { action, targets }) if yes => {
            info!(action = %action, targets, "Confirming high-risk batch");
            let token = plane.issue_risk_token(actor, &request).await?;
            Ok(plane.execute(request.with_confirm_token(token.token)).await?)
        }
        Err(ServerError::ConfirmationRequired { action, targets }) => {
            anyhow::bail!("{action} on {targets} node(s) is high risk; re-run with --yes to confirm")
        }
        other => Ok(other?),
    }
}

async fn cmd_jobs(plane: &ControlPlane, actor: &str, cmd: JobsCommands) -> anyhow::Result<()> {
    match cmd {
        JobsCommands::List {
            page,
            per_page,
            node,
            failed,
        } => {
            let filter = JobFilter {
                node,
                has_failures: failed.then_some(true),
                ..JobFilter::default()
            };
            let page = plane.list_jobs(&filter, page, per_page).await?;
            println!("{} job(s), page {}", page.total, page.page);
            for job in page.items {
                println!(
                    "{}  {}.{:<14} total={} success={} skipped={} failed={}",
                    job.id,
                    job.domain,
                    job.action,
                    job.summary.total,
                    job.summary.success,
                    job.summary.skipped,
                    job.summary.failed
                );
            }
            Ok(())
        }
        JobsCommands::Show { id } => print_json(&plane.job(&id).await?),
        JobsCommands::Retry {
            id,
            all,
            group_by,
            yes,
        } => {
            let mut options = RetryOptions {
                failed_only: !all,
                group_by,
                actor: actor.to_string(),
                confirm_token: None,
            };
            let job = match plane.retry(&id, &options).await {
                Err(ServerError::ConfirmationRequired { .. }) if yes => {
                    let parent = plane.job(&id).await?;
                    let plan = fleet_server::services::retry::plan_retry(&parent, &options)?;
                    options.confirm_token = Some(plane.issue_risk_token(actor, &plan.request).await?.token);
                    plane.retry(&id, &options).await?
                }
                other => other?,
            };
            print_job(&job)
        }
        JobsCommands::Delete { id } => {
            plane.delete_job(actor, &id).await?;
            println!("✅ Job {id} deleted");
            Ok(())
        }
        JobsCommands::Clear => {
            let removed = plane.clear_jobs(actor).await?;
            println!("✅ {removed} job(s) deleted");
            Ok(())
        }
    }
}

async fn cmd_audit(plane: &ControlPlane, actor: &str, cmd: AuditCommands) -> anyhow::Result<()> {
    match cmd {
        AuditCommands::List {
            limit,
            event_type,
            by_actor,
            node,
        } => {
            let filter = AuditFilter {
                event_type,
                actor: by_actor,
                server_id: node,
                outcome: None,
            };
            for event in plane.list_audit(&filter, limit).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(())
        }
        AuditCommands::Clear => {
            let removed = plane.clear_audit(actor).await?;
            println!("✅ {removed} audit event(s) deleted");
            Ok(())
        }
    }
}

// ============================================
// Helper Functions
// ============================================

/// Initializes the tracing subscriber.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .ok();
}

/// Loads config or returns default.
async fn load_or_default_config(path: &Path) -> anyhow::Result<ServerConfig> {
    if path.exists() {
        Ok(ServerConfig::load(path).await?)
    } else {
        eprintln!("Config file not found, using defaults");
        Ok(ServerConfig::default())
    }
}

fn read_secret_env(var: &str) -> anyhow::Result<String> {
    std::env::var(var).with_context(|| format!("environment variable {var} is not set"))
}

fn print_job(job: &Job) -> anyhow::Result<()> {
    println!(
        "Job {}: total={} success={} skipped={} failed={}{}",
        job.id,
        job.summary.total,
        job.summary.success,
        job.summary.skipped,
        job.summary.failed,
        if job.cancelled { " (cancelled)" } else { "" }
    );
    for result in job.failed_results() {
        println!(
            "   {} {}: {}",
            result.server_id,
            result.scope,
            result.error.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
