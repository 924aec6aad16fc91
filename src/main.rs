//! Hypnos - memory lifecycle engine
//!
//! Command-line entry point: run the background worker, trigger sleep and
//! think cycles by hand, and inspect or steer individual memories and tasks.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use hypnos_core::{
    ConnectionMode, Decision, Direction, Domain, HypnosConfig, LibsqlStorage, LifecycleEngine,
    LlmService, MemoryDraft, MemoryId, Priority, ReasoningOracle, RelationshipType, TaskId,
    TaskStatus, TemporalLayer, ThinkOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hypnos")]
#[command(about = "Layered agent memory with sleep-cycle consolidation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Database path (overrides HYPNOS_DB_PATH, the config file and the default)
    #[arg(long, env = "HYPNOS_DB_PATH")]
    db_path: Option<String>,

    /// Configuration file (default: $XDG_CONFIG_HOME/hypnos/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and apply migrations
    Init,

    /// Run the sleep and think cycles until interrupted
    Worker,

    /// Run one sleep cycle now
    Sleep {
        /// Maximum memories to review (default: worker.consolidation.batch_size)
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Ask the oracle but apply nothing
        #[arg(long)]
        dry_run: bool,

        /// Output format (text/json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run one think tick now
    Think {
        /// Maximum tasks to process (default: worker.think.batch_size)
        #[arg(short, long)]
        max_tasks: Option<usize>,

        /// Output format (text/json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List memories awaiting review
    Pending,

    /// Record a manual review decision
    Decide {
        /// Memory ID
        memory_id: String,

        /// promote|extend|archive|forget
        decision: Decision,

        /// Why the decision was made
        #[arg(short, long, default_value = "")]
        reason: String,

        /// Who made the decision
        #[arg(long, default_value = "manual")]
        reviewer: String,
    },

    /// Queue a topic for the think cycle
    Enqueue {
        /// Topic to reflect on
        topic: String,

        /// low|medium|high|urgent
        #[arg(short, long, default_value = "medium")]
        priority: Priority,

        /// Additional context for the reflection
        #[arg(long, default_value = "")]
        context: String,

        /// Memory that prompted the thought
        #[arg(long)]
        source: Option<String>,

        /// When the thought is due, RFC 3339 (e.g. 2026-11-02T09:00:00Z)
        #[arg(long)]
        due_at: Option<DateTime<Utc>>,
    },

    /// List think tasks
    Tasks {
        /// pending|in_progress|complete|postponed
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Maximum results
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Hold a pending think task back from scheduling
    Postpone {
        /// Task ID
        task_id: String,
    },

    /// Return a postponed think task to the queue
    ResetTask {
        /// Task ID
        task_id: String,
    },

    /// Walk the relationship graph from a memory
    Chain {
        /// Root memory ID
        memory_id: String,

        /// Relationship types to follow (comma-separated; default: all)
        #[arg(short, long, value_delimiter = ',')]
        types: Vec<RelationshipType>,

        /// forward|backward|both
        #[arg(short, long, default_value = "forward")]
        direction: Direction,
    },

    /// Link two memories
    Link {
        /// Source memory ID
        from: String,

        /// Target memory ID
        to: String,

        /// Relationship type
        #[arg(short = 'y', long = "type", default_value = "related_to")]
        relationship_type: RelationshipType,

        /// Why the memories are related
        #[arg(short, long, default_value = "")]
        reason: String,
    },

    /// Replace a memory's content with a new version
    Revise {
        /// Memory ID (must be the current version)
        memory_id: String,

        /// New content
        #[arg(short, long)]
        content: String,

        /// Why it changed
        #[arg(short, long, default_value = "revised")]
        reason: String,
    },

    /// Store a new memory
    Remember {
        /// Content to remember
        #[arg(short, long)]
        content: String,

        /// working|short|long|archive
        #[arg(long, default_value = "working")]
        layer: TemporalLayer,

        /// Hours until the memory expires (working default 24, short default 168)
        #[arg(long)]
        ttl_hours: Option<i64>,

        /// self|user|projects|world|system|general
        #[arg(short, long, default_value = "general")]
        domain: Domain,

        /// Importance in [0, 1]
        #[arg(short, long, default_value = "0.5")]
        importance: f32,

        /// Tags (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Show the review log and versions of a memory
    History {
        /// Memory ID
        memory_id: String,
    },

    /// Show store statistics
    Stats {
        /// Output format (text/json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the effective configuration
    Config,
}

fn parse_memory_id(raw: &str) -> anyhow::Result<MemoryId> {
    MemoryId::from_string(raw).with_context(|| format!("Invalid memory ID: {}", raw))
}

fn parse_task_id(raw: &str) -> anyhow::Result<TaskId> {
    TaskId::from_string(raw).with_context(|| format!("Invalid task ID: {}", raw))
}

/// Default ttl for a freshly captured memory in `layer`
fn default_ttl(layer: TemporalLayer) -> Option<chrono::Duration> {
    match layer {
        TemporalLayer::Working => Some(chrono::Duration::hours(24)),
        TemporalLayer::Short => Some(chrono::Duration::days(7)),
        TemporalLayer::Long | TemporalLayer::Archive => None,
    }
}

async fn open_engine(config: &HypnosConfig, with_oracle: bool) -> anyhow::Result<LifecycleEngine> {
    let storage = LibsqlStorage::from_path(&config.storage.path, true).await?;

    let oracle: Option<Arc<dyn ReasoningOracle>> = if with_oracle {
        match LlmService::new(config.oracle.clone()) {
            Ok(service) => {
                debug!("Reasoning oracle ready (model: {})", service.model());
                Some(Arc::new(service))
            }
            Err(e) => {
                warn!("Reasoning oracle unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    Ok(LifecycleEngine::new(
        Arc::new(storage),
        oracle,
        config.worker.clone(),
    ))
}

async fn run_worker(engine: LifecycleEngine) -> anyhow::Result<()> {
    let scheduler = Arc::new(engine.scheduler()?);
    let runner = scheduler.clone();
    let loops = tokio::spawn(async move { runner.start().await });

    info!("Worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Received shutdown signal, stopping worker gracefully...");
    scheduler.shutdown().await;
    loops.await??;

    info!("Worker shut down complete");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Use specified level for hypnos, but WARN for the database driver
    let filter = EnvFilter::new(format!(
        "hypnos={0},hypnos_core={0},libsql=warn",
        level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Hypnos v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = HypnosConfig::load(cli.config.as_deref())?;
    if let Some(path) = cli.db_path {
        config.storage.path = path;
    }
    debug!("Using database: {}", config.storage.path);

    match cli.command {
        Commands::Init => {
            let storage = LibsqlStorage::from_path(&config.storage.path, true).await?;
            storage.check_database_health().await?;
            println!("✓ Database initialized: {}", config.storage.path);
            Ok(())
        }
        Commands::Worker => {
            let engine = open_engine(&config, true).await?;
            run_worker(engine).await
        }
        Commands::Sleep {
            batch_size,
            dry_run,
            format,
        } => {
            let engine = open_engine(&config, true).await?;
            let batch = batch_size.unwrap_or(config.worker.consolidation.batch_size);
            let report = engine.run_consolidation_cycle(batch, dry_run).await?;

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Sleep cycle{}: {} reviewed",
                    if report.dry_run { " (dry run)" } else { "" },
                    report.reviewed
                );
                println!("  promoted:          {}", report.promoted);
                println!("  extended:          {}", report.extended);
                println!("  archived:          {}", report.archived);
                println!("  forgotten:         {}", report.forgotten);
                println!("  still pending:     {}", report.still_pending);
                println!("  fallback archived: {}", report.fallback_archived);
                println!("  conflicts:         {}", report.conflicts);
                if report.errors > 0 {
                    println!("  errors:            {}", report.errors);
                }
            }
            Ok(())
        }
        Commands::Think { max_tasks, format } => {
            let engine = open_engine(&config, true).await?;
            let max = max_tasks.unwrap_or(config.worker.think.batch_size);
            let outcomes = engine.run_think_tick(max).await?;

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&outcomes)?);
            } else if outcomes.is_empty() {
                println!("No pending think tasks");
            } else {
                for outcome in &outcomes {
                    match outcome {
                        ThinkOutcome::Completed {
                            task_id,
                            insight_id,
                        } => println!("✓ {} → insight {}", task_id, insight_id),
                        ThinkOutcome::Failed { task_id, error } => {
                            println!("✗ {} released: {}", task_id, error)
                        }
                        ThinkOutcome::Skipped { task_id } => println!("- {} skipped", task_id),
                    }
                }
            }
            Ok(())
        }
        Commands::Pending => {
            let engine = open_engine(&config, false).await?;
            let pending = engine.list_pending_review().await?;
            if pending.is_empty() {
                println!("Nothing awaiting review");
            }
            for id in pending {
                let memory = engine.storage().get_memory(id).await?;
                println!(
                    "{}  {:<8} retries={}  {}",
                    id,
                    memory.temporal_layer,
                    memory.retry_count,
                    memory.headline()
                );
            }
            Ok(())
        }
        Commands::Decide {
            memory_id,
            decision,
            reason,
            reviewer,
        } => {
            let engine = open_engine(&config, false).await?;
            let id = parse_memory_id(&memory_id)?;
            let entry = engine
                .record_manual_decision(id, decision, &reason, &reviewer)
                .await?;
            println!(
                "✓ {} {}: {} → {}",
                entry.decision, id, entry.old_layer, entry.new_layer
            );
            Ok(())
        }
        Commands::Enqueue {
            topic,
            priority,
            context,
            source,
            due_at,
        } => {
            let engine = open_engine(&config, false).await?;
            let id = match source {
                Some(raw) => {
                    let source = parse_memory_id(&raw)?;
                    engine
                        .enqueue_thought_about(source, &topic, priority, &context, due_at)
                        .await?
                }
                None => engine.enqueue_thought(&topic, priority, &context, due_at).await?,
            };
            println!("{}", id);
            Ok(())
        }
        Commands::Tasks { status, limit } => {
            let engine = open_engine(&config, false).await?;
            let tasks = engine.storage().list_tasks(status, limit).await?;
            if tasks.is_empty() {
                println!("No think tasks");
            }
            for task in tasks {
                let due = task
                    .due_at
                    .map(|d| format!("  (due {})", d.format("%Y-%m-%d %H:%M")))
                    .unwrap_or_default();
                println!(
                    "{}  {:<11} {:<6}  {}{}",
                    task.id, task.status, task.priority, task.topic, due
                );
            }
            Ok(())
        }
        Commands::Postpone { task_id } => {
            let engine = open_engine(&config, false).await?;
            engine.postpone_thought(parse_task_id(&task_id)?).await?;
            println!("✓ Postponed {}", task_id);
            Ok(())
        }
        Commands::ResetTask { task_id } => {
            let engine = open_engine(&config, false).await?;
            engine.reset_thought(parse_task_id(&task_id)?).await?;
            println!("✓ Returned {} to the queue", task_id);
            Ok(())
        }
        Commands::Chain {
            memory_id,
            types,
            direction,
        } => {
            let engine = open_engine(&config, false).await?;
            let root = parse_memory_id(&memory_id)?;
            for id in engine.get_evolution_chain(root, &types, direction).await? {
                let memory = engine.storage().get_memory(id).await?;
                println!("{}  v{}  {}", id, memory.version, memory.headline());
            }
            Ok(())
        }
        Commands::Link {
            from,
            to,
            relationship_type,
            reason,
        } => {
            let engine = open_engine(&config, false).await?;
            let created = engine
                .add_relationship(
                    parse_memory_id(&from)?,
                    parse_memory_id(&to)?,
                    relationship_type,
                    &reason,
                )
                .await?;
            if created {
                println!("✓ {} -[{}]-> {}", from, relationship_type, to);
            } else {
                println!("Edge already exists");
            }
            Ok(())
        }
        Commands::Revise {
            memory_id,
            content,
            reason,
        } => {
            let engine = open_engine(&config, false).await?;
            let revised = engine
                .revise_memory(parse_memory_id(&memory_id)?, &content, &reason)
                .await?;
            println!("{} (version {})", revised.id, revised.version);
            Ok(())
        }
        Commands::Remember {
            content,
            layer,
            ttl_hours,
            domain,
            importance,
            tags,
        } => {
            let engine = open_engine(&config, false).await?;
            let mut draft = MemoryDraft::from_content(&content)
                .with_layer(layer)
                .with_domain(domain)
                .with_importance(importance)
                .with_tags(tags.into_iter().filter(|t| !t.trim().is_empty()))
                .with_source("cli");
            let ttl = ttl_hours.map(chrono::Duration::hours).or_else(|| default_ttl(layer));
            if let Some(ttl) = ttl {
                draft = draft.with_ttl(layer, ttl);
            }

            let memory = engine.remember(draft).await?;
            println!("{}", memory.id);
            Ok(())
        }
        Commands::History { memory_id } => {
            let engine = open_engine(&config, false).await?;
            let id = parse_memory_id(&memory_id)?;
            let memory = engine.storage().get_memory(id).await?;

            println!("Memory {}", id);
            println!(
                "  {} / {}  version {}{}",
                memory.temporal_layer,
                memory.status,
                memory.version,
                if memory.is_current { " (current)" } else { "" }
            );
            if let Some(expires_at) = memory.expires_at {
                println!("  expires: {}", expires_at.to_rfc3339());
            }

            let history = engine.review_history(id).await?;
            if !history.is_empty() {
                println!("\nReviews:");
                for entry in history {
                    println!(
                        "  {}  {:<8} {} → {}  by {}: {}",
                        entry.reviewed_at.format("%Y-%m-%d %H:%M"),
                        entry.decision,
                        entry.old_layer,
                        entry.new_layer,
                        entry.reviewer,
                        entry.reason
                    );
                }
            }

            let versions = engine.lineage(id).await?;
            if versions.len() > 1 {
                println!("\nVersions:");
                for version in versions {
                    println!(
                        "  v{}  {}{}  {}",
                        version.version,
                        version.id,
                        if version.is_current { "*" } else { " " },
                        version.headline()
                    );
                }
            }
            Ok(())
        }
        Commands::Stats { format } => {
            let engine = open_engine(&config, false).await?;
            let stats = engine.stats().await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }

            println!("Memories: {}", stats.total_memories());
            for (layer, count) in &stats.memories_by_layer {
                println!("  layer  {:<15} {}", layer, count);
            }
            for (status, count) in &stats.memories_by_status {
                println!("  status {:<15} {}", status, count);
            }
            println!("Think tasks:");
            for (status, count) in &stats.tasks_by_status {
                println!("  {:<22} {}", status, count);
            }
            println!("Relationships: {}", stats.relationships);
            println!("Review entries: {}", stats.review_entries);
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
