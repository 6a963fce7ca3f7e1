mod config;
mod dlq_cmds;
mod serve_cmd;
mod task_cmds;

use anyhow::Context;
use clap::{Parser, Subcommand};

use mule_db::pool;

use config::MuleConfig;

#[derive(Parser)]
#[command(name = "mule", about = "Distributed task queue coordinator")]
struct Cli {
    /// Database URL (overrides MULE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a mule config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/mule")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the mule database (requires config file or env vars)
    DbInit,
    /// Run the coordinator until interrupted
    Serve,
    /// Submit a task
    Submit {
        /// Task function name (routing key into the worker handler registry)
        name: String,
        /// Positional arguments as a JSON value
        #[arg(long, default_value = "null")]
        args: String,
        /// Keyword arguments as a JSON object
        #[arg(long, default_value = "null")]
        kwargs: String,
        /// Priority 1-10 (10 highest)
        #[arg(long, default_value_t = 5)]
        priority: i32,
        /// Retry budget
        #[arg(long)]
        max_retries: Option<i32>,
        /// Backoff base in seconds
        #[arg(long)]
        retry_base_delay: Option<i32>,
        /// Execution timeout in seconds
        #[arg(long)]
        timeout: Option<i32>,
        /// Earliest start time (RFC 3339)
        #[arg(long)]
        scheduled_at: Option<String>,
        /// Cron expression for recurrence
        #[arg(long)]
        cron: Option<String>,
        /// Comma-separated predecessor task IDs
        #[arg(long)]
        depends_on: Option<String>,
        /// Dependency mode: all or any
        #[arg(long, default_value = "all")]
        wait_mode: String,
        /// Submitter label
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Show a task (or overall queue depths when omitted)
    Status {
        /// Task ID to show
        task_id: Option<String>,
    },
    /// List tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by task name
        #[arg(long)]
        name: Option<String>,
        /// Page size
        #[arg(long, default_value_t = 50)]
        limit: i64,
        /// Page offset
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Cancel a task
    Cancel {
        /// Task ID to cancel
        task_id: String,
    },
    /// Re-submit a terminal task as a fresh one
    Replay {
        /// Task ID to replay
        task_id: String,
    },
    /// List scheduled tasks, soonest first
    Scheduled,
    /// Dead-letter queue management
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
}

#[derive(Subcommand)]
pub enum DlqCommands {
    /// List dead-letter entries
    List {
        /// Page size
        #[arg(long, default_value_t = 50)]
        limit: i64,
        /// Page offset
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show the newest dead-letter entry for a task
    Show {
        /// Task ID to inspect
        task_id: String,
    },
    /// Requeue a dead-lettered task with a reset retry budget
    Requeue {
        /// Task ID to requeue
        task_id: String,
    },
    /// Remove entries older than the given number of days
    Purge {
        /// Age threshold in days
        #[arg(long)]
        older_than_days: i64,
    },
}

/// Execute the `mule init` command: generate a session secret and write
/// the config file with default queue tuning.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "refusing to overwrite existing config at {} (pass --force)",
            path.display()
        );
    }

    let token_secret = config::generate_token_secret();
    let queue = mule_core::config::QueueConfig::default();

    config::save_config(&config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        auth: config::AuthSection {
            token_secret: token_secret.clone(),
        },
        queue: queue.clone(),
    })?;

    println!("Wrote {}", path.display());
    println!("  store url       {db_url}");
    println!(
        "  session secret  {}... (workers authenticate with this)",
        &token_secret[..8]
    );
    println!(
        "  queue defaults  tick {}s, retries {}, dlq retention {}d (edit [queue] to tune)",
        queue.scheduler_tick_secs, queue.max_retries, queue.dlq_retention_days
    );
    println!();
    println!("Run `mule db-init` next to create the store, then `mule serve`.");

    Ok(())
}

/// Execute the `mule db-init` command: create the store database if
/// needed, bring the schema up to date, and report queue state.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = MuleConfig::resolve(cli_db_url)?;

    pool::create_database_if_missing(&resolved.db_config).await?;
    let db_pool = pool::connect(&resolved.db_config).await?;
    pool::migrate(&db_pool).await?;

    let summary = pool::store_summary(&db_pool).await?;
    db_pool.close().await;

    let d = &summary.depths;
    if d.total == 0 && summary.dlq_entries == 0 {
        println!("Store ready at {} (queue is empty).", resolved.db_config.database_url);
    } else {
        println!("Store ready at {}.", resolved.db_config.database_url);
        println!(
            "  tasks: {} total ({} pending, {} scheduled, {} running, {} terminal)",
            d.total,
            d.pending,
            d.scheduled,
            d.running,
            d.completed + d.cancelled + d.dead
        );
        println!("  dead-letter entries: {}", summary.dlq_entries);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve => {
            let code = serve_cmd::run_serve(cli.database_url.as_deref()).await;
            if code != serve_cmd::EXIT_OK {
                std::process::exit(code);
            }
        }
        Commands::Submit {
            name,
            args,
            kwargs,
            priority,
            max_retries,
            retry_base_delay,
            timeout,
            scheduled_at,
            cron,
            depends_on,
            wait_mode,
            created_by,
        } => {
            let resolved = MuleConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = task_cmds::run_submit(
                &db_pool,
                &resolved,
                task_cmds::SubmitArgs {
                    name,
                    args,
                    kwargs,
                    priority,
                    max_retries,
                    retry_base_delay,
                    timeout,
                    scheduled_at,
                    cron,
                    depends_on,
                    wait_mode,
                    created_by,
                },
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { task_id } => {
            let resolved = MuleConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = task_cmds::run_status(&db_pool, task_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::List {
            status,
            name,
            limit,
            offset,
        } => {
            let resolved = MuleConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result =
                task_cmds::run_list(&db_pool, status.as_deref(), name.as_deref(), limit, offset)
                    .await;
            db_pool.close().await;
            result?;
        }
        Commands::Cancel { task_id } => {
            let resolved = MuleConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = task_cmds::run_cancel(&db_pool, &resolved, &task_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Replay { task_id } => {
            let resolved = MuleConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = task_cmds::run_replay(&db_pool, &resolved, &task_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Scheduled => {
            let resolved = MuleConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = task_cmds::run_scheduled(&db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Dlq { command } => {
            let resolved = MuleConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = dlq_cmds::run_dlq_command(command, &db_pool, &resolved).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}

/// Parse a task ID argument.
pub(crate) fn parse_task_id(s: &str) -> anyhow::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s).with_context(|| format!("invalid task ID: {s}"))
}
