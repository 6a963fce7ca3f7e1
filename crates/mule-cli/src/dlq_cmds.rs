//! Dead-letter queue commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;

use mule_core::broker::MemoryBroker;
use mule_core::coordinator::Coordinator;
use mule_db::queries::dlq as dlq_db;

use crate::config::MuleConfig;
use crate::{DlqCommands, parse_task_id};

pub async fn run_dlq_command(
    command: DlqCommands,
    pool: &PgPool,
    resolved: &MuleConfig,
) -> Result<()> {
    match command {
        DlqCommands::List { limit, offset } => {
            let entries = dlq_db::list_entries(pool, limit, offset).await?;
            if entries.is_empty() {
                println!("Dead-letter queue is empty.");
                return Ok(());
            }
            for entry in &entries {
                let requeued = entry
                    .requeued_at
                    .map(|at| format!("requeued {at}"))
                    .unwrap_or_else(|| "parked".to_owned());
                println!(
                    "{}  {}  {} attempts  {}  moved {}  [{}]",
                    entry.task_id,
                    entry.task_name,
                    entry.total_attempts,
                    entry.failure_reason,
                    entry.moved_at,
                    requeued
                );
            }
        }
        DlqCommands::Show { task_id } => {
            let id = parse_task_id(&task_id)?;
            let entry = dlq_db::latest_for_task(pool, id)
                .await?
                .with_context(|| format!("no dead-letter entry for task {id}"))?;
            println!("Task {}  ({})", entry.task_id, entry.task_name);
            println!("  reason:    {}", entry.failure_reason);
            if let Some(message) = &entry.error_message {
                println!("  error:     {message}");
            }
            println!("  attempts:  {}", entry.total_attempts);
            println!("  moved_at:  {}", entry.moved_at);
            if let Some(at) = entry.requeued_at {
                println!("  requeued:  {at}");
            }
            println!("  snapshot:  {}", entry.snapshot);
        }
        DlqCommands::Requeue { task_id } => {
            let id = parse_task_id(&task_id)?;
            let coordinator = Coordinator::new(
                pool.clone(),
                Arc::new(MemoryBroker::new()),
                resolved.queue.clone(),
                mule_core::session::SessionConfig::new(resolved.session_config.secret.clone()),
            );
            coordinator.dlq_requeue(id).await?;
            println!("Task {id} requeued with a reset retry budget.");
        }
        DlqCommands::Purge { older_than_days } => {
            let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
            let removed = dlq_db::purge_older_than(pool, cutoff).await?;
            println!("Removed {removed} dead-letter entries older than {older_than_days} days.");
        }
    }
    Ok(())
}
