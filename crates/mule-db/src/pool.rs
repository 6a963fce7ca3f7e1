//! Store connections and schema management.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::DbConfig;
use crate::queries::dlq;
use crate::queries::tasks::{self, QueueDepths};

/// Bound on waiting for a pooled connection.
///
/// Every store call sits inside a coordinator loop or a worker-surface
/// call, none of which may block unboundedly; waiting on the pool is
/// capped well under the shortest loop tick so a saturated pool surfaces
/// as a retryable error instead of a stall.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a connection pool against the task store.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await
        .with_context(|| {
            format!("failed to connect to task store at {}", config.database_url)
        })?;
    Ok(pool)
}

/// Apply any pending schema migrations.
///
/// Migration files are loaded at runtime from the directory shipped
/// inside `mule-db`, so compiling the crate never needs a live
/// database. Safe to call on every startup; an up-to-date schema is a
/// no-op.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    let dir = migrations_dir();
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("failed to load migrations from {}", dir.display()))?;

    migrator
        .run(pool)
        .await
        .context("failed to apply task store migrations")?;

    info!("task store schema is current");
    Ok(())
}

/// The migrations directory shipped with this crate.
///
/// Resolved via `CARGO_MANIFEST_DIR` at compile time, which points at
/// the `mule-db` source tree. Installed binaries that ship without the
/// source tree must embed the migrations themselves.
fn migrations_dir() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

/// Create the configured database when it does not exist yet.
///
/// Issues `CREATE DATABASE` through the maintenance database and treats
/// the duplicate-database error as success, so two initializers racing
/// each other both come out fine.
pub async fn create_database_if_missing(config: &DbConfig) -> Result<()> {
    let name = config
        .database_name()
        .context("database URL carries no database name")?;

    // CREATE DATABASE cannot take a bind parameter, so the name goes
    // into the statement text and must be a plain identifier.
    if !is_plain_identifier(name) {
        bail!("database name {name:?} is not a plain identifier");
    }

    let maintenance_url = config.maintenance_url();
    let maint = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&maintenance_url)
        .await
        .with_context(|| format!("failed to reach maintenance database at {maintenance_url}"))?;

    let stmt = format!("CREATE DATABASE {name}");
    match sqlx::query(&stmt).execute(&maint).await {
        Ok(_) => info!(db = name, "database created"),
        // 42P04: duplicate_database -- someone got there first.
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("42P04") => {
            info!(db = name, "database already exists");
        }
        Err(e) => {
            maint.close().await;
            return Err(e).with_context(|| format!("failed to create database {name}"));
        }
    }

    maint.close().await;
    Ok(())
}

fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A snapshot of queue state for the `mule db-init` success message.
#[derive(Debug, Clone)]
pub struct StoreSummary {
    pub depths: QueueDepths,
    pub dlq_entries: i64,
}

/// Summarize the store: task counts by status plus dead-letter depth.
pub async fn store_summary(pool: &PgPool) -> Result<StoreSummary> {
    let depths = tasks::count_by_status(pool)
        .await
        .context("failed to count tasks by status")?;
    let dlq_entries = dlq::count_entries(pool)
        .await
        .context("failed to count dead-letter entries")?;
    Ok(StoreSummary {
        depths,
        dlq_entries,
    })
}
