//! The `mule serve` command: run the coordinator until interrupted.
//!
//! Exit codes follow the process contract: 0 graceful shutdown, 64
//! configuration error, 65 store unavailable after startup retries, 66
//! broker unavailable, 70 unexpected fatal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tracing::{error, info, warn};

use mule_core::broker::MemoryBroker;
use mule_core::coordinator::Coordinator;
use mule_db::pool;

use crate::config::MuleConfig;

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 64;
pub const EXIT_STORE_UNAVAILABLE: i32 = 65;
#[allow(dead_code)]
pub const EXIT_BROKER_UNAVAILABLE: i32 = 66;
pub const EXIT_FATAL: i32 = 70;

/// Connect to the store, retrying with bounded backoff inside the
/// startup grace window.
async fn connect_store_with_retries(
    config: &MuleConfig,
    grace: Duration,
) -> Result<PgPool, anyhow::Error> {
    let deadline = Instant::now() + grace;
    let mut delay = Duration::from_secs(1);
    loop {
        match pool::connect(&config.db_config).await {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                if Instant::now() + delay >= deadline {
                    return Err(e);
                }
                warn!(error = %e, retry_in_secs = delay.as_secs(), "store unavailable, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(8));
            }
        }
    }
}

/// Run the coordinator. Returns the process exit code.
pub async fn run_serve(cli_db_url: Option<&str>) -> i32 {
    let resolved = match MuleConfig::resolve(cli_db_url) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!(error = %e, "configuration error");
            return EXIT_CONFIG;
        }
    };

    let grace = Duration::from_secs(resolved.queue.startup_grace_secs);
    let db_pool = match connect_store_with_retries(&resolved, grace).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "store unavailable after startup retries");
            return EXIT_STORE_UNAVAILABLE;
        }
    };

    let broker = Arc::new(MemoryBroker::new());
    let coordinator = Arc::new(Coordinator::new(
        db_pool.clone(),
        broker,
        resolved.queue.clone(),
        resolved.session_config,
    ));

    // Wire SIGINT to a graceful shutdown.
    {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                coordinator.request_shutdown();
            }
        });
    }

    info!("coordinator starting");
    let code = match coordinator.run().await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(error = %e, "coordinator failed");
            EXIT_FATAL
        }
    };

    db_pool.close().await;
    code
}
