//! Shared PostgreSQL harness for mule integration tests.
//!
//! One server per test binary, one migrated *template* database, and a
//! cheap clone of the template for every test. Cloning skips re-running
//! migrations per test, which is what dominates setup time once a test
//! file holds more than a couple of cases.
//!
//! Server selection:
//! - **`MULE_TEST_PG_URL`** set (CI setup script): use that server.
//! - otherwise: start a container via testcontainers, held alive for
//!   the binary's lifetime.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// The shared server: base URL plus the container handle kept alive
/// (`None` when an external server is used).
struct SharedServer {
    base_url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<SharedServer> = OnceCell::const_new();

/// Name of the migrated template database, created on first use.
static TEMPLATE: OnceCell<String> = OnceCell::const_new();

async fn start_server() -> SharedServer {
    if let Ok(url) = std::env::var("MULE_TEST_PG_URL") {
        return SharedServer {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("failed to start PostgreSQL container");

    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    SharedServer {
        base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: Some(container),
    }
}

/// Base URL of the shared server (no database name appended).
pub async fn pg_url() -> &'static str {
    &SERVER.get_or_init(start_server).await.base_url
}

/// Open a single maintenance connection to the `postgres` database.
async fn admin_connection() -> PgConnection {
    let url = format!("{}/postgres", pg_url().await);
    PgConnection::connect(&url)
        .await
        .expect("failed to open maintenance connection")
}

/// Build the template database: created once, migrated once, then only
/// ever copied. The migration pool is fully closed before the name is
/// published because a template cannot be copied while sessions are
/// attached to it.
async fn template_db() -> &'static str {
    TEMPLATE
        .get_or_init(|| async {
            let name = format!("mule_template_{}", Uuid::new_v4().simple());

            let mut admin = admin_connection().await;
            let stmt = format!("CREATE DATABASE {name}");
            admin
                .execute(stmt.as_str())
                .await
                .unwrap_or_else(|e| panic!("failed to create template database {name}: {e}"));

            let url = format!("{}/{name}", pg_url().await);
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(30))
                .connect(&url)
                .await
                .unwrap_or_else(|e| panic!("failed to connect to template database: {e}"));
            mule_db::pool::migrate(&pool)
                .await
                .expect("template migrations should succeed");
            pool.close().await;

            name
        })
        .await
}

/// Create a fresh database for one test by cloning the migrated
/// template. Returns `(pool, db_name)`; pass `db_name` to
/// [`drop_test_db`] when done.
pub async fn create_test_db() -> (PgPool, String) {
    let template = template_db().await;
    let db_name = format!("mule_test_{}", Uuid::new_v4().simple());

    let mut admin = admin_connection().await;
    let stmt = format!("CREATE DATABASE {db_name} TEMPLATE {template}");
    admin
        .execute(stmt.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to clone template into {db_name}: {e}"));

    let url = format!("{}/{db_name}", pg_url().await);
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&url)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to test database {db_name}: {e}"));

    (pool, db_name)
}

/// Drop a test database, kicking out any straggler connections first.
/// Safe to call twice.
pub async fn drop_test_db(db_name: &str) {
    let mut admin = admin_connection().await;

    let kick = format!(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = admin.execute(kick.as_str()).await;

    let stmt = format!("DROP DATABASE IF EXISTS {db_name}");
    let _ = admin.execute(stmt.as_str()).await;
}
