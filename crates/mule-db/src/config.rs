//! Store connection settings.

use std::env;

/// Connection settings for the task store.
///
/// The queue's access pattern is many short statements -- status CAS
/// updates, execution-row appends, liveness scans -- issued from four
/// concurrent coordinator loops plus the worker surface. The pool is
/// therefore sized for statement concurrency, not per-connection
/// throughput.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL, query parameters included.
    pub database_url: String,
    /// Upper bound on pooled connections. The default covers the four
    /// loops with headroom for a burst of concurrent acquire/report
    /// calls; raise it for large worker fleets.
    pub max_connections: u32,
}

impl DbConfig {
    /// Connection URL used when nothing else is configured.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/mule";

    /// Default pool bound (see the struct docs for the sizing model).
    pub const DEFAULT_POOL_SIZE: u32 = 16;

    /// Read settings from the environment: `MULE_DATABASE_URL` for the
    /// URL, `MULE_DB_POOL_SIZE` for the pool bound, defaults otherwise.
    pub fn from_env() -> Self {
        let database_url =
            env::var("MULE_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        let max_connections = env::var("MULE_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(Self::DEFAULT_POOL_SIZE);
        Self {
            database_url,
            max_connections,
        }
    }

    /// Settings for an explicit URL (tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_POOL_SIZE,
        }
    }

    /// The database name: the final path segment of the URL, with any
    /// query string stripped. `None` when the URL has no name at all.
    pub fn database_name(&self) -> Option<&str> {
        let tail = self.database_url.rsplit('/').next()?;
        let name = match tail.find(['?', '#']) {
            Some(i) => &tail[..i],
            None => tail,
        };
        (!name.is_empty()).then_some(name)
    }

    /// A URL for the `postgres` maintenance database on the same
    /// server, preserving any query parameters. Used to issue
    /// `CREATE DATABASE` before the target database exists.
    pub fn maintenance_url(&self) -> String {
        let Some(pos) = self.database_url.rfind('/') else {
            return self.database_url.clone();
        };
        let (head, tail) = self.database_url.split_at(pos + 1);
        let params = tail.find('?').map(|i| &tail[i..]).unwrap_or("");
        format!("{head}postgres{params}")
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_url_with_default_pool() {
        let cfg = DbConfig::new("postgresql://remotehost:5433/other");
        assert_eq!(cfg.database_url, "postgresql://remotehost:5433/other");
        assert_eq!(cfg.max_connections, DbConfig::DEFAULT_POOL_SIZE);
        assert_eq!(cfg.database_name(), Some("other"));
    }

    #[test]
    fn database_name_strips_query_string() {
        let cfg = DbConfig::new("postgresql://localhost:5432/mule?sslmode=require");
        assert_eq!(cfg.database_name(), Some("mule"));
    }

    #[test]
    fn database_name_absent_when_url_has_no_path() {
        let cfg = DbConfig::new("postgresql://localhost:5432/");
        assert_eq!(cfg.database_name(), None);
    }

    #[test]
    fn maintenance_url_swaps_the_name_only() {
        let cfg = DbConfig::new("postgresql://localhost:5432/mule");
        assert_eq!(
            cfg.maintenance_url(),
            "postgresql://localhost:5432/postgres"
        );
    }

    #[test]
    fn maintenance_url_keeps_query_parameters() {
        let cfg = DbConfig::new("postgresql://localhost:5432/mule?sslmode=require");
        assert_eq!(
            cfg.maintenance_url(),
            "postgresql://localhost:5432/postgres?sslmode=require"
        );
    }
}
