//! Postgres connection pool.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Type alias for the shared Postgres pool used across the whole application.
pub type DbPool = PgPool;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for the dagflow database.
///
/// A short acquire timeout makes a saturated pool surface as a transient
/// [`DbError`] that the worker retries, rather than a run that hangs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Close connections idle for longer than this.
    pub idle_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            idle_timeout: None,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// The URL with its password replaced, for logs.
    pub fn masked_url(&self) -> String {
        let url = &self.database_url;
        let Some(at) = url.rfind('@') else {
            return url.clone();
        };
        let scheme_end = url.find("://").map_or(0, |i| i + 3);
        match url[scheme_end..at].find(':') {
            Some(colon) => format!("{}:***{}", &url[..scheme_end + colon], &url[at..]),
            None => url.clone(),
        }
    }

    pub fn options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
    }

    /// Open the pool, failing if the first connection cannot be made.
    pub async fn connect(&self) -> Result<DbPool, DbError> {
        info!(
            url = %self.masked_url(),
            max_connections = self.max_connections,
            acquire_timeout = ?self.acquire_timeout,
            "Connecting to database"
        );
        let pool = self.options().connect(&self.database_url).await?;
        Ok(pool)
    }
}

/// Run embedded SQLx migrations located in `./migrations` (relative to the
/// workspace root at build time).
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("Running database migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_the_pool_options() {
        let options = PoolConfig::new("postgres://localhost/dagflow").options();
        assert_eq!(options.get_max_connections(), DEFAULT_MAX_CONNECTIONS);
        assert_eq!(options.get_acquire_timeout(), DEFAULT_ACQUIRE_TIMEOUT);
        assert_eq!(options.get_idle_timeout(), None);
    }

    #[test]
    fn overrides_reach_the_pool_options() {
        let options = PoolConfig::new("postgres://localhost/dagflow")
            .with_max_connections(0)
            .with_acquire_timeout(Duration::from_millis(250))
            .with_idle_timeout(Some(Duration::from_secs(300)))
            .options();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_acquire_timeout(), Duration::from_millis(250));
        assert_eq!(options.get_idle_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn password_is_masked_in_logs() {
        let config = PoolConfig::new("postgres://dagflow:s3cr3t@db:5432/dagflow");
        assert_eq!(config.masked_url(), "postgres://dagflow:***@db:5432/dagflow");
        assert_eq!(config.database_url(), "postgres://dagflow:s3cr3t@db:5432/dagflow");

        let no_password = PoolConfig::new("postgres://dagflow@db/dagflow");
        assert_eq!(no_password.masked_url(), "postgres://dagflow@db/dagflow");
        let local = PoolConfig::new("postgres://localhost/dagflow");
        assert_eq!(local.masked_url(), "postgres://localhost/dagflow");
    }
}
