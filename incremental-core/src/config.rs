use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{pool::PoolOptions, PgPool};

// A pool config object, designed to be passable across API boundaries
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub max_connections: Option<u32>,         // Default to 10
    pub min_connections: Option<u32>,         // Default to 1
    pub acquire_timeout_seconds: Option<u64>, // Default to 30
    pub max_lifetime_seconds: Option<u64>,    // Default to 300
    pub idle_timeout_seconds: Option<u64>,    // Default to 60
}

impl PoolConfig {
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        PoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(10))
            .min_connections(self.min_connections.unwrap_or(1))
            .max_lifetime(Duration::from_secs(
                self.max_lifetime_seconds.unwrap_or(300),
            ))
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds.unwrap_or(60)))
            .acquire_timeout(Duration::from_secs(
                self.acquire_timeout_seconds.unwrap_or(30),
            ))
            .connect(&self.db_url)
            .await
    }
}

pub const DEFAULT_LIST_FUNCTION: &str = "incremental.list_files";
pub const DEFAULT_WRITER_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineConfig {
    // Used by file list pipelines created without an explicit list function
    pub default_list_function: String,
    // Upper bound on how long resolution waits for in-flight writers of a source
    pub writer_wait_timeout: Duration,
    // Commands running past this are cancelled and treated as failed. None means no limit
    pub command_timeout: Option<Duration>,
    // Role used for reads and writes of the engine's own tables. None keeps the connection's role
    pub service_role: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_list_function: DEFAULT_LIST_FUNCTION.to_string(),
            writer_wait_timeout: DEFAULT_WRITER_WAIT_TIMEOUT,
            command_timeout: None,
            service_role: None,
        }
    }
}
