//! Storage configuration types.

use serde::Deserialize;

/// Local replica store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. `:memory:` keeps replicas in process memory.
    pub path: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/replicas.db".to_string(),
            max_connections: 5,
        }
    }
}

impl StorageConfig {
    pub fn in_memory() -> Self {
        Self {
            path: ":memory:".to_string(),
            max_connections: 1,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}
