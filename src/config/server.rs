//! Service identity and health endpoint configuration.

use serde::Deserialize;

use crate::topology::ServiceRole;

/// Which service this process replicates for.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service role; determines owned and replicated entities.
    pub role: ServiceRole,
    /// Override the role's default binding patterns.
    pub bindings: Option<Vec<String>>,
}

impl ServiceConfig {
    /// Effective binding patterns for the subscriber queue.
    pub fn bindings(&self) -> Vec<String> {
        self.bindings
            .clone()
            .unwrap_or_else(|| self.role.bindings())
    }
}

/// gRPC health endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Serve the health endpoint at all.
    pub enabled: bool,
    /// Host to bind to.
    pub host: String,
    /// Port for the gRPC health service.
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 50052,
        }
    }
}
