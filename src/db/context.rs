//! Tenant context for multi-tenant storage
//!
//! Every statement is scoped by keyspace so several tenants can share one
//! physical store without seeing each other's rows.

/// Tenant scope passed to every store operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantContext {
    /// Keyspace all rows of this tenant live under
    pub keyspace: String,
}

impl TenantContext {
    pub fn new(keyspace: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
        }
    }

    /// Default keyspace for learner data
    pub fn default_learner() -> Self {
        Self::new("learner")
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }
}

impl Default for TenantContext {
    fn default() -> Self {
        Self::default_learner()
    }
}

impl std::fmt::Display for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TenantContext({})", self.keyspace)
    }
}
