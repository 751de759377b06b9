//! Deployment registry: recommended canary hosts per service.
//!
//! The registry is fed by the deploy pipeline (which hosts received the
//! newest build of a service) and read when an operator inspects a
//! canary, so the operator can pick hosts that already run that build.

use tracing::debug;

use crate::error::RegistryError;
use crate::store::StateStore;

/// Source of recommended canary hosts for a service.
pub trait DeploymentRegistry: Send + Sync {
    /// Replace the host set registered for `service`.
    fn register(&self, service: &str, hosts: &[String]) -> Result<(), RegistryError>;

    /// Forget the host set of `service`.
    fn release(&self, service: &str) -> Result<(), RegistryError>;

    /// Hosts registered for `service`; empty when none are.
    fn recommended_hosts(&self, service: &str) -> Result<Vec<String>, RegistryError>;
}

/// Registry persisted in the key store's `registry` table.
#[derive(Clone)]
pub struct StoreRegistry {
    store: StateStore,
}

impl StoreRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl DeploymentRegistry for StoreRegistry {
    fn register(&self, service: &str, hosts: &[String]) -> Result<(), RegistryError> {
        self.store.put_registry_hosts(service, hosts)?;
        Ok(())
    }

    fn release(&self, service: &str) -> Result<(), RegistryError> {
        let existed = self.store.delete_registry_hosts(service)?;
        debug!(%service, existed, "canary hosts released");
        Ok(())
    }

    fn recommended_hosts(&self, service: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self.store.registry_hosts(service)?.unwrap_or_default())
    }
}
