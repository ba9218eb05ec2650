//! Collaborators the node sets up on activation and tears down on seal.
//!
//! The node never looks inside these. It calls them in a fixed order and
//! reports their failures.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CoreError;
use crate::mount::{BarrierView, MountEntry, TableKind};

/// A mounted secret engine, credential backend or audit device.
#[async_trait::async_trait]
pub trait LogicalBackend: Send + Sync {
    /// Release resources before the backend is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if cleanup fails; teardown continues regardless.
    async fn unload(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Creates backends of one type.
#[async_trait::async_trait]
pub trait BackendFactory: Send + Sync {
    /// Instantiate a backend for `entry`, storing its data under `view`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if the backend cannot be set up; activation
    /// aborts.
    async fn create(
        &self,
        entry: &MountEntry,
        view: BarrierView,
    ) -> Result<Arc<dyn LogicalBackend>, CoreError>;
}

/// Policy or identity data that must be loaded before requests are served.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Load and verify stored artifacts.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if loading fails; activation aborts.
    async fn load(&self, view: BarrierView) -> Result<(), CoreError>;

    /// Drop loaded state.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if cleanup fails; teardown continues regardless.
    async fn unload(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Periodic work run while the node is active (lease expiration, rollback,
/// activity tracking).
#[async_trait::async_trait]
pub trait PeriodicTask: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Time between runs.
    fn interval(&self) -> Duration;

    /// Do one round of work.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure. Storage failures are retried with
    /// backoff before the round is abandoned.
    async fn tick(&self) -> Result<(), CoreError>;

    /// Flush state when the task is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if flushing fails; teardown continues regardless.
    async fn stop(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Runs once activation is otherwise complete, immediately before the node
/// reports itself active.
#[async_trait::async_trait]
pub trait ActivationHook: Send + Sync {
    /// Called after every successful activation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] to abort activation.
    async fn on_activation(&self) -> Result<(), CoreError>;
}

/// Every collaborator the node knows about.
#[derive(Default, Clone)]
pub struct Collaborators {
    /// Secret engine factories by mount type.
    pub secrets: HashMap<String, Arc<dyn BackendFactory>>,
    /// Credential backend factories by mount type.
    pub credentials: HashMap<String, Arc<dyn BackendFactory>>,
    /// Audit device factories by mount type.
    pub audit: HashMap<String, Arc<dyn BackendFactory>>,
    /// Policy store, loaded after the mounts.
    pub policy: Option<Arc<dyn ArtifactStore>>,
    /// Identity store, loaded after policies.
    pub identity: Option<Arc<dyn ArtifactStore>>,
    /// Lease expiration manager.
    pub expiration: Option<Arc<dyn PeriodicTask>>,
    /// Rollback manager.
    pub rollback: Option<Arc<dyn PeriodicTask>>,
    /// Activity tracker.
    pub activity: Option<Arc<dyn PeriodicTask>>,
    /// Hooks run last on activation, in order.
    pub on_activation: Vec<Arc<dyn ActivationHook>>,
}

impl Collaborators {
    /// Factories for entries of the given table.
    #[must_use]
    pub fn factories(&self, kind: TableKind) -> &HashMap<String, Arc<dyn BackendFactory>> {
        match kind {
            TableKind::Secrets => &self.secrets,
            TableKind::Credentials => &self.credentials,
            TableKind::Audit => &self.audit,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .field("audit", &self.audit.keys().collect::<Vec<_>>())
            .field("policy", &self.policy.as_ref().map(|s| s.name().to_owned()))
            .field("identity", &self.identity.as_ref().map(|s| s.name().to_owned()))
            .field("on_activation", &self.on_activation.len())
            .finish_non_exhaustive()
    }
}
