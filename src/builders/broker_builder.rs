//! Builder wiring registry, roles, store and engine from a [`BrokerConfig`].

use std::sync::Arc;

use anyhow::Context;

use crate::config::{BrokerConfig, StoreBackendConfig};
use crate::core::{
    AllocationEngine, AllocationStore, AppResult, AuditSink, AuthProvider, DriverRegistry,
    InMemoryTargetRegistry, StaticRoles,
};
use crate::infra::{FileStore, InMemoryStore, WaitQueue};

/// Engine type produced by the builder; the store backend is chosen at
/// runtime from configuration.
pub type Broker = AllocationEngine<Box<dyn AllocationStore>, WaitQueue>;

/// Step-by-step construction of a [`Broker`].
pub struct BrokerBuilder {
    config: BrokerConfig,
    registry: Arc<InMemoryTargetRegistry>,
    auth: Option<Arc<dyn AuthProvider>>,
    drivers: DriverRegistry,
    audit: Option<Box<dyn AuditSink>>,
}

impl BrokerBuilder {
    /// Start from `config`; the target registry is filled from its targets.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        let registry = InMemoryTargetRegistry::new();
        for (id, info) in &config.targets {
            registry.insert(id.clone(), info.clone());
        }
        Self {
            config,
            registry: Arc::new(registry),
            auth: None,
            drivers: DriverRegistry::new(),
            audit: None,
        }
    }

    /// Configuration being built.
    #[must_use]
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Registry the engine will read; keep a handle to add or remove
    /// targets at runtime.
    #[must_use]
    pub fn registry(&self) -> Arc<InMemoryTargetRegistry> {
        Arc::clone(&self.registry)
    }

    /// Replace the default [`StaticRoles`] built from `admins`.
    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Driver hooks notified on preemption.
    #[must_use]
    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    /// Audit sink receiving every action.
    #[must_use]
    pub fn with_audit(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Validate the configuration, open the store and build the engine.
    pub fn build(self) -> AppResult<Broker> {
        self.config
            .validate()
            .map_err(|e| anyhow::anyhow!("config invalid: {e}"))?;

        let store: Box<dyn AllocationStore> = match &self.config.store {
            StoreBackendConfig::InMemory => Box::new(InMemoryStore::new()),
            StoreBackendConfig::File { path } => Box::new(
                FileStore::open(path)
                    .with_context(|| format!("opening allocation store {}", path.display()))?,
            ),
        };
        let auth = self
            .auth
            .unwrap_or_else(|| Arc::new(StaticRoles::new(self.config.admins.iter().cloned())));

        let engine = AllocationEngine::new(
            self.config.to_policy(),
            store,
            WaitQueue::new(self.config.max_queue_depth),
            self.registry,
            auth,
        )
        .context("recovering allocation state")?
        .with_drivers(self.drivers);

        tracing::info!(
            targets = self.config.targets.len(),
            admins = self.config.admins.len(),
            store = ?self.config.store,
            "broker built"
        );
        Ok(match self.audit {
            Some(sink) => engine.with_audit(sink),
            None => engine,
        })
    }
}

/// Build a broker straight from configuration with default roles and no
/// driver hooks.
pub fn build_broker(config: BrokerConfig) -> AppResult<Broker> {
    BrokerBuilder::new(config).build()
}
