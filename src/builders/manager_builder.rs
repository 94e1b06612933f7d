//! Builder assembling a [`UnifiedResourceManager`] from configuration.

use std::sync::Arc;

use crate::config::ManagerConfig;
use crate::core::audit::{AuditSink, InMemoryAuditSink};
use crate::core::error::{AppResult, ResourceError};
use crate::core::manager::UnifiedResourceManager;
use crate::core::scheduler::{default_policies, SchedulingPolicy, TaskRunner};
use crate::runtime::Spawn;
use crate::util::clock::{Clock, SystemClock};

type RunnerHook = Box<dyn FnOnce(&UnifiedResourceManager)>;

/// Step-by-step construction of a manager.
pub struct ManagerBuilder {
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    audit: Option<Box<dyn AuditSink>>,
    policies: Option<Vec<Box<dyn SchedulingPolicy>>>,
    runner: Option<RunnerHook>,
    start: bool,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl ManagerBuilder {
    /// Builder over `config` with the system clock.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            audit: None,
            policies: None,
            runner: None,
            start: false,
        }
    }

    /// Builder over configuration read from the environment.
    ///
    /// # Errors
    /// See [`ManagerConfig::from_env`].
    pub fn from_env() -> AppResult<Self> {
        Ok(Self::new(ManagerConfig::from_env()?))
    }

    /// Configuration the manager will be built with.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Use `clock` for every component.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record audit events into `sink` instead of the bounded in-memory ring.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Replace the built-in scheduling policies.
    #[must_use]
    pub fn with_policies(mut self, policies: Vec<Box<dyn SchedulingPolicy>>) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Run started tasks with `runner` on `spawner`.
    #[must_use]
    pub fn with_runner<S>(mut self, runner: Arc<dyn TaskRunner>, spawner: S) -> Self
    where
        S: Spawn + Send + Sync + 'static,
    {
        self.runner = Some(Box::new(move |manager: &UnifiedResourceManager| {
            manager.scheduler().set_runner(runner, spawner);
        }));
        self
    }

    /// Start the manager before returning it.
    #[must_use]
    pub const fn started(mut self) -> Self {
        self.start = true;
        self
    }

    /// Build the manager.
    ///
    /// # Errors
    /// [`ResourceError::InvalidConfig`] or a start failure.
    pub fn build(self) -> Result<UnifiedResourceManager, ResourceError> {
        let audit = self
            .audit
            .unwrap_or_else(|| Box::new(InMemoryAuditSink::new(self.config.audit_capacity)));
        let policies = self.policies.unwrap_or_else(default_policies);
        let manager = UnifiedResourceManager::with_parts(self.config, self.clock, audit, policies)?;
        if let Some(install) = self.runner {
            install(&manager);
        }
        if self.start {
            manager.start()?;
        }
        Ok(manager)
    }
}
