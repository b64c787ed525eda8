//! Strongest tier: a dedicated native engine and epoch timer per sandbox.

use super::engine::{EpochTicker, epoch_deadline_ticks, native_config};
use super::session::{Confinement, Deadline, SandboxCore};
use super::{ExecutionOutcome, FailureKind, InitContext, IsolationBackend, IsolationTier};
use crate::capabilities::CapabilitySet;
use crate::error::PluginHostError;
use crate::host::ImportPolicy;
use crate::limits::{ResourceLimits, ResourceUsage};
use crate::services::HostServices;
use plugguard_types::SandboxId;
use serde_json::Value;
use std::sync::Arc;
use wasmtime::{Engine, Module};

/// Nothing compiled for one plugin is shared with another: each sandbox
/// owns its engine, code cache and epoch thread, all released on dispose.
pub struct StrongIsolation {
    core: SandboxCore,
    engine: Option<Engine>,
    ticker: Option<EpochTicker>,
}

impl StrongIsolation {
    pub(crate) fn new(
        capabilities: CapabilitySet,
        limits: &ResourceLimits,
        services: Arc<HostServices>,
    ) -> Result<Self, PluginHostError> {
        let engine = Engine::new(&native_config())
            .map_err(|e| PluginHostError::BackendUnavailable(format!("native engine: {e}")))?;
        let ticker = EpochTicker::start(engine.clone())
            .map_err(|e| PluginHostError::BackendUnavailable(format!("epoch thread: {e}")))?;
        Ok(Self {
            core: SandboxCore::new(IsolationTier::StrongIsolation, capabilities, limits.clone(), services),
            engine: Some(engine),
            ticker: Some(ticker),
        })
    }

    fn release_engine(&mut self) {
        self.ticker = None;
        self.engine = None;
    }
}

impl IsolationBackend for StrongIsolation {
    fn id(&self) -> SandboxId {
        self.core.id()
    }

    fn tier(&self) -> IsolationTier {
        self.core.tier()
    }

    fn capabilities(&self) -> &CapabilitySet {
        self.core.capabilities()
    }

    fn execution_count(&self) -> u64 {
        self.core.execution_count()
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    fn is_terminated(&self) -> bool {
        self.core.is_terminated()
    }

    fn resource_usage(&self) -> ResourceUsage {
        self.core.resource_usage()
    }

    fn initialize(&mut self, code: &[u8], init: &InitContext) -> ExecutionOutcome {
        let Some(engine) = self.engine.clone() else {
            return self.core.unavailable().unwrap_or_else(|| {
                ExecutionOutcome::failure(FailureKind::RuntimeError, "sandbox engine was released")
            });
        };
        let limits = self.core.limits();
        let confinement = Confinement {
            deadline: Deadline::Epoch {
                ticks: epoch_deadline_ticks(limits.call_timeout()),
            },
            memory_limit: Some(limits.max_memory_bytes),
            imports: ImportPolicy::AllowList,
        };
        let outcome = self.core.start(&engine, Module::new(&engine, code), confinement, init);
        if self.core.is_terminated() {
            self.release_engine();
        }
        outcome
    }

    fn execute(&mut self, function: &str, input: &Value) -> ExecutionOutcome {
        let outcome = self.core.execute(function, input);
        if self.core.is_terminated() {
            self.release_engine();
        }
        outcome
    }

    fn dispose(&mut self) -> Result<(), PluginHostError> {
        let result = self.core.dispose();
        self.release_engine();
        result
    }
}
