//! Weakest tier, used only when a host policy explicitly opts in.
//!
//! Native code on a shared engine with no memory ceiling and no epoch
//! instrumentation. Running time is bounded by a fuel budget derived from
//! the call timeout, which only approximates wall-clock time and does not
//! cover time spent blocked in host calls.

use super::engine::SharedEngine;
use super::session::{Confinement, Deadline, SandboxCore};
use super::{ExecutionOutcome, InitContext, IsolationBackend, IsolationTier};
use crate::capabilities::CapabilitySet;
use crate::error::PluginHostError;
use crate::host::ImportPolicy;
use crate::limits::{ResourceLimits, ResourceUsage};
use crate::services::HostServices;
use plugguard_types::SandboxId;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

pub struct UnsafeFallback {
    core: SandboxCore,
    shared: Arc<SharedEngine>,
}

impl UnsafeFallback {
    pub(crate) fn new(
        shared: Arc<SharedEngine>,
        capabilities: CapabilitySet,
        limits: &ResourceLimits,
        services: Arc<HostServices>,
    ) -> Self {
        let core = SandboxCore::new(IsolationTier::UnsafeFallback, capabilities, limits.clone(), services);
        warn!(
            sandbox_id = %core.id(),
            "Creating UNSAFE sandbox: no memory ceiling, timeout enforced by fuel estimate only"
        );
        Self { core, shared }
    }

    pub fn is_unsafe(&self) -> bool {
        true
    }
}

impl IsolationBackend for UnsafeFallback {
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
        let confinement = Confinement {
            deadline: Deadline::Fuel {
                budget: self.core.limits().fuel_budget(),
            },
            memory_limit: None,
            imports: ImportPolicy::DenyList,
        };
        let module = self.shared.compile(code);
        self.core.start(self.shared.engine(), module, confinement, init)
    }

    fn execute(&mut self, function: &str, input: &Value) -> ExecutionOutcome {
        self.core.execute(function, input)
    }

    fn dispose(&mut self) -> Result<(), PluginHostError> {
        self.core.dispose()
    }
}
