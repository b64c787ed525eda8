//! Middle tier: Pulley bytecode on an engine shared across sandboxes.
//!
//! Guest code never becomes native machine code and linear memory is an
//! ordinary bounds-checked heap allocation, so this tier does not depend on
//! virtual-memory tricks the host may not allow.

use super::engine::{SharedEngine, epoch_deadline_ticks};
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

pub struct RestrictedInterpreter {
    core: SandboxCore,
    shared: Arc<SharedEngine>,
}

impl RestrictedInterpreter {
    pub(crate) fn new(
        shared: Arc<SharedEngine>,
        capabilities: CapabilitySet,
        limits: &ResourceLimits,
        services: Arc<HostServices>,
    ) -> Self {
        Self {
            core: SandboxCore::new(
                IsolationTier::RestrictedInterpreter,
                capabilities,
                limits.clone(),
                services,
            ),
            shared,
        }
    }
}

impl IsolationBackend for RestrictedInterpreter {
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
        let limits = self.core.limits();
        let confinement = Confinement {
            deadline: Deadline::Epoch {
                ticks: epoch_deadline_ticks(limits.call_timeout()),
            },
            memory_limit: Some(limits.max_memory_bytes),
            imports: ImportPolicy::AllowList,
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
