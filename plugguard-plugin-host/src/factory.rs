//! Chooses and constructs the isolation backend for each plugin.

use crate::backend::{
    IsolationBackend, IsolationTier, RestrictedInterpreter, SharedEngine, StrongIsolation,
    UnsafeFallback, fuel_config, interpreter_config,
};
use crate::capabilities::CapabilitySet;
use crate::error::PluginHostError;
use crate::limits::ResourceLimits;
use crate::policy::PolicyEngine;
use crate::services::HostServices;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Which tiers a host is willing to run plugins in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SandboxPolicy {
    /// Weakest tier that may be selected.
    pub minimum_tier: IsolationTier,
    /// Whether `UnsafeFallback` may be selected at all.
    pub allow_unsafe_fallback: bool,
    /// Candidate tiers; tried strongest first regardless of order.
    pub tiers: Vec<IsolationTier>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            minimum_tier: IsolationTier::UnsafeFallback,
            allow_unsafe_fallback: false,
            tiers: IsolationTier::ALL.to_vec(),
        }
    }
}

impl SandboxPolicy {
    /// Candidate tiers this policy permits, strongest first.
    pub fn eligible_tiers(&self) -> Vec<IsolationTier> {
        let mut tiers: Vec<IsolationTier> = self
            .tiers
            .iter()
            .copied()
            .filter(|tier| tier.is_at_least(self.minimum_tier))
            .filter(|tier| !tier.is_unsafe() || self.allow_unsafe_fallback)
            .collect();
        tiers.sort_by_key(|tier| std::cmp::Reverse(tier.strength()));
        tiers.dedup();
        tiers
    }
}

type SharedSlot = OnceLock<Result<Arc<SharedEngine>, String>>;

/// Builds sandboxes, falling back tier by tier.
///
/// The interpreter and unsafe tiers share one engine each (and with it the
/// compiled-module cache); they are created on first use.
pub struct SandboxFactory {
    policy: SandboxPolicy,
    limits: ResourceLimits,
    services: Arc<HostServices>,
    interpreter: SharedSlot,
    unconfined: SharedSlot,
}

impl SandboxFactory {
    pub fn new(policy: SandboxPolicy, limits: ResourceLimits, services: HostServices) -> Self {
        Self {
            policy,
            limits,
            services: Arc::new(services),
            interpreter: OnceLock::new(),
            unconfined: OnceLock::new(),
        }
    }

    /// Factory using the host policy's tier selection and limits.
    pub fn from_policy(policy: &PolicyEngine, services: HostServices) -> Self {
        Self::new(policy.sandbox_policy().clone(), policy.resource_limits().clone(), services)
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn services(&self) -> &Arc<HostServices> {
        &self.services
    }

    /// Creates a sandbox in the strongest eligible tier that can be built.
    pub fn create(&self, capabilities: &CapabilitySet) -> Result<Box<dyn IsolationBackend>, PluginHostError> {
        let eligible = self.policy.eligible_tiers();
        if eligible.is_empty() {
            return Err(PluginHostError::BackendUnavailable(format!(
                "no tier at or above {} is enabled (unsafe fallback allowed: {})",
                self.policy.minimum_tier, self.policy.allow_unsafe_fallback
            )));
        }

        let mut failures = Vec::new();
        for tier in eligible {
            match self.build(tier, capabilities) {
                Ok(sandbox) => {
                    debug!(tier = %tier, sandbox_id = %sandbox.id(), "Sandbox created");
                    return Ok(sandbox);
                }
                Err(e) => {
                    warn!(tier = %tier, error = %e, "Isolation tier unavailable, trying next");
                    failures.push(format!("{tier}: {e}"));
                }
            }
        }
        Err(PluginHostError::BackendUnavailable(failures.join("; ")))
    }

    fn build(&self, tier: IsolationTier, capabilities: &CapabilitySet) -> Result<Box<dyn IsolationBackend>, String> {
        let capabilities = capabilities.clone();
        let services = Arc::clone(&self.services);
        match tier {
            IsolationTier::StrongIsolation => StrongIsolation::new(capabilities, &self.limits, services)
                .map(|s| Box::new(s) as Box<dyn IsolationBackend>)
                .map_err(|e| e.to_string()),
            IsolationTier::RestrictedInterpreter => {
                let shared = self.shared(&self.interpreter, tier)?;
                Ok(Box::new(RestrictedInterpreter::new(shared, capabilities, &self.limits, services)))
            }
            IsolationTier::UnsafeFallback => {
                let shared = self.shared(&self.unconfined, tier)?;
                Ok(Box::new(UnsafeFallback::new(shared, capabilities, &self.limits, services)))
            }
        }
    }

    fn shared(&self, slot: &SharedSlot, tier: IsolationTier) -> Result<Arc<SharedEngine>, String> {
        slot.get_or_init(|| {
            let engine = match tier {
                IsolationTier::UnsafeFallback => SharedEngine::new(&fuel_config(), false),
                _ => interpreter_config().and_then(|config| SharedEngine::new(&config, true)),
            };
            engine.map(Arc::new).map_err(|e| format!("{e:#}"))
        })
        .clone()
    }

    /// Compiled modules currently cached across the shared engines.
    pub fn cached_modules(&self) -> usize {
        [&self.interpreter, &self.unconfined]
            .into_iter()
            .filter_map(|slot| slot.get())
            .filter_map(|engine| engine.as_ref().ok())
            .map(|engine| engine.cached_modules())
            .sum()
    }

    /// Pins the candidate tiers, keeping every other setting.
    pub fn with_tiers(mut self, tiers: impl IntoIterator<Item = IsolationTier>) -> Self {
        self.policy.tiers = tiers.into_iter().collect();
        self
    }
}

impl std::fmt::Debug for SandboxFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxFactory")
            .field("policy", &self.policy)
            .field("limits", &self.limits)
            .finish()
    }
}
