//! Central plugin lifecycle manager.
//!
//! Owns every loaded sandbox, gates loading on host policy and the
//! permission ledger, serializes calls per plugin and keeps execution
//! statistics. All methods take `&self`; the manager is shared across
//! threads behind an `Arc`.

use crate::backend::{ExecutionOutcome, FailureKind, InitContext, IsolationBackend, IsolationTier};
use crate::capabilities::CapabilitySet;
use crate::error::PluginHostError;
use crate::factory::{SandboxFactory, SandboxPolicy};
use crate::limits::{ResourceLimits, ResourceUsage};
use crate::policy::PolicyEngine;
use crate::services::HostServices;
use chrono::{DateTime, Utc};
use plugguard_permissions::{AuditAction, AuditEvent, Decision, PermissionLedger};
use plugguard_types::{EntityType, SandboxId};
use serde::{Serialize, Serializer};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything needed to load one plugin.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub plugin_id: String,
    /// WebAssembly module, text or binary.
    pub code: Vec<u8>,
    pub permissions: Vec<String>,
    /// Handed to the plugin's `on_init` hook.
    pub config: Value,
}

impl LoadRequest {
    pub fn new(plugin_id: impl Into<String>, code: impl Into<Vec<u8>>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            code: code.into(),
            permissions: Vec::new(),
            config: Value::Null,
        }
    }

    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReceipt {
    pub plugin_id: String,
    pub sandbox_id: SandboxId,
    pub tier: IsolationTier,
    pub unsafe_tier: bool,
    pub capabilities: CapabilitySet,
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub plugin_id: String,
    pub function: String,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
    #[serde(rename = "durationMs", serialize_with = "as_millis")]
    pub duration: Duration,
    pub execution_count: u64,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Per-plugin call statistics. Kept after the plugin is unloaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total_executions: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub avg_duration_ms: f64,
    pub last_duration_ms: f64,
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl ExecutionStats {
    fn record(&mut self, duration: Duration, outcome: &ExecutionOutcome) {
        let ms = duration.as_secs_f64() * 1000.0;
        self.total_executions += 1;
        if !outcome.is_success() {
            self.errors += 1;
        }
        if outcome.failure_kind() == Some(FailureKind::Timeout) {
            self.timeouts += 1;
        }
        self.avg_duration_ms += (ms - self.avg_duration_ms) / self.total_executions as f64;
        self.last_duration_ms = ms;
        self.last_executed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginStatus {
    pub plugin_id: String,
    pub sandbox_id: SandboxId,
    pub tier: IsolationTier,
    pub unsafe_tier: bool,
    pub terminated: bool,
    pub capabilities: CapabilitySet,
    pub permissions: Vec<String>,
    pub loaded_at: DateTime<Utc>,
    pub execution_count: u64,
    pub resources: ResourceUsage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub loaded_plugins: usize,
    pub sandbox_policy: SandboxPolicy,
    pub limits: ResourceLimits,
    pub cached_modules: usize,
    pub plugins: Vec<PluginStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub disposed: usize,
    /// `(plugin_id, error)` for sandboxes whose dispose hook failed. They
    /// are released regardless.
    pub failed: Vec<(String, String)>,
}

struct LoadedPlugin {
    sandbox: Box<dyn IsolationBackend>,
    permissions: Vec<String>,
    loaded_at: DateTime<Utc>,
    unloaded: bool,
}

type PluginMap = HashMap<String, Arc<Mutex<LoadedPlugin>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Manages the lifecycle of all loaded plugins.
pub struct PluginRuntimeManager {
    ledger: Arc<PermissionLedger>,
    policy: PolicyEngine,
    factory: SandboxFactory,
    plugins: RwLock<PluginMap>,
    stats: Mutex<HashMap<String, ExecutionStats>>,
}

impl PluginRuntimeManager {
    /// Creates a manager whose sandboxes follow `policy`'s tier selection
    /// and limits.
    pub fn new(ledger: Arc<PermissionLedger>, policy: PolicyEngine) -> Self {
        let services = HostServices::new(policy.resource_limits());
        let factory = SandboxFactory::from_policy(&policy, services);
        Self::with_factory(ledger, policy, factory)
    }

    pub fn with_factory(ledger: Arc<PermissionLedger>, policy: PolicyEngine, factory: SandboxFactory) -> Self {
        Self {
            ledger,
            policy,
            factory,
            plugins: RwLock::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<PermissionLedger> {
        &self.ledger
    }

    pub fn policy_engine(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn factory(&self) -> &SandboxFactory {
        &self.factory
    }

    fn read_plugins(&self) -> RwLockReadGuard<'_, PluginMap> {
        self.plugins.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_plugins(&self) -> RwLockWriteGuard<'_, PluginMap> {
        self.plugins.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry(&self, plugin_id: &str) -> Result<Arc<Mutex<LoadedPlugin>>, PluginHostError> {
        self.read_plugins()
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PluginHostError::NotLoaded(plugin_id.to_string()))
    }

    fn audit(&self, action: AuditAction, plugin_id: &str, metadata: Value) {
        self.ledger.record_event(
            AuditEvent::new(action, plugin_id)
                .entity_type(EntityType::Plugin)
                .metadata(metadata),
        );
    }

    // ================================================================
    // Loading / Unloading
    // ================================================================

    /// Loads a plugin: host policy, then every requested permission against
    /// the policy deny list and the ledger, then a sandbox in the strongest
    /// available tier. Nothing is registered if any step fails.
    pub fn load_plugin(&self, request: LoadRequest) -> Result<LoadReceipt, PluginHostError> {
        let result = self
            .admit(&request)
            .and_then(|capabilities| self.instantiate(&request, capabilities));

        if let Err(e) = &result {
            warn!(plugin_id = %request.plugin_id, error = %e, "Plugin load failed");
            self.audit(
                AuditAction::PluginLoadFailed,
                &request.plugin_id,
                json!({ "error": e.to_string(), "permissions": request.permissions }),
            );
        }
        result
    }

    fn admit(&self, request: &LoadRequest) -> Result<CapabilitySet, PluginHostError> {
        let plugin_id = &request.plugin_id;
        if !self.policy.is_plugin_allowed(plugin_id) {
            return Err(PluginHostError::PolicyDenied(format!(
                "plugin '{plugin_id}' blocked by policy"
            )));
        }
        if self.is_loaded(plugin_id) {
            return Err(PluginHostError::AlreadyLoaded(plugin_id.clone()));
        }

        let mut granted = Vec::with_capacity(request.permissions.len());
        for raw in &request.permissions {
            let permission = self.ledger.catalog().parse(raw).map_err(|source| {
                PluginHostError::InvalidPermission {
                    plugin_id: plugin_id.clone(),
                    permission: raw.clone(),
                    source,
                }
            })?;
            if self.policy.is_permission_denied_by_policy(&permission) {
                return Err(PluginHostError::PolicyDenied(format!(
                    "permission '{permission}' is denied by host policy"
                )));
            }
            if let Decision::Denied(reason) = self.ledger.check(plugin_id, raw) {
                return Err(PluginHostError::PermissionDenied {
                    plugin_id: plugin_id.clone(),
                    permission: raw.clone(),
                    reason: reason.to_string(),
                });
            }
            granted.push(permission);
        }
        Ok(CapabilitySet::from_permissions(&granted))
    }

    fn instantiate(&self, request: &LoadRequest, capabilities: CapabilitySet) -> Result<LoadReceipt, PluginHostError> {
        let plugin_id = &request.plugin_id;
        let mut sandbox = self.factory.create(&capabilities)?;

        let init = InitContext::new(plugin_id.clone(), request.config.clone());
        if let ExecutionOutcome::Failure { error, kind } = sandbox.initialize(&request.code, &init) {
            if let Err(e) = sandbox.dispose() {
                debug!(plugin_id = %plugin_id, "dispose after failed init: {}", e);
            }
            return Err(PluginHostError::InitializationFailed {
                plugin_id: plugin_id.clone(),
                kind,
                message: error,
            });
        }

        let receipt = LoadReceipt {
            plugin_id: plugin_id.clone(),
            sandbox_id: sandbox.id(),
            tier: sandbox.tier(),
            unsafe_tier: sandbox.tier().is_unsafe(),
            capabilities,
        };

        {
            let mut plugins = self.write_plugins();
            if plugins.contains_key(plugin_id) {
                drop(plugins);
                let _ = sandbox.dispose();
                return Err(PluginHostError::AlreadyLoaded(plugin_id.clone()));
            }
            plugins.insert(
                plugin_id.clone(),
                Arc::new(Mutex::new(LoadedPlugin {
                    sandbox,
                    permissions: request.permissions.clone(),
                    loaded_at: Utc::now(),
                    unloaded: false,
                })),
            );
        }

        if receipt.unsafe_tier {
            warn!(plugin_id = %plugin_id, "Plugin is running in the UNSAFE fallback tier");
        }
        info!(
            plugin_id = %plugin_id,
            sandbox_id = %receipt.sandbox_id,
            tier = %receipt.tier,
            "Plugin loaded"
        );
        self.audit(
            AuditAction::PluginLoad,
            plugin_id,
            json!({
                "sandboxId": receipt.sandbox_id,
                "tier": receipt.tier,
                "unsafe": receipt.unsafe_tier,
                "permissions": request.permissions,
                "capabilities": receipt.capabilities,
            }),
        );
        Ok(receipt)
    }

    /// Removes a plugin and disposes its sandbox once any in-flight call
    /// has finished. A failing dispose hook is logged; the plugin is
    /// unloaded regardless.
    pub fn unload_plugin(&self, plugin_id: &str) -> Result<(), PluginHostError> {
        let entry = self
            .write_plugins()
            .remove(plugin_id)
            .ok_or_else(|| PluginHostError::NotLoaded(plugin_id.to_string()))?;

        let (executions, disposed) = {
            let mut plugin = lock(&entry);
            plugin.unloaded = true;
            (plugin.sandbox.execution_count(), plugin.sandbox.dispose())
        };
        if let Err(e) = &disposed {
            warn!(plugin_id = %plugin_id, "dispose() failed during unload: {}", e);
        }

        info!(plugin_id = %plugin_id, executions, "Plugin unloaded");
        self.audit(
            AuditAction::PluginUnload,
            plugin_id,
            json!({
                "executions": executions,
                "disposeError": disposed.err().map(|e| e.to_string()),
            }),
        );
        Ok(())
    }

    /// Unloads every plugin. Individual dispose failures are collected,
    /// not propagated.
    pub fn cleanup(&self) -> CleanupReport {
        let drained: Vec<(String, Arc<Mutex<LoadedPlugin>>)> = self.write_plugins().drain().collect();
        let mut report = CleanupReport::default();

        for (plugin_id, entry) in drained {
            let disposed = {
                let mut plugin = lock(&entry);
                plugin.unloaded = true;
                plugin.sandbox.dispose()
            };
            match disposed {
                Ok(()) => report.disposed += 1,
                Err(e) => {
                    warn!(plugin_id = %plugin_id, "dispose() failed during cleanup: {}", e);
                    report.failed.push((plugin_id.clone(), e.to_string()));
                }
            }
            self.audit(AuditAction::PluginUnload, &plugin_id, json!({ "cleanup": true }));
        }

        if report.disposed > 0 || !report.failed.is_empty() {
            info!(disposed = report.disposed, failed = report.failed.len(), "Plugin cleanup finished");
        }
        report
    }

    // ================================================================
    // Execution
    // ================================================================

    /// Calls an exported entry point. Guest faults come back as a failed
    /// [`ExecutionOutcome`] inside `Ok`; `Err` only means the plugin is not
    /// loaded.
    pub fn execute_plugin(
        &self,
        plugin_id: &str,
        function: &str,
        input: &Value,
    ) -> Result<ExecutionReport, PluginHostError> {
        let entry = self.entry(plugin_id)?;

        let (outcome, duration, execution_count) = {
            let mut plugin = lock(&entry);
            if plugin.unloaded {
                return Err(PluginHostError::NotLoaded(plugin_id.to_string()));
            }
            let started = Instant::now();
            let outcome = plugin.sandbox.execute(function, input);
            (outcome, started.elapsed(), plugin.sandbox.execution_count())
        };

        lock(&self.stats)
            .entry(plugin_id.to_string())
            .or_default()
            .record(duration, &outcome);

        match outcome.failure_kind() {
            Some(FailureKind::Timeout) => {
                warn!(plugin_id = %plugin_id, function, "Plugin call timed out; sandbox terminated")
            }
            Some(kind) => debug!(plugin_id = %plugin_id, function, kind = %kind, "Plugin call failed"),
            None => debug!(plugin_id = %plugin_id, function, ?duration, "Plugin call succeeded"),
        }
        self.audit(
            AuditAction::PluginExecute,
            plugin_id,
            json!({
                "function": function,
                "success": outcome.is_success(),
                "kind": outcome.failure_kind(),
                "durationMs": duration.as_secs_f64() * 1000.0,
                "executionCount": execution_count,
            }),
        );

        Ok(ExecutionReport {
            plugin_id: plugin_id.to_string(),
            function: function.to_string(),
            outcome,
            duration,
            execution_count,
        })
    }

    // ================================================================
    // Introspection
    // ================================================================

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.read_plugins().contains_key(plugin_id)
    }

    pub fn plugin_count(&self) -> usize {
        self.read_plugins().len()
    }

    pub fn loaded_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_plugins().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Execution statistics, for one plugin or all of them.
    pub fn stats(&self, plugin_id: Option<&str>) -> BTreeMap<String, ExecutionStats> {
        let stats = lock(&self.stats);
        match plugin_id {
            Some(id) => stats.get(id).map(|s| (id.to_string(), s.clone())).into_iter().collect(),
            None => stats.iter().map(|(id, s)| (id.clone(), s.clone())).collect(),
        }
    }

    /// Snapshot of every loaded plugin. Waits for in-flight calls.
    pub fn status(&self) -> ManagerStatus {
        let entries: Vec<(String, Arc<Mutex<LoadedPlugin>>)> = self
            .read_plugins()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        let mut plugins: Vec<PluginStatus> = entries
            .into_iter()
            .map(|(plugin_id, entry)| {
                let plugin = lock(&entry);
                let sandbox = &plugin.sandbox;
                PluginStatus {
                    plugin_id,
                    sandbox_id: sandbox.id(),
                    tier: sandbox.tier(),
                    unsafe_tier: sandbox.tier().is_unsafe(),
                    terminated: sandbox.is_terminated(),
                    capabilities: sandbox.capabilities().clone(),
                    permissions: plugin.permissions.clone(),
                    loaded_at: plugin.loaded_at,
                    execution_count: sandbox.execution_count(),
                    resources: sandbox.resource_usage(),
                }
            })
            .collect();
        plugins.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));

        ManagerStatus {
            loaded_plugins: plugins.len(),
            sandbox_policy: self.factory.policy().clone(),
            limits: self.factory.limits().clone(),
            cached_modules: self.factory.cached_modules(),
            plugins,
        }
    }
}

impl Drop for PluginRuntimeManager {
    fn drop(&mut self) {
        if self.plugin_count() > 0 {
            self.cleanup();
        }
    }
}
