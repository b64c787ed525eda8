//! The part of a sandbox every tier shares: one instantiated module in its
//! own `Store`, the guest ABI calls into it, and the sandbox lifecycle.

use super::{ExecutionOutcome, FailureKind, InitContext, IsolationTier, RESERVED_EXPORTS};
use crate::capabilities::CapabilitySet;
use crate::error::PluginHostError;
use crate::host::{self, ImportPolicy, SandboxState, UnboundCapability};
use crate::limits::{ResourceLimits, ResourceUsage};
use crate::services::HostServices;
use plugguard_types::SandboxId;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wasmtime::{Engine, ExternType, Instance, Memory, Module, Store, Trap};

/// How a call's running time is bounded.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Deadline {
    Epoch { ticks: u64 },
    Fuel { budget: u64 },
}

/// Tier-specific confinement of a session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Confinement {
    pub deadline: Deadline,
    pub memory_limit: Option<usize>,
    pub imports: ImportPolicy,
}

#[derive(Debug)]
struct Fault {
    kind: FailureKind,
    message: String,
}

impl Fault {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<Fault> for ExecutionOutcome {
    fn from(fault: Fault) -> Self {
        ExecutionOutcome::failure(fault.kind, fault.message)
    }
}

fn classify(err: wasmtime::Error, timeout_ms: u64) -> Fault {
    if let Some(unbound) = err.downcast_ref::<UnboundCapability>() {
        return Fault::new(FailureKind::CapabilityUnavailable, unbound.to_string());
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::Interrupt | Trap::OutOfFuel) => {
            Fault::new(FailureKind::Timeout, format!("execution exceeded {timeout_ms}ms"))
        }
        Some(trap) => Fault::new(FailureKind::RuntimeError, format!("wasm trap: {trap}")),
        None => Fault::new(FailureKind::RuntimeError, format!("{err:#}")),
    }
}

/// Resets the store's deadline before a call into the guest.
fn arm(store: &mut Store<SandboxState>, deadline: Deadline) -> Result<(), Fault> {
    store.data_mut().start_call();
    match deadline {
        Deadline::Epoch { ticks } => store.set_epoch_deadline(ticks),
        Deadline::Fuel { budget } => store
            .set_fuel(budget)
            .map_err(|e| Fault::new(FailureKind::RuntimeError, format!("cannot set fuel: {e}")))?,
    }
    Ok(())
}

/// An instantiated module and its store.
struct WasmSession {
    store: Store<SandboxState>,
    instance: Instance,
    deadline: Deadline,
    timeout_ms: u64,
    max_output_bytes: usize,
}

impl WasmSession {
    fn arm(&mut self) -> Result<(), Fault> {
        arm(&mut self.store, self.deadline)
    }

    fn has_export(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }

    fn memory(&mut self) -> Result<Memory, Fault> {
        self.instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| Fault::new(FailureKind::RuntimeError, "plugin does not export `memory`"))
    }

    /// Calls an ABI function `(ptr, len) -> packed` with `input` as JSON.
    fn call(&mut self, name: &str, input: &Value) -> Result<Value, Fault> {
        let func = self.instance.get_func(&mut self.store, name).ok_or_else(|| {
            Fault::new(FailureKind::FunctionNotFound, format!("function '{name}' is not exported"))
        })?;
        let func = func.typed::<(i32, i32), i64>(&self.store).map_err(|_| {
            Fault::new(
                FailureKind::FunctionNotFound,
                format!("function '{name}' does not have the signature (i32, i32) -> i64"),
            )
        })?;
        let payload = serde_json::to_vec(input)
            .map_err(|e| Fault::new(FailureKind::RuntimeError, format!("cannot encode input: {e}")))?;

        self.arm()?;
        let (ptr, len) = self.write_input(&payload)?;
        let packed = func
            .call(&mut self.store, (ptr, len))
            .map_err(|e| classify(e, self.timeout_ms))?;
        self.read_output(packed)
    }

    fn write_input(&mut self, payload: &[u8]) -> Result<(i32, i32), Fault> {
        let alloc = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, "alloc")
            .map_err(|_| {
                Fault::new(FailureKind::RuntimeError, "plugin does not export `alloc(i32) -> i32`")
            })?;
        let len = i32::try_from(payload.len())
            .map_err(|_| Fault::new(FailureKind::RuntimeError, "input is too large"))?;
        let ptr = alloc
            .call(&mut self.store, len)
            .map_err(|e| classify(e, self.timeout_ms))?;
        let memory = self.memory()?;
        memory
            .write(&mut self.store, ptr as u32 as usize, payload)
            .map_err(|_| Fault::new(FailureKind::RuntimeError, format!("alloc returned invalid pointer {ptr}")))?;
        Ok((ptr, len))
    }

    fn read_output(&mut self, packed: i64) -> Result<Value, Fault> {
        let (ptr, len) = host::unpack(packed);
        let len = len as usize;
        if len == 0 {
            return Ok(Value::Null);
        }
        if len > self.max_output_bytes {
            return Err(Fault::new(
                FailureKind::OutputTooLarge,
                format!("result of {len} bytes exceeds the {} byte limit", self.max_output_bytes),
            ));
        }
        let memory = self.memory()?;
        let mut buf = vec![0u8; len];
        memory.read(&self.store, ptr as usize, &mut buf).map_err(|_| {
            Fault::new(FailureKind::RuntimeError, "result points outside linear memory")
        })?;
        match serde_json::from_slice(&buf) {
            Ok(value) => Ok(value),
            Err(_) => String::from_utf8(buf)
                .map(Value::String)
                .map_err(|_| Fault::new(FailureKind::RuntimeError, "result is not valid UTF-8")),
        }
    }

    fn usage(&self) -> ResourceUsage {
        self.store.data().limiter.usage()
    }
}

/// Lifecycle and bookkeeping shared by every tier.
pub(crate) struct SandboxCore {
    id: SandboxId,
    tier: IsolationTier,
    plugin_id: String,
    capabilities: CapabilitySet,
    limits: ResourceLimits,
    services: Arc<HostServices>,
    session: Option<WasmSession>,
    last_usage: ResourceUsage,
    executions: u64,
    disposed: bool,
    terminated: bool,
}

impl SandboxCore {
    pub(crate) fn new(
        tier: IsolationTier,
        capabilities: CapabilitySet,
        limits: ResourceLimits,
        services: Arc<HostServices>,
    ) -> Self {
        Self {
            id: SandboxId::new(),
            tier,
            plugin_id: String::new(),
            capabilities,
            limits,
            services,
            session: None,
            last_usage: ResourceUsage::default(),
            executions: 0,
            disposed: false,
            terminated: false,
        }
    }

    pub(crate) fn id(&self) -> SandboxId {
        self.id
    }

    pub(crate) fn tier(&self) -> IsolationTier {
        self.tier
    }

    pub(crate) fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub(crate) fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub(crate) fn execution_count(&self) -> u64 {
        self.executions
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub(crate) fn resource_usage(&self) -> ResourceUsage {
        self.session
            .as_ref()
            .map(WasmSession::usage)
            .unwrap_or_else(|| self.last_usage.clone())
    }

    /// The `Terminated` outcome for a torn-down sandbox.
    pub(crate) fn unavailable(&self) -> Option<ExecutionOutcome> {
        if self.terminated {
            Some(ExecutionOutcome::failure(
                FailureKind::Terminated,
                format!("sandbox {} was terminated after a timeout", self.id),
            ))
        } else if self.disposed {
            Some(ExecutionOutcome::failure(
                FailureKind::Terminated,
                format!("sandbox {} has been disposed", self.id),
            ))
        } else {
            None
        }
    }

    /// Instantiates `module` under `confinement` and runs `on_init`.
    pub(crate) fn start(
        &mut self,
        engine: &Engine,
        module: wasmtime::Result<Module>,
        confinement: Confinement,
        init: &InitContext,
    ) -> ExecutionOutcome {
        if let Some(outcome) = self.unavailable() {
            return outcome;
        }
        if self.session.is_some() {
            return ExecutionOutcome::failure(FailureKind::RuntimeError, "sandbox is already initialized");
        }
        self.plugin_id = init.plugin_id.clone();

        let module = match module {
            Ok(module) => module,
            Err(e) => return ExecutionOutcome::failure(FailureKind::CompileError, format!("{e:#}")),
        };
        if let Err(message) = host::screen_imports(&module, confinement.imports) {
            return ExecutionOutcome::failure(FailureKind::CapabilityUnavailable, message);
        }
        let linker = match host::build_linker(engine, &module, &self.capabilities, confinement.imports) {
            Ok(linker) => linker,
            Err(e) => return ExecutionOutcome::failure(FailureKind::RuntimeError, format!("{e:#}")),
        };

        let state = SandboxState::new(
            &init.plugin_id,
            self.id,
            Arc::clone(&self.services),
            self.limits.max_storage_bytes,
            confinement.memory_limit,
            self.limits.call_timeout(),
        );
        let mut store = Store::new(engine, state);
        store.limiter(|state| &mut state.limiter);

        if let Err(fault) = arm(&mut store, confinement.deadline) {
            return fault.into();
        }
        let timeout_ms = self.limits.call_timeout_ms;
        let instance = match linker.instantiate(&mut store, &module) {
            Ok(instance) => instance,
            Err(e) => return classify(e, timeout_ms).into(),
        };
        let mut session = WasmSession {
            store,
            instance,
            deadline: confinement.deadline,
            timeout_ms,
            max_output_bytes: self.limits.max_output_bytes,
        };

        let exports: Vec<String> = module
            .exports()
            .filter(|e| matches!(e.ty(), ExternType::Func(_)))
            .map(|e| e.name().to_string())
            .filter(|name| !RESERVED_EXPORTS.contains(&name.as_str()))
            .collect();

        let hook = if session.has_export("on_init") {
            let payload = serde_json::to_value(init).unwrap_or(Value::Null);
            Some(session.call("on_init", &payload))
        } else {
            None
        };
        self.session = Some(session);

        if let Some(Err(fault)) = hook {
            if fault.kind == FailureKind::Timeout {
                self.terminate();
            }
            return ExecutionOutcome::failure(fault.kind, format!("on_init failed: {}", fault.message));
        }

        info!(
            plugin_id = %self.plugin_id,
            sandbox_id = %self.id,
            tier = %self.tier,
            exports = exports.len(),
            "Sandbox initialized"
        );
        ExecutionOutcome::success(json!({ "exports": exports }))
    }

    pub(crate) fn execute(&mut self, function: &str, input: &Value) -> ExecutionOutcome {
        if let Some(outcome) = self.unavailable() {
            return outcome;
        }
        self.executions += 1;

        if RESERVED_EXPORTS.contains(&function) {
            return ExecutionOutcome::failure(
                FailureKind::FunctionNotFound,
                format!("'{function}' is reserved and cannot be called"),
            );
        }
        let Some(session) = self.session.as_mut() else {
            return ExecutionOutcome::failure(FailureKind::RuntimeError, "sandbox is not initialized");
        };

        match session.call(function, input) {
            Ok(result) => ExecutionOutcome::success(result),
            Err(fault) => {
                debug!(
                    plugin_id = %self.plugin_id,
                    sandbox_id = %self.id,
                    function,
                    kind = %fault.kind,
                    error = %fault.message,
                    "Plugin call failed"
                );
                if fault.kind == FailureKind::Timeout {
                    self.terminate();
                }
                fault.into()
            }
        }
    }

    /// Drops the instance after a timeout; the sandbox cannot be reused.
    fn terminate(&mut self) {
        warn!(
            plugin_id = %self.plugin_id,
            sandbox_id = %self.id,
            tier = %self.tier,
            timeout_ms = self.limits.call_timeout_ms,
            "Plugin exceeded its deadline, reclaiming sandbox"
        );
        self.release();
        self.terminated = true;
    }

    fn release(&mut self) {
        if let Some(session) = self.session.take() {
            self.last_usage = session.usage();
        }
    }

    pub(crate) fn dispose(&mut self) -> Result<(), PluginHostError> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let hook = self.session.as_mut().and_then(|session| {
            session
                .has_export("on_dispose")
                .then(|| session.call("on_dispose", &Value::Null))
        });
        self.release();
        debug!(plugin_id = %self.plugin_id, sandbox_id = %self.id, "Sandbox disposed");

        match hook {
            Some(Err(fault)) => {
                warn!(
                    plugin_id = %self.plugin_id,
                    sandbox_id = %self.id,
                    error = %fault.message,
                    "on_dispose failed"
                );
                Err(PluginHostError::Dispose {
                    sandbox_id: self.id.to_string(),
                    message: fault.message,
                })
            }
            _ => Ok(()),
        }
    }
}
