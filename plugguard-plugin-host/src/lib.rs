//! Wasmtime-based plugin host for plugguard.
//!
//! Loads WebAssembly plugins into tiered sandboxes, wires host functions
//! only for the capabilities a plugin's granted permissions cover, and
//! records every lifecycle event in the permission ledger's audit trail.
//!
//! Each plugin runs in its own `wasmtime::Store` with a wall-clock
//! deadline, a memory ceiling (except in the opt-in unsafe tier), and no
//! ambient access to the filesystem, environment or clock beyond `host`.

mod backend;
mod capabilities;
mod error;
mod factory;
mod host;
mod limits;
mod manager;
mod policy;
mod services;

pub use backend::{
    ExecutionOutcome, FailureKind, InitContext, IsolationBackend, IsolationTier,
    RESERVED_EXPORTS, RestrictedInterpreter, StrongIsolation, UnsafeFallback,
};
pub use capabilities::{Capability, CapabilitySet, HOST_MODULE, UTILITY_IMPORTS};
pub use error::PluginHostError;
pub use factory::{SandboxFactory, SandboxPolicy};
pub use host::{LocalStorage, UnboundCapability};
pub use limits::{ResourceLimits, ResourceUsage, WASM_PAGE_BYTES};
pub use manager::{
    CleanupReport, ExecutionReport, ExecutionStats, LoadReceipt, LoadRequest, ManagerStatus,
    PluginRuntimeManager, PluginStatus,
};
pub use policy::{AuditConfig, POLICY_PATH_ENV, PolicyConfig, PolicyEngine, PolicyMode};
pub use services::{AiService, FetchRequest, FetchResponse, HostServices, validate_fetch_url};
