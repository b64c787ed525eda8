//! Isolation backends: the tiers a plugin can run in.
//!
//! All tiers run WebAssembly through wasmtime and speak the same guest ABI;
//! they differ in how strongly the guest is confined:
//!
//! | tier                    | engine                   | memory ceiling | timeout          | imports    |
//! |-------------------------|--------------------------|----------------|------------------|------------|
//! | `StrongIsolation`       | native, one per sandbox  | yes            | epoch, own timer | allow-list |
//! | `RestrictedInterpreter` | Pulley, shared           | yes            | epoch, shared    | allow-list |
//! | `UnsafeFallback`        | native, shared           | no             | fuel estimate    | deny-list  |

mod engine;
mod interpreter;
mod session;
mod strong;
mod unsafe_fallback;

pub use interpreter::RestrictedInterpreter;
pub use strong::StrongIsolation;
pub use unsafe_fallback::UnsafeFallback;

pub(crate) use engine::{SharedEngine, fuel_config, interpreter_config};

use crate::capabilities::CapabilitySet;
use crate::error::PluginHostError;
use crate::limits::ResourceUsage;
use plugguard_types::SandboxId;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Export names that are part of the ABI and never callable as entry points.
pub const RESERVED_EXPORTS: &[&str] = &["alloc", "memory", "on_init", "on_dispose"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationTier {
    StrongIsolation,
    RestrictedInterpreter,
    UnsafeFallback,
}

impl IsolationTier {
    /// Every tier, strongest first.
    pub const ALL: [IsolationTier; 3] = [
        IsolationTier::StrongIsolation,
        IsolationTier::RestrictedInterpreter,
        IsolationTier::UnsafeFallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrongIsolation => "strong-isolation",
            Self::RestrictedInterpreter => "restricted-interpreter",
            Self::UnsafeFallback => "unsafe-fallback",
        }
    }

    /// Higher is stronger.
    pub fn strength(&self) -> u8 {
        match self {
            Self::StrongIsolation => 3,
            Self::RestrictedInterpreter => 2,
            Self::UnsafeFallback => 1,
        }
    }

    pub fn is_at_least(&self, minimum: IsolationTier) -> bool {
        self.strength() >= minimum.strength()
    }

    pub fn is_unsafe(&self) -> bool {
        matches!(self, Self::UnsafeFallback)
    }
}

impl fmt::Display for IsolationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown isolation tier '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RuntimeError,
    CompileError,
    CapabilityUnavailable,
    FunctionNotFound,
    OutputTooLarge,
    Terminated,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RuntimeError => "runtime_error",
            Self::CompileError => "compile_error",
            Self::CapabilityUnavailable => "capability_unavailable",
            Self::FunctionNotFound => "function_not_found",
            Self::OutputTooLarge => "output_too_large",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running plugin code. Guest faults are data, never panics.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success { result: Value },
    Failure { error: String, kind: FailureKind },
}

impl ExecutionOutcome {
    pub fn success(result: Value) -> Self {
        Self::Success { result }
    }

    pub fn failure(kind: FailureKind, error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            kind,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Success { result } => Some(result),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }
}

#[derive(Serialize)]
struct OutcomeRecord<'a> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<FailureKind>,
}

impl Serialize for ExecutionOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        OutcomeRecord {
            success: self.is_success(),
            result: self.result(),
            error: self.error(),
            kind: self.failure_kind(),
        }
        .serialize(serializer)
    }
}

/// What a plugin's `on_init` hook receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitContext {
    pub plugin_id: String,
    pub config: Value,
}

impl InitContext {
    pub fn new(plugin_id: impl Into<String>, config: Value) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            config,
        }
    }
}

/// A sandbox able to load and run one plugin.
///
/// `execute` and `initialize` never return `Err`: every guest fault is an
/// [`ExecutionOutcome::Failure`]. After a timeout the sandbox is torn down
/// and every further call reports [`FailureKind::Terminated`].
pub trait IsolationBackend: Send {
    fn id(&self) -> SandboxId;

    fn tier(&self) -> IsolationTier;

    fn capabilities(&self) -> &CapabilitySet;

    /// Number of `execute` calls that reached this sandbox.
    fn execution_count(&self) -> u64;

    fn is_disposed(&self) -> bool;

    /// Whether the sandbox was reclaimed after a timeout.
    fn is_terminated(&self) -> bool;

    fn resource_usage(&self) -> ResourceUsage;

    /// Compiles and instantiates `code` (WAT or binary wasm), then runs the
    /// optional `on_init` hook. Success carries the callable exports.
    fn initialize(&mut self, code: &[u8], init: &InitContext) -> ExecutionOutcome;

    fn execute(&mut self, function: &str, input: &Value) -> ExecutionOutcome;

    /// Runs the optional `on_dispose` hook and releases the instance.
    /// Idempotent; resources are released even if the hook fails.
    fn dispose(&mut self) -> Result<(), PluginHostError>;
}
