//! Host side of the guest ABI: per-sandbox store state, guest memory
//! access, import screening and the `host` module functions.
//!
//! Every value crossing the boundary is UTF-8 bytes in guest linear memory,
//! addressed as `(ptr, len)`. Host results are written into the guest
//! through its `alloc` export and returned packed as `(ptr << 32) | len`;
//! `0` means "no value".

use crate::capabilities::{Capability, CapabilitySet, HOST_MODULE, is_known_host_import};
use crate::limits::MemoryLimiter;
use crate::services::{FetchRequest, HostServices};
use plugguard_types::SandboxId;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use wasmtime::{Caller, Engine, Extern, ExternType, Linker, Memory, Module};

/// Largest single buffer a host function will read out of the guest.
const MAX_HOST_READ_BYTES: usize = 4 * 1024 * 1024;

/// Import modules that are refused on every tier.
pub(crate) const DENIED_IMPORT_MODULES: &[&str] =
    &["wasi_snapshot_preview1", "wasi_unstable", "wasi", "env"];

/// Raised by the stub linked in place of a capability that was not granted.
#[derive(Debug, Clone, Error)]
#[error("capability '{permission}' is not available to this plugin (called host.{import})")]
pub struct UnboundCapability {
    pub permission: &'static str,
    pub import: String,
}

/// Per-sandbox key/value storage behind `storage:local`.
#[derive(Debug, Default)]
pub struct LocalStorage {
    entries: HashMap<String, Vec<u8>>,
    used_bytes: usize,
    quota_bytes: usize,
}

impl LocalStorage {
    pub fn new(quota_bytes: usize) -> Self {
        Self {
            quota_bytes,
            ..Default::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Stores `value` under `key`. Returns false, leaving the store
    /// untouched, if the write would exceed the quota.
    pub fn set(&mut self, key: &str, value: Vec<u8>) -> bool {
        let replaced = self.entries.get(key).map_or(0, |v| key.len() + v.len());
        let used = self.used_bytes - replaced + key.len() + value.len();
        if used > self.quota_bytes {
            return false;
        }
        self.used_bytes = used;
        self.entries.insert(key.to_string(), value);
        true
    }

    pub fn delete(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(value) => {
                self.used_bytes -= key.len() + value.len();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.used_bytes = 0;
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Data owned by a sandbox's `Store`.
pub struct SandboxState {
    pub(crate) plugin_id: String,
    pub(crate) sandbox_id: SandboxId,
    pub(crate) services: Arc<HostServices>,
    pub(crate) storage: LocalStorage,
    pub(crate) limiter: MemoryLimiter,
    call_timeout: Duration,
    call_started: Instant,
}

impl SandboxState {
    pub(crate) fn new(
        plugin_id: &str,
        sandbox_id: SandboxId,
        services: Arc<HostServices>,
        storage_quota: usize,
        max_memory: Option<usize>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            sandbox_id,
            services,
            storage: LocalStorage::new(storage_quota),
            limiter: MemoryLimiter::new(max_memory),
            call_timeout,
            call_started: Instant::now(),
        }
    }

    /// Marks the start of a guest call; host calls share its timeout.
    pub(crate) fn start_call(&mut self) {
        self.call_started = Instant::now();
    }

    /// Time left before the current guest call's deadline.
    pub(crate) fn remaining_call_time(&self) -> Duration {
        self.call_timeout.saturating_sub(self.call_started.elapsed())
    }
}

// ============================================================================
// Packed pointers and guest memory
// ============================================================================

pub(crate) fn pack(ptr: u32, len: u32) -> i64 {
    ((u64::from(ptr) << 32) | u64::from(len)) as i64
}

pub(crate) fn unpack(packed: i64) -> (u32, u32) {
    let packed = packed as u64;
    ((packed >> 32) as u32, packed as u32)
}

fn guest_memory(caller: &mut Caller<'_, SandboxState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("plugin does not export `memory`"))
}

fn read_guest(caller: &mut Caller<'_, SandboxState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let (ptr, len) = (ptr as u32 as usize, len as u32 as usize);
    if len > MAX_HOST_READ_BYTES {
        return Err(wasmtime::Error::msg(format!(
            "host call argument of {len} bytes exceeds {MAX_HOST_READ_BYTES}"
        )));
    }
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; len];
    memory.read(&*caller, ptr, &mut buf)?;
    Ok(buf)
}

/// Copies `bytes` into guest memory obtained from the guest's `alloc`.
fn write_guest(caller: &mut Caller<'_, SandboxState>, bytes: &[u8]) -> wasmtime::Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    let alloc = caller
        .get_export("alloc")
        .and_then(Extern::into_func)
        .ok_or_else(|| wasmtime::Error::msg("plugin does not export `alloc`"))?
        .typed::<i32, i32>(&*caller)?;
    let len = i32::try_from(bytes.len())?;
    let ptr = alloc.call(&mut *caller, len)?;
    let memory = guest_memory(caller)?;
    memory.write(&mut *caller, ptr as u32 as usize, bytes)?;
    Ok(pack(ptr as u32, len as u32))
}

fn envelope<T: Serialize>(result: Result<T, String>) -> Vec<u8> {
    let value = match result {
        Ok(ok) => json!({ "ok": ok }),
        Err(error) => json!({ "error": error }),
    };
    serde_json::to_vec(&value).unwrap_or_else(|_| br#"{"error":"unencodable result"}"#.to_vec())
}

// ============================================================================
// Import screening
// ============================================================================

/// How strictly a tier screens the imports a module declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ImportPolicy {
    /// Only functions of the `host` module.
    AllowList,
    /// Anything except the denied modules; unknown modules become traps.
    DenyList,
}

pub(crate) fn screen_imports(module: &Module, policy: ImportPolicy) -> Result<(), String> {
    for import in module.imports() {
        let (name, field) = (import.module(), import.name());
        if DENIED_IMPORT_MODULES.contains(&name) {
            return Err(format!("import {name}.{field} is not available to plugins"));
        }
        if name == HOST_MODULE {
            if !matches!(import.ty(), ExternType::Func(_)) {
                return Err(format!("import {name}.{field} must be a function"));
            }
            if !is_known_host_import(field) {
                return Err(format!("unknown host function {name}.{field}"));
            }
        } else if policy == ImportPolicy::AllowList {
            return Err(format!("import {name}.{field} is outside the `{HOST_MODULE}` module"));
        }
    }
    Ok(())
}

// ============================================================================
// Linking
// ============================================================================

/// Builds the linker for one module: utility functions, the functions of
/// granted capabilities and trap stubs for known but ungranted ones.
pub(crate) fn build_linker(
    engine: &Engine,
    module: &Module,
    capabilities: &CapabilitySet,
    policy: ImportPolicy,
) -> wasmtime::Result<Linker<SandboxState>> {
    let mut linker = Linker::new(engine);
    link_utilities(&mut linker)?;
    for capability in capabilities.iter() {
        match capability {
            Capability::Fetch => link_fetch(&mut linker)?,
            Capability::LocalStorage => link_storage(&mut linker)?,
            Capability::AiChat => link_ai_chat(&mut linker)?,
            Capability::AiEmbeddings => link_ai_embed(&mut linker)?,
        }
    }

    for import in module.imports() {
        if import.module() != HOST_MODULE {
            continue;
        }
        let Some(capability) = Capability::for_import(import.name()) else {
            continue;
        };
        if capabilities.contains(capability) {
            continue;
        }
        if let ExternType::Func(ty) = import.ty() {
            let stub = UnboundCapability {
                permission: capability.permission(),
                import: import.name().to_string(),
            };
            linker.func_new(HOST_MODULE, import.name(), ty, move |_caller, _params, _results| {
                Err(wasmtime::Error::new(stub.clone()))
            })?;
        }
    }

    if policy == ImportPolicy::DenyList {
        linker.define_unknown_imports_as_traps(module)?;
    }
    Ok(linker)
}

fn link_utilities(linker: &mut Linker<SandboxState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, SandboxState>, level: i32, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let message = String::from_utf8_lossy(&bytes);
            let state = caller.data();
            let (plugin_id, sandbox_id) = (&state.plugin_id, state.sandbox_id);
            match level {
                0 => trace!(plugin_id = %plugin_id, %sandbox_id, "{message}"),
                1 => debug!(plugin_id = %plugin_id, %sandbox_id, "{message}"),
                2 => info!(plugin_id = %plugin_id, %sandbox_id, "{message}"),
                3 => warn!(plugin_id = %plugin_id, %sandbox_id, "{message}"),
                _ => error!(plugin_id = %plugin_id, %sandbox_id, "{message}"),
            }
            Ok(())
        },
    )?;
    linker.func_wrap(HOST_MODULE, "now_ms", || -> i64 { chrono::Utc::now().timestamp_millis() })?;
    Ok(())
}

fn link_fetch(linker: &mut Linker<SandboxState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "fetch",
        |mut caller: Caller<'_, SandboxState>, ptr: i32, len: i32| -> wasmtime::Result<i64> {
            let raw = read_guest(&mut caller, ptr, len)?;
            let reply = match serde_json::from_slice::<FetchRequest>(&raw) {
                Ok(request) => {
                    let state = caller.data();
                    let remaining = state.remaining_call_time();
                    envelope(state.services.fetch(&state.plugin_id, &request, remaining))
                }
                Err(e) => envelope::<()>(Err(format!("invalid fetch request: {e}"))),
            };
            write_guest(&mut caller, &reply)
        },
    )?;
    Ok(())
}

fn link_storage(linker: &mut Linker<SandboxState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "storage_get",
        |mut caller: Caller<'_, SandboxState>, ptr: i32, len: i32| -> wasmtime::Result<i64> {
            let key = String::from_utf8(read_guest(&mut caller, ptr, len)?)?;
            let value = caller.data().storage.get(&key).map(<[u8]>::to_vec);
            match value {
                Some(value) => write_guest(&mut caller, &value),
                None => Ok(0),
            }
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "storage_set",
        |mut caller: Caller<'_, SandboxState>,
         key_ptr: i32,
         key_len: i32,
         value_ptr: i32,
         value_len: i32|
         -> wasmtime::Result<i32> {
            let key = String::from_utf8(read_guest(&mut caller, key_ptr, key_len)?)?;
            let value = read_guest(&mut caller, value_ptr, value_len)?;
            let state = caller.data_mut();
            if state.storage.set(&key, value) {
                Ok(0)
            } else {
                debug!(plugin_id = %state.plugin_id, key = %key, "Storage quota exceeded");
                Ok(-1)
            }
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "storage_delete",
        |mut caller: Caller<'_, SandboxState>, ptr: i32, len: i32| -> wasmtime::Result<i32> {
            let key = String::from_utf8(read_guest(&mut caller, ptr, len)?)?;
            Ok(i32::from(caller.data_mut().storage.delete(&key)))
        },
    )?;
    linker.func_wrap(HOST_MODULE, "storage_clear", |mut caller: Caller<'_, SandboxState>| {
        caller.data_mut().storage.clear();
    })?;
    Ok(())
}

fn link_ai_chat(linker: &mut Linker<SandboxState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "ai_chat",
        |mut caller: Caller<'_, SandboxState>, ptr: i32, len: i32| -> wasmtime::Result<i64> {
            let reply = match serde_json::from_slice::<Value>(&read_guest(&mut caller, ptr, len)?) {
                Ok(request) => {
                    let state = caller.data();
                    envelope(state.services.ai_chat(&state.plugin_id, &request))
                }
                Err(e) => envelope::<()>(Err(format!("invalid chat request: {e}"))),
            };
            write_guest(&mut caller, &reply)
        },
    )?;
    Ok(())
}

fn link_ai_embed(linker: &mut Linker<SandboxState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "ai_embed",
        |mut caller: Caller<'_, SandboxState>, ptr: i32, len: i32| -> wasmtime::Result<i64> {
            let reply = match serde_json::from_slice::<Value>(&read_guest(&mut caller, ptr, len)?) {
                Ok(input) => {
                    let state = caller.data();
                    envelope(state.services.ai_embed(&state.plugin_id, &input))
                }
                Err(e) => envelope::<()>(Err(format!("invalid embeddings request: {e}"))),
            };
            write_guest(&mut caller, &reply)
        },
    )?;
    Ok(())
}
