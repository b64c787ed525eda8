//! Engine configuration per tier, the epoch ticker and the shared-engine
//! module cache.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;
use wasmtime::{Config, Engine, Module};

pub(crate) const EPOCH_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Compiled modules kept per shared engine before the cache is flushed.
const MODULE_CACHE_CAPACITY: usize = 64;

pub(crate) fn epoch_deadline_ticks(timeout: Duration) -> u64 {
    let interval_ms = EPOCH_TICK_INTERVAL.as_millis().max(1);
    let timeout_ms = timeout.as_millis().max(1);
    timeout_ms.div_ceil(interval_ms) as u64
}

/// Native Cranelift code with epoch interruption.
pub(crate) fn native_config() -> Config {
    let mut config = Config::new();
    config.epoch_interruption(true);
    config
}

/// Pulley bytecode: no native code, no virtual-memory guard regions.
pub(crate) fn interpreter_config() -> wasmtime::Result<Config> {
    let target = if cfg!(target_pointer_width = "64") { "pulley64" } else { "pulley32" };
    let mut config = Config::new();
    config.target(target)?;
    config.epoch_interruption(true);
    config.signals_based_traps(false);
    config.memory_reservation(0);
    config.memory_guard_size(0);
    config.memory_reservation_for_growth(0);
    Ok(config)
}

/// Native code metered by fuel instead of epochs.
pub(crate) fn fuel_config() -> Config {
    let mut config = Config::new();
    config.consume_fuel(true);
    config
}

/// Advances an engine's epoch on a background thread until dropped.
pub(crate) struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    pub(crate) fn start(engine: Engine) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = std::thread::Builder::new()
            .name("plugguard-epoch".to_string())
            .spawn(move || {
                while !stop_clone.load(Ordering::SeqCst) {
                    std::thread::sleep(EPOCH_TICK_INTERVAL);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// An engine shared by many sandboxes, with a content-addressed cache of
/// compiled modules.
pub(crate) struct SharedEngine {
    engine: Engine,
    modules: Mutex<HashMap<String, Module>>,
    _ticker: Option<EpochTicker>,
}

impl SharedEngine {
    /// `epochs` must match whether `config` enables epoch interruption.
    pub(crate) fn new(config: &Config, epochs: bool) -> wasmtime::Result<Self> {
        let engine = Engine::new(config)?;
        let ticker = if epochs {
            Some(EpochTicker::start(engine.clone())?)
        } else {
            None
        };
        Ok(Self {
            engine,
            modules: Mutex::new(HashMap::new()),
            _ticker: ticker,
        })
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Compiles `code`, reusing an earlier compilation of identical bytes.
    pub(crate) fn compile(&self, code: &[u8]) -> wasmtime::Result<Module> {
        let key = hex::encode(Sha256::digest(code));
        if let Some(module) = self.lock().get(&key) {
            debug!(hash = %&key[..16], "Using cached module");
            return Ok(module.clone());
        }

        let module = Module::new(&self.engine, code)?;
        let mut modules = self.lock();
        if modules.len() >= MODULE_CACHE_CAPACITY {
            modules.clear();
        }
        modules.insert(key, module.clone());
        Ok(module)
    }

    pub(crate) fn cached_modules(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Module>> {
        self.modules.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
