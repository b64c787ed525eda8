//! Runs the WAT fixtures through every isolation tier and checks the
//! confinement each tier promises.

use plugguard_plugin_host::*;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ECHO: &[u8] = include_bytes!("fixtures/echo.wat");
const FETCHER: &[u8] = include_bytes!("fixtures/fetcher.wat");
const STORAGE: &[u8] = include_bytes!("fixtures/storage.wat");
const AI: &[u8] = include_bytes!("fixtures/ai.wat");
const HOOKS: &[u8] = include_bytes!("fixtures/hooks.wat");
const INIT_TRAP: &[u8] = include_bytes!("fixtures/init_trap.wat");
const WASI: &[u8] = include_bytes!("fixtures/wasi.wat");
const FOREIGN: &[u8] = include_bytes!("fixtures/foreign.wat");

fn test_limits() -> ResourceLimits {
    ResourceLimits {
        max_memory_bytes: 2 * 1024 * 1024,
        call_timeout_ms: 200,
        fuel_per_ms: 100_000,
        ..Default::default()
    }
}

fn factory_with(tier: IsolationTier, limits: ResourceLimits, services: HostServices) -> SandboxFactory {
    let policy = SandboxPolicy {
        allow_unsafe_fallback: true,
        ..Default::default()
    };
    SandboxFactory::new(policy, limits, services).with_tiers([tier])
}

fn factory(tier: IsolationTier) -> SandboxFactory {
    let limits = test_limits();
    let services = HostServices::new(&limits);
    factory_with(tier, limits, services)
}

fn load(factory: &SandboxFactory, caps: CapabilitySet, code: &[u8]) -> Box<dyn IsolationBackend> {
    let mut sandbox = factory.create(&caps).unwrap();
    let init = sandbox.initialize(code, &InitContext::new("test.plugin", json!({})));
    assert!(init.is_success(), "{} init failed: {:?}", sandbox.tier(), init);
    sandbox
}

fn kind(outcome: &ExecutionOutcome) -> Option<FailureKind> {
    outcome.failure_kind()
}

// ============================================================================
// Basic ABI
// ============================================================================

#[test]
fn each_tier_is_built_as_requested() {
    for tier in IsolationTier::ALL {
        let sandbox = factory(tier).create(&CapabilitySet::none()).unwrap();
        assert_eq!(sandbox.tier(), tier);
        assert!(!sandbox.is_disposed());
        assert_eq!(sandbox.execution_count(), 0);
    }
}

#[test]
fn initialize_lists_callable_exports() {
    for tier in IsolationTier::ALL {
        let mut sandbox = factory(tier).create(&CapabilitySet::none()).unwrap();
        let outcome = sandbox.initialize(HOOKS, &InitContext::new("hooks", Value::Null));
        assert_eq!(outcome.result(), Some(&json!({ "exports": ["initialized"] })), "{tier}");
    }
}

#[test]
fn echo_round_trips_json() {
    let input = json!({ "msg": "hi", "n": [1, 2, 3] });
    for tier in IsolationTier::ALL {
        let mut sandbox = load(&factory(tier), CapabilitySet::none(), ECHO);
        let outcome = sandbox.execute("echo", &input);
        assert_eq!(outcome.result(), Some(&input), "{tier}");
    }
}

#[test]
fn static_results_and_null() {
    for tier in IsolationTier::ALL {
        let mut sandbox = load(&factory(tier), CapabilitySet::none(), ECHO);
        assert_eq!(sandbox.execute("answer", &Value::Null).result(), Some(&json!({ "answer": 42 })));
        assert_eq!(sandbox.execute("nothing", &Value::Null).result(), Some(&Value::Null));
        assert_eq!(sandbox.execution_count(), 2);
    }
}

#[test]
fn non_json_output_becomes_a_string() {
    let mut sandbox = load(&factory(IsolationTier::StrongIsolation), CapabilitySet::none(), ECHO);
    assert_eq!(sandbox.execute("text", &Value::Null).result(), Some(&json!("hello")));
}

#[test]
fn oversized_output_is_rejected() {
    for tier in IsolationTier::ALL {
        let mut sandbox = load(&factory(tier), CapabilitySet::none(), ECHO);
        let outcome = sandbox.execute("huge", &Value::Null);
        assert_eq!(kind(&outcome), Some(FailureKind::OutputTooLarge), "{tier}");
        // the sandbox stays usable
        assert!(sandbox.execute("answer", &Value::Null).is_success());
    }
}

#[test]
fn missing_and_reserved_functions() {
    let mut sandbox = load(&factory(IsolationTier::RestrictedInterpreter), CapabilitySet::none(), ECHO);
    for name in ["does_not_exist", "wrong_signature", "alloc", "on_init", "memory"] {
        let outcome = sandbox.execute(name, &Value::Null);
        assert_eq!(kind(&outcome), Some(FailureKind::FunctionNotFound), "{name}");
    }
}

#[test]
fn traps_are_runtime_errors() {
    for tier in IsolationTier::ALL {
        let mut sandbox = load(&factory(tier), CapabilitySet::none(), ECHO);
        let outcome = sandbox.execute("crash", &Value::Null);
        assert_eq!(kind(&outcome), Some(FailureKind::RuntimeError), "{tier}");
        assert!(!sandbox.is_terminated());
        assert!(sandbox.execute("answer", &Value::Null).is_success());
    }
}

#[test]
fn binary_modules_are_accepted() {
    let binary = wat::parse_bytes(ECHO).unwrap();
    let mut sandbox = load(&factory(IsolationTier::StrongIsolation), CapabilitySet::none(), &binary);
    assert_eq!(sandbox.execute("answer", &Value::Null).result(), Some(&json!({ "answer": 42 })));
}

#[test]
fn garbage_is_a_compile_error() {
    for tier in IsolationTier::ALL {
        let mut sandbox = factory(tier).create(&CapabilitySet::none()).unwrap();
        let outcome = sandbox.initialize(b"definitely not wasm", &InitContext::new("bad", Value::Null));
        assert_eq!(kind(&outcome), Some(FailureKind::CompileError), "{tier}");
    }
}

#[test]
fn execute_before_initialize_fails() {
    let mut sandbox = factory(IsolationTier::StrongIsolation).create(&CapabilitySet::none()).unwrap();
    let outcome = sandbox.execute("echo", &Value::Null);
    assert_eq!(kind(&outcome), Some(FailureKind::RuntimeError));
}

#[test]
fn initialize_twice_fails() {
    let mut sandbox = load(&factory(IsolationTier::StrongIsolation), CapabilitySet::none(), ECHO);
    let again = sandbox.initialize(ECHO, &InitContext::new("test.plugin", Value::Null));
    assert!(!again.is_success());
}

// ============================================================================
// Confinement
// ============================================================================

#[test]
fn memory_ceiling_applies_to_confined_tiers_only() {
    for tier in IsolationTier::ALL {
        let mut sandbox = load(&factory(tier), CapabilitySet::none(), ECHO);
        let grown = sandbox.execute("grow", &Value::Null);
        let expected = if tier.is_unsafe() { json!(true) } else { json!(false) };
        assert_eq!(grown.result(), Some(&expected), "{tier}");

        let usage = sandbox.resource_usage();
        if tier.is_unsafe() {
            assert_eq!(usage.memory_limit_bytes, None);
            assert_eq!(usage.denied_growths, 0);
        } else {
            assert_eq!(usage.memory_limit_bytes, Some(2 * 1024 * 1024));
            assert_eq!(usage.denied_growths, 1);
            assert_eq!(usage.memory_bytes, WASM_PAGE_BYTES);
        }
    }
}

#[test]
fn runaway_loop_times_out_then_sandbox_is_terminated() {
    for tier in IsolationTier::ALL {
        let mut sandbox = load(&factory(tier), CapabilitySet::none(), ECHO);
        let outcome = sandbox.execute("spin", &Value::Null);
        assert_eq!(kind(&outcome), Some(FailureKind::Timeout), "{tier}");
        assert!(sandbox.is_terminated());

        let after = sandbox.execute("answer", &Value::Null);
        assert_eq!(kind(&after), Some(FailureKind::Terminated), "{tier}");
        assert!(sandbox.dispose().is_ok());
    }
}

#[test]
fn wasi_imports_are_refused_everywhere() {
    for tier in IsolationTier::ALL {
        let mut sandbox = factory(tier).create(&CapabilitySet::none()).unwrap();
        let outcome = sandbox.initialize(WASI, &InitContext::new("wasi", Value::Null));
        assert_eq!(kind(&outcome), Some(FailureKind::CapabilityUnavailable), "{tier}");
        assert!(outcome.error().unwrap().contains("wasi_snapshot_preview1"));
    }
}

#[test]
fn foreign_imports_trap_only_in_the_unsafe_tier() {
    for tier in [IsolationTier::StrongIsolation, IsolationTier::RestrictedInterpreter] {
        let mut sandbox = factory(tier).create(&CapabilitySet::none()).unwrap();
        let outcome = sandbox.initialize(FOREIGN, &InitContext::new("foreign", Value::Null));
        assert_eq!(kind(&outcome), Some(FailureKind::CapabilityUnavailable), "{tier}");
    }

    let mut sandbox = load(&factory(IsolationTier::UnsafeFallback), CapabilitySet::none(), FOREIGN);
    assert!(sandbox.execute("run", &Value::Null).is_success());
    let outcome = sandbox.execute("call_vendor", &Value::Null);
    assert_eq!(kind(&outcome), Some(FailureKind::RuntimeError));
}

// ============================================================================
// Capabilities
// ============================================================================

#[test]
fn ungranted_capability_fails_only_when_called() {
    for tier in IsolationTier::ALL {
        let mut sandbox = load(&factory(tier), CapabilitySet::none(), FETCHER);
        assert!(sandbox.execute("ping", &Value::Null).is_success());

        let outcome = sandbox.execute("fetch", &json!({ "url": "https://example.com" }));
        assert_eq!(kind(&outcome), Some(FailureKind::CapabilityUnavailable), "{tier}");
        assert!(outcome.error().unwrap().contains("network:fetch"));
        assert!(!sandbox.is_terminated());
    }
}

#[test]
fn granted_fetch_rejects_non_http_urls() {
    let caps = CapabilitySet::none().with(Capability::Fetch);
    let mut sandbox = load(&factory(IsolationTier::StrongIsolation), caps, FETCHER);
    let outcome = sandbox.execute("fetch", &json!({ "url": "file:///etc/passwd" }));
    let result = outcome.result().unwrap();
    assert!(result.get("error").is_some(), "{result}");
    assert!(result.get("ok").is_none());
}

#[test]
fn blocked_fetch_cannot_outlive_the_call_timeout() {
    // completes the TCP handshake from its backlog but never replies
    let silent = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/", silent.local_addr().unwrap());
    let limits = ResourceLimits {
        fetch_timeout_ms: 3_000,
        ..test_limits()
    };
    let caps = CapabilitySet::none().with(Capability::Fetch);

    for tier in IsolationTier::ALL {
        let services = HostServices::new(&limits);
        let mut sandbox = load(&factory_with(tier, limits.clone(), services), caps.clone(), FETCHER);

        let started = Instant::now();
        let outcome = sandbox.execute("fetch", &json!({ "url": url }));
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(1_500), "{tier} took {elapsed:?}");
        match &outcome {
            ExecutionOutcome::Failure { kind, .. } => assert_eq!(*kind, FailureKind::Timeout, "{tier}"),
            ExecutionOutcome::Success { result } => assert!(result.get("error").is_some(), "{tier}: {result}"),
        }
    }
}

#[test]
fn granted_fetch_reports_malformed_requests() {
    let caps = CapabilitySet::none().with(Capability::Fetch);
    let mut sandbox = load(&factory(IsolationTier::RestrictedInterpreter), caps, FETCHER);
    let outcome = sandbox.execute("fetch", &json!({ "method": "GET" }));
    let error = outcome.result().unwrap()["error"].as_str().unwrap().to_string();
    assert!(error.starts_with("invalid fetch request"), "{error}");
}

#[test]
fn storage_persists_across_calls() {
    let caps = CapabilitySet::none().with(Capability::LocalStorage);
    for tier in IsolationTier::ALL {
        let mut sandbox = load(&factory(tier), caps.clone(), STORAGE);
        assert_eq!(sandbox.execute("get", &Value::Null).result(), Some(&Value::Null));
        assert_eq!(sandbox.execute("put", &json!({ "n": 1 })).result(), Some(&json!(true)));
        assert_eq!(sandbox.execute("get", &Value::Null).result(), Some(&json!({ "n": 1 })), "{tier}");
        sandbox.execute("clear", &Value::Null);
        assert_eq!(sandbox.execute("get", &Value::Null).result(), Some(&Value::Null));
    }
}

#[test]
fn storage_is_private_to_each_sandbox() {
    let caps = CapabilitySet::none().with(Capability::LocalStorage);
    let factory = factory(IsolationTier::RestrictedInterpreter);
    let mut first = load(&factory, caps.clone(), STORAGE);
    let mut second = load(&factory, caps, STORAGE);

    first.execute("put", &json!("mine"));
    assert_eq!(second.execute("get", &Value::Null).result(), Some(&Value::Null));
}

#[test]
fn storage_quota_is_enforced() {
    let limits = ResourceLimits {
        max_storage_bytes: 32,
        ..test_limits()
    };
    let services = HostServices::new(&limits);
    let factory = factory_with(IsolationTier::StrongIsolation, limits, services);
    let mut sandbox = load(&factory, CapabilitySet::none().with(Capability::LocalStorage), STORAGE);

    assert_eq!(sandbox.execute("put", &json!(1)).result(), Some(&json!(true)));
    let big = json!("x".repeat(64));
    assert_eq!(sandbox.execute("put", &big).result(), Some(&json!(false)));
    assert_eq!(sandbox.execute("get", &Value::Null).result(), Some(&json!(1)));
}

#[test]
fn storage_without_grant_is_unavailable() {
    let mut sandbox = load(&factory(IsolationTier::UnsafeFallback), CapabilitySet::none(), STORAGE);
    let outcome = sandbox.execute("put", &json!(1));
    assert_eq!(kind(&outcome), Some(FailureKind::CapabilityUnavailable));
    assert!(outcome.error().unwrap().contains("storage:local"));
}

struct EchoAi;

impl AiService for EchoAi {
    fn chat(&self, plugin_id: &str, request: &Value) -> Result<Value, String> {
        Ok(json!({ "plugin": plugin_id, "reply": request["prompt"] }))
    }

    fn embed(&self, _plugin_id: &str, _input: &Value) -> Result<Value, String> {
        Err("embeddings are offline".to_string())
    }
}

#[test]
fn ai_calls_reach_the_configured_service() {
    let limits = test_limits();
    let services = HostServices::new(&limits).with_ai_service(Arc::new(EchoAi));
    let factory = factory_with(IsolationTier::StrongIsolation, limits, services);
    let caps = CapabilitySet::none()
        .with(Capability::AiChat)
        .with(Capability::AiEmbeddings);
    let mut sandbox = load(&factory, caps, AI);

    let chat = sandbox.execute("chat", &json!({ "prompt": "hello" }));
    assert_eq!(
        chat.result(),
        Some(&json!({ "ok": { "plugin": "test.plugin", "reply": "hello" } }))
    );
    let embed = sandbox.execute("embed", &json!(["a"]));
    assert_eq!(embed.result(), Some(&json!({ "error": "embeddings are offline" })));
}

#[test]
fn ai_without_service_returns_an_error_envelope() {
    let caps = CapabilitySet::none().with(Capability::AiChat);
    let mut sandbox = load(&factory(IsolationTier::RestrictedInterpreter), caps, AI);
    let chat = sandbox.execute("chat", &json!({ "prompt": "hello" }));
    assert!(chat.result().unwrap()["error"].as_str().unwrap().contains("no AI service"));

    // embeddings were not granted
    let embed = sandbox.execute("embed", &json!(["a"]));
    assert_eq!(kind(&embed), Some(FailureKind::CapabilityUnavailable));
}

// ============================================================================
// Lifecycle hooks
// ============================================================================

#[test]
fn on_init_runs_before_first_call() {
    for tier in IsolationTier::ALL {
        let mut sandbox = load(&factory(tier), CapabilitySet::none(), HOOKS);
        assert_eq!(sandbox.execute("initialized", &Value::Null).result(), Some(&json!(true)), "{tier}");
    }
}

#[test]
fn failing_on_init_fails_initialize() {
    for tier in IsolationTier::ALL {
        let mut sandbox = factory(tier).create(&CapabilitySet::none()).unwrap();
        let outcome = sandbox.initialize(INIT_TRAP, &InitContext::new("init-trap", Value::Null));
        assert_eq!(kind(&outcome), Some(FailureKind::RuntimeError), "{tier}");
        assert!(outcome.error().unwrap().starts_with("on_init failed"));
    }
}

#[test]
fn failing_on_dispose_still_releases() {
    let mut sandbox = load(&factory(IsolationTier::StrongIsolation), CapabilitySet::none(), HOOKS);
    let err = sandbox.dispose().unwrap_err();
    assert!(matches!(err, PluginHostError::Dispose { .. }));
    assert!(sandbox.is_disposed());

    // idempotent, and the hook does not run twice
    assert!(sandbox.dispose().is_ok());
    let after = sandbox.execute("initialized", &Value::Null);
    assert_eq!(kind(&after), Some(FailureKind::Terminated));
}

#[test]
fn dispose_without_hook_succeeds() {
    for tier in IsolationTier::ALL {
        let mut sandbox = load(&factory(tier), CapabilitySet::none(), ECHO);
        assert!(sandbox.dispose().is_ok());
        assert!(sandbox.is_disposed());
    }
}

// ============================================================================
// Shared engines
// ============================================================================

#[test]
fn shared_engines_compile_identical_code_once() {
    let factory = factory(IsolationTier::RestrictedInterpreter);
    let _a = load(&factory, CapabilitySet::none(), ECHO);
    let _b = load(&factory, CapabilitySet::none(), ECHO);
    assert_eq!(factory.cached_modules(), 1);

    let _c = load(&factory, CapabilitySet::none(), HOOKS);
    assert_eq!(factory.cached_modules(), 2);
}

#[test]
fn strong_sandboxes_do_not_use_the_shared_cache() {
    let factory = factory(IsolationTier::StrongIsolation);
    let _a = load(&factory, CapabilitySet::none(), ECHO);
    assert_eq!(factory.cached_modules(), 0);
}
