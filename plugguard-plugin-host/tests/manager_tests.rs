//! Integration tests for the runtime manager: admission against host policy
//! and the permission ledger, execution bookkeeping and audit records.

use plugguard_permissions::{
    AuditFilter, GrantOptions, LedgerStore, Permission, PermissionLedger,
};
use plugguard_plugin_host::*;
use plugguard_types::EntityType;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ECHO: &[u8] = include_bytes!("fixtures/echo.wat");
const FETCHER: &[u8] = include_bytes!("fixtures/fetcher.wat");
const HOOKS: &[u8] = include_bytes!("fixtures/hooks.wat");
const INIT_TRAP: &[u8] = include_bytes!("fixtures/init_trap.wat");

fn test_ledger() -> Arc<PermissionLedger> {
    Arc::new(PermissionLedger::new(Arc::new(LedgerStore::new())))
}

fn test_config() -> PolicyConfig {
    PolicyConfig {
        limits: ResourceLimits {
            call_timeout_ms: 200,
            max_memory_bytes: 4 * 1024 * 1024,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn manager_with(ledger: &Arc<PermissionLedger>, config: PolicyConfig) -> PluginRuntimeManager {
    PluginRuntimeManager::new(Arc::clone(ledger), PolicyEngine::with_config(config))
}

fn grant(ledger: &PermissionLedger, plugin_id: &str, permission: &str) {
    ledger
        .grant(plugin_id, EntityType::Plugin, permission, "admin", GrantOptions::default())
        .unwrap();
}

fn plugin_actions(ledger: &PermissionLedger, plugin_id: &str) -> Vec<String> {
    ledger
        .audit_log(&AuditFilter::new().entity(plugin_id).action("plugin:*"))
        .into_iter()
        .map(|entry| entry.action.to_string())
        .collect()
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn load_execute_unload() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());

    let receipt = manager.load_plugin(LoadRequest::new("demo", ECHO)).unwrap();
    assert_eq!(receipt.plugin_id, "demo");
    assert_eq!(receipt.tier, IsolationTier::StrongIsolation);
    assert!(!receipt.unsafe_tier);
    assert!(receipt.capabilities.is_empty());
    assert!(manager.is_loaded("demo"));
    assert_eq!(manager.loaded_plugins(), vec!["demo".to_string()]);

    let report = manager.execute_plugin("demo", "answer", &Value::Null).unwrap();
    assert!(report.is_success());
    assert_eq!(report.outcome.result(), Some(&json!({ "answer": 42 })));
    assert_eq!(report.execution_count, 1);

    manager.unload_plugin("demo").unwrap();
    assert!(!manager.is_loaded("demo"));
    assert!(matches!(
        manager.execute_plugin("demo", "answer", &Value::Null),
        Err(PluginHostError::NotLoaded(_))
    ));
    assert!(matches!(manager.unload_plugin("demo"), Err(PluginHostError::NotLoaded(_))));

    assert_eq!(
        plugin_actions(&ledger, "demo"),
        vec!["plugin:load", "plugin:execute", "plugin:unload"]
    );
}

#[test]
fn granted_permissions_become_capabilities() {
    let ledger = test_ledger();
    grant(&ledger, "fetcher", "network:*");
    let manager = manager_with(&ledger, test_config());

    let receipt = manager
        .load_plugin(LoadRequest::new("fetcher", FETCHER).permissions(["network:fetch"]))
        .unwrap();
    assert!(receipt.capabilities.contains(Capability::Fetch));
    assert_eq!(receipt.capabilities.len(), 1);

    let report = manager
        .execute_plugin("fetcher", "fetch", &json!({ "url": "ftp://example.com/file" }))
        .unwrap();
    assert!(report.outcome.result().unwrap().get("error").is_some());
}

#[test]
fn ungranted_permission_blocks_loading() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());

    let err = manager
        .load_plugin(LoadRequest::new("greedy", FETCHER).permissions(["network:fetch"]))
        .unwrap_err();
    match err {
        PluginHostError::PermissionDenied { plugin_id, permission, .. } => {
            assert_eq!(plugin_id, "greedy");
            assert_eq!(permission, "network:fetch");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!manager.is_loaded("greedy"));
    assert_eq!(plugin_actions(&ledger, "greedy"), vec!["plugin:load_failed"]);
    assert!(!ledger.audit_log(&AuditFilter::new().entity("greedy").action("check:denied:*")).is_empty());
}

#[test]
fn revoked_permission_blocks_loading() {
    let ledger = test_ledger();
    grant(&ledger, "p", "storage:local");
    ledger.revoke("p", "storage:local", "admin", Some("abuse")).unwrap();
    let manager = manager_with(&ledger, test_config());

    let err = manager
        .load_plugin(LoadRequest::new("p", ECHO).permissions(["storage:local"]))
        .unwrap_err();
    assert!(matches!(err, PluginHostError::PermissionDenied { .. }));
}

#[test]
fn wildcard_request_cannot_reach_a_revoked_capability() {
    let ledger = test_ledger();
    grant(&ledger, "p", "network:*");
    ledger.revoke("p", "network:fetch", "admin", Some("exfiltration")).unwrap();
    let manager = manager_with(&ledger, test_config());

    let err = manager
        .load_plugin(LoadRequest::new("p", FETCHER).permissions(["network:*"]))
        .unwrap_err();
    match err {
        PluginHostError::PermissionDenied { permission, reason, .. } => {
            assert_eq!(permission, "network:*");
            assert_eq!(reason, "explicitly_revoked");
        }
        other => panic!("expected PermissionDenied, got {other:?}"),
    }
    assert!(!manager.is_loaded("p"));
}

#[test]
fn malformed_permission_is_rejected() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());

    for bad in ["not-a-permission", "teleport:now"] {
        let err = manager
            .load_plugin(LoadRequest::new("p", ECHO).permissions([bad]))
            .unwrap_err();
        assert!(matches!(err, PluginHostError::InvalidPermission { .. }), "{bad}: {err}");
    }
}

#[test]
fn policy_denial_overrides_ledger_grants() {
    let ledger = test_ledger();
    grant(&ledger, "p", "*");
    let config = PolicyConfig {
        denied_permissions: vec![Permission::parse("network:fetch").unwrap()],
        ..test_config()
    };
    let manager = manager_with(&ledger, config);

    for requested in ["network:fetch", "network:*"] {
        let err = manager
            .load_plugin(LoadRequest::new("p", FETCHER).permissions([requested]))
            .unwrap_err();
        assert!(matches!(err, PluginHostError::PolicyDenied(_)), "{requested}");
    }
    manager
        .load_plugin(LoadRequest::new("p", ECHO).permissions(["storage:local"]))
        .unwrap();
}

#[test]
fn plugin_lists_are_enforced() {
    let ledger = test_ledger();
    let config = PolicyConfig {
        mode: PolicyMode::Allowlist,
        allowed_plugin_ids: vec!["trusted".into(), "banned".into()],
        blocked_plugin_ids: vec!["banned".into()],
        ..test_config()
    };
    let manager = manager_with(&ledger, config);

    assert!(manager.load_plugin(LoadRequest::new("trusted", ECHO)).is_ok());
    for id in ["stranger", "banned"] {
        let err = manager.load_plugin(LoadRequest::new(id, ECHO)).unwrap_err();
        assert!(matches!(err, PluginHostError::PolicyDenied(_)), "{id}");
    }
}

#[test]
fn duplicate_load_is_rejected() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());
    manager.load_plugin(LoadRequest::new("demo", ECHO)).unwrap();

    let err = manager.load_plugin(LoadRequest::new("demo", ECHO)).unwrap_err();
    assert!(matches!(err, PluginHostError::AlreadyLoaded(_)));
    assert_eq!(manager.plugin_count(), 1);
}

#[test]
fn initialization_failures_are_reported() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());

    let err = manager.load_plugin(LoadRequest::new("trap", INIT_TRAP)).unwrap_err();
    match err {
        PluginHostError::InitializationFailed { kind, .. } => assert_eq!(kind, FailureKind::RuntimeError),
        other => panic!("unexpected error: {other}"),
    }

    let err = manager.load_plugin(LoadRequest::new("junk", b"\0asm".to_vec())).unwrap_err();
    match err {
        PluginHostError::InitializationFailed { kind, .. } => assert_eq!(kind, FailureKind::CompileError),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(manager.plugin_count(), 0);
}

#[test]
fn no_eligible_tier_is_backend_unavailable() {
    let ledger = test_ledger();
    let mut config = test_config();
    config.sandbox.tiers = vec![IsolationTier::UnsafeFallback];
    let manager = manager_with(&ledger, config);

    let err = manager.load_plugin(LoadRequest::new("demo", ECHO)).unwrap_err();
    assert!(matches!(err, PluginHostError::BackendUnavailable(_)));
}

#[test]
fn unsafe_tier_requires_opt_in_and_is_flagged() {
    let ledger = test_ledger();
    let mut config = test_config();
    config.sandbox.tiers = vec![IsolationTier::UnsafeFallback];
    config.sandbox.allow_unsafe_fallback = true;
    let manager = manager_with(&ledger, config);

    let receipt = manager.load_plugin(LoadRequest::new("demo", ECHO)).unwrap();
    assert_eq!(receipt.tier, IsolationTier::UnsafeFallback);
    assert!(receipt.unsafe_tier);

    let status = manager.status();
    assert!(status.plugins[0].unsafe_tier);

    let load = ledger.audit_log(&AuditFilter::new().entity("demo").action("plugin:load"));
    assert_eq!(load[0].metadata["unsafe"], json!(true));
}

// ============================================================================
// Execution
// ============================================================================

#[test]
fn guest_faults_are_reports_not_errors() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());
    manager.load_plugin(LoadRequest::new("demo", ECHO)).unwrap();

    let report = manager.execute_plugin("demo", "crash", &Value::Null).unwrap();
    assert!(!report.is_success());
    assert_eq!(report.outcome.failure_kind(), Some(FailureKind::RuntimeError));

    let report = manager.execute_plugin("demo", "missing", &Value::Null).unwrap();
    assert_eq!(report.outcome.failure_kind(), Some(FailureKind::FunctionNotFound));

    let stats = &manager.stats(Some("demo"))["demo"];
    assert_eq!(stats.total_executions, 2);
    assert_eq!(stats.errors, 2);
    assert_eq!(stats.timeouts, 0);
}

#[test]
fn timeout_terminates_but_keeps_plugin_registered() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());
    manager.load_plugin(LoadRequest::new("spinner", ECHO)).unwrap();

    let report = manager.execute_plugin("spinner", "spin", &Value::Null).unwrap();
    assert_eq!(report.outcome.failure_kind(), Some(FailureKind::Timeout));

    let status = manager.status();
    assert_eq!(status.loaded_plugins, 1);
    assert!(status.plugins[0].terminated);

    let report = manager.execute_plugin("spinner", "answer", &Value::Null).unwrap();
    assert_eq!(report.outcome.failure_kind(), Some(FailureKind::Terminated));

    let stats = &manager.stats(None)["spinner"];
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.errors, 2);

    manager.unload_plugin("spinner").unwrap();
}

#[test]
fn execution_report_serializes_flat() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());
    manager.load_plugin(LoadRequest::new("demo", ECHO)).unwrap();

    let report = manager.execute_plugin("demo", "answer", &Value::Null).unwrap();
    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["pluginId"], json!("demo"));
    assert_eq!(value["function"], json!("answer"));
    assert_eq!(value["success"], json!(true));
    assert_eq!(value["result"], json!({ "answer": 42 }));
    assert_eq!(value["executionCount"], json!(1));
    assert!(value["durationMs"].is_f64());
}

#[test]
fn stats_survive_unload() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());
    manager.load_plugin(LoadRequest::new("demo", ECHO)).unwrap();
    manager.execute_plugin("demo", "answer", &Value::Null).unwrap();
    manager.unload_plugin("demo").unwrap();

    let stats = manager.stats(Some("demo"));
    assert_eq!(stats["demo"].total_executions, 1);
    assert!(stats["demo"].last_executed_at.is_some());
    assert!(manager.stats(Some("other")).is_empty());
}

#[test]
fn config_reaches_on_init() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());
    manager
        .load_plugin(LoadRequest::new("hooks", HOOKS).config(json!({ "greeting": "hi" })))
        .unwrap();
    let report = manager.execute_plugin("hooks", "initialized", &Value::Null).unwrap();
    assert_eq!(report.outcome.result(), Some(&json!(true)));
    manager.cleanup();
}

// ============================================================================
// Cleanup and status
// ============================================================================

#[test]
fn cleanup_collects_dispose_failures() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());
    manager.load_plugin(LoadRequest::new("echo", ECHO)).unwrap();
    manager.load_plugin(LoadRequest::new("hooks", HOOKS)).unwrap();

    let report = manager.cleanup();
    assert_eq!(report.disposed, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "hooks");
    assert_eq!(manager.plugin_count(), 0);
}

#[test]
fn failing_dispose_does_not_block_unload() {
    let ledger = test_ledger();
    let manager = manager_with(&ledger, test_config());
    manager.load_plugin(LoadRequest::new("hooks", HOOKS)).unwrap();

    manager.unload_plugin("hooks").unwrap();
    assert!(!manager.is_loaded("hooks"));
    let unload = ledger.audit_log(&AuditFilter::new().entity("hooks").action("plugin:unload"));
    assert!(unload[0].metadata["disposeError"].is_string());
}

#[test]
fn dropping_the_manager_unloads_everything() {
    let ledger = test_ledger();
    {
        let manager = manager_with(&ledger, test_config());
        manager.load_plugin(LoadRequest::new("a", ECHO)).unwrap();
        manager.load_plugin(LoadRequest::new("b", ECHO)).unwrap();
    }
    assert_eq!(plugin_actions(&ledger, "a"), vec!["plugin:load", "plugin:unload"]);
    assert_eq!(plugin_actions(&ledger, "b"), vec!["plugin:load", "plugin:unload"]);
}

#[test]
fn status_describes_loaded_plugins() {
    let ledger = test_ledger();
    grant(&ledger, "store", "storage:local");
    let manager = manager_with(&ledger, test_config());
    manager
        .load_plugin(LoadRequest::new("store", ECHO).permissions(["storage:local"]))
        .unwrap();
    manager.load_plugin(LoadRequest::new("alpha", ECHO)).unwrap();

    let status = manager.status();
    assert_eq!(status.loaded_plugins, 2);
    assert_eq!(status.limits.call_timeout_ms, 200);
    let ids: Vec<&str> = status.plugins.iter().map(|p| p.plugin_id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "store"]);

    let store = &status.plugins[1];
    assert_eq!(store.permissions, vec!["storage:local".to_string()]);
    assert!(store.capabilities.contains(Capability::LocalStorage));
    assert_eq!(store.resources.memory_limit_bytes, Some(4 * 1024 * 1024));

    let value = serde_json::to_value(&status).unwrap();
    assert_eq!(value["plugins"][1]["capabilities"], json!(["local-storage"]));
}

#[test]
fn concurrent_calls_are_serialized_per_plugin() {
    let ledger = test_ledger();
    let manager = Arc::new(manager_with(&ledger, test_config()));
    manager.load_plugin(LoadRequest::new("demo", ECHO)).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let report = manager.execute_plugin("demo", "echo", &json!({ "i": i })).unwrap();
                assert_eq!(report.outcome.result(), Some(&json!({ "i": i })));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(manager.stats(Some("demo"))["demo"].total_executions, 4);
}

#[test]
fn unload_waits_for_an_in_flight_call() {
    let ledger = test_ledger();
    let manager = Arc::new(manager_with(&ledger, test_config()));
    manager.load_plugin(LoadRequest::new("demo", ECHO)).unwrap();

    let spinner = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || manager.execute_plugin("demo", "spin", &Value::Null))
    };
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    manager.unload_plugin("demo").unwrap();
    // the 200ms call was still running when unload began
    assert!(started.elapsed() >= Duration::from_millis(50));

    let report = spinner.join().unwrap().unwrap();
    assert_eq!(report.outcome.failure_kind(), Some(FailureKind::Timeout));
    assert!(!manager.is_loaded("demo"));
    assert!(matches!(
        manager.execute_plugin("demo", "echo", &Value::Null),
        Err(PluginHostError::NotLoaded(_))
    ));
    let mut actions = plugin_actions(&ledger, "demo");
    actions.sort();
    assert_eq!(actions, vec!["plugin:execute", "plugin:load", "plugin:unload"]);
}
