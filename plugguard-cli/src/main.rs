//! plugguard operator CLI
//!
//! Inspects the permission catalog and runs a WebAssembly plugin through the
//! same admission and sandboxing path a host application uses.
//!
//! Usage:
//!   plugguard permissions
//!   plugguard parse network:fetch
//!   plugguard run --plugin demo.wat --grant storage:local --call main --input '{"n":1}'

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plugguard_permissions::{AuditFilter, GrantOptions, LedgerStore, PermissionLedger};
use plugguard_plugin_host::{LoadRequest, PluginRuntimeManager, PolicyEngine};
use plugguard_types::EntityType;
use serde_json::{Value, json};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const CLI_ACTOR: &str = "cli";

#[derive(Parser, Debug)]
#[command(name = "plugguard")]
#[command(about = "Permission ledger and sandboxed plugin runner")]
struct Args {
    /// Enable verbose debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every permission in the built-in catalog
    Permissions {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Validate a permission string and show its risk level
    Parse {
        permission: String,
    },

    /// List roles and their default permissions
    Roles,

    /// Show the effective host policy
    Policy {
        /// Policy file (defaults to $PLUGGUARD_POLICY or ./plugguard.toml)
        #[arg(long)]
        policy: Option<PathBuf>,
    },

    /// Load a plugin, call entry points and print the reports
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// WebAssembly module, text (.wat) or binary (.wasm)
    #[arg(short, long)]
    plugin: PathBuf,

    /// Plugin id used for grants, policy and audit
    #[arg(long, default_value = "cli.plugin")]
    id: String,

    /// Grant a permission to the plugin before loading (repeatable)
    #[arg(short, long = "grant")]
    grants: Vec<String>,

    /// Permission the plugin requests at load time (repeatable; defaults to the grants)
    #[arg(long = "permission")]
    permissions: Vec<String>,

    /// Entry point to call (repeatable, called in order)
    #[arg(short, long = "call", required = true)]
    calls: Vec<String>,

    /// JSON input passed to every call
    #[arg(short, long, default_value = "null")]
    input: String,

    /// JSON config handed to on_init
    #[arg(long, default_value = "{}")]
    config: String,

    /// Policy file (defaults to $PLUGGUARD_POLICY or ./plugguard.toml)
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Permit the unsafe fallback tier
    #[arg(long)]
    allow_unsafe: bool,

    /// Print the plugin's audit trail after running
    #[arg(long)]
    audit: bool,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    match args.command {
        Command::Permissions { json } => list_permissions(json),
        Command::Parse { permission } => parse_permission(&permission),
        Command::Roles => list_roles(),
        Command::Policy { policy } => show_policy(load_policy(policy)?),
        Command::Run(run) => run_plugin(run),
    }
}

fn catalog_ledger() -> PermissionLedger {
    PermissionLedger::new(Arc::new(LedgerStore::new()))
}

fn load_policy(path: Option<PathBuf>) -> Result<PolicyEngine> {
    let policy = match path {
        Some(path) => PolicyEngine::load_from(path),
        None => PolicyEngine::load(),
    };
    policy.context("Refusing to run with an invalid policy file")
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn list_permissions(as_json: bool) -> Result<ExitCode> {
    let permissions = catalog_ledger().available_permissions();
    if as_json {
        print_json(&permissions)?;
        return Ok(ExitCode::SUCCESS);
    }
    for info in &permissions {
        println!("{:<24} {:<8} {}", info.permission, info.risk, info.description);
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_permission(raw: &str) -> Result<ExitCode> {
    let ledger = catalog_ledger();
    let permission = ledger
        .catalog()
        .parse(raw)
        .with_context(|| format!("'{raw}' is not a valid permission"))?;
    print_json(&json!({
        "permission": permission.to_string(),
        "category": permission.category(),
        "scope": permission.scope(),
        "risk": permission.risk(),
        "universal": permission.is_universal(),
        "categoryWildcard": permission.is_category_wildcard(),
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn list_roles() -> Result<ExitCode> {
    for role in catalog_ledger().roles() {
        println!("{:<10} {}", role.name, role.default_permissions.join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

fn show_policy(policy: PolicyEngine) -> Result<ExitCode> {
    let config = policy.config();
    print_json(&json!({
        "policyFile": policy.has_policy_file(),
        "mode": config.mode,
        "allowedPlugins": config.allowed_plugin_ids,
        "blockedPlugins": config.blocked_plugin_ids,
        "deniedPermissions": config.denied_permissions.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "sandbox": config.sandbox,
        "eligibleTiers": config.sandbox.eligible_tiers(),
        "limits": config.limits,
        "audit": config.audit,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--{what} is not valid JSON"))
}

fn run_plugin(args: RunArgs) -> Result<ExitCode> {
    let code = fs::read(&args.plugin)
        .with_context(|| format!("Failed to read plugin {:?}", args.plugin))?;
    let input = parse_json(&args.input, "input")?;
    let config = parse_json(&args.config, "config")?;

    let mut policy = load_policy(args.policy)?;
    if args.allow_unsafe {
        let mut config = policy.config().clone();
        config.sandbox.allow_unsafe_fallback = true;
        policy = PolicyEngine::with_config(config);
    }

    let store = LedgerStore::with_audit(policy.audit_config().build_trail());
    let ledger = Arc::new(PermissionLedger::new(Arc::new(store)));
    for permission in &args.grants {
        ledger
            .grant(
                &args.id,
                EntityType::Plugin,
                permission,
                CLI_ACTOR,
                GrantOptions::default().reason("granted on the command line"),
            )
            .with_context(|| format!("Failed to grant '{permission}'"))?;
    }
    debug!(plugin_id = %args.id, grants = args.grants.len(), "Grants recorded");

    let requested = if args.permissions.is_empty() {
        args.grants.clone()
    } else {
        args.permissions.clone()
    };

    let manager = PluginRuntimeManager::new(Arc::clone(&ledger), policy);
    let receipt = manager
        .load_plugin(LoadRequest::new(&args.id, code).permissions(requested).config(config))
        .with_context(|| format!("Failed to load {:?}", args.plugin))?;
    info!(plugin_id = %receipt.plugin_id, tier = %receipt.tier, "Plugin ready");
    if receipt.unsafe_tier {
        eprintln!("warning: plugin is running in the UNSAFE fallback tier");
    }

    let mut failed = false;
    for function in &args.calls {
        let report = manager.execute_plugin(&args.id, function, &input)?;
        failed |= !report.is_success();
        print_json(&report)?;
    }

    manager
        .unload_plugin(&args.id)
        .with_context(|| format!("Failed to unload {}", args.id))?;

    if args.audit {
        for entry in ledger.audit_log(&AuditFilter::new().entity(&args.id)) {
            println!("{}", serde_json::to_string(&entry)?);
        }
    }

    if failed {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
