//! Host policy engine: reads `plugguard.toml` and enforces admin-managed
//! plugin allow/block lists, permission overrides, sandbox tier selection,
//! resource limits and audit settings.

use crate::error::PluginHostError;
use crate::factory::SandboxPolicy;
use crate::limits::ResourceLimits;
use plugguard_permissions::{
    AuditTrail, DEFAULT_AUDIT_CAPACITY, JsonLinesExporter, Permission, match_grant,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Environment variable naming the policy file.
pub const POLICY_PATH_ENV: &str = "PLUGGUARD_POLICY";

/// Which plugins may be loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Only explicitly listed plugins can be loaded.
    Allowlist,
    /// All plugins except blocked ones can be loaded.
    Denylist,
    #[default]
    /// No restrictions beyond the block list.
    Unrestricted,
}

/// Audit trail configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuditConfig {
    /// Entries kept in memory before the oldest are evicted.
    pub capacity: usize,
    /// Optional JSON-lines file every entry is appended to.
    pub export_path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_AUDIT_CAPACITY,
            export_path: None,
        }
    }
}

impl AuditConfig {
    /// Builds the audit trail. An export file that cannot be opened is
    /// logged and skipped.
    pub fn build_trail(&self) -> AuditTrail {
        let trail = AuditTrail::new(self.capacity);
        let Some(path) = &self.export_path else {
            return trail;
        };
        match JsonLinesExporter::open(path) {
            Ok(exporter) => {
                info!("Exporting audit entries to {:?}", path);
                trail.with_exporter(Box::new(exporter))
            }
            Err(e) => {
                warn!("Failed to open audit export {:?}: {}. Audit stays in memory only.", path, e);
                trail
            }
        }
    }
}

/// Policy configuration parsed from the policy file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    pub allowed_plugin_ids: Vec<String>,
    pub blocked_plugin_ids: Vec<String>,
    pub denied_permissions: Vec<Permission>,
    pub sandbox: SandboxPolicy,
    pub limits: ResourceLimits,
    pub audit: AuditConfig,
}

impl PolicyConfig {
    /// Parses a policy file. Unknown permission names in the deny list are
    /// rejected.
    pub fn from_toml(contents: &str) -> Result<Self, PluginHostError> {
        let file: PolicyFile =
            toml::from_str(contents).map_err(|e| PluginHostError::Config(e.to_string()))?;
        file.into_config()
    }
}

/// Enforces host policy decisions.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: PolicyConfig,
    policy_path: Option<PathBuf>,
}

impl PolicyEngine {
    /// Loads policy from `$PLUGGUARD_POLICY`, or `./plugguard.toml`.
    pub fn load() -> Result<Self, PluginHostError> {
        let path = std::env::var_os(POLICY_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("plugguard.toml"));
        Self::load_from(path)
    }

    /// Loads policy from an explicit path. A missing file means defaults;
    /// a file that exists but cannot be read or parsed is an error, so a
    /// typo never silently drops block lists or permission denials.
    pub fn load_from(policy_path: impl AsRef<Path>) -> Result<Self, PluginHostError> {
        let policy_path = policy_path.as_ref().to_path_buf();
        if !policy_path.exists() {
            info!("No policy file found at {:?}, running with defaults", policy_path);
            return Ok(Self::with_config(PolicyConfig::default()));
        }

        let contents = std::fs::read_to_string(&policy_path).map_err(|e| {
            error!("Failed to read policy file {:?}: {}", policy_path, e);
            PluginHostError::Config(format!("cannot read {}: {e}", policy_path.display()))
        })?;
        let config = PolicyConfig::from_toml(&contents).map_err(|e| {
            error!("Failed to parse policy file {:?}: {}", policy_path, e);
            PluginHostError::Config(format!("{}: {e}", policy_path.display()))
        })?;
        info!("Loaded host policy from {:?}", policy_path);
        Ok(Self {
            config,
            policy_path: Some(policy_path),
        })
    }

    /// Creates a policy engine with explicit config.
    pub fn with_config(config: PolicyConfig) -> Self {
        Self {
            config,
            policy_path: None,
        }
    }

    /// Check if a plugin may be loaded. The block list applies in every mode.
    pub fn is_plugin_allowed(&self, plugin_id: &str) -> bool {
        if self.config.blocked_plugin_ids.iter().any(|id| id == plugin_id) {
            return false;
        }
        match self.config.mode {
            PolicyMode::Allowlist => self.config.allowed_plugin_ids.iter().any(|id| id == plugin_id),
            PolicyMode::Denylist | PolicyMode::Unrestricted => true,
        }
    }

    /// Check if a permission is denied by host policy, whatever the ledger
    /// says. A requested wildcard is denied if it would cover a denied
    /// permission.
    pub fn is_permission_denied_by_policy(&self, permission: &Permission) -> bool {
        self.config.denied_permissions.iter().any(|denied| {
            match_grant(denied, permission).is_some() || match_grant(permission, denied).is_some()
        })
    }

    pub fn sandbox_policy(&self) -> &SandboxPolicy {
        &self.config.sandbox
    }

    pub fn resource_limits(&self) -> &ResourceLimits {
        &self.config.limits
    }

    /// Returns audit config.
    pub fn audit_config(&self) -> &AuditConfig {
        &self.config.audit
    }

    /// Returns whether a policy file was found.
    pub fn has_policy_file(&self) -> bool {
        self.policy_path.is_some()
    }

    /// Returns the active policy config.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::with_config(PolicyConfig::default())
    }
}

/// Raw TOML structure matching the policy file format.
#[derive(Deserialize, Default)]
struct PolicyFile {
    #[serde(default)]
    policy: PolicySection,
    #[serde(default)]
    sandbox: SandboxSection,
    #[serde(default)]
    audit: AuditConfig,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct PolicySection {
    #[serde(default)]
    mode: PolicyMode,
    #[serde(default)]
    allowed_plugins: PluginList,
    #[serde(default)]
    blocked_plugins: PluginList,
    #[serde(default)]
    denied_permissions: DeniedPermissions,
}

#[derive(Deserialize, Default)]
struct PluginList {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Deserialize, Default)]
struct DeniedPermissions {
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Deserialize, Default)]
struct SandboxSection {
    #[serde(flatten)]
    policy: SandboxPolicy,
    #[serde(default)]
    limits: ResourceLimits,
}

impl PolicyFile {
    fn into_config(self) -> Result<PolicyConfig, PluginHostError> {
        let denied_permissions = self
            .policy
            .denied_permissions
            .permissions
            .iter()
            .map(|raw| {
                Permission::parse(raw)
                    .map_err(|e| PluginHostError::Config(format!("denied permission '{raw}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PolicyConfig {
            mode: self.policy.mode,
            allowed_plugin_ids: self.policy.allowed_plugins.ids,
            blocked_plugin_ids: self.policy.blocked_plugins.ids,
            denied_permissions,
            sandbox: self.sandbox.policy,
            limits: self.sandbox.limits,
            audit: self.audit,
        })
    }
}
