//! The table of known permission categories, their scopes and risk levels.
//!
//! The catalog is plain data: adding a category never touches the matching
//! rules in [`crate::permission`].

use crate::error::PermissionError;
use crate::permission::Permission;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Risk attached to a permission. Ordered `Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// Highest risk in a list of levels; `Low` for an empty list.
pub fn aggregate_risk<I>(levels: I) -> RiskLevel
where
    I: IntoIterator<Item = RiskLevel>,
{
    levels.into_iter().max().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDef {
    pub name: String,
    pub description: String,
    pub risk: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDef {
    pub key: String,
    pub name: String,
    pub description: String,
    pub scopes: Vec<ScopeDef>,
}

impl CategoryDef {
    pub fn new(key: &str, name: &str, description: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            scopes: Vec::new(),
        }
    }

    pub fn scope(mut self, name: &str, description: &str, risk: RiskLevel) -> Self {
        self.scopes.push(ScopeDef {
            name: name.to_string(),
            description: description.to_string(),
            risk,
        });
        self
    }

    pub fn find_scope(&self, name: &str) -> Option<&ScopeDef> {
        self.scopes.iter().find(|s| s.name == name)
    }

    /// Risk of the category wildcard `key:*`.
    pub fn highest_risk(&self) -> RiskLevel {
        aggregate_risk(self.scopes.iter().map(|s| s.risk))
    }
}

/// One concrete `category:scope` entry, as listed to administrators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionInfo {
    pub permission: String,
    pub category: String,
    pub category_name: String,
    pub description: String,
    pub risk: RiskLevel,
}

/// Registry of permission categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCatalog {
    categories: Vec<CategoryDef>,
}

impl Default for PermissionCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PermissionCatalog {
    /// The standard host catalog.
    pub fn builtin() -> Self {
        use RiskLevel::{High, Low, Medium};

        let categories = vec![
            CategoryDef::new("data", "Data Access", "Access to user and application data")
                .scope("read", "Read data", Low)
                .scope("write", "Create and modify data", Medium)
                .scope("delete", "Delete data", High),
            CategoryDef::new("network", "Network Access", "Internet and network connectivity")
                .scope("fetch", "Make HTTP requests", Medium)
                .scope("websocket", "WebSocket connections", Medium),
            CategoryDef::new("ai", "AI Features", "Access to AI capabilities")
                .scope("chat", "Chat completions", Low)
                .scope("embeddings", "Generate embeddings", Low)
                .scope("images", "Image generation", Medium)
                .scope("voice", "Voice synthesis and recognition", Medium),
            CategoryDef::new("storage", "Storage", "Data storage services")
                .scope("local", "Sandbox-local key/value storage", Low)
                .scope("cloud", "Cloud object storage", Medium)
                .scope("database", "Direct database access", High),
            CategoryDef::new("system", "System", "System-level features")
                .scope("notifications", "Send notifications", Low)
                .scope("clipboard", "Clipboard access", Medium)
                .scope("files", "File system access", High),
            CategoryDef::new("tools", "Tools", "Tool and plugin interaction")
                .scope("execute", "Execute other tools", Medium)
                .scope("compose", "Compose tool chains", Low)
                .scope("install", "Install plugins", High),
            CategoryDef::new("billing", "Billing", "Financial operations")
                .scope("read", "View billing info", Medium)
                .scope("charge", "Create charges", High),
        ];

        Self { categories }
    }

    /// An empty catalog. Only `*` parses against it.
    pub fn empty() -> Self {
        Self {
            categories: Vec::new(),
        }
    }

    /// Adds a category, replacing any existing one with the same key.
    pub fn with_category(mut self, category: CategoryDef) -> Self {
        self.categories.retain(|c| c.key != category.key);
        self.categories.push(category);
        self
    }

    pub fn category(&self, key: &str) -> Option<&CategoryDef> {
        self.categories.iter().find(|c| c.key == key)
    }

    pub fn categories(&self) -> &[CategoryDef] {
        &self.categories
    }

    pub fn category_keys(&self) -> Vec<String> {
        self.categories.iter().map(|c| c.key.clone()).collect()
    }

    /// Parses and validates a permission string against this catalog.
    pub fn parse(&self, raw: &str) -> Result<Permission, PermissionError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PermissionError::Empty);
        }
        if raw == Permission::WILDCARD {
            return Ok(Permission::universal());
        }

        let (category, scope) = raw
            .split_once(':')
            .ok_or_else(|| PermissionError::Malformed(raw.to_string()))?;
        if category.is_empty() || scope.is_empty() || scope.contains(':') {
            return Err(PermissionError::Malformed(raw.to_string()));
        }

        let def = self
            .category(category)
            .ok_or_else(|| PermissionError::UnknownCategory(category.to_string()))?;

        if scope == Permission::WILDCARD {
            return Ok(Permission::new(category, scope, def.highest_risk()));
        }

        let scope_def = def
            .find_scope(scope)
            .ok_or_else(|| PermissionError::UnknownScope {
                category: category.to_string(),
                scope: scope.to_string(),
            })?;
        Ok(Permission::new(category, scope, scope_def.risk))
    }

    /// Every concrete permission the catalog knows about.
    pub fn available_permissions(&self) -> Vec<PermissionInfo> {
        self.categories
            .iter()
            .flat_map(|cat| {
                cat.scopes.iter().map(move |scope| PermissionInfo {
                    permission: format!("{}:{}", cat.key, scope.name),
                    category: cat.key.clone(),
                    category_name: cat.name.clone(),
                    description: scope.description.clone(),
                    risk: scope.risk,
                })
            })
            .collect()
    }
}
