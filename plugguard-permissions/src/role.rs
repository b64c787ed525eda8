use crate::error::LedgerError;
use plugguard_types::EntityType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Built-in roles. A role is only a template for seeding grants; checks
/// never consult it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Developer,
    Admin,
    /// Plugins start with nothing and must request every permission.
    Plugin,
}

/// Serializable summary of a role, for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleInfo {
    pub role: Role,
    pub name: &'static str,
    pub default_permissions: Vec<&'static str>,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::User, Role::Developer, Role::Admin, Role::Plugin];

    pub fn name(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Developer => "Developer",
            Self::Admin => "Admin",
            Self::Plugin => "Plugin",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Developer => "developer",
            Self::Admin => "admin",
            Self::Plugin => "plugin",
        }
    }

    pub fn default_permissions(&self) -> &'static [&'static str] {
        match self {
            Self::User => &[
                "data:read",
                "ai:chat",
                "ai:embeddings",
                "storage:local",
                "tools:compose",
            ],
            Self::Developer => &[
                "data:read",
                "data:write",
                "network:fetch",
                "ai:chat",
                "ai:embeddings",
                "ai:images",
                "storage:local",
                "storage:cloud",
                "tools:execute",
                "tools:compose",
            ],
            Self::Admin => &["*"],
            Self::Plugin => &[],
        }
    }

    /// Entity type recorded for grants seeded from this role.
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Plugin => EntityType::Plugin,
            _ => EntityType::User,
        }
    }

    pub fn info(&self) -> RoleInfo {
        RoleInfo {
            role: *self,
            name: self.name(),
            default_permissions: self.default_permissions().to_vec(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| LedgerError::UnknownRole(s.to_string()))
    }
}
