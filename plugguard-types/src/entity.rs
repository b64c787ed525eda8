use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of principal a permission is granted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A loaded plugin.
    Plugin,
    /// A human user of the host application.
    User,
    /// A named role used as a grant template.
    Role,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plugin => "plugin",
            Self::User => "user",
            Self::Role => "role",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plugin" => Ok(Self::Plugin),
            "user" => Ok(Self::User),
            "role" => Ok(Self::Role),
            other => Err(crate::Error::UnknownEntityType(other.to_string())),
        }
    }
}
