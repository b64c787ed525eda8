//! Parsed permissions and the grant-matching rules.

use crate::catalog::{PermissionCatalog, RiskLevel};
use crate::error::PermissionError;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static BUILTIN: LazyLock<PermissionCatalog> = LazyLock::new(PermissionCatalog::builtin);

/// A validated `category:scope` permission, a category wildcard
/// (`category:*`), or the universal wildcard `*`.
///
/// Permissions are stored and exchanged as strings; this type is the
/// parsed form and is always produced by [`PermissionCatalog::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permission {
    category: String,
    scope: String,
    risk: RiskLevel,
}

impl Permission {
    pub const WILDCARD: &'static str = "*";

    pub(crate) fn new(category: &str, scope: &str, risk: RiskLevel) -> Self {
        Self {
            category: category.to_string(),
            scope: scope.to_string(),
            risk,
        }
    }

    /// The universal wildcard `*`.
    pub fn universal() -> Self {
        Self::new(Self::WILDCARD, Self::WILDCARD, RiskLevel::High)
    }

    /// Parses against the built-in catalog.
    pub fn parse(raw: &str) -> Result<Self, PermissionError> {
        BUILTIN.parse(raw)
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn risk(&self) -> RiskLevel {
        self.risk
    }

    pub fn is_universal(&self) -> bool {
        self.category == Self::WILDCARD
    }

    pub fn is_category_wildcard(&self) -> bool {
        !self.is_universal() && self.scope == Self::WILDCARD
    }

    pub fn is_concrete(&self) -> bool {
        self.scope != Self::WILDCARD
    }

    fn same_target(&self, other: &Permission) -> bool {
        self.category == other.category && self.scope == other.scope
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_universal() {
            f.write_str(Self::WILDCARD)
        } else {
            write!(f, "{}:{}", self.category, self.scope)
        }
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for Permission {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// How a held permission satisfied a check. Ordered by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    CategoryWildcard,
    FullWildcard,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::CategoryWildcard => "category_wildcard",
            Self::FullWildcard => "full_wildcard",
        }
    }
}

/// Whether `held` covers `requested`, and how.
///
/// A category wildcard only covers concrete scopes of its own category; a
/// request for `ai:*` is satisfied by holding `ai:*` (exact) or `*`.
pub fn match_grant(held: &Permission, requested: &Permission) -> Option<MatchType> {
    if held.same_target(requested) {
        Some(MatchType::Exact)
    } else if held.is_category_wildcard()
        && requested.is_concrete()
        && held.category == requested.category
    {
        Some(MatchType::CategoryWildcard)
    } else if held.is_universal() {
        Some(MatchType::FullWildcard)
    } else {
        None
    }
}

/// Best match of `requested` across a set of held permissions.
pub fn best_match<'a, I>(held: I, requested: &Permission) -> Option<MatchType>
where
    I: IntoIterator<Item = &'a Permission>,
{
    held.into_iter()
        .filter_map(|p| match_grant(p, requested))
        .min()
}
