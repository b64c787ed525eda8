//! Host capabilities a sandbox can be wired with.
//!
//! Capabilities are derived from the permissions a plugin was granted. Only
//! the host functions of granted capabilities are linked; imports of other
//! known capabilities get trapping stubs.

use plugguard_permissions::{Permission, best_match};
use serde::Serialize;
use std::collections::BTreeSet;

/// Import module every host function lives in.
pub const HOST_MODULE: &str = "host";

/// Host functions linked into every sandbox regardless of grants.
pub const UTILITY_IMPORTS: &[&str] = &["log", "now_ms"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Fetch,
    LocalStorage,
    AiChat,
    AiEmbeddings,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Fetch,
        Capability::LocalStorage,
        Capability::AiChat,
        Capability::AiEmbeddings,
    ];

    /// The permission that unlocks this capability.
    pub fn permission(&self) -> &'static str {
        match self {
            Self::Fetch => "network:fetch",
            Self::LocalStorage => "storage:local",
            Self::AiChat => "ai:chat",
            Self::AiEmbeddings => "ai:embeddings",
        }
    }

    /// Names of the `host` imports this capability provides.
    pub fn imports(&self) -> &'static [&'static str] {
        match self {
            Self::Fetch => &["fetch"],
            Self::LocalStorage => &["storage_get", "storage_set", "storage_delete", "storage_clear"],
            Self::AiChat => &["ai_chat"],
            Self::AiEmbeddings => &["ai_embed"],
        }
    }

    /// The capability providing a `host` import, if any.
    pub fn for_import(name: &str) -> Option<Capability> {
        Self::ALL.into_iter().find(|c| c.imports().contains(&name))
    }
}

/// Whether `name` is a function the `host` module can ever provide.
pub fn is_known_host_import(name: &str) -> bool {
    UTILITY_IMPORTS.contains(&name) || Capability::for_import(name).is_some()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn none() -> Self {
        Self::default()
    }

    /// Capabilities covered by a set of granted permissions, honouring
    /// category and universal wildcards.
    pub fn from_permissions<'a, I>(granted: I) -> Self
    where
        I: IntoIterator<Item = &'a Permission>,
    {
        let granted: Vec<&Permission> = granted.into_iter().collect();
        let caps = Capability::ALL
            .into_iter()
            .filter(|cap| {
                Permission::parse(cap.permission())
                    .map(|needed| best_match(granted.iter().copied(), &needed).is_some())
                    .unwrap_or(false)
            })
            .collect();
        Self(caps)
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
