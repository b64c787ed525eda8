//! Process-wide grant and revocation storage.
//!
//! A [`LedgerStore`] is constructed once by the host and shared by `Arc`
//! with every [`crate::PermissionLedger`] that needs it. The entity map lock
//! is only held to look up or insert an entity; each entity's grants,
//! revocations and usage counters sit behind their own mutex so operations
//! on different entities never contend.

use crate::audit::AuditTrail;
use crate::catalog::RiskLevel;
use crate::permission::Permission;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// A permission held by an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRecord {
    pub permission: Permission,
    pub risk: RiskLevel,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    /// Expired grants stay listed but no longer satisfy checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GrantRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expiry| expiry > now)
    }
}

/// An explicit revocation. Wins over any grant it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationRecord {
    pub permission: Permission,
    pub revoked_by: String,
    pub revoked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// How often an entity has exercised one permission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub(crate) struct EntityRecord {
    /// Keyed by canonical permission string.
    pub grants: HashMap<String, GrantRecord>,
    pub revocations: HashMap<String, RevocationRecord>,
    pub usage: HashMap<String, UsageStats>,
}

pub(crate) type SharedEntity = Arc<Mutex<EntityRecord>>;

/// Shared backing store for permission ledgers.
pub struct LedgerStore {
    entities: RwLock<HashMap<String, SharedEntity>>,
    audit: AuditTrail,
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::with_audit(AuditTrail::default())
    }

    pub fn with_audit(audit: AuditTrail) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            audit,
        }
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn entity_count(&self) -> usize {
        self.entities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub(crate) fn entity(&self, entity_id: &str) -> Option<SharedEntity> {
        self.entities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(entity_id)
            .cloned()
    }

    pub(crate) fn entity_or_insert(&self, entity_id: &str) -> SharedEntity {
        if let Some(existing) = self.entity(entity_id) {
            return existing;
        }
        let mut entities = self
            .entities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(entities.entry(entity_id.to_string()).or_default())
    }

    /// Total (grants, revocations) across all entities.
    pub(crate) fn totals(&self) -> (usize, usize) {
        let entities: Vec<SharedEntity> = self
            .entities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        entities.iter().fold((0, 0), |(g, r), entity| {
            let entity = lock(entity);
            (g + entity.grants.len(), r + entity.revocations.len())
        })
    }
}

/// Locks an entity, recovering the data if a previous holder panicked.
pub(crate) fn lock(entity: &SharedEntity) -> MutexGuard<'_, EntityRecord> {
    entity.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
