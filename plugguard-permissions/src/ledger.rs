//! The permission ledger: grants, revocations, checks and requests.
//!
//! Every decision goes through [`PermissionLedger::check`], which applies a
//! fixed precedence:
//!
//! 1. a revocation overlapping the permission: one that covers it
//!    (exact, `category:*` or `*`) or one it would cover (`network:*`
//!    against a revoked `network:fetch`)
//! 2. an exact grant
//! 3. a category wildcard grant for a concrete scope
//! 4. the universal wildcard
//!
//! and otherwise denies, with `no_grants` only for an entity the ledger has
//! never seen. Denials are written to the audit trail; allows bump the
//! per-permission usage counters.

use crate::audit::{AuditAction, AuditEntry, AuditEvent, AuditFilter};
use crate::catalog::{PermissionCatalog, PermissionInfo, RiskLevel, aggregate_risk};
use crate::error::{LedgerError, PermissionError, Result};
use crate::permission::{MatchType, best_match, match_grant};
use crate::request::{PermissionRequest, RequestStatus};
use crate::role::{Role, RoleInfo};
use crate::store::{GrantRecord, LedgerStore, RevocationRecord, UsageStats, lock};
use chrono::{DateTime, Utc};
use plugguard_types::{EntityType, RequestId};
use serde::{Serialize, Serializer};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Actor recorded for grants seeded from roles.
const SYSTEM_ACTOR: &str = "system";

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed(MatchType),
    Denied(DenialReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    ExplicitlyRevoked,
    NoGrants,
    NotGranted,
    InvalidPermission(PermissionError),
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitlyRevoked => "explicitly_revoked",
            Self::NoGrants => "no_grants",
            Self::NotGranted => "not_granted",
            Self::InvalidPermission(_) => "invalid_permission",
        }
    }

    fn audit_action(&self) -> AuditAction {
        match self {
            Self::ExplicitlyRevoked => AuditAction::CheckDeniedRevoked,
            Self::NoGrants => AuditAction::CheckDeniedNoGrants,
            Self::NotGranted => AuditAction::CheckDeniedNotGranted,
            Self::InvalidPermission(_) => AuditAction::CheckDeniedInvalid,
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPermission(e) => write!(f, "invalid_permission: {e}"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    pub fn match_type(&self) -> Option<MatchType> {
        match self {
            Self::Allowed(m) => Some(*m),
            Self::Denied(_) => None,
        }
    }

    pub fn denial_reason(&self) -> Option<&DenialReason> {
        match self {
            Self::Allowed(_) => None,
            Self::Denied(reason) => Some(reason),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DecisionRecord<'a> {
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    match_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a PermissionError>,
}

impl Serialize for Decision {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let record = match self {
            Self::Allowed(m) => DecisionRecord {
                allowed: true,
                match_type: Some(m.as_str()),
                reason: None,
                error: None,
            },
            Self::Denied(reason) => DecisionRecord {
                allowed: false,
                match_type: None,
                reason: Some(reason.as_str()),
                error: match reason {
                    DenialReason::InvalidPermission(e) => Some(e),
                    _ => None,
                },
            },
        };
        record.serialize(serializer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GrantOptions {
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl GrantOptions {
    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantReceipt {
    pub permission: String,
    pub risk: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything an entity currently holds, sorted by permission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityPermissions {
    pub granted: Vec<GrantRecord>,
    pub revoked: Vec<RevocationRecord>,
}

impl EntityPermissions {
    pub fn granted_permissions(&self) -> Vec<String> {
        self.granted.iter().map(|g| g.permission.to_string()).collect()
    }

    pub fn revoked_permissions(&self) -> Vec<String> {
        self.revoked.iter().map(|r| r.permission.to_string()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStatus {
    pub total_entities: usize,
    pub total_grants: usize,
    pub total_revocations: usize,
    pub audit_log_size: usize,
    pub audit_capacity: usize,
    pub audit_failures: u64,
    pub categories: Vec<String>,
    pub roles: Vec<Role>,
}

/// Grants, revokes and checks permissions against a shared [`LedgerStore`].
#[derive(Clone)]
pub struct PermissionLedger {
    store: Arc<LedgerStore>,
    catalog: PermissionCatalog,
}

impl PermissionLedger {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self::with_catalog(store, PermissionCatalog::builtin())
    }

    pub fn with_catalog(store: Arc<LedgerStore>, catalog: PermissionCatalog) -> Self {
        Self { store, catalog }
    }

    pub fn catalog(&self) -> &PermissionCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    // ================================================================
    // Grants and revocations
    // ================================================================

    /// Grants a permission. Re-granting replaces the previous grant record
    /// and clears an exact-match revocation.
    pub fn grant(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        permission: &str,
        granted_by: &str,
        options: GrantOptions,
    ) -> Result<GrantReceipt> {
        let parsed = self.catalog.parse(permission)?;
        let key = parsed.to_string();
        let risk = parsed.risk();

        {
            let entity = self.store.entity_or_insert(entity_id);
            let mut entity = lock(&entity);
            entity.revocations.remove(&key);
            entity.grants.insert(
                key.clone(),
                GrantRecord {
                    permission: parsed,
                    risk,
                    granted_by: granted_by.to_string(),
                    granted_at: Utc::now(),
                    expires_at: options.expires_at,
                    reason: options.reason.clone(),
                },
            );
        }

        self.store.audit().record(
            AuditEvent::new(AuditAction::Grant, entity_id)
                .entity_type(entity_type)
                .permission(&key)
                .actor(granted_by)
                .metadata(json!({
                    "risk": risk,
                    "expiresAt": options.expires_at,
                    "reason": options.reason,
                })),
        );
        debug!(entity_id, permission = %key, %risk, "permission granted");

        Ok(GrantReceipt {
            permission: key,
            risk,
            expires_at: options.expires_at,
        })
    }

    /// Revokes a permission. The revocation outlives any later grant of a
    /// different permission it covers.
    pub fn revoke(
        &self,
        entity_id: &str,
        permission: &str,
        revoked_by: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let parsed = self.catalog.parse(permission)?;
        let key = parsed.to_string();

        {
            let entity = self.store.entity_or_insert(entity_id);
            let mut entity = lock(&entity);
            entity.grants.remove(&key);
            entity.revocations.insert(
                key.clone(),
                RevocationRecord {
                    permission: parsed,
                    revoked_by: revoked_by.to_string(),
                    revoked_at: Utc::now(),
                    reason: reason.map(str::to_string),
                },
            );
        }

        self.store.audit().record(
            AuditEvent::new(AuditAction::Revoke, entity_id)
                .permission(&key)
                .actor(revoked_by)
                .metadata(json!({ "reason": reason })),
        );
        debug!(entity_id, permission = %key, "permission revoked");
        Ok(())
    }

    /// Seeds an entity with a role's default permissions.
    pub fn initialize_for_role(&self, entity_id: &str, role: Role) -> Result<Vec<GrantReceipt>> {
        let receipts = role
            .default_permissions()
            .iter()
            .map(|perm| {
                self.grant(
                    entity_id,
                    role.entity_type(),
                    perm,
                    SYSTEM_ACTOR,
                    GrantOptions::default().reason(format!("role:{role}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        info!(entity_id, %role, grants = receipts.len(), "initialized permissions for role");
        Ok(receipts)
    }

    // ================================================================
    // Checks
    // ================================================================

    /// Decides whether `entity_id` may use `permission`. Never fails:
    /// malformed input is a denial.
    pub fn check(&self, entity_id: &str, permission: &str) -> Decision {
        let decision = self.evaluate(entity_id, permission);
        if let Decision::Denied(reason) = &decision {
            self.store.audit().record(
                AuditEvent::new(reason.audit_action(), entity_id)
                    .permission(permission)
                    .metadata(json!({ "reason": reason.to_string() })),
            );
            debug!(entity_id, permission, reason = %reason, "permission check denied");
        }
        decision
    }

    fn evaluate(&self, entity_id: &str, permission: &str) -> Decision {
        let requested = match self.catalog.parse(permission) {
            Ok(p) => p,
            Err(e) => return Decision::Denied(DenialReason::InvalidPermission(e)),
        };

        let Some(entity) = self.store.entity(entity_id) else {
            return Decision::Denied(DenialReason::NoGrants);
        };
        let mut entity = lock(&entity);

        if entity.revocations.values().any(|r| {
            match_grant(&r.permission, &requested).is_some()
                || match_grant(&requested, &r.permission).is_some()
        }) {
            return Decision::Denied(DenialReason::ExplicitlyRevoked);
        }

        let now = Utc::now();
        let active = entity.grants.values().filter(|g| g.is_active(now));
        match best_match(active.map(|g| &g.permission), &requested) {
            Some(matched) => {
                let usage = entity.usage.entry(requested.to_string()).or_default();
                usage.count += 1;
                usage.last_used_at = Some(now);
                Decision::Allowed(matched)
            }
            None => Decision::Denied(DenialReason::NotGranted),
        }
    }

    // ================================================================
    // Requests
    // ================================================================

    /// Records a request for permissions. All permissions must be valid or
    /// the whole request is rejected.
    pub fn create_permission_request<S: AsRef<str>>(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        permissions: &[S],
        reason: &str,
    ) -> Result<PermissionRequest> {
        let mut parsed = Vec::with_capacity(permissions.len());
        let mut errors = Vec::new();
        for perm in permissions {
            match self.catalog.parse(perm.as_ref()) {
                Ok(p) => parsed.push(p),
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            return Err(LedgerError::InvalidRequest(errors));
        }

        let request = PermissionRequest {
            id: RequestId::new(),
            entity_id: entity_id.to_string(),
            entity_type,
            permissions: parsed.iter().map(ToString::to_string).collect(),
            reason: reason.to_string(),
            risk: aggregate_risk(parsed.iter().map(|p| p.risk())),
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            decided_by: None,
            decided_at: None,
            decision_note: None,
        };

        self.store.audit().record(
            AuditEvent::new(AuditAction::PermissionRequest, entity_id)
                .entity_type(entity_type)
                .metadata(json!({
                    "requestId": request.id,
                    "permissions": request.permissions,
                    "risk": request.risk,
                    "reason": request.reason,
                })),
        );
        info!(entity_id, request_id = %request.id, risk = %request.risk, "permission request created");
        Ok(request)
    }

    /// Marks a request approved. Grants are not changed.
    pub fn approve_request(&self, request: &mut PermissionRequest, approved_by: &str) -> Result<()> {
        self.decide(request, RequestStatus::Approved, approved_by, None)
    }

    /// Marks a request denied.
    pub fn deny_request(
        &self,
        request: &mut PermissionRequest,
        denied_by: &str,
        reason: &str,
    ) -> Result<()> {
        self.decide(request, RequestStatus::Denied, denied_by, Some(reason))
    }

    fn decide(
        &self,
        request: &mut PermissionRequest,
        status: RequestStatus,
        actor: &str,
        note: Option<&str>,
    ) -> Result<()> {
        if !request.is_pending() {
            return Err(LedgerError::RequestAlreadyDecided {
                request_id: request.id.to_string(),
                status: request.status.to_string(),
            });
        }

        request.status = status;
        request.decided_by = Some(actor.to_string());
        request.decided_at = Some(Utc::now());
        request.decision_note = note.map(str::to_string);

        let action = match status {
            RequestStatus::Approved => AuditAction::RequestApproved,
            _ => AuditAction::RequestDenied,
        };
        self.store.audit().record(
            AuditEvent::new(action, &request.entity_id)
                .entity_type(request.entity_type)
                .actor(actor)
                .metadata(json!({
                    "requestId": request.id,
                    "permissions": request.permissions,
                    "note": note,
                })),
        );
        info!(request_id = %request.id, %status, actor, "permission request decided");
        Ok(())
    }

    // ================================================================
    // Introspection
    // ================================================================

    pub fn get_permissions(&self, entity_id: &str) -> EntityPermissions {
        let Some(entity) = self.store.entity(entity_id) else {
            return EntityPermissions::default();
        };
        let entity = lock(&entity);
        let mut granted: Vec<GrantRecord> = entity.grants.values().cloned().collect();
        let mut revoked: Vec<RevocationRecord> = entity.revocations.values().cloned().collect();
        granted.sort_by_key(|g| g.permission.to_string());
        revoked.sort_by_key(|r| r.permission.to_string());
        EntityPermissions { granted, revoked }
    }

    pub fn usage_stats(&self, entity_id: &str) -> BTreeMap<String, UsageStats> {
        self.store
            .entity(entity_id)
            .map(|entity| {
                lock(&entity)
                    .usage
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn audit_log(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.store.audit().query(filter)
    }

    /// Appends a non-permission event (plugin lifecycle) to the shared trail.
    pub fn record_event(&self, event: AuditEvent) -> u64 {
        self.store.audit().record(event)
    }

    pub fn available_permissions(&self) -> Vec<PermissionInfo> {
        self.catalog.available_permissions()
    }

    pub fn roles(&self) -> Vec<RoleInfo> {
        Role::ALL.iter().map(Role::info).collect()
    }

    pub fn status(&self) -> LedgerStatus {
        let (total_grants, total_revocations) = self.store.totals();
        let audit = self.store.audit();
        LedgerStatus {
            total_entities: self.store.entity_count(),
            total_grants,
            total_revocations,
            audit_log_size: audit.len(),
            audit_capacity: audit.capacity(),
            audit_failures: audit.failures(),
            categories: self.catalog.category_keys(),
            roles: Role::ALL.to_vec(),
        }
    }
}
