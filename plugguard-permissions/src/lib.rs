//! Permission model and ledger for sandboxed plugins.
//!
//! - [`PermissionCatalog`]: the categories, scopes and risk levels a
//!   permission string can name
//! - [`PermissionLedger`]: grants, revocations, checks and permission
//!   requests over a shared [`LedgerStore`]
//! - [`AuditTrail`]: the bounded record of every denial, grant and plugin
//!   lifecycle event
//!
//! Permission strings have the form `category:scope`, `category:*` or `*`.
//! Revocations always take precedence over grants.

mod audit;
mod catalog;
mod error;
mod ledger;
mod permission;
mod request;
mod role;
mod store;

pub use audit::{
    AuditAction, AuditEntry, AuditEvent, AuditExportError, AuditExporter, AuditFilter,
    AuditTrail, DEFAULT_AUDIT_CAPACITY, JsonLinesExporter,
};
pub use catalog::{CategoryDef, PermissionCatalog, PermissionInfo, RiskLevel, ScopeDef, aggregate_risk};
pub use error::{LedgerError, PermissionError, Result};
pub use ledger::{
    Decision, DenialReason, EntityPermissions, GrantOptions, GrantReceipt, LedgerStatus,
    PermissionLedger,
};
pub use permission::{MatchType, Permission, best_match, match_grant};
pub use request::{PermissionRequest, RequestStatus};
pub use role::{Role, RoleInfo};
pub use store::{GrantRecord, LedgerStore, RevocationRecord, UsageStats};
