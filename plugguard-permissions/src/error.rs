//! Error types for permission parsing and the ledger.

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Why a permission string failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("permission string is empty")]
    Empty,

    #[error("malformed permission '{0}': expected 'category:scope' or '*'")]
    Malformed(String),

    #[error("unknown category: {0}")]
    UnknownCategory(String),

    #[error("unknown scope: {scope} in category {category}")]
    UnknownScope { category: String, scope: String },
}

impl Serialize for PermissionError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid permission: {0}")]
    InvalidPermission(#[from] PermissionError),

    #[error("invalid permission request: {}", join_errors(.0))]
    InvalidRequest(Vec<PermissionError>),

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("permission request {request_id} was already {status}")]
    RequestAlreadyDecided { request_id: String, status: String },
}

fn join_errors(errors: &[PermissionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
