//! Core type definitions shared by the plugguard crates.
//!
//! - Sandbox and permission-request identifiers (UUID v7)
//! - The kinds of entity that can hold permissions
//!
//! Permission parsing, the ledger and the sandbox runtime live in their own
//! crates; this one stays dependency-light so every layer can use it.

mod entity;
mod ids;

pub use entity::EntityType;
pub use ids::{RequestId, SandboxId};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),
}
