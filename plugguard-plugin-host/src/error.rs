//! Error types for the plugin host.

use crate::backend::FailureKind;
use plugguard_permissions::PermissionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("plugin not loaded: {0}")]
    NotLoaded(String),

    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("plugin '{plugin_id}' requested invalid permission '{permission}': {source}")]
    InvalidPermission {
        plugin_id: String,
        permission: String,
        #[source]
        source: PermissionError,
    },

    #[error("permission denied: plugin '{plugin_id}' lacks '{permission}' ({reason})")]
    PermissionDenied {
        plugin_id: String,
        permission: String,
        reason: String,
    },

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("no isolation backend available: {0}")]
    BackendUnavailable(String),

    #[error("plugin initialization failed: {plugin_id} ({kind}): {message}")]
    InitializationFailed {
        plugin_id: String,
        kind: FailureKind,
        message: String,
    },

    #[error("dispose failed for sandbox {sandbox_id}: {message}")]
    Dispose { sandbox_id: String, message: String },

    #[error("config error: {0}")]
    Config(String),
}
