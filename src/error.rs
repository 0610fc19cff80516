/// `error.rs` — error taxonomy for the script repository
///
/// Low-level lifecycle primitives surface these to their direct caller.
/// Orchestration wrappers in `ScriptManager` log and notify before deciding
/// whether to propagate.
use thiserror::Error;

use crate::scripting::types::ScriptType;

pub type Result<T> = std::result::Result<T, ScriptError>;

#[derive(Debug, Error)]
pub enum ScriptError {
    /// The referenced script id is not stored in the given scope.
    #[error("script '{id}' not found in {scope} scripts")]
    NotFound { id: String, scope: ScriptType },

    /// Malformed import payload.
    #[error("invalid script data: {0}")]
    Validation(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl ScriptError {
    pub fn not_found(id: impl Into<String>, scope: ScriptType) -> Self {
        Self::NotFound { id: id.into(), scope }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Failure creating or destroying an execution context.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("failed to create sandbox VM: {0}")]
    Vm(String),

    #[error("host API registration failed for '{script_id}': {message}")]
    Api { script_id: String, message: String },

    #[error("script '{script_id}' failed: {message}")]
    Script { script_id: String, message: String },

    /// A live instance already exists for this key.
    #[error("script '{0}' already has a live sandbox")]
    AlreadyRunning(String),

    #[error("sandbox task for '{script_id}' aborted: {message}")]
    Task { script_id: String, message: String },
}

/// Script Store read/write failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt stored script: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A collection may hold each id once.
    #[error("duplicate script id '{0}' in collection")]
    DuplicateId(String),

    #[error("data directory unavailable: {0}")]
    Io(#[from] std::io::Error),
}
