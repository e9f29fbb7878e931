use liboperator::OperatorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("stored data is invalid: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum HookError {
    /// The request cannot be satisfied, e.g. invalid provisioning.
    #[error("{0}")]
    Rejected(String),
    #[error("hook is missing configuration: {0}")]
    MissingConfig(String),
    #[error(transparent)]
    Operator(#[from] OperatorError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tool `{0}` not found")]
    ToolNotFound(String),
    #[error("version `{version}` of tool `{tool}` not found")]
    VersionNotFound { tool: String, version: String },
    #[error("connection method `{method}` is not declared by tool `{tool}`")]
    ConnectionMethodUnknown { tool: String, method: String },
    #[error("a persistent session of tool `{tool}` already exists")]
    ExistingSession { tool: String },
    #[error("session `{session}` is already shared with `{grantee}`")]
    SessionAlreadyShared { session: String, grantee: String },
    #[error("session `{0}` not found")]
    SessionNotFound(String),
    #[error("session `{0}` is not owned by the user")]
    SessionNotOwned(String),
    #[error("the connection method of session `{0}` does not support sharing")]
    SharingNotSupported(String),
    #[error("a session cannot be shared with its owner")]
    CannotShareWithOwner,
    #[error("session `{session}` is not shared with user {grantee_id}")]
    ShareNotFound { session: String, grantee_id: i64 },
    #[error("volume name `{0}` is used more than once")]
    DuplicateVolume(String),
    #[error("mandatory hook `{hook}` failed: {source}")]
    HookFailed {
        hook: String,
        #[source]
        source: HookError,
    },
    #[error(transparent)]
    Operator(#[from] OperatorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline `{0}` not found")]
    PipelineNotFound(String),
    #[error("pipeline run `{0}` not found")]
    RunNotFound(String),
    #[error("pipeline `{0}` already has an unfinished run")]
    RunAlreadyActive(String),
    #[error(transparent)]
    Operator(#[from] OperatorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
