//! Error types for the supervisor and its collaborators

use thiserror::Error;

/// Errors raised by a listener generation and the supervisor loop
#[derive(Debug, Error)]
pub enum ServerError {
    /// The active generation was interrupted and should be rebuilt.
    ///
    /// This is control flow, not a failure: the supervisor loop catches it
    /// and starts a new generation. It never escapes `Supervisor::run`.
    #[error("server restart requested")]
    RestartRequested,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),

    #[error("failed to provision TLS material: {0}")]
    Provision(#[from] ProvisionError),

    #[error("failed to spawn worker process `{program}`: {source}")]
    Worker {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ServerError {
    /// Whether this is the restart sentinel rather than a real failure
    pub fn is_restart(&self) -> bool {
        matches!(self, ServerError::RestartRequested)
    }
}

/// Errors from generating or writing TLS material
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("crypto provider failed: {0}")]
    Provider(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("settings store error: {0}")]
    Settings(#[from] SettingsError),
}

/// Errors from loading or persisting settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write settings file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}
