//! Error taxonomy for the model supervisor.

use thiserror::Error;

/// Errors surfaced across the public API.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("model '{name}': invalid configuration: {detail}")]
    ConfigInvalid { name: String, detail: String },

    #[error("model '{name}': failed to provision environment: {detail}")]
    EnvError { name: String, detail: String },

    #[error("model '{name}': dependency installation failed: {detail}")]
    DependencyInstallError { name: String, detail: String },

    #[error("model '{name}': failed to spawn worker: {detail}")]
    SpawnError { name: String, detail: String },

    #[error("model '{name}': startup failed: {detail}\n--- worker stderr (tail) ---\n{stderr_tail}")]
    StartupFailed {
        name: String,
        detail: String,
        stderr_tail: String,
    },

    #[error("model '{name}': channel not connected")]
    ChannelNotConnected { name: String },

    #[error("model '{name}': channel closed unexpectedly")]
    ChannelClosed { name: String },

    #[error("model '{name}': request failed: {detail}")]
    RequestFailed { name: String, detail: String },

    #[error("model '{name}': supervisor is not started")]
    NotStarted { name: String },

    #[error("discovery failed at '{root}': {detail}")]
    DiscoveryFailed { root: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
