//! Error types shared by transitions and session items.

use thiserror::Error;

/// Failure reported by the remote graph layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Object not found: {0}")]
    NotFound(u32),
    #[error("Unknown factory: {0}")]
    UnknownFactory(String),
    #[error("Activation of object {id} failed: {reason}")]
    ActivationFailed { id: u32, reason: String },
    #[error("Object {0} was destroyed")]
    Destroyed(u32),
}

/// Failure to obtain exclusive use of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    #[error("Resource {resource} is held by {holder}")]
    Busy { resource: u32, holder: u32 },
    #[error("Acquisition holder was dropped")]
    HolderGone,
}

/// Configuration error, returned synchronously by `configure`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Missing required property: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("Item {0} cannot be reconfigured while activating or active")]
    Busy(u32),
}

impl ConfigError {
    /// Shorthand for an invalid property value.
    #[must_use]
    pub fn invalid(key: &'static str, value: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
        }
    }
}

/// Error raised inside a transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Invariant violated: {0}")]
    Invariant(String),
    #[error("Item {0} is not configured")]
    NotConfigured(u32),
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),
    #[error("Transition source was dropped")]
    SourceGone,
    #[error("State machine failed without reporting an error")]
    StateMachine,
}

impl Error {
    /// Build an invariant violation.
    #[must_use]
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }
}

/// Result alias used across the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;
