//! Error types for the scheduling core
//!
//! Library code reports typed errors; the binary and transports wrap them in
//! `anyhow` with context at the edges.

use thiserror::Error;

use crate::time::Millis;

/// Failure while turning a resolved state into commands
#[derive(Debug, Error)]
pub enum DiffError {
    /// Layer content could not be interpreted by the device kind
    #[error("invalid content on layer '{layer}' (object '{object_id}'): {reason}")]
    InvalidContent {
        layer: String,
        object_id: String,
        reason: String,
    },

    /// Layer mapping is missing routing data the device needs
    #[error("mapping for layer '{layer}' is invalid: {reason}")]
    InvalidMapping { layer: String, reason: String },

    /// A command payload could not be serialized for the scheduler
    #[error("failed to encode command for '{context}': {source}")]
    Encode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of a device-level operation
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device '{0}' has been terminated")]
    Terminated(String),

    #[error("device '{device_id}' failed to handle state at {time}: {source}")]
    Diff {
        device_id: String,
        time: Millis,
        #[source]
        source: DiffError,
    },
}

/// Failure while resolving the timeline
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("timeline object '{0}' references unknown object '{1}'")]
    UnknownReference(String, String),

    #[error("timeline object '{0}' has an invalid start expression '{1}'")]
    InvalidExpression(String, String),

    #[error("circular reference while resolving timeline object '{0}'")]
    CircularReference(String),

    #[error("duplicate timeline object id '{0}'")]
    DuplicateId(String),

    #[error("timeline object '{0}' has a window beyond the end of time")]
    OutOfRange(String),
}
