//! Messaging error types.

use serde::{Deserialize, Serialize};

/// A serialisable description of an error raised by a remote handler.
///
/// Built from the full `anyhow` chain on the responding side and rebuilt
/// into [`MessagingError::Remote`] on the calling side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl ErrorDescriptor {
    /// Describe an `anyhow` error, keeping every cause in the chain.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self {
            name: "Error".to_string(),
            message: err.to_string(),
            causes: err.chain().skip(1).map(|cause| cause.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        for cause in &self.causes {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

/// Errors that can occur in the bridge_messaging crate.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The other end of a private channel is gone.
    #[error("Port closed: {0}")]
    PortClosed(String),

    /// A responder endpoint was required for a kind that has none.
    #[error("[messaging/window] Internal error: not found {0} responderPort.")]
    MissingResponderPort(String),

    /// A sender channel was required for a kind that has none.
    #[error("[messaging/window] Internal error: not found {0} sender channel.")]
    MissingSenderChannel(String),

    /// A handler for this message kind is already registered.
    #[error("[messaging] In this context, only one listener can be setup for {0}")]
    DuplicateHandler(String),

    /// The remote handler failed.
    #[error("Remote handler error: {0}")]
    Remote(ErrorDescriptor),

    /// The remote side accepted the call but had nothing to answer with.
    #[error("No response for {0}")]
    NoResponse(String),

    /// The messenger configuration is unusable.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
