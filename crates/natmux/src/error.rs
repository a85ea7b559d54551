//! Error types for tunnel operations

use thiserror::Error;

/// Errors that can occur while running a tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Malformed frame or message received out of sequence
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the violation
        message: String,
    },

    /// Request vetoed by policy (bad token, disallowed port, capacity)
    #[error("Request rejected: {reason}")]
    Rejected {
        /// Reason sent back to the client verbatim
        reason: String,
    },

    /// Routing key already taken: port bound elsewhere or vhost registered
    #[error("Bind conflict: {reason}")]
    BindConflict {
        /// Reason sent back to the client verbatim
        reason: String,
    },

    /// Connection error (refused, reset, closed)
    #[error("Connection error: {source}")]
    Connection {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Registry lookup failure
    #[error("Registry error: {message}")]
    Registry {
        /// Error message describing the registry issue
        message: String,
    },

    /// Configuration error (invalid config, missing required field)
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// TLS material could not be loaded or the handshake failed
    #[error("TLS error: {message}")]
    Tls {
        /// Error message describing the TLS failure
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Service is shutting down
    #[error("Service is shutting down")]
    Shutdown,
}

impl TunnelError {
    /// Create a new protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new policy rejection
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Create a new bind conflict
    #[must_use]
    pub fn bind_conflict(reason: impl Into<String>) -> Self {
        Self::BindConflict {
            reason: reason.into(),
        }
    }

    /// Create a new registry error
    #[must_use]
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new TLS error
    #[must_use]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create a new connection error from any error type
    #[must_use]
    pub fn connection<E: std::error::Error>(err: E) -> Self {
        Self::Connection {
            source: std::io::Error::other(err.to_string()),
        }
    }

    /// Create a new connection error with a message
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            source: std::io::Error::other(message.into()),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Whether this error ends the tunnel permanently.
    ///
    /// Bind conflicts are a kind of rejection.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::BindConflict { .. })
    }

    /// Reason to put on the wire in a failed RESPONSE, if this is a rejection
    #[must_use]
    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            Self::Rejected { reason } | Self::BindConflict { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;
