//! Common error types for the HoLA agent.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`HolaError`].
pub type HolaResult<T> = Result<T, HolaError>;

/// Errors raised by the agent's collaborators.
///
/// Client protocol violations are not errors in this sense; they travel back to
/// the client as [`crate::ErrorCode`] values inside `error` envelopes.
#[derive(Error, Diagnostic, Debug)]
pub enum HolaError {
    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(hola::container::invalid_id),
        help("Container IDs and names are 1-128 characters of [A-Za-z0-9_.-]")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// The Docker daemon rejected a call or the connection to it failed.
    #[error("Docker error: {message}")]
    #[diagnostic(
        code(hola::docker),
        help("Check that the Docker daemon is running and the socket is readable")
    )]
    Docker {
        /// The error message reported by the client library.
        message: String,
    },

    /// Host metrics could not be sampled.
    #[error("Metrics error: {message}")]
    #[diagnostic(code(hola::metrics))]
    Metrics {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(hola::io))]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(hola::config))]
    Config {
        /// The error message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = HolaError::Docker {
            message: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "Docker error: connection refused");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "socket not found");
        let err: HolaError = io_err.into();
        assert!(matches!(err, HolaError::Io(_)));
    }
}
