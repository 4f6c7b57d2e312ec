//! Error types for the gateway core.
//!
//! All fallible operations return [`GatewayError`] via the [`Result`] alias.
//! Each variant carries enough structure for callers to react without string
//! matching: validation failures name the offending field and validator,
//! query failures keep the driver's original code, and canceled queries are
//! tagged with [`CANCELED_BY_USER`].

use thiserror::Error;

/// Stable code attached to errors produced by the cancellation path.
pub const CANCELED_BY_USER: &str = "CANCELED_BY_USER";

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Validation failed for `{field}` ({validator}): {message}")]
    Validation {
        /// Dotted path of the offending field, e.g. `ssh.port`.
        field: String,
        /// Name of the validator that rejected the value.
        validator: String,
        message: String,
    },

    #[error("Connection failed: {message}")]
    Connect { message: String },

    #[error("Query failed: {message}")]
    Query {
        message: String,
        /// Driver-reported code, e.g. "42P01" or "1317".
        code: Option<String>,
        /// Index of the failing statement within a batch, when known.
        statement_index: Option<usize>,
    },

    #[error("Query canceled by user")]
    Canceled,

    #[error("Query is not executing yet")]
    QueryNotReady,

    #[error("Not supported by the {client} adapter: {operation}")]
    NotSupported { client: String, operation: String },

    #[error("Decryption failed: {message}")]
    Auth { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Tunnel error: {message}")]
    Tunnel { message: String },
}

impl GatewayError {
    /// Create a validation error for a field.
    pub fn validation(
        field: impl Into<String>,
        validator: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            validator: validator.into(),
            message: message.into(),
        }
    }

    /// Create a connection error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Create a query error with an optional driver code.
    pub fn query(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Query {
            message: message.into(),
            code,
            statement_index: None,
        }
    }

    /// Create a not-supported error for an adapter operation.
    pub fn not_supported(client: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotSupported {
            client: client.into(),
            operation: operation.into(),
        }
    }

    /// Create an authentication/decryption error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a tunnel error.
    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::Tunnel {
            message: message.into(),
        }
    }

    /// Attach a batch statement index to a query error.
    pub fn at_statement(self, index: usize) -> Self {
        match self {
            Self::Query { message, code, .. } => Self::Query {
                message,
                code,
                statement_index: Some(index),
            },
            other => other,
        }
    }

    /// The stable error code for this error, when one exists.
    ///
    /// Canceled queries always report [`CANCELED_BY_USER`].
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Canceled => Some(CANCELED_BY_USER),
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// True when this error was produced by the cancellation path.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// The validator name for validation errors.
    pub fn validator(&self) -> Option<&str> {
        match self {
            Self::Validation { validator, .. } => Some(validator),
            _ => None,
        }
    }
}

/// Convert sqlx errors, preserving the driver's own code where present.
impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => GatewayError::connect(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                GatewayError::query(db_err.message().to_string(), code)
            }
            sqlx::Error::PoolTimedOut => {
                GatewayError::connect("Timed out acquiring a pooled connection")
            }
            sqlx::Error::PoolClosed => GatewayError::connect("Connection pool is closed"),
            sqlx::Error::Io(io_err) => GatewayError::connect(format!("I/O error: {io_err}")),
            sqlx::Error::Tls(tls_err) => GatewayError::connect(format!("TLS error: {tls_err}")),
            sqlx::Error::Protocol(msg) => GatewayError::connect(format!("Protocol error: {msg}")),
            other => GatewayError::query(other.to_string(), None),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::config(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::config(err.to_string())
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canceled_code() {
        let err = GatewayError::Canceled;
        assert_eq!(err.code(), Some(CANCELED_BY_USER));
        assert!(err.is_canceled());
    }

    #[test]
    fn test_query_code_preserved() {
        let err = GatewayError::query("relation missing", Some("42P01".to_string()));
        assert_eq!(err.code(), Some("42P01"));
        assert!(!err.is_canceled());
    }

    #[test]
    fn test_validation_exposes_validator() {
        let err = GatewayError::validation("ssh.port", "integer", "must be an integer");
        assert_eq!(err.validator(), Some("integer"));
        assert!(err.to_string().contains("ssh.port"));
    }

    #[test]
    fn test_statement_index_attached() {
        let err = GatewayError::query("syntax error", None).at_statement(2);
        match err {
            GatewayError::Query {
                statement_index, ..
            } => assert_eq!(statement_index, Some(2)),
            _ => panic!("expected query error"),
        }
    }
}
