//! Error types for Skiff.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Skiff's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Category attached to every surfaced failure.
///
/// Categories drive user-facing messaging only. Nothing in the adapter
/// retries based on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Missing or rejected credentials.
    Auth,
    /// Usage or billing limits reached.
    Quota,
    /// The submitted code is malformed (detected from captured stderr).
    Syntax,
    /// A referenced session or port does not exist.
    NotFound,
    /// Everything else.
    Generic,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Auth => "auth",
            ErrorCategory::Quota => "quota",
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::NotFound => "not-found",
            ErrorCategory::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// Core error type for Skiff.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Classified Errors
    // =========================================================================
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Quota exceeded: {0}")]
    Quota(String),

    /// Carries the interpreter's stderr verbatim (trimmed).
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Generic(String),

    // =========================================================================
    // Raw Errors (not yet classified)
    // =========================================================================
    /// Failure reported by the remote service, before classification.
    #[error("{0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an auth error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a quota error.
    pub fn quota(msg: impl Into<String>) -> Self {
        Self::Quota(msg.into())
    }

    /// Create a syntax error.
    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a generic error.
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a raw remote-service error.
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The category this error is reported under.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Auth(_) => ErrorCategory::Auth,
            Error::Quota(_) => ErrorCategory::Quota,
            Error::Syntax(_) => ErrorCategory::Syntax,
            Error::NotFound(_) => ErrorCategory::NotFound,
            Error::Generic(_) | Error::Remote(_) | Error::Config(_) | Error::Io(_) => {
                ErrorCategory::Generic
            }
        }
    }

    /// Whether the error has already been through the classifier.
    pub fn is_classified(&self) -> bool {
        !matches!(self, Error::Remote(_) | Error::Io(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(Error::auth("x").category(), ErrorCategory::Auth);
        assert_eq!(Error::quota("x").category(), ErrorCategory::Quota);
        assert_eq!(Error::syntax("x").category(), ErrorCategory::Syntax);
        assert_eq!(Error::not_found("x").category(), ErrorCategory::NotFound);
        assert_eq!(Error::remote("x").category(), ErrorCategory::Generic);
        assert_eq!(Error::config("x").category(), ErrorCategory::Generic);
    }

    #[test]
    fn test_syntax_message_keeps_stderr() {
        let err = Error::syntax("SyntaxError: invalid syntax");
        assert_eq!(err.to_string(), "Syntax error: SyntaxError: invalid syntax");
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::NotFound.to_string(), "not-found");
        assert_eq!(ErrorCategory::Generic.to_string(), "generic");
    }
}
