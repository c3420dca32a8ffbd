//! Core error types for TESSERA.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Descriptor or feature set bytes did not decode
    InvalidEncoding { format: &'static str, reason: String },

    /// Invalid ID format
    InvalidId { reason: String },

    /// Invalid feature token
    InvalidFeature { reason: String },

    /// Invalid server role
    InvalidRole { value: String },

    /// Validation error
    Validation { field: String, reason: String },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding { format, reason } => {
                write!(f, "Invalid {} encoding: {}", format, reason)
            }
            Self::InvalidId { reason } => write!(f, "Invalid ID: {}", reason),
            Self::InvalidFeature { reason } => write!(f, "Invalid feature: {}", reason),
            Self::InvalidRole { value } => write!(f, "Invalid server role: {}", value),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            format: "json",
            reason: err.to_string(),
        }
    }
}

impl From<postcard::Error> for CoreError {
    fn from(err: postcard::Error) -> Self {
        Self::InvalidEncoding {
            format: "postcard",
            reason: err.to_string(),
        }
    }
}
