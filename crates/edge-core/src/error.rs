//! Error types for decoding upstream and stored documents.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while turning raw JSON into domain values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Payload was not a JSON object.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Required field absent or of the wrong type.
    #[error("missing field: {field}")]
    MissingField {
        /// Name of the missing field
        field: &'static str,
    },

    /// `dateModified` could not be parsed as an RFC 3339 timestamp.
    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp {
        /// Raw value received
        value: String,
        /// Parser error message
        reason: String,
    },

    /// Resource collection name not recognized.
    #[error("unknown resource kind: {0}")]
    UnknownResource(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_format() {
        assert_eq!(CoreError::MissingField { field: "id" }.to_string(), "missing field: id");
        assert_eq!(
            CoreError::UnknownResource("lots".to_string()).to_string(),
            "unknown resource kind: lots"
        );
    }
}
