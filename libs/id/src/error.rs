//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is not a valid UUID.
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    /// The ID contains a character that cannot appear in a store key.
    #[error("invalid character {character:?} in ID '{value}'")]
    InvalidCharacter { character: char, value: String },

    /// The ID is longer than the allowed maximum.
    #[error("ID too long: {actual} characters (max {max})")]
    TooLong { max: usize, actual: usize },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ID format is invalid.
    #[error("invalid ID format: {message}")]
    InvalidFormat { message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
