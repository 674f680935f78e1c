//! Error types shared by the parser and the value accessors.

use thiserror::Error;

/// Malformed MI text.
///
/// Carries the byte offset at which parsing stopped and the complete raw
/// text that was being parsed, so a caller can log the exact line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("MI parse error at offset {offset}: {message} in \"{raw}\"")]
pub struct ParseError {
    /// Byte offset into `raw` where the problem was detected.
    pub offset: usize,
    /// What was expected or what went wrong.
    pub message: String,
    /// The text being parsed.
    pub raw: String,
}

impl ParseError {
    /// Create a parse error for `raw` at `offset`.
    #[must_use]
    pub fn new(offset: usize, message: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
            raw: raw.into(),
        }
    }
}

/// Failure to read a typed field out of a tuple.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldAccessError {
    #[error("Missing field: {name}")]
    Missing { name: String },
    #[error("Field '{name}' is not a {expected}")]
    WrongType { name: String, expected: &'static str },
    #[error("Field '{name}' value \"{value}\" is not a valid {expected}")]
    Invalid {
        name: String,
        value: String,
        expected: &'static str,
    },
    #[error("Field '{name}' value \"{value}\" does not fit in {expected}")]
    Overflow {
        name: String,
        value: String,
        expected: &'static str,
    },
}

impl FieldAccessError {
    /// True when the value parsed but was out of range for the requested type.
    ///
    /// Some backends report lossy values (for instance addresses wider than the
    /// requested integer); callers may choose to default only this case.
    #[must_use]
    pub const fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }

    /// Name of the field the error refers to.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Missing { name }
            | Self::WrongType { name, .. }
            | Self::Invalid { name, .. }
            | Self::Overflow { name, .. } => name,
        }
    }
}
