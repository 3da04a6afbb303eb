//! Description parsing errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while turning description text into a [`VmDescription`].
///
/// [`VmDescription`]: crate::VmDescription
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The text is not well-formed JSON.
    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        /// 1-based line of the error.
        line: usize,
        /// 1-based column of the error.
        column: usize,
        /// Decoder message.
        message: String,
    },

    /// Well-formed JSON that is not a valid description.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The description file could not be read.
    #[error("description read failed: {}: {reason}", path.display())]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        reason: String,
    },
}

impl ParseError {
    /// Field path of a configuration error, if this is one.
    pub fn field_path(&self) -> Option<&str> {
        match self {
            ParseError::Config(e) => Some(&e.path),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        ParseError::Syntax {
            line: e.line(),
            column: e.column(),
            message: e.to_string(),
        }
    }
}

/// A semantically invalid description field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: {kind}")]
pub struct ConfigError {
    /// Offending field, e.g. `os.kernel_path` or `device[2].driver`.
    pub path: String,
    /// What is wrong with it.
    pub kind: ConfigErrorKind,
}

impl ConfigError {
    pub(crate) fn new(path: impl Into<String>, kind: ConfigErrorKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Classification of a [`ConfigError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// A required field is absent or null.
    #[error("required field missing")]
    Missing,

    /// The field has the wrong JSON type.
    #[error("expected {0}")]
    WrongType(&'static str),

    /// The field is not part of the format.
    #[error("unknown field")]
    UnknownField,

    /// The `driver` tag names no known driver.
    #[error("unknown driver \"{0}\"")]
    UnknownDriver(String),

    /// The `type` tag names no known OS type.
    #[error("unknown os type \"{0}\"")]
    UnknownOsType(String),

    /// The value is out of range or contradicts another field.
    #[error("{0}")]
    Invalid(String),
}
