//! # Error Definitions
//!
//! Every way an inbound buffer can fail to be a message.

/// Protocol violations found while encoding or decoding a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The buffer was not valid JSON, or a value could not be serialized.
    Json(String),
    /// The top level value was not a sequence.
    NotASequence { found: &'static str },
    /// The sequence did not have exactly five elements.
    WrongArity(usize),
    /// The kind tag was not one of dispatch, resolve, or reject.
    UnknownKind(String),
    /// A field held a value of the wrong shape for the message kind.
    InvalidField {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(msg) => write!(f, "malformed message: {}", msg),
            Self::NotASequence { found } => write!(f, "malformed message: expected a sequence, found {}", found),
            Self::WrongArity(len) => write!(f, "malformed message: expected 5 elements, found {}", len),
            Self::UnknownKind(kind) => write!(f, "malformed message: unknown kind {}", kind),
            Self::InvalidField { field, expected, found } => {
                write!(f, "malformed message: {} must be {}, found {}", field, expected, found)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
