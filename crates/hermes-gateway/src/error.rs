/*!
 * Error types for the Hermes gateway crate.
 */
use serde_json::Value;
use thiserror::Error;

use hermes_devices::protocol::{error_response, CodecError, ErrorCode};
use hermes_devices::{DirectoryError, RelayError};

/// A failure reported to the requesting client as an ERROR response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct CommandError {
    /// Client-facing error code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
}

impl CommandError {
    /// Create an error with a custom message
    pub fn new<S: AsRef<str>>(code: ErrorCode, message: S) -> Self {
        Self {
            code,
            message: message.as_ref().to_string(),
        }
    }

    /// Create an error carrying the standard message of its code
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.message())
    }

    /// Render the ERROR response envelope
    pub fn to_response(&self) -> Value {
        error_response(self.code, &self.message)
    }
}

impl From<ErrorCode> for CommandError {
    fn from(code: ErrorCode) -> Self {
        CommandError::from_code(code)
    }
}

impl From<RelayError> for CommandError {
    fn from(err: RelayError) -> Self {
        CommandError::from_code(err.error_code())
    }
}

impl From<CodecError> for CommandError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnframeableType(_) | CodecError::ValueMismatch { .. } => {
                CommandError::from_code(ErrorCode::InvalidDataType)
            }
            _ => CommandError::from_code(ErrorCode::InvalidResponseJson),
        }
    }
}

/// Error type for Hermes gateway operations
#[derive(Error, Debug)]
pub enum Error {
    /// A client-facing command failure
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Relay error
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Directory error
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] hermes_core::error::Error),

    /// Stream bridge error
    #[error("Stream error: {0}")]
    Stream(String),

    /// The task was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for Hermes gateway operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new stream error
    pub fn stream<S: AsRef<str>>(msg: S) -> Self {
        Error::Stream(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }

    /// Whether the error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Stream(err.to_string())
    }
}
