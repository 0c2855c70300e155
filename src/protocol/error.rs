//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid stamped frame: {0}")]
    InvalidStampedFrame(&'static str),

    #[error("Empty audio frame")]
    EmptyFrame,

    #[error("Invalid command type: {0}")]
    InvalidCommandType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
