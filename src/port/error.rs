//! Port error types

use thiserror::Error;

use crate::audio::AudioError;
use crate::protocol::ProtocolError;

/// Errors that can occur at the port boundary
#[derive(Error, Debug)]
pub enum PortError {
    /// The port or its transport has been closed
    #[error("Port closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
