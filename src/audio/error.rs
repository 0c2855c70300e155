//! Audio transport error types

use thiserror::Error;

/// Errors that can occur in the audio buffering and mixing subsystem
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// The packet is older than data already emitted; the caller skips it
    #[error("Packet stamp older than emitted tail")]
    DisorderedPacket,

    /// The pipe, buffer, or mixer has been closed
    #[error("Closed pipe")]
    Closed,

    #[error("Invalid stamped frame: {0}")]
    InvalidStampedFrame(String),

    #[error("Codec error: {0}")]
    Codec(String),
}
