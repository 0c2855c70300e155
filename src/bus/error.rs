//! Bus error types

use thiserror::Error;

/// Errors that can occur in the pub/sub bus subsystem
#[derive(Error, Debug)]
pub enum BusError {
    /// The bus or listener has been closed
    #[error("Bus closed")]
    Closed,

    /// Invalid configuration; fatal at startup
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),
}
