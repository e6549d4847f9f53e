//! Error types for the daemon channel ([`SocketError`]) and the command
//! handlers ([`HandlerError`]).

use thiserror::Error;

use crate::store::CancelError;

/// Framing or transport failures on the daemon's TCP channel.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Connection refused")]
    Refused,

    #[error("Connection timed out")]
    ConnectTimeout,

    #[error("Sending timed out")]
    SendTimeout,

    #[error("Receiving timed out")]
    ReceiveTimeout,

    #[error("Frame is not valid UTF-8")]
    Encoding,

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command frame the handler could not process. Every variant's message
/// is sent back to the client verbatim in an error response.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid JSON message: {0}")]
    InvalidJson(String),

    #[error("Invalid request, no command and / or data passed")]
    InvalidEnvelope,

    #[error("Invalid command {0}")]
    InvalidCommand(String),

    #[error("Invalid transfer parameters")]
    InvalidParameters,

    #[error("Failed to add the transfer")]
    AddFailed,

    #[error(transparent)]
    Cancel(#[from] CancelError),
}
