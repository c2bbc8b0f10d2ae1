//! Link and codec errors

use thiserror::Error;

/// Errors that can occur while operating the display link
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Not connected to display")]
    NotConnected,

    #[error("No serial port found for the display")]
    NoPortFound,

    #[error("Link worker already running")]
    AlreadyRunning,

    #[error("Link worker is still shutting down")]
    Stopping,

    #[error("Link worker was lost")]
    WorkerLost,

    #[error("Peer closed the channel")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised while decoding an inbound line
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Expected {expected} fields after '{prefix}', got {actual}")]
    FieldCount {
        prefix: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid number '{value}' in '{prefix}' payload")]
    InvalidNumber { prefix: &'static str, value: String },

    #[error("Sensor index {0} out of range")]
    WheelOutOfRange(usize),

    #[error("Malformed key=value pair '{0}'")]
    MalformedPair(String),

    #[error("'{0}' contains a reserved character")]
    InvalidToken(String),
}
