//! Error types for the 7k client

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A command name that isn't in the command table
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// The command exists but the supplied values don't fit its parameters
    #[error("invalid parameters for {command}: {reason}")]
    InvalidParameters {
        command: &'static str,
        reason: String,
    },
    /// Socket level failure (refused connection, failed send, bind error)
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    /// A TCP operation was attempted without a live connection
    #[error("no TCP connection to the device")]
    NotConnected,
    /// The device closed the TCP connection, the session must be reopened
    #[error("connection closed by the device")]
    ConnectionClosed,
    /// Bytes handed to an explicit decode call did not hold a valid record
    #[error("malformed record: {0}")]
    Malformed(String),
    /// A receive loop thread panicked before it could be joined
    #[error("{0} receive loop panicked")]
    LoopPanicked(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
