use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The sub-kind of a [`NotFound`](Error::NotFound) error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Player,
    Lobby,
    Server,
    Record,
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NotFoundKind::Player => "player",
            NotFoundKind::Lobby => "lobby",
            NotFoundKind::Server => "server",
            NotFoundKind::Record => "record",
        };
        f.write_str(name)
    }
}

/// Errors produced by the FESL/Theater client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("invalid parameter: {0}")]
    Parameter(String),

    #[error("{0} not found")]
    NotFound(NotFoundKind),

    #[error("search returned no or too many results")]
    Search,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Connection(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
