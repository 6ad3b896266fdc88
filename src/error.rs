//! Error type shared by every component of the nested client

use thiserror::Error;
use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The transport to the host display could not be opened or was lost.
    #[error("host connection error: {0}")]
    Connection(String),

    /// The host lacks something the operation cannot run without.
    #[error("host capability missing: {0}")]
    Capability(String),

    /// A local allocation (image layout, segment, heap block) failed.
    #[error("resource allocation failed: {0}")]
    Resource(String),

    /// The host answered a specific request with an error.
    #[error("host protocol error: {0}")]
    Protocol(String),
}

impl From<ConnectError> for Error {
    fn from(err: ConnectError) -> Self {
        Error::Connection(err.to_string())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err.to_string())
    }
}

impl From<ReplyError> for Error {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::ConnectionError(err) => err.into(),
            ReplyError::X11Error(err) => Error::Protocol(format!("{:?}", err.error_kind)),
        }
    }
}

impl From<ReplyOrIdError> for Error {
    fn from(err: ReplyOrIdError) -> Self {
        match err {
            ReplyOrIdError::IdsExhausted => Error::Resource("host resource ids exhausted".into()),
            ReplyOrIdError::ConnectionError(err) => err.into(),
            ReplyOrIdError::X11Error(err) => Error::Protocol(format!("{:?}", err.error_kind)),
        }
    }
}
