//! Client error module.
use std::io;

use thiserror::Error;

/// A client error. Errors of this kind during startup are fatal.
#[derive(Error, Debug)]
pub enum Error {
    /// An error coming from the networking sub-system.
    #[error(transparent)]
    Net(#[from] crate::net::error::Error),
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// An invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
    /// A configured address could not be resolved.
    #[error("failed to resolve address `{0}`: {1}")]
    Resolve(String, String),
    /// A communication channel error.
    #[error("command channel disconnected")]
    Channel,
}
