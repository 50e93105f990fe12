//! Reactor errors.
//!
//! Only conditions that take the whole event loop down live here. A failure
//! on an individual peer socket is not one of them: the reactor disconnects
//! that peer and keeps polling.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// A fatal reactor error.
#[derive(Error, Debug)]
pub enum Error {
    /// The listening socket could not be set up.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        source: io::Error,
    },

    /// Polling the registered sources failed.
    #[error("socket poll failed: {0}")]
    Poll(#[source] io::Error),
}
