//! Pool errors returned to callers.

use thiserror::Error;

/// An error from a caller-initiated pool operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("attempted connection to self")]
    AttemptedConnectionToSelf,
    #[error("pool is closed")]
    PoolClosed,
    #[error("node address is a tor address and no tor transport is available")]
    NodeTorAddress,
    #[error("node is banned")]
    NodeIsBanned,
    #[error("node is already connected")]
    NodeAlreadyConnected,
    #[error("node is already banned")]
    NodeAlreadyBanned,
    #[error("node is not banned")]
    NodeNotBanned,
    #[error("a connection attempt to this node is already in progress")]
    AlreadyConnecting,
    #[error("not connected")]
    NotConnected,
    #[error("node not found")]
    NodeNotFound,
    #[error("malformed version `{0}`")]
    MalformedVersion(String),
    #[error("version {actual} is below the minimum compatible version {min}")]
    IncompatibleVersion { actual: String, min: String },
    #[error("connection retries exceeded the maximum retry period")]
    ConnectionRetriesMaxPeriodExceeded,
}

impl Error {
    /// The stable identifier for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AttemptedConnectionToSelf => "ATTEMPTED_CONNECTION_TO_SELF",
            Self::PoolClosed => "POOL_CLOSED",
            Self::NodeTorAddress => "NODE_TOR_ADDRESS",
            Self::NodeIsBanned => "NODE_IS_BANNED",
            Self::NodeAlreadyConnected => "NODE_ALREADY_CONNECTED",
            Self::NodeAlreadyBanned => "NODE_ALREADY_BANNED",
            Self::NodeNotBanned => "NODE_NOT_BANNED",
            Self::AlreadyConnecting => "ALREADY_CONNECTING",
            Self::NotConnected => "NOT_CONNECTED",
            Self::NodeNotFound => "NODE_NOT_FOUND",
            Self::MalformedVersion(_) => "MALFORMED_VERSION",
            Self::IncompatibleVersion { .. } => "INCOMPATIBLE_VERSION",
            Self::ConnectionRetriesMaxPeriodExceeded => "CONNECTION_RETRIES_MAX_PERIOD_EXCEEDED",
        }
    }
}
