//! State machine events.
use std::net;

use crate::fsm::{nodelist::Event as NodeEvent, peermgr::Event as PeerEvent, pingmgr::Event as PingEvent};
use crate::net::LocalTime;

/// A peer-to-peer event, surfaced to the reactor for tracing.
#[derive(Debug, Clone)]
pub enum Event {
    /// The pool is initializing its state machine and about to start
    /// network activity.
    Initializing,
    /// The pool is initialized and ready to receive commands.
    Ready {
        /// Local time.
        time: LocalTime,
        /// The resolved listen address, if listening.
        local_addr: Option<net::SocketAddr>,
    },
    /// A peer manager event.
    Peer(PeerEvent),
    /// A node catalog event.
    Node(NodeEvent),
    /// A heartbeat manager event.
    Ping(PingEvent),
}

impl From<PeerEvent> for Event {
    fn from(e: PeerEvent) -> Self {
        Self::Peer(e)
    }
}

impl From<NodeEvent> for Event {
    fn from(e: NodeEvent) -> Self {
        Self::Node(e)
    }
}

impl From<PingEvent> for Event {
    fn from(e: PingEvent) -> Self {
        Self::Ping(e)
    }
}
