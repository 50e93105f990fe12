//! Typed event channels for external subscribers.
//!
//! The pool surfaces decoded packets and peer lifecycle changes as plain
//! enums over `flume` channels. Subscribers clone a receiver; the pool never
//! blocks on a slow subscriber.

use std::net::SocketAddr;

use flume as chan;
use uuid::Uuid;

use dexd_types::{NodeState, Order, OrderPortion, PubKey, SanitySwapInit, SwapAccepted, SwapFailed, SwapRequest};

use crate::fsm::peermgr::PeerInfo;

/// A packet forwarded verbatim to external subscribers. `id` is the wire
/// packet id; responses to request packets echo it as their `req_id`.
#[derive(Debug, Clone)]
pub enum PacketEvent {
    Order {
        from: PubKey,
        order: Order,
    },
    OrderInvalidation {
        from: PubKey,
        portion: OrderPortion,
    },
    GetOrders {
        from: PubKey,
        id: Uuid,
    },
    Orders {
        from: PubKey,
        orders: Vec<Order>,
        req_id: Option<Uuid>,
    },
    SanitySwapInit {
        from: PubKey,
        body: SanitySwapInit,
        id: Uuid,
    },
    SwapRequest {
        from: PubKey,
        body: SwapRequest,
        id: Uuid,
    },
    SwapAccepted {
        from: PubKey,
        body: SwapAccepted,
        id: Uuid,
    },
    SwapFailed {
        from: PubKey,
        body: SwapFailed,
        id: Uuid,
    },
}

/// A peer lifecycle event.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A peer completed its handshake and was admitted into the pool.
    Active(PeerInfo),
    /// A peer session ended.
    Close {
        pub_key: Option<PubKey>,
        addr: SocketAddr,
    },
    /// A peer's advertised pairs should be (re-)verified by the swap engine.
    VerifyPairs { pub_key: PubKey, pairs: Vec<String> },
    /// A peer stopped advertising a pair.
    PairDropped { pub_key: PubKey, pair_id: String },
    /// A peer pushed a new node state.
    NodeStateUpdate { pub_key: PubKey, state: NodeState },
}

/// A change to the durable node catalog.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Banned(PubKey),
    Unbanned(PubKey),
}

/// The pool's event publisher plus subscription surface.
#[derive(Debug, Clone)]
pub struct Events {
    packets: (chan::Sender<PacketEvent>, chan::Receiver<PacketEvent>),
    peers: (chan::Sender<PeerEvent>, chan::Receiver<PeerEvent>),
    nodes: (chan::Sender<NodeEvent>, chan::Receiver<NodeEvent>),
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    pub fn new() -> Self {
        Self {
            packets: chan::unbounded(),
            peers: chan::unbounded(),
            nodes: chan::unbounded(),
        }
    }

    pub(crate) fn packet(&self, event: PacketEvent) {
        self.packets.0.send(event).ok();
    }

    pub(crate) fn peer(&self, event: PeerEvent) {
        self.peers.0.send(event).ok();
    }

    pub(crate) fn node(&self, event: NodeEvent) {
        self.nodes.0.send(event).ok();
    }

    /// Subscribe to forwarded packets.
    pub fn subscribe_packets(&self) -> chan::Receiver<PacketEvent> {
        self.packets.1.clone()
    }

    /// Subscribe to peer lifecycle events.
    pub fn subscribe_peers(&self) -> chan::Receiver<PeerEvent> {
        self.peers.1.clone()
    }

    /// Subscribe to node catalog events.
    pub fn subscribe_nodes(&self) -> chan::Receiver<NodeEvent> {
        self.nodes.1.clone()
    }
}
