//! Protocol output capabilities.
//!
//! See [`Outbox`] type.
//!
//! Each manager, eg. the handshake or heartbeat manager, is given a copy of
//! this outbox with specific capabilities, eg. peer disconnection, packet
//! sending etc. to communicate with the network.
use std::collections::VecDeque;
use std::net;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use dexd_types::{
    DisconnectionReason, Hello, NodeEntry, NodeState, Packet, PacketBody,
};

use crate::fsm::event::Event;

/// Output of a state transition of the pool state machine.
pub type Io = crate::net::Io<Packet, Event, DisconnectionReason>;

impl From<Event> for Io {
    fn from(event: Event) -> Self {
        Io::Event(event)
    }
}

/// Ability to connect to peers.
pub trait Connect {
    /// Connect to peer.
    fn connect(&self, addr: net::SocketAddr, timeout: Duration);
}

/// Ability to disconnect from peers.
pub trait Disconnect {
    /// Disconnect from peer.
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectionReason);
}

/// The ability to set a timer.
pub trait SetTimer {
    /// Ask to be woken up in a predefined amount of time.
    fn set_timer(&self, duration: Duration) -> &Self;
}

/// The overlay wire protocol.
pub trait Wire<E> {
    /// Emit an event.
    fn event(&self, event: E);

    // Handshake packets ///////////////////////////////////////////////////

    /// Send a `Hello` packet.
    fn hello(&mut self, addr: net::SocketAddr, hello: Hello) -> Uuid;

    /// Acknowledge a received `Hello`.
    fn session_ack(&mut self, addr: net::SocketAddr, req_id: Uuid);

    /// Announce the reason before a disconnect.
    fn disconnecting(
        &mut self,
        addr: net::SocketAddr,
        reason: DisconnectionReason,
        payload: Option<String>,
    );

    // Heartbeat ///////////////////////////////////////////////////////////

    /// Send a `Ping` packet. Returns its id for pong correlation.
    fn ping(&mut self, addr: net::SocketAddr) -> Uuid;

    /// Send a `Pong` packet answering the ping with the given id.
    fn pong(&mut self, addr: net::SocketAddr, req_id: Uuid);

    // Gossip //////////////////////////////////////////////////////////////

    /// Ask a peer for its known nodes. Returns the request id.
    fn get_nodes(&mut self, addr: net::SocketAddr) -> Uuid;

    /// Answer a `GetNodes` request.
    fn nodes(&mut self, addr: net::SocketAddr, entries: Vec<NodeEntry>, req_id: Uuid);

    /// Ask a peer for its orders. Returns the request id.
    fn get_orders(&mut self, addr: net::SocketAddr) -> Uuid;

    /// Push our updated node state to a peer.
    fn node_state_update(&mut self, addr: net::SocketAddr, state: NodeState);

    // Application payloads ////////////////////////////////////////////////

    /// Send an arbitrary packet, eg. an order broadcast or a swap message.
    fn packet(&mut self, addr: net::SocketAddr, packet: Packet);
}

/// Holds protocol outputs and pending I/O.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    /// Output queue.
    outbound: Arc<Mutex<VecDeque<Io>>>,
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound.lock().unwrap().pop_front()
    }
}

impl Outbox {
    /// Push an output to the channel.
    pub fn push(&self, output: Io) {
        self.outbound.lock().unwrap().push_back(output);
    }

    /// Push a packet to the channel.
    pub fn message(&mut self, addr: net::SocketAddr, packet: Packet) -> Uuid {
        debug!(target: "p2p", "Sending {:?} to {}", packet.packet_type(), addr);

        let id = packet.header.id;
        self.push(Io::Write(addr, packet));
        id
    }

    /// Push an event to the channel.
    pub fn event(&self, event: Event) {
        self.push(Io::Event(event));
    }
}

impl Disconnect for Outbox {
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectionReason) {
        debug!(target: "p2p", "Disconnecting from {}: {}", addr, reason);

        self.push(Io::Disconnect(addr, reason));
    }
}

impl SetTimer for Outbox {
    fn set_timer(&self, duration: Duration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}

impl Connect for Outbox {
    fn connect(&self, addr: net::SocketAddr, timeout: Duration) {
        self.push(Io::Connect(addr));
        self.push(Io::SetTimer(timeout));
    }
}

impl<E: Into<Event> + std::fmt::Display> Wire<E> for Outbox {
    fn event(&self, event: E) {
        debug!(target: "p2p", "{}", &event);
        Outbox::event(self, event.into());
    }

    fn hello(&mut self, addr: net::SocketAddr, hello: Hello) -> Uuid {
        self.message(addr, Packet::new(PacketBody::Hello(hello)))
    }

    fn session_ack(&mut self, addr: net::SocketAddr, req_id: Uuid) {
        self.message(addr, Packet::response(PacketBody::SessionAck, req_id));
    }

    fn disconnecting(
        &mut self,
        addr: net::SocketAddr,
        reason: DisconnectionReason,
        payload: Option<String>,
    ) {
        self.message(
            addr,
            Packet::new(PacketBody::Disconnecting(dexd_types::messages::p2p::Disconnecting {
                reason,
                payload,
            })),
        );
    }

    fn ping(&mut self, addr: net::SocketAddr) -> Uuid {
        self.message(addr, Packet::new(PacketBody::Ping))
    }

    fn pong(&mut self, addr: net::SocketAddr, req_id: Uuid) {
        self.message(addr, Packet::response(PacketBody::Pong, req_id));
    }

    fn get_nodes(&mut self, addr: net::SocketAddr) -> Uuid {
        self.message(addr, Packet::new(PacketBody::GetNodes))
    }

    fn nodes(&mut self, addr: net::SocketAddr, entries: Vec<NodeEntry>, req_id: Uuid) {
        self.message(addr, Packet::response(PacketBody::Nodes(entries), req_id));
    }

    fn get_orders(&mut self, addr: net::SocketAddr) -> Uuid {
        self.message(addr, Packet::new(PacketBody::GetOrders))
    }

    fn node_state_update(&mut self, addr: net::SocketAddr, state: NodeState) {
        self.message(addr, Packet::new(PacketBody::NodeStateUpdate(state)));
    }

    fn packet(&mut self, addr: net::SocketAddr, packet: Packet) {
        self.message(addr, packet);
    }
}
