//! Client service. Wraps the pool state machine and handles framing of
//! packets on their way in and out.
use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::net;

use async_trait::async_trait;
use tracing::{debug, error};

use dexd_types::{DisconnectionReason, NodeState};

use crate::client::framer::Framer;
use crate::common::identity::NodeKey;
use crate::common::node::Store;
use crate::common::time::DrivenClock;
use crate::events::Events;
use crate::fsm;
use crate::fsm::handler::Pool;
use crate::net::{Disconnect, Io, Link, LocalTime, Machine};

/// Bridges raw socket bytes and the pool state machine.
pub struct Service<S, C> {
    inboxes: HashMap<net::SocketAddr, Framer>,
    machine: Pool<S, C>,
}

impl<S: Store, C: DrivenClock> Service<S, C> {
    pub fn new(
        config: fsm::handler::Config,
        key: NodeKey,
        node_state: NodeState,
        store: S,
        rng: fastrand::Rng,
        events: Events,
        clock: C,
    ) -> Self {
        Self {
            inboxes: HashMap::new(),
            machine: Pool::new(config, key, node_state, store, rng, events, clock),
        }
    }
}

#[async_trait]
impl<S, C> Machine for Service<S, C>
where
    S: Store + Send,
    C: DrivenClock + Send + Sync,
{
    type Event = fsm::event::Event;
    type DisconnectReason = DisconnectionReason;

    async fn initialize(&mut self, time: LocalTime, local_addr: Option<net::SocketAddr>) {
        self.machine.initialize(time, local_addr);
    }

    async fn message_received(&mut self, addr: &net::SocketAddr, bytes: Cow<'_, [u8]>) {
        let Some(inbox) = self.inboxes.get_mut(addr) else {
            debug!(target: "p2p", "Received bytes from unknown peer {}", addr);
            return;
        };
        inbox.input(bytes.borrow());

        loop {
            match inbox.decode_next() {
                Ok(Some(packet)) => self.machine.packet_received(*addr, packet),
                Ok(None) => break,
                Err(err) => {
                    error!(target: "p2p", "{}: Invalid frame received: {}", addr, err);
                    self.machine.wire_protocol_error(*addr);
                    return;
                }
            }
        }
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.machine.peer_attempted(addr);
    }

    fn connected(
        &mut self,
        addr: net::SocketAddr,
        local_addr: &net::SocketAddr,
        link: Link,
    ) -> bool {
        if !self.machine.peer_connected(addr, *local_addr, link) {
            return false;
        }
        self.inboxes.insert(addr, Framer::new(1024));
        true
    }

    async fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: Disconnect<Self::DisconnectReason>,
    ) {
        self.inboxes.remove(addr);
        self.machine.peer_disconnected(addr, reason);
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.machine.tick(local_time);
    }

    async fn timer_expired(&mut self) {
        self.machine.timer_expired();
    }

    async fn shutdown(&mut self) {
        self.machine.shutdown();
    }
}

#[async_trait]
impl<S, C> crate::net::Service for Service<S, C>
where
    S: Store + Send,
    C: DrivenClock + Send + Sync,
{
    type Command = fsm::handler::Command;

    async fn command_received(&mut self, cmd: Self::Command) {
        self.machine.command(cmd);
    }
}

impl<S, C> Iterator for Service<S, C> {
    type Item = Io<Vec<u8>, fsm::event::Event, DisconnectionReason>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.machine.next() {
            Some(Io::Write(addr, packet)) => Some(Io::Write(addr, Framer::frame(&packet))),
            Some(Io::Event(e)) => Some(Io::Event(e)),
            Some(Io::Connect(a)) => Some(Io::Connect(a)),
            Some(Io::Disconnect(a, r)) => Some(Io::Disconnect(a, r)),
            Some(Io::SetTimer(d)) => Some(Io::SetTimer(d)),

            None => None,
        }
    }
}
