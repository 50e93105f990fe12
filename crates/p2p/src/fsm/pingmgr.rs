//! Heartbeat and stall detection.
//!
//! Once a session is open, each side pings every [`PING_INTERVAL`] unless
//! some other frame went out in the meantime. A peer that sends nothing at
//! all for [`STALL_INTERVAL`] is reported stalled and closed by the pool.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

use crate::common::time::Clock;
use crate::fsm::output::{SetTimer, Wire};
use crate::net::LocalTime;

/// Interval between pings on an otherwise quiet session.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Time without any inbound frame after which a peer counts as stalled.
pub const STALL_INTERVAL: Duration = Duration::from_secs(30);

/// An event emitted by the heartbeat manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A ping was sent to a peer.
    Ping(SocketAddr),
    /// A matching pong came back.
    Pong(SocketAddr),
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Ping(addr) => write!(f, "Sent ping to {}", addr),
            Event::Pong(addr) => write!(f, "Received pong from {}", addr),
        }
    }
}

#[derive(Debug)]
struct Heartbeat {
    /// Last time any frame arrived from the peer.
    last_recv: LocalTime,
    /// Last time any frame was sent to the peer.
    last_send: LocalTime,
    /// Outstanding ping, if any.
    outstanding: Option<Uuid>,
}

/// Tracks per-peer traffic liveness.
#[derive(Debug)]
pub struct PingManager<U, C> {
    peers: HashMap<SocketAddr, Heartbeat>,
    upstream: U,
    clock: C,
}

impl<U: Wire<Event> + SetTimer, C: Clock> PingManager<U, C> {
    pub fn new(upstream: U, clock: C) -> Self {
        Self {
            peers: HashMap::new(),
            upstream,
            clock,
        }
    }

    /// Called when a peer session opens.
    pub fn peer_negotiated(&mut self, addr: SocketAddr) {
        let now = self.clock.local_time();

        self.peers.insert(
            addr,
            Heartbeat {
                last_recv: now,
                last_send: now,
                outstanding: None,
            },
        );
        self.upstream.set_timer(PING_INTERVAL);
    }

    /// Called when a peer session ends.
    pub fn peer_disconnected(&mut self, addr: &SocketAddr) {
        self.peers.remove(addr);
    }

    /// Any frame arrived from the peer; its stall clock resets.
    pub fn message_received(&mut self, addr: &SocketAddr) {
        if let Some(hb) = self.peers.get_mut(addr) {
            hb.last_recv = self.clock.local_time();
        }
    }

    /// Any frame was sent to the peer; the next ping is deferred.
    pub fn message_sent(&mut self, addr: &SocketAddr) {
        if let Some(hb) = self.peers.get_mut(addr) {
            hb.last_send = self.clock.local_time();
        }
    }

    /// Answer a ping in kind.
    pub fn received_ping(&mut self, addr: SocketAddr, id: Uuid) {
        if self.peers.contains_key(&addr) {
            self.upstream.pong(addr, id);
            self.message_sent(&addr);
        }
    }

    /// Correlate a pong with its ping.
    pub fn received_pong(&mut self, addr: SocketAddr, req_id: Option<Uuid>) {
        if let Some(hb) = self.peers.get_mut(&addr) {
            if hb.outstanding.is_some() && hb.outstanding == req_id {
                hb.outstanding = None;
                self.upstream.event(Event::Pong(addr));
            }
        }
    }

    /// Send due pings and report peers whose inbound side went quiet for
    /// longer than [`STALL_INTERVAL`].
    pub fn received_wake(&mut self) -> Vec<SocketAddr> {
        let now = self.clock.local_time();
        let mut stalled = Vec::new();

        for (addr, hb) in self.peers.iter_mut() {
            if now - hb.last_recv >= STALL_INTERVAL {
                stalled.push(*addr);
                continue;
            }
            if now - hb.last_send >= PING_INTERVAL {
                let id = self.upstream.ping(*addr);
                hb.outstanding = Some(id);
                hb.last_send = now;
                self.upstream.event(Event::Ping(*addr));
            }
        }
        if !self.peers.is_empty() {
            self.upstream.set_timer(PING_INTERVAL);
        }

        stalled
    }

    #[cfg(test)]
    pub(crate) fn is_tracked(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time::RefClock;
    use crate::fsm::output::{Io, Outbox};
    use dexd_types::PacketType;

    fn addr() -> SocketAddr {
        "127.0.0.1:9735".parse().unwrap()
    }

    fn setup() -> (PingManager<Outbox, RefClock<LocalTime>>, Outbox, RefClock<LocalTime>) {
        let clock = RefClock::from(LocalTime::from_secs(100_000));
        let outbox = Outbox::default();
        let mgr = PingManager::new(outbox.clone(), clock.clone());

        (mgr, outbox, clock)
    }

    fn elapse(clock: &RefClock<LocalTime>, duration: Duration) {
        clock.lock().unwrap().elapse(duration);
    }

    fn sent_types(outbox: &mut Outbox) -> Vec<PacketType> {
        let mut types = Vec::new();
        while let Some(io) = outbox.next() {
            if let Io::Write(_, packet) = io {
                types.push(packet.packet_type());
            }
        }
        types
    }

    #[test]
    fn pings_quiet_peers() {
        let (mut mgr, mut outbox, clock) = setup();
        mgr.peer_negotiated(addr());

        // Inbound traffic keeps flowing; outbound has been quiet.
        elapse(&clock, Duration::from_secs(30));
        mgr.message_received(&addr());

        let stalled = mgr.received_wake();
        assert!(stalled.is_empty());
        assert_eq!(sent_types(&mut outbox), vec![PacketType::Ping]);
    }

    #[test]
    fn other_traffic_defers_ping() {
        let (mut mgr, mut outbox, clock) = setup();
        mgr.peer_negotiated(addr());

        elapse(&clock, Duration::from_secs(29));
        mgr.message_sent(&addr());
        mgr.message_received(&addr());
        elapse(&clock, Duration::from_secs(1));

        let stalled = mgr.received_wake();
        assert!(stalled.is_empty());
        assert!(sent_types(&mut outbox).is_empty());
    }

    #[test]
    fn quiet_inbound_side_stalls() {
        let (mut mgr, _outbox, clock) = setup();
        mgr.peer_negotiated(addr());

        elapse(&clock, Duration::from_secs(30));

        assert_eq!(mgr.received_wake(), vec![addr()]);
    }

    #[test]
    fn pong_correlates_by_req_id() {
        let (mut mgr, mut outbox, clock) = setup();
        mgr.peer_negotiated(addr());
        elapse(&clock, Duration::from_secs(30));
        mgr.message_received(&addr());
        mgr.received_wake();

        let ping_id = {
            let mut id = None;
            while let Some(io) = outbox.next() {
                if let Io::Write(_, packet) = io {
                    if packet.packet_type() == PacketType::Ping {
                        id = Some(packet.header.id);
                    }
                }
            }
            id.unwrap()
        };

        // A pong with the wrong id leaves the ping outstanding.
        mgr.received_pong(addr(), Some(Uuid::new_v4()));
        assert!(mgr.peers[&addr()].outstanding.is_some());

        mgr.received_pong(addr(), Some(ping_id));
        assert!(mgr.peers[&addr()].outstanding.is_none());
    }

    #[test]
    fn ping_answered_with_pong() {
        let (mut mgr, mut outbox, _clock) = setup();
        mgr.peer_negotiated(addr());

        let id = Uuid::new_v4();
        mgr.received_ping(addr(), id);

        let mut found = false;
        while let Some(io) = outbox.next() {
            if let Io::Write(_, packet) = io {
                if packet.packet_type() == PacketType::Pong {
                    assert_eq!(packet.header.req_id, Some(id));
                    found = true;
                }
            }
        }
        assert!(found);
    }
}
