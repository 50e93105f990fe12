//! The peer pool: the supervisory state machine tying the session, heartbeat
//! and catalog managers together, and the only module through which callers
//! talk to remote nodes.
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use flume as chan;
use semver::Version;
use tracing::{debug, trace, warn};

use dexd_types::{
    DisconnectionReason, NodeAddress, NodeEntry, NodeState, Order, OrderPortion, Packet,
    PacketBody, PubKey,
};

use crate::common::identity::NodeKey;
use crate::common::node::Store;
use crate::common::time::{Clock, DrivenClock};
use crate::error::Error;
use crate::events::{Events, NodeEvent, PacketEvent, PeerEvent};
use crate::fsm::event::Event;
use crate::fsm::nodelist::{NodeList, ReputationEvent};
use crate::fsm::output::{Outbox, SetTimer};
use crate::fsm::peermgr::{
    ConnectReply, Departure, HelloOutcome, PeerInfo, PeerManager,
};
use crate::fsm::pingmgr::PingManager;
use crate::fsm::{output, peermgr};
use crate::net::{Disconnect as NetDisconnect, Link, LocalTime};

/// The version this pool presents in its `Hello`.
pub const POOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Granularity of the periodic sweeps.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The version we present to peers.
    pub version: String,
    /// Reject peers below this version.
    pub min_compatible_version: Version,
    /// Ask admitted peers for their known nodes.
    pub discover: bool,
    /// Re-ask every this many minutes; 0 disables periodic rediscovery.
    pub discover_minutes: u32,
    /// Refuse peers with a negative reputation score outright.
    pub strict_reputation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: POOL_VERSION.to_owned(),
            min_compatible_version: Version::new(0, 1, 0),
            discover: true,
            discover_minutes: 0,
            strict_reputation: false,
        }
    }
}

/// A command or request that can be sent to the pool.
pub enum Command {
    /// Open an outbound connection to a node.
    Connect {
        pub_key: PubKey,
        address: Option<NodeAddress>,
        retry: bool,
        /// Cancel any pending dial retries for this node first.
        revoke_pending: bool,
        reply: ConnectReply,
    },
    /// Cancel pending dial retries for a node.
    RevokeRetries { pub_key: PubKey },
    /// Close an open peer session.
    ClosePeer {
        pub_key: PubKey,
        reason: Option<DisconnectionReason>,
        reply: chan::Sender<Result<(), Error>>,
    },
    /// Ban a node and close its session.
    Ban {
        pub_key: PubKey,
        reply: chan::Sender<Result<(), Error>>,
    },
    /// Lift a node's ban, optionally reconnecting.
    Unban {
        pub_key: PubKey,
        reconnect: bool,
        reply: chan::Sender<Result<(), Error>>,
    },
    /// Ask a specific peer for its known nodes.
    DiscoverNodes {
        pub_key: PubKey,
        reply: chan::Sender<Result<(), Error>>,
    },
    /// Apply a reputation event to a node.
    Reputation {
        pub_key: PubKey,
        event: ReputationEvent,
        reply: chan::Sender<Result<(), Error>>,
    },
    /// Send a packet to one peer.
    SendToPeer {
        pub_key: PubKey,
        packet: Packet,
        reply: chan::Sender<Result<(), Error>>,
    },
    /// Send an order to every peer trading its pair.
    BroadcastOrder {
        order: Order,
        reply: chan::Sender<Vec<PubKey>>,
    },
    /// Invalidate a previously broadcast order.
    BroadcastOrderInvalidation {
        portion: OrderPortion,
        exclude: Option<PubKey>,
        reply: chan::Sender<Vec<PubKey>>,
    },
    /// Get one peer's info.
    GetPeer {
        pub_key: PubKey,
        reply: chan::Sender<Option<PeerInfo>>,
    },
    /// List open peers.
    ListPeers { reply: chan::Sender<Vec<PeerInfo>> },
    /// Replace the set of pairs we advertise.
    UpdatePairs { pairs: Vec<String> },
    /// Update one currency's auxiliary state in what we advertise.
    UpdateAuxState {
        currency: String,
        identifier: Option<String>,
        pub_key: Option<String>,
        uris: Option<Vec<String>>,
        token_identifier: Option<String>,
    },
    /// Resolve an alias to a node key.
    ResolveAlias {
        alias: String,
        reply: chan::Sender<Result<PubKey, Error>>,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { pub_key, retry, .. } => {
                write!(f, "Connect({}, retry={})", pub_key, retry)
            }
            Self::RevokeRetries { pub_key } => write!(f, "RevokeRetries({})", pub_key),
            Self::ClosePeer { pub_key, reason, .. } => {
                write!(f, "ClosePeer({}, {:?})", pub_key, reason)
            }
            Self::Ban { pub_key, .. } => write!(f, "Ban({})", pub_key),
            Self::Unban {
                pub_key, reconnect, ..
            } => write!(f, "Unban({}, reconnect={})", pub_key, reconnect),
            Self::DiscoverNodes { pub_key, .. } => write!(f, "DiscoverNodes({})", pub_key),
            Self::Reputation { pub_key, event, .. } => {
                write!(f, "Reputation({}, {})", pub_key, event)
            }
            Self::SendToPeer { pub_key, packet, .. } => {
                write!(f, "SendToPeer({}, {:?})", pub_key, packet.packet_type())
            }
            Self::BroadcastOrder { order, .. } => write!(f, "BroadcastOrder({})", order.pair_id),
            Self::BroadcastOrderInvalidation { portion, .. } => {
                write!(f, "BroadcastOrderInvalidation({})", portion.pair_id)
            }
            Self::GetPeer { pub_key, .. } => write!(f, "GetPeer({})", pub_key),
            Self::ListPeers { .. } => write!(f, "ListPeers"),
            Self::UpdatePairs { pairs } => write!(f, "UpdatePairs({:?})", pairs),
            Self::UpdateAuxState { currency, .. } => write!(f, "UpdateAuxState({})", currency),
            Self::ResolveAlias { alias, .. } => write!(f, "ResolveAlias({})", alias),
        }
    }
}

/// The peer pool.
pub struct Pool<S, C> {
    /// Session manager.
    pub peermgr: PeerManager<Outbox, C>,
    /// Heartbeat manager.
    pingmgr: PingManager<Outbox, C>,
    /// Durable node catalog.
    pub nodes: NodeList<S, Outbox>,
    config: Config,
    /// Outbound I/O. Used to communicate protocol events with the reactor.
    pub outbox: Outbox,
    clock: C,
    events: Events,
    /// Set once `init` completes; cleared by `shutdown`.
    connected: bool,
    disconnecting: bool,
    /// Last gossip request per open peer.
    discovery: HashMap<PubKey, LocalTime>,
}

impl<S: Store, C: DrivenClock> Pool<S, C> {
    pub fn new(
        config: Config,
        key: NodeKey,
        node_state: NodeState,
        store: S,
        rng: fastrand::Rng,
        events: Events,
        clock: C,
    ) -> Self {
        let outbox = Outbox::default();
        let peermgr = PeerManager::new(
            peermgr::Config {
                version: config.version.clone(),
                min_compatible_version: config.min_compatible_version.clone(),
                strict_reputation: config.strict_reputation,
            },
            key,
            node_state,
            rng,
            outbox.clone(),
            clock.clone(),
        );
        let pingmgr = PingManager::new(outbox.clone(), clock.clone());
        let nodes = NodeList::new(store, outbox.clone());

        Self {
            peermgr,
            pingmgr,
            nodes,
            config,
            outbox,
            clock,
            events,
            connected: false,
            disconnecting: false,
            discovery: HashMap::new(),
        }
    }

    /// Whether the pool accepts and initiates connections.
    pub fn is_connected(&self) -> bool {
        self.connected && !self.disconnecting
    }

    /// Initialize the pool. Called once, after the listener is bound.
    pub fn initialize(&mut self, time: LocalTime, local_addr: Option<SocketAddr>) {
        self.outbox.event(Event::Initializing);

        // A configured port of zero means the OS picked one for us; patch
        // the advertised addresses to match.
        if let Some(bound) = local_addr {
            let mut state = self.peermgr.node_state().clone();
            for address in state.addresses.iter_mut() {
                if address.port == 0 {
                    address.port = bound.port();
                }
            }
            self.peermgr.set_node_state(state);
        }

        let known = self.nodes.load();
        debug!(target: "p2p", "Loaded {} known node(s)", known);

        // Bulk reconnection to every known, unbanned node.
        let mut known_nodes = Vec::new();
        self.nodes.for_each(|node| {
            if !node.banned {
                known_nodes.push((node.pub_key, node.connect_order()));
            }
        });
        for (pub_key, addresses) in known_nodes {
            if addresses.is_empty() {
                continue;
            }
            if let Err(err) = self.peermgr.connect_node(pub_key, addresses, true, None) {
                trace!(target: "p2p", "Skipping reconnect to {}: {}", pub_key, err);
            }
        }

        // Fire-and-forget reachability probes for our own advertised
        // addresses.
        let advertised = self.peermgr.node_state().addresses.clone();
        for address in advertised {
            if let Some(addr) = address.socket_addr() {
                self.peermgr.probe(addr);
            }
        }

        self.connected = true;
        self.outbox.event(Event::Ready { time, local_addr });
        self.outbox.set_timer(IDLE_TIMEOUT);
    }

    /// A socket was established. Returning `false` refuses it.
    pub fn peer_connected(&mut self, addr: SocketAddr, local_addr: SocketAddr, link: Link) -> bool {
        if link.is_inbound() {
            if !self.is_connected() {
                debug!(target: "p2p", "{}: Refusing inbound connection, pool is not accepting", addr);
                return false;
            }
            if self.nodes.is_banned_host(&addr.ip().to_string()) {
                debug!(target: "p2p", "{}: Refusing inbound connection from banned host", addr);
                return false;
            }
        }
        self.peermgr.peer_connected(addr, local_addr, link);

        true
    }

    /// An outbound connection attempt is underway.
    pub fn peer_attempted(&mut self, addr: &SocketAddr) {
        self.peermgr.peer_attempted(addr);
    }

    /// A socket was closed.
    pub fn peer_disconnected(
        &mut self,
        addr: &SocketAddr,
        reason: NetDisconnect<DisconnectionReason>,
    ) {
        self.pingmgr.peer_disconnected(addr);

        match self.peermgr.peer_disconnected(addr, &reason) {
            Departure::Admitted {
                info,
                sent_reason,
                recv_reason,
                replacement,
            } => {
                debug!(
                    target: "p2p",
                    "{}: Peer {} disconnected: {}", addr, info.pub_key, reason
                );
                self.discovery.remove(&info.pub_key);
                self.events.peer(PeerEvent::Close {
                    pub_key: Some(info.pub_key),
                    addr: *addr,
                });

                if let Some(replacement) = replacement {
                    self.handle_opened_peer(replacement);
                } else if self.should_reconnect(&info, sent_reason, recv_reason) {
                    self.reconnect(info.pub_key);
                }
            }
            Departure::Pending { .. } => {
                trace!(target: "p2p", "{}: Connection attempt ended: {}", addr, reason);
            }
            Departure::Probe | Departure::Unknown => {}
        }
    }

    /// Whether a closed peer session warrants a reconnection attempt.
    /// Deliberate closes (bans, incompatibility, shutdown on our side) do
    /// not; stalls and duplicate-resolution losses do.
    fn should_reconnect(
        &self,
        info: &PeerInfo,
        sent_reason: Option<DisconnectionReason>,
        recv_reason: Option<DisconnectionReason>,
    ) -> bool {
        use DisconnectionReason::*;

        let sent_ok = matches!(sent_reason, None | Some(ResponseStalling));
        let recv_ok = matches!(
            recv_reason,
            None | Some(ResponseStalling | AlreadyConnected | Shutdown)
        );

        sent_ok && recv_ok && info.link.is_outbound() && self.is_connected()
    }

    fn reconnect(&mut self, pub_key: PubKey) {
        let addresses = match self.nodes.get(&pub_key) {
            Some(node) if !node.banned => node.connect_order(),
            _ => return,
        };
        if addresses.is_empty() {
            return;
        }
        if let Err(err) = self.peermgr.connect_node(pub_key, addresses, true, None) {
            trace!(target: "p2p", "Not reconnecting to {}: {}", pub_key, err);
        }
    }

    /// A decoded packet arrived from a peer.
    pub fn packet_received(&mut self, addr: SocketAddr, packet: Packet) {
        trace!(target: "p2p", "Received {:?} from {}", packet.packet_type(), addr);

        self.pingmgr.message_received(&addr);

        let Packet { header, body } = packet;
        match body {
            PacketBody::Hello(hello) => {
                let accepting = self.is_connected();
                let outcome =
                    self.peermgr
                        .received_hello(addr, header.id, hello, &self.nodes, accepting);
                match outcome {
                    HelloOutcome::Admitted(info) => self.handle_opened_peer(info),
                    HelloOutcome::Rejected {
                        pub_key: Some(pub_key),
                        invalid_auth: true,
                        ..
                    } => {
                        if self.nodes.has(&pub_key) {
                            self.apply_reputation(pub_key, ReputationEvent::InvalidAuth)
                                .ok();
                        }
                    }
                    _ => {}
                }
            }
            PacketBody::SessionAck => {
                if let Some(info) = self.peermgr.received_session_ack(addr) {
                    self.handle_opened_peer(info);
                }
            }
            PacketBody::Ping => self.pingmgr.received_ping(addr, header.id),
            PacketBody::Pong => self.pingmgr.received_pong(addr, header.req_id),
            PacketBody::Disconnecting(farewell) => {
                debug!(
                    target: "p2p",
                    "{}: Peer is disconnecting us: {}", addr, farewell.reason
                );
                self.peermgr.received_disconnecting(addr, farewell.reason);
            }
            PacketBody::GetNodes => self.handle_get_nodes(addr, header.id),
            PacketBody::Nodes(entries) => {
                if self.peermgr.pub_key_of(&addr).is_some() {
                    self.connect_nodes(entries);
                }
            }
            PacketBody::NodeStateUpdate(state) => {
                if let Some((pub_key, dropped, state)) = self.peermgr.update_node_state(addr, state)
                {
                    self.nodes
                        .update_addresses(&pub_key, state.addresses.clone(), None)
                        .ok();
                    self.events.peer(PeerEvent::NodeStateUpdate {
                        pub_key,
                        state: state.clone(),
                    });
                    for pair_id in dropped {
                        self.events.peer(PeerEvent::PairDropped { pub_key, pair_id });
                    }
                    self.events.peer(PeerEvent::VerifyPairs {
                        pub_key,
                        pairs: state.pairs,
                    });
                }
            }
            // Everything else is application traffic, forwarded to
            // subscribers without interpretation.
            body => {
                let Some(from) = self.peermgr.pub_key_of(&addr) else {
                    debug!(target: "p2p", "{}: Dropping {:?} from unknown peer", addr, body.packet_type());
                    return;
                };
                let event = match body {
                    PacketBody::Order(order) => PacketEvent::Order { from, order },
                    PacketBody::OrderInvalidation(portion) => {
                        PacketEvent::OrderInvalidation { from, portion }
                    }
                    PacketBody::GetOrders => PacketEvent::GetOrders {
                        from,
                        id: header.id,
                    },
                    PacketBody::Orders(orders) => PacketEvent::Orders {
                        from,
                        orders,
                        req_id: header.req_id,
                    },
                    PacketBody::SanitySwapInit(body) => PacketEvent::SanitySwapInit {
                        from,
                        body,
                        id: header.id,
                    },
                    PacketBody::SwapRequest(body) => PacketEvent::SwapRequest {
                        from,
                        body,
                        id: header.id,
                    },
                    PacketBody::SwapAccepted(body) => PacketEvent::SwapAccepted {
                        from,
                        body,
                        id: header.id,
                    },
                    PacketBody::SwapFailed(body) => PacketEvent::SwapFailed {
                        from,
                        body,
                        id: header.id,
                    },
                    _ => return,
                };
                self.events.packet(event);
            }
        }
    }

    /// Bookkeeping for a freshly admitted peer. The `peer.active` event is
    /// emitted only once this completes.
    fn handle_opened_peer(&mut self, info: PeerInfo) {
        let pub_key = info.pub_key;

        if self.nodes.has(&pub_key) {
            self.nodes
                .update_addresses(&pub_key, info.state.addresses.clone(), None)
                .ok();
        } else {
            self.nodes
                .create_node(pub_key, info.state.addresses.clone());
        }
        if info.link.is_outbound() {
            // The dialed address proved itself; it becomes the node's last
            // known-good address.
            self.nodes
                .record_connected(
                    &pub_key,
                    NodeAddress::from(info.addr),
                    self.clock.local_time().as_secs(),
                )
                .ok();
        }

        self.pingmgr.peer_negotiated(info.addr);

        if self.config.discover {
            self.outbox
                .message(info.addr, Packet::new(PacketBody::GetNodes));
            self.outbox
                .message(info.addr, Packet::new(PacketBody::GetOrders));
            self.pingmgr.message_sent(&info.addr);
            self.discovery.insert(pub_key, self.clock.local_time());
        }

        self.events.peer(PeerEvent::VerifyPairs {
            pub_key,
            pairs: info.state.pairs.clone(),
        });
        self.events.peer(PeerEvent::Active(info));
    }

    /// Answer a `GetNodes` request with every open peer except the
    /// requester, skipping peers without known listening addresses.
    fn handle_get_nodes(&mut self, addr: SocketAddr, req_id: uuid::Uuid) {
        let Some(requester) = self.peermgr.pub_key_of(&addr) else {
            return;
        };
        let entries = self
            .peermgr
            .peers()
            .filter(|p| p.pub_key != requester)
            .filter(|p| !p.state.addresses.is_empty())
            .map(|p| NodeEntry {
                pub_key: p.pub_key,
                addresses: p.state.addresses.clone(),
            })
            .collect::<Vec<_>>();

        self.outbox
            .message(addr, Packet::response(PacketBody::Nodes(entries), req_id));
        self.pingmgr.message_sent(&addr);
    }

    /// Open connections to gossiped nodes we don't already know as peers.
    fn connect_nodes(&mut self, entries: Vec<NodeEntry>) {
        for entry in entries {
            let pub_key = entry.pub_key;

            if pub_key == self.peermgr.our_pub_key()
                || self.peermgr.is_connected(&pub_key)
                || self.peermgr.is_connecting(&pub_key)
                || self.nodes.is_banned(&pub_key)
            {
                continue;
            }
            // Prefer the catalog's view of a known node over gossip.
            let addresses = match self.nodes.get(&pub_key) {
                Some(node) => node.connect_order(),
                None => entry.addresses,
            };
            if addresses.is_empty() {
                continue;
            }
            if let Err(err) = self.peermgr.connect_node(pub_key, addresses, false, None) {
                trace!(target: "p2p", "Skipping gossiped node {}: {}", pub_key, err);
            }
        }
    }

    /// Apply a reputation event, closing and announcing a newly banned peer.
    fn apply_reputation(&mut self, pub_key: PubKey, event: ReputationEvent) -> Result<(), Error> {
        let banned = self.nodes.add_reputation_event(&pub_key, event)?;
        if banned {
            self.peermgr
                .disconnect_peer(&pub_key, DisconnectionReason::Banned);
            self.events.node(NodeEvent::Banned(pub_key));
        }
        Ok(())
    }

    /// A decode failure on a peer's byte stream: close it and dent its
    /// reputation.
    pub fn wire_protocol_error(&mut self, addr: SocketAddr) {
        if let Some(pub_key) = self.peermgr.pub_key_of(&addr) {
            self.apply_reputation(pub_key, ReputationEvent::WireProtocolErr)
                .ok();
        }
        self.peermgr
            .disconnect(addr, DisconnectionReason::WireProtocolErr);
    }

    /// Update the reactor-driven clock.
    pub fn tick(&mut self, local_time: LocalTime) {
        self.clock.set(local_time);
    }

    /// Periodic sweeps: heartbeats, session deadlines, retries, gossip.
    pub fn timer_expired(&mut self) {
        for addr in self.pingmgr.received_wake() {
            debug!(target: "p2p", "{}: Peer is stalling, closing", addr);
            self.peermgr
                .disconnect(addr, DisconnectionReason::ResponseStalling);
        }
        self.peermgr.received_wake();
        self.maintain_discovery();

        debug!(
            target: "p2p",
            "peers = {}, pending inbound = {}, known nodes = {}",
            self.peermgr.peers().count(),
            self.peermgr.pending_inbound(),
            self.nodes.count(),
        );
        self.outbox.set_timer(IDLE_TIMEOUT);
    }

    fn maintain_discovery(&mut self) {
        if !self.config.discover || self.config.discover_minutes == 0 {
            return;
        }
        let interval = Duration::from_secs(u64::from(self.config.discover_minutes) * 60);
        let now = self.clock.local_time();

        let due = self
            .peermgr
            .peers()
            .filter(|p| {
                self.discovery
                    .get(&p.pub_key)
                    .map_or(true, |last| now - *last >= interval)
            })
            .map(|p| (p.pub_key, p.addr))
            .collect::<Vec<_>>();

        for (pub_key, addr) in due {
            self.outbox.message(addr, Packet::new(PacketBody::GetNodes));
            self.pingmgr.message_sent(&addr);
            self.discovery.insert(pub_key, now);
        }
    }

    /// Close every session with `Shutdown` and cancel all pending work.
    pub fn shutdown(&mut self) {
        debug!(target: "p2p", "Pool shutting down");

        self.disconnecting = true;
        self.peermgr.shutdown();
        self.discovery.clear();
        self.connected = false;
        self.disconnecting = false;
    }

    /// Process a user command.
    pub fn command(&mut self, cmd: Command) {
        debug!(target: "p2p", "Received command: {:?}", cmd);

        match cmd {
            Command::Connect {
                pub_key,
                address,
                retry,
                revoke_pending,
                reply,
            } => {
                if revoke_pending {
                    self.peermgr.revoke_retries(&pub_key);
                }
                if let Err(err) = self.add_outbound(pub_key, address, retry, reply.clone()) {
                    reply.send(Err(err)).ok();
                }
            }
            Command::RevokeRetries { pub_key } => {
                self.peermgr.revoke_retries(&pub_key);
            }
            Command::ClosePeer {
                pub_key,
                reason,
                reply,
            } => {
                let reason = reason.unwrap_or(DisconnectionReason::Shutdown);
                let result = if self.peermgr.disconnect_peer(&pub_key, reason) {
                    Ok(())
                } else {
                    Err(Error::NotConnected)
                };
                reply.send(result).ok();
            }
            Command::Ban { pub_key, reply } => {
                let result = self.nodes.ban(&pub_key).map(|()| {
                    self.peermgr
                        .disconnect_peer(&pub_key, DisconnectionReason::Banned);
                    self.peermgr.revoke_retries(&pub_key);
                    self.events.node(NodeEvent::Banned(pub_key));
                });
                reply.send(result).ok();
            }
            Command::Unban {
                pub_key,
                reconnect,
                reply,
            } => {
                let result = self.nodes.unban(&pub_key).map(|()| {
                    self.events.node(NodeEvent::Unbanned(pub_key));
                });
                if result.is_ok() && reconnect {
                    self.reconnect(pub_key);
                }
                reply.send(result).ok();
            }
            Command::DiscoverNodes { pub_key, reply } => {
                let result = match self.peermgr.get_peer(&pub_key) {
                    Some(info) => {
                        let addr = info.addr;
                        self.outbox.message(addr, Packet::new(PacketBody::GetNodes));
                        self.pingmgr.message_sent(&addr);
                        self.discovery.insert(pub_key, self.clock.local_time());
                        Ok(())
                    }
                    None => Err(Error::NotConnected),
                };
                reply.send(result).ok();
            }
            Command::Reputation {
                pub_key,
                event,
                reply,
            } => {
                let result = self.apply_reputation(pub_key, event);
                reply.send(result).ok();
            }
            Command::SendToPeer {
                pub_key,
                packet,
                reply,
            } => {
                let result = match self.peermgr.get_peer(&pub_key) {
                    Some(info) => {
                        let addr = info.addr;
                        self.outbox.message(addr, packet);
                        self.pingmgr.message_sent(&addr);
                        Ok(())
                    }
                    None => Err(Error::NotConnected),
                };
                reply.send(result).ok();
            }
            Command::BroadcastOrder { order, reply } => {
                let receiving = self.broadcast(
                    &order.pair_id,
                    None,
                    Packet::new(PacketBody::Order(order.clone())),
                );
                reply.send(receiving).ok();
            }
            Command::BroadcastOrderInvalidation {
                portion,
                exclude,
                reply,
            } => {
                let receiving = self.broadcast(
                    &portion.pair_id,
                    exclude,
                    Packet::new(PacketBody::OrderInvalidation(portion.clone())),
                );
                reply.send(receiving).ok();
            }
            Command::GetPeer { pub_key, reply } => {
                reply.send(self.peermgr.get_peer(&pub_key).cloned()).ok();
            }
            Command::ListPeers { reply } => {
                reply.send(self.peermgr.peers().cloned().collect()).ok();
            }
            Command::UpdatePairs { pairs } => {
                let mut state = self.peermgr.node_state().clone();
                state.pairs = pairs;
                self.update_our_state(state);
            }
            Command::UpdateAuxState {
                currency,
                identifier,
                pub_key,
                uris,
                token_identifier,
            } => {
                let mut state = self.peermgr.node_state().clone();
                if let Some(identifier) = identifier {
                    state.aux_identifiers.insert(currency.clone(), identifier);
                }
                if let Some(pub_key) = pub_key {
                    state.aux_pub_keys.insert(currency.clone(), pub_key);
                }
                if let Some(uris) = uris {
                    state.aux_uris.insert(currency.clone(), uris);
                }
                if let Some(token) = token_identifier {
                    state.token_identifiers.insert(currency, token);
                }
                self.update_our_state(state);
            }
            Command::ResolveAlias { alias, reply } => {
                reply.send(self.nodes.pub_key_for_alias(&alias)).ok();
            }
        }
    }

    /// Caller-initiated outbound connection.
    fn add_outbound(
        &mut self,
        pub_key: PubKey,
        address: Option<NodeAddress>,
        retry: bool,
        reply: ConnectReply,
    ) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::PoolClosed);
        }
        if self.nodes.is_banned(&pub_key) {
            return Err(Error::NodeIsBanned);
        }
        let addresses = match address {
            Some(address) => {
                if address.is_onion() {
                    return Err(Error::NodeTorAddress);
                }
                vec![address]
            }
            None => self
                .nodes
                .get(&pub_key)
                .ok_or(Error::NodeNotFound)?
                .connect_order(),
        };
        self.peermgr.connect_node(pub_key, addresses, retry, Some(reply))
    }

    /// Send a packet to every peer trading `pair_id`, except `exclude`.
    /// Sends are fire-and-forget; a slow peer is closed by its own send
    /// queue stalling rather than holding up the broadcast.
    fn broadcast(
        &mut self,
        pair_id: &str,
        exclude: Option<PubKey>,
        packet: Packet,
    ) -> Vec<PubKey> {
        if !self.peermgr.node_state().has_pair(pair_id) {
            warn!(target: "p2p", "Broadcasting for pair {} we don't advertise", pair_id);
        }
        let targets = self
            .peermgr
            .peers()
            .filter(|p| Some(p.pub_key) != exclude)
            .filter(|p| p.state.has_pair(pair_id))
            .map(|p| (p.pub_key, p.addr))
            .collect::<Vec<_>>();

        let mut receiving = Vec::with_capacity(targets.len());
        for (pub_key, addr) in targets {
            self.outbox.message(addr, packet.clone());
            self.pingmgr.message_sent(&addr);
            receiving.push(pub_key);
        }
        receiving
    }

    /// Replace our advertised state and push it to every open peer.
    fn update_our_state(&mut self, state: NodeState) {
        self.peermgr.set_node_state(state);
        let state = self.peermgr.node_state().clone();

        let peers = self
            .peermgr
            .peers()
            .map(|p| p.addr)
            .collect::<Vec<_>>();
        for addr in peers {
            self.outbox.message(
                addr,
                Packet::new(PacketBody::NodeStateUpdate(state.clone())),
            );
            self.pingmgr.message_sent(&addr);
        }
    }
}

impl<S, C> Iterator for Pool<S, C> {
    type Item = output::Io;

    fn next(&mut self) -> Option<output::Io> {
        self.outbox.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::nodes::MemoryStore;
    use crate::common::identity::NONCE_SIZE;
    use crate::common::time::RefClock;
    use crate::fsm::output::Io;
    use crate::net::Disconnect;
    use dexd_types::{Hello, PacketType};
    use uuid::Uuid;

    type TestPool = Pool<MemoryStore, RefClock<LocalTime>>;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn pool(min: &str) -> (TestPool, Events, RefClock<LocalTime>) {
        let key = NodeKey::from_secret_bytes(&[0x11; 32]).unwrap();
        let events = Events::new();
        let clock = RefClock::from(LocalTime::from_secs(900_000));
        let config = Config {
            version: "1.2.0".to_owned(),
            min_compatible_version: Version::parse(min).unwrap(),
            discover: true,
            discover_minutes: 0,
            strict_reputation: false,
        };
        let mut pool = Pool::new(
            config,
            key,
            NodeState::default(),
            MemoryStore::default(),
            fastrand::Rng::with_seed(9),
            events.clone(),
            clock.clone(),
        );
        pool.initialize(clock.local_time(), Some(addr("10.0.0.1:8885")));
        drain(&mut pool);

        (pool, events, clock)
    }

    fn drain(pool: &mut TestPool) -> Vec<Io> {
        let mut out = Vec::new();
        while let Some(io) = pool.next() {
            out.push(io);
        }
        out
    }

    fn remote_key(fill: u8) -> NodeKey {
        NodeKey::from_secret_bytes(&[fill; 32]).unwrap()
    }

    fn state_with(pairs: &[&str], addresses: &[&str]) -> NodeState {
        NodeState {
            pairs: pairs.iter().map(|p| p.to_string()).collect(),
            addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
            ..NodeState::default()
        }
    }

    fn hello_packet(key: &NodeKey, version: &str, state: NodeState) -> Packet {
        let nonce = vec![5u8; NONCE_SIZE];

        Packet::new(PacketBody::Hello(Hello {
            version: version.to_owned(),
            pub_key: key.pub_key(),
            nonce: nonce.clone(),
            signature: key.sign(&nonce),
            node_state: state,
        }))
    }

    /// Run an inbound session through its handshake.
    fn admit_inbound(pool: &mut TestPool, a: SocketAddr, key: &NodeKey, state: NodeState) {
        assert!(pool.peer_connected(a, addr("10.0.0.1:8885"), Link::Inbound));
        pool.packet_received(a, hello_packet(key, "1.2.0", state));
        pool.packet_received(a, Packet::new(PacketBody::SessionAck));
        assert!(
            pool.peermgr.is_connected(&key.pub_key()),
            "inbound peer was not admitted"
        );
    }

    /// Dial, connect and handshake an outbound session.
    fn admit_outbound(
        pool: &mut TestPool,
        a: SocketAddr,
        key: &NodeKey,
        state: NodeState,
    ) -> chan::Receiver<Result<PeerInfo, Error>> {
        let (reply, replies) = chan::bounded(1);
        pool.command(Command::Connect {
            pub_key: key.pub_key(),
            address: Some(NodeAddress::from(a)),
            retry: false,
            revoke_pending: false,
            reply,
        });
        assert!(drain(pool)
            .iter()
            .any(|io| matches!(io, Io::Connect(dialed) if *dialed == a)));

        pool.peer_connected(a, addr("10.0.0.1:50001"), Link::Outbound);
        pool.packet_received(a, hello_packet(key, "1.2.0", state));
        pool.packet_received(a, Packet::new(PacketBody::SessionAck));
        assert!(
            pool.peermgr.is_connected(&key.pub_key()),
            "outbound peer was not admitted"
        );
        replies
    }

    fn written_to(ios: &[Io], to: SocketAddr) -> Vec<PacketType> {
        ios.iter()
            .filter_map(|io| match io {
                Io::Write(a, p) if *a == to => Some(p.packet_type()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn admission_records_node_and_emits_active() {
        let (mut pool, events, _clock) = pool("0.1.0");
        let peers_rx = events.subscribe_peers();
        let key = remote_key(0x22);
        let a = addr("203.0.113.5:45000");

        admit_inbound(
            &mut pool,
            a,
            &key,
            state_with(&["LTC/BTC"], &["203.0.113.5:8885"]),
        );

        // The catalog learned the node and its advertised addresses.
        assert!(pool.nodes.has(&key.pub_key()));
        let node = pool.nodes.get(&key.pub_key()).unwrap();
        assert_eq!(node.addresses.len(), 1);

        // Discovery kicked in on admission.
        let ios = drain(&mut pool);
        let sent = written_to(&ios, a);
        assert!(sent.contains(&PacketType::GetNodes));
        assert!(sent.contains(&PacketType::GetOrders));

        // `verifyPairs` precedes `active`.
        assert!(matches!(
            peers_rx.try_recv().unwrap(),
            PeerEvent::VerifyPairs { .. }
        ));
        match peers_rx.try_recv().unwrap() {
            PeerEvent::Active(info) => {
                assert_eq!(info.pub_key, key.pub_key());
                assert_eq!(pool.peermgr.peers().count(), 1);
            }
            other => panic!("expected active event, got {:?}", other),
        }
    }

    #[test]
    fn outbound_admission_stamps_last_address() {
        let (mut pool, _events, _clock) = pool("0.1.0");
        let key = remote_key(0x22);
        let a = addr("203.0.113.9:8885");

        let replies = admit_outbound(&mut pool, a, &key, NodeState::default());

        assert!(replies.try_recv().unwrap().is_ok());

        let node = pool.nodes.get(&key.pub_key()).unwrap();
        let last = node.last_address.as_ref().unwrap();
        assert_eq!((last.host.as_str(), last.port), ("203.0.113.9", 8885));
        assert!(last.last_connected.is_some());
        assert!(node.addresses[0].last_connected.is_some());
    }

    #[test]
    fn incompatible_version_leaves_no_node_record() {
        let (mut pool, _events, _clock) = pool("2.0.0");
        let key = remote_key(0x22);
        let a = addr("203.0.113.5:45000");

        assert!(pool.peer_connected(a, addr("10.0.0.1:8885"), Link::Inbound));
        drain(&mut pool);
        pool.packet_received(a, hello_packet(&key, "0.1.0", NodeState::default()));

        let ios = drain(&mut pool);
        assert_eq!(written_to(&ios, a), vec![PacketType::Disconnecting]);
        assert!(ios.iter().any(|io| matches!(
            io,
            Io::Disconnect(_, DisconnectionReason::IncompatibleProtocolVersion)
        )));
        assert_eq!(pool.nodes.count(), 0);
        assert_eq!(pool.peermgr.peers().count(), 0);
    }

    #[test]
    fn reputation_cascade_bans_and_closes_peer() {
        let (mut pool, events, _clock) = pool("0.1.0");
        let nodes_rx = events.subscribe_nodes();
        let key = remote_key(0x22);
        let a = addr("203.0.113.5:45000");

        admit_inbound(&mut pool, a, &key, NodeState::default());
        drain(&mut pool);

        let (reply, replies) = chan::bounded(1);
        pool.command(Command::Reputation {
            pub_key: key.pub_key(),
            event: ReputationEvent::SwapAbuse,
            reply,
        });
        assert!(replies.try_recv().unwrap().is_ok());
        assert!(!pool.nodes.is_banned(&key.pub_key()));

        let (reply, replies) = chan::bounded(1);
        pool.command(Command::Reputation {
            pub_key: key.pub_key(),
            event: ReputationEvent::InvalidAuth,
            reply,
        });
        assert!(replies.try_recv().unwrap().is_ok());

        // Score of -120 crossed the -100 threshold.
        assert!(pool.nodes.is_banned(&key.pub_key()));
        assert!(matches!(
            nodes_rx.try_recv().unwrap(),
            NodeEvent::Banned(pk) if pk == key.pub_key()
        ));

        let ios = drain(&mut pool);
        assert!(ios
            .iter()
            .any(|io| matches!(io, Io::Disconnect(_, DisconnectionReason::Banned))));

        // Further outbound attempts are refused.
        let (reply, replies) = chan::bounded(1);
        pool.command(Command::Connect {
            pub_key: key.pub_key(),
            address: Some(NodeAddress::from(a)),
            retry: false,
            revoke_pending: false,
            reply,
        });
        assert!(matches!(
            replies.try_recv().unwrap(),
            Err(Error::NodeIsBanned)
        ));
    }

    #[test]
    fn gossip_reply_excludes_requester_and_addressless_peers() {
        let (mut pool, _events, _clock) = pool("0.1.0");
        let asker = remote_key(0x22);
        let listed = remote_key(0x33);
        let hidden = remote_key(0x44);
        let asker_addr = addr("203.0.113.5:45000");

        admit_inbound(
            &mut pool,
            asker_addr,
            &asker,
            state_with(&[], &["203.0.113.5:8885"]),
        );
        admit_inbound(
            &mut pool,
            addr("203.0.113.6:45000"),
            &listed,
            state_with(&[], &["203.0.113.6:8885"]),
        );
        // No listening addresses; must not be gossiped.
        admit_inbound(
            &mut pool,
            addr("203.0.113.7:45000"),
            &hidden,
            NodeState::default(),
        );
        drain(&mut pool);

        let request = Packet::new(PacketBody::GetNodes);
        let req_id = request.header.id;
        pool.packet_received(asker_addr, request);

        let ios = drain(&mut pool);
        let reply = ios
            .iter()
            .find_map(|io| match io {
                Io::Write(a, p) if *a == asker_addr => Some(p.clone()),
                _ => None,
            })
            .expect("a Nodes reply was sent");

        assert_eq!(reply.header.req_id, Some(req_id));
        match reply.body {
            PacketBody::Nodes(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].pub_key, listed.pub_key());
                assert_eq!(entries[0].addresses.len(), 1);
            }
            other => panic!("expected Nodes, got {:?}", other.packet_type()),
        }
    }

    #[test]
    fn gossiped_nodes_are_dialed_once() {
        let (mut pool, _events, _clock) = pool("0.1.0");
        let peer = remote_key(0x22);
        let peer_addr = addr("203.0.113.5:45000");
        admit_inbound(&mut pool, peer_addr, &peer, NodeState::default());
        drain(&mut pool);

        let entries = vec![NodeEntry {
            pub_key: remote_key(0x55).pub_key(),
            addresses: vec![NodeAddress::new("203.0.113.77", 8885)],
        }];

        pool.packet_received(peer_addr, Packet::new(PacketBody::Nodes(entries.clone())));
        let first = drain(&mut pool);
        assert_eq!(
            first
                .iter()
                .filter(|io| matches!(io, Io::Connect(_)))
                .count(),
            1
        );

        // The same gossip again must not produce a second dial.
        pool.packet_received(peer_addr, Packet::new(PacketBody::Nodes(entries)));
        let second = drain(&mut pool);
        assert_eq!(
            second
                .iter()
                .filter(|io| matches!(io, Io::Connect(_)))
                .count(),
            0
        );
    }

    #[test]
    fn broadcasts_go_to_pair_peers_only() {
        let (mut pool, _events, _clock) = pool("0.1.0");
        pool.command(Command::UpdatePairs {
            pairs: vec!["LTC/BTC".into()],
        });
        drain(&mut pool);

        let ltc = remote_key(0x22);
        let eth = remote_key(0x33);
        let ltc_addr = addr("203.0.113.5:45000");
        admit_inbound(&mut pool, ltc_addr, &ltc, state_with(&["LTC/BTC"], &[]));
        admit_inbound(
            &mut pool,
            addr("203.0.113.6:45000"),
            &eth,
            state_with(&["ETH/BTC"], &[]),
        );
        drain(&mut pool);

        let order = Order {
            id: Uuid::new_v4(),
            pair_id: "LTC/BTC".into(),
            price: 0.015,
            quantity: 100_000,
            is_buy: false,
        };
        let (reply, replies) = chan::bounded(1);
        pool.command(Command::BroadcastOrder { order, reply });

        assert_eq!(replies.try_recv().unwrap(), vec![ltc.pub_key()]);
        let ios = drain(&mut pool);
        assert_eq!(written_to(&ios, ltc_addr), vec![PacketType::Order]);
        assert!(written_to(&ios, addr("203.0.113.6:45000")).is_empty());

        // Invalidations honor the exclusion.
        let portion = OrderPortion {
            id: Uuid::new_v4(),
            pair_id: "LTC/BTC".into(),
            quantity: 50_000,
        };
        let (reply, replies) = chan::bounded(1);
        pool.command(Command::BroadcastOrderInvalidation {
            portion,
            exclude: Some(ltc.pub_key()),
            reply,
        });
        assert_eq!(replies.try_recv().unwrap(), Vec::<PubKey>::new());
    }

    #[test]
    fn stalled_outbound_peer_is_redialed() {
        let (mut pool, events, _clock) = pool("0.1.0");
        let peers_rx = events.subscribe_peers();
        let key = remote_key(0x22);
        let a = addr("203.0.113.9:8885");

        admit_outbound(&mut pool, a, &key, NodeState::default());
        drain(&mut pool);
        while peers_rx.try_recv().is_ok() {}

        // The stall detector closes the peer...
        pool.peermgr
            .disconnect(a, DisconnectionReason::ResponseStalling);
        pool.peer_disconnected(&a, Disconnect::StateMachine(DisconnectionReason::ResponseStalling));

        assert!(matches!(
            peers_rx.try_recv().unwrap(),
            PeerEvent::Close {
                pub_key: Some(pk),
                ..
            } if pk == key.pub_key()
        ));

        // ...and a reconnection attempt begins at once.
        let ios = drain(&mut pool);
        assert!(ios
            .iter()
            .any(|io| matches!(io, Io::Connect(dialed) if *dialed == a)));
    }

    #[test]
    fn no_reconnect_when_peer_banned_us() {
        let (mut pool, _events, _clock) = pool("0.1.0");
        let key = remote_key(0x22);
        let a = addr("203.0.113.9:8885");

        admit_outbound(&mut pool, a, &key, NodeState::default());
        drain(&mut pool);

        pool.packet_received(
            a,
            Packet::new(PacketBody::Disconnecting(
                dexd_types::messages::p2p::Disconnecting {
                    reason: DisconnectionReason::Banned,
                    payload: None,
                },
            )),
        );
        pool.peer_disconnected(
            &a,
            Disconnect::ConnectionError(std::sync::Arc::new(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset,
            ))),
        );

        assert!(!drain(&mut pool)
            .iter()
            .any(|io| matches!(io, Io::Connect(_))));
    }

    #[test]
    fn write_stall_counts_as_response_stalling() {
        let (mut pool, _events, _clock) = pool("0.1.0");
        let key = remote_key(0x22);
        let a = addr("203.0.113.9:8885");

        admit_outbound(&mut pool, a, &key, NodeState::default());
        drain(&mut pool);

        pool.peer_disconnected(&a, Disconnect::WriteStall);

        // Treated like a self-sent `ResponseStalling`: eligible to retry.
        assert!(drain(&mut pool)
            .iter()
            .any(|io| matches!(io, Io::Connect(dialed) if *dialed == a)));
    }

    #[test]
    fn shutdown_announces_and_refuses_new_work() {
        let (mut pool, _events, _clock) = pool("0.1.0");
        let key = remote_key(0x22);
        let a = addr("203.0.113.5:45000");

        admit_inbound(&mut pool, a, &key, NodeState::default());
        drain(&mut pool);

        pool.shutdown();

        let ios = drain(&mut pool);
        let sent = written_to(&ios, a);
        assert!(sent.contains(&PacketType::Disconnecting));
        assert!(ios
            .iter()
            .any(|io| matches!(io, Io::Disconnect(_, DisconnectionReason::Shutdown))));
        assert!(!pool.is_connected());

        let (reply, replies) = chan::bounded(1);
        pool.command(Command::Connect {
            pub_key: remote_key(0x33).pub_key(),
            address: Some(NodeAddress::new("203.0.113.50", 8885)),
            retry: false,
            revoke_pending: false,
            reply,
        });
        assert!(matches!(
            replies.try_recv().unwrap(),
            Err(Error::PoolClosed)
        ));
    }

    #[test]
    fn node_state_updates_surface_dropped_pairs() {
        let (mut pool, events, _clock) = pool("0.1.0");
        let peers_rx = events.subscribe_peers();
        let key = remote_key(0x22);
        let a = addr("203.0.113.5:45000");

        admit_inbound(&mut pool, a, &key, state_with(&["LTC/BTC", "ETH/BTC"], &[]));
        while peers_rx.try_recv().is_ok() {}

        pool.packet_received(
            a,
            Packet::new(PacketBody::NodeStateUpdate(state_with(&["LTC/BTC"], &[]))),
        );

        let mut saw_update = false;
        let mut dropped = Vec::new();
        while let Ok(event) = peers_rx.try_recv() {
            match event {
                PeerEvent::NodeStateUpdate { pub_key, .. } => {
                    assert_eq!(pub_key, key.pub_key());
                    saw_update = true;
                }
                PeerEvent::PairDropped { pair_id, .. } => dropped.push(pair_id),
                PeerEvent::VerifyPairs { pairs, .. } => {
                    assert_eq!(pairs, vec!["LTC/BTC".to_string()]);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(saw_update);
        assert_eq!(dropped, vec!["ETH/BTC".to_string()]);
    }

    #[test]
    fn aliases_resolve_back_to_keys() {
        let (mut pool, _events, _clock) = pool("0.1.0");
        let key = remote_key(0x22);

        admit_inbound(
            &mut pool,
            addr("203.0.113.5:45000"),
            &key,
            NodeState::default(),
        );

        let alias = pool.nodes.get_alias(&key.pub_key()).unwrap();
        let (reply, replies) = chan::bounded(1);
        pool.command(Command::ResolveAlias { alias, reply });

        assert_eq!(replies.try_recv().unwrap(), Ok(key.pub_key()));
    }
}
