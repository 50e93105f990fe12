//! Peer session management: connection establishment, the session
//! handshake, duplicate resolution, and reconnection with backoff.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use flume as chan;
use semver::Version;
use tracing::{debug, warn};
use uuid::Uuid;

use dexd_types::{DisconnectionReason, Hello, NodeAddress, NodeState, PubKey};

use crate::common::identity::{self, NodeKey, NONCE_SIZE};
use crate::common::node::{alias, Directory};
use crate::common::time::Clock;
use crate::error::Error;
use crate::fsm::output::{Connect, Disconnect, SetTimer, Wire};
use crate::fsm::pingmgr::STALL_INTERVAL;
use crate::net::{Disconnect as NetDisconnect, Link, LocalTime};

/// Time to wait for an outbound dial attempt to become a connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// First reconnection backoff delay.
pub const RETRY_MIN_WAIT: Duration = Duration::from_secs(1);
/// Backoff delay ceiling.
pub const RETRY_MAX_WAIT: Duration = Duration::from_secs(60);
/// Total window in which reconnection attempts for one node may run.
pub const RETRY_MAX_PERIOD: Duration = Duration::from_secs(7 * 60);

/// Reply channel for a caller-initiated connection attempt.
pub type ConnectReply = chan::Sender<Result<PeerInfo, Error>>;

/// An event originating in the peer manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// Dialing a peer.
    Connecting(SocketAddr, PubKey),
    /// A socket was established.
    Connected(SocketAddr, Link),
    /// A peer completed the session handshake and was admitted.
    Negotiated {
        addr: SocketAddr,
        link: Link,
        pub_key: PubKey,
        version: String,
    },
    /// A connection attempt failed terminally.
    ConnectionFailed(PubKey, &'static str),
    /// One of our advertised addresses proved publicly reachable.
    AddressReachable(SocketAddr),
    /// A duplicate session was parked pending the existing one's close.
    DuplicateParked(SocketAddr, PubKey),
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Connecting(addr, pk) => write!(f, "Connecting to {} at {}", pk, addr),
            Event::Connected(addr, link) => write!(f, "{}: Peer connected ({:?})", addr, link),
            Event::Negotiated {
                addr,
                pub_key,
                version,
                ..
            } => write!(f, "{}: Peer {} negotiated, version {}", addr, pub_key, version),
            Event::ConnectionFailed(pk, why) => {
                write!(f, "Connection attempt to {} failed: {}", pk, why)
            }
            Event::AddressReachable(addr) => {
                write!(f, "Advertised address {} is publicly reachable", addr)
            }
            Event::DuplicateParked(addr, pk) => {
                write!(f, "{}: Duplicate connection for {} parked", addr, pk)
            }
        }
    }
}

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The version we present in our `Hello`.
    pub version: String,
    /// Peers below this version are rejected.
    pub min_compatible_version: Version,
    /// Refuse peers whose reputation score is negative, not merely banned.
    pub strict_reputation: bool,
}

/// An established socket.
#[derive(Debug, Clone)]
pub struct Connection {
    pub addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub link: Link,
    pub since: LocalTime,
}

/// What the remote told us about itself in its `Hello`.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub pub_key: PubKey,
    pub version: String,
    pub state: NodeState,
}

/// An admitted peer, as exposed to callers and events.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub pub_key: PubKey,
    pub alias: String,
    pub addr: SocketAddr,
    pub link: Link,
    pub version: String,
    pub state: NodeState,
    pub since: LocalTime,
}

/// Session state for one socket.
#[derive(Debug)]
enum Peer {
    /// An outbound connection attempt is in flight.
    Connecting {
        since: LocalTime,
        pub_key: Option<PubKey>,
        probe: bool,
    },
    /// The socket is established; the session is handshaking or open.
    Connected {
        conn: Connection,
        /// The key we expect the remote to present (outbound dials).
        expected: Option<PubKey>,
        /// Whether this socket is a reachability probe of our own address.
        probe: bool,
        hello: Option<SessionInfo>,
        acked: bool,
        /// Handshake complete, but an existing session for the same key must
        /// close before this one may open.
        parked_since: Option<LocalTime>,
        open: bool,
        sent_reason: Option<DisconnectionReason>,
        recv_reason: Option<DisconnectionReason>,
    },
}

/// A plan for connecting to one node: the addresses to walk and the backoff
/// state once they are exhausted.
#[derive(Debug)]
struct DialPlan {
    addresses: Vec<NodeAddress>,
    next: usize,
    current: Option<SocketAddr>,
    retry: bool,
    attempts: u32,
    started: LocalTime,
    retry_at: Option<LocalTime>,
    reply: Option<ConnectReply>,
}

/// The outcome of processing a received `Hello`.
#[derive(Debug)]
pub enum HelloOutcome {
    /// The session opened; the peer is admitted.
    Admitted(PeerInfo),
    /// Waiting for the remote's `SessionAck`.
    Pending,
    /// Duplicate session parked until the existing one closes.
    Parked(PubKey),
    /// The remote is ourselves.
    SelfConnection { probe: bool },
    /// The handshake was rejected and the socket is closing.
    Rejected {
        pub_key: Option<PubKey>,
        reason: DisconnectionReason,
        /// The peer failed authentication (bad signature or identity
        /// mismatch); worth a reputation event.
        invalid_auth: bool,
    },
    /// No session for this socket; nothing done.
    Ignored,
}

/// The outcome of a socket closing.
#[derive(Debug)]
pub enum Departure {
    /// A dial attempt or pre-admission session ended.
    Pending { pub_key: Option<PubKey> },
    /// A reachability probe socket closed.
    Probe,
    /// An admitted peer session ended.
    Admitted {
        info: PeerInfo,
        sent_reason: Option<DisconnectionReason>,
        recv_reason: Option<DisconnectionReason>,
        /// A parked duplicate that now takes over the session.
        replacement: Option<PeerInfo>,
    },
    /// The socket was not ours to track.
    Unknown,
}

/// Manages peer sessions and the handshake.
#[derive(Debug)]
pub struct PeerManager<U, C> {
    pub config: Config,
    /// Session states, one per socket.
    peers_storage: HashMap<SocketAddr, Peer>,
    /// Admitted peers, keyed by node identity.
    admitted: HashMap<PubKey, PeerInfo>,
    /// Outbound connection plans, keyed by node identity.
    plans: HashMap<PubKey, DialPlan>,
    key: NodeKey,
    node_state: NodeState,
    rng: fastrand::Rng,
    upstream: U,
    clock: C,
}

impl<U: Wire<Event> + SetTimer + Connect + Disconnect, C: Clock> PeerManager<U, C> {
    pub fn new(
        config: Config,
        key: NodeKey,
        node_state: NodeState,
        rng: fastrand::Rng,
        upstream: U,
        clock: C,
    ) -> Self {
        Self {
            config,
            peers_storage: HashMap::new(),
            admitted: HashMap::new(),
            plans: HashMap::new(),
            key,
            node_state,
            rng,
            upstream,
            clock,
        }
    }

    pub fn our_pub_key(&self) -> PubKey {
        self.key.pub_key()
    }

    pub fn node_state(&self) -> &NodeState {
        &self.node_state
    }

    pub fn set_node_state(&mut self, state: NodeState) {
        self.node_state = state.sanitize();
    }

    /// Admitted peers.
    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.admitted.values()
    }

    pub fn get_peer(&self, pub_key: &PubKey) -> Option<&PeerInfo> {
        self.admitted.get(pub_key)
    }

    pub fn is_connected(&self, pub_key: &PubKey) -> bool {
        self.admitted.contains_key(pub_key)
    }

    pub fn is_connecting(&self, pub_key: &PubKey) -> bool {
        self.plans.contains_key(pub_key)
    }

    /// The identity behind an open socket, if the session is open.
    pub fn pub_key_of(&self, addr: &SocketAddr) -> Option<PubKey> {
        match self.peers_storage.get(addr) {
            Some(Peer::Connected {
                open: true,
                hello: Some(info),
                ..
            }) => Some(info.pub_key),
            _ => None,
        }
    }

    /// Inbound sessions whose identity we don't yet know.
    pub fn pending_inbound(&self) -> usize {
        self.peers_storage
            .values()
            .filter(|p| {
                matches!(
                    p,
                    Peer::Connected {
                        conn: Connection {
                            link: Link::Inbound,
                            ..
                        },
                        open: false,
                        ..
                    }
                )
            })
            .count()
    }

    /// Begin connecting to a node, walking `addresses` in order. `retry`
    /// keeps redialing the first address with backoff once the list is
    /// exhausted, within [`RETRY_MAX_PERIOD`].
    pub fn connect_node(
        &mut self,
        pub_key: PubKey,
        addresses: Vec<NodeAddress>,
        retry: bool,
        reply: Option<ConnectReply>,
    ) -> Result<(), Error> {
        if pub_key == self.our_pub_key() {
            return Err(Error::AttemptedConnectionToSelf);
        }
        if self.is_connected(&pub_key) {
            return Err(Error::NodeAlreadyConnected);
        }
        if self.is_connecting(&pub_key) {
            return Err(Error::AlreadyConnecting);
        }

        let mut onion_only = !addresses.is_empty();
        let dialable = addresses
            .into_iter()
            .filter(|a| {
                if a.socket_addr().is_some() {
                    onion_only = false;
                    true
                } else {
                    false
                }
            })
            .collect::<Vec<_>>();

        if dialable.is_empty() {
            return Err(if onion_only {
                Error::NodeTorAddress
            } else {
                Error::NotConnected
            });
        }

        self.plans.insert(
            pub_key,
            DialPlan {
                addresses: dialable,
                next: 0,
                current: None,
                retry,
                attempts: 0,
                started: self.clock.local_time(),
                retry_at: None,
                reply,
            },
        );
        self.dial_next(&pub_key);

        Ok(())
    }

    /// Dial our own advertised address; the handshake is expected to reach
    /// `ConnectedToSelf`, which proves the address publicly reachable.
    pub fn probe(&mut self, addr: SocketAddr) {
        if self.peers_storage.contains_key(&addr) {
            return;
        }
        self.peers_storage.insert(
            addr,
            Peer::Connecting {
                since: self.clock.local_time(),
                pub_key: None,
                probe: true,
            },
        );
        self.upstream.connect(addr, DIAL_TIMEOUT);
    }

    /// Cancel pending dial retries for a node. The in-flight attempt, if
    /// any, is left to finish without further retries.
    pub fn revoke_retries(&mut self, pub_key: &PubKey) {
        let in_flight = match self.plans.get_mut(pub_key) {
            Some(plan) if plan.current.is_some() => {
                plan.retry = false;
                plan.retry_at = None;
                true
            }
            Some(_) => false,
            None => return,
        };
        if !in_flight {
            if let Some(plan) = self.plans.remove(pub_key) {
                if let Some(reply) = plan.reply {
                    reply.send(Err(Error::NotConnected)).ok();
                }
            }
        }
    }

    fn dial_next(&mut self, pub_key: &PubKey) {
        let now = self.clock.local_time();
        let Some(plan) = self.plans.get_mut(pub_key) else {
            return;
        };
        plan.current = None;
        plan.retry_at = None;

        while plan.next < plan.addresses.len() {
            let address = &plan.addresses[plan.next];
            plan.next += 1;

            let Some(addr) = address.socket_addr() else {
                continue;
            };
            if self.peers_storage.contains_key(&addr) {
                continue;
            }

            plan.current = Some(addr);
            self.peers_storage.insert(
                addr,
                Peer::Connecting {
                    since: now,
                    pub_key: Some(*pub_key),
                    probe: false,
                },
            );
            self.upstream.connect(addr, DIAL_TIMEOUT);
            self.upstream.event(Event::Connecting(addr, *pub_key));
            return;
        }

        // Address list exhausted.
        if !plan.retry {
            self.fail_plan(pub_key, Error::NotConnected, "no address could be reached");
            return;
        }
        if now - plan.started >= RETRY_MAX_PERIOD {
            self.fail_plan(
                pub_key,
                Error::ConnectionRetriesMaxPeriodExceeded,
                "maximum retry period exceeded",
            );
            return;
        }

        let exp = 1u64 << plan.attempts.min(16);
        let delay = Duration::from_secs(exp).clamp(RETRY_MIN_WAIT, RETRY_MAX_WAIT);
        plan.attempts += 1;
        plan.retry_at = Some(now + delay);

        debug!(target: "p2p", "Retrying {} in {:?}", pub_key, delay);
        self.upstream.set_timer(delay);
    }

    fn fail_plan(&mut self, pub_key: &PubKey, error: Error, why: &'static str) {
        if let Some(plan) = self.plans.remove(pub_key) {
            if let Some(reply) = plan.reply {
                reply.send(Err(error)).ok();
            }
            self.upstream.event(Event::ConnectionFailed(*pub_key, why));
        }
    }

    /// Called when a peer is being connected to.
    pub fn peer_attempted(&mut self, addr: &SocketAddr) {
        // Since all "attempts" are made from this module, we expect that
        // when a peer is attempted, we know about it already.
        debug_assert!(self.peers_storage.contains_key(addr), "{} is unknown", addr);
    }

    /// Called when a socket is established. Sends our `Hello`; both sides
    /// open the session exchange regardless of direction.
    pub fn peer_connected(&mut self, addr: SocketAddr, local_addr: SocketAddr, link: Link) {
        let now = self.clock.local_time();

        let (expected, probe) = match self.peers_storage.remove(&addr) {
            Some(Peer::Connecting { pub_key, probe, .. }) => (pub_key, probe),
            Some(connected @ Peer::Connected { .. }) => {
                // Nb. This shouldn't happen. Put it back.
                self.peers_storage.insert(addr, connected);
                return;
            }
            None => (None, false),
        };

        self.peers_storage.insert(
            addr,
            Peer::Connected {
                conn: Connection {
                    addr,
                    local_addr,
                    link,
                    since: now,
                },
                expected,
                probe,
                hello: None,
                acked: false,
                parked_since: None,
                open: false,
                sent_reason: None,
                recv_reason: None,
            },
        );

        let mut nonce = vec![0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce);
        let signature = self.key.sign(&nonce);

        let hello = Hello {
            version: self.config.version.clone(),
            pub_key: self.key.pub_key(),
            nonce,
            signature,
            node_state: self.node_state.clone().sanitize(),
        };
        self.upstream.hello(addr, hello);
        // The whole exchange must finish within the stall interval.
        self.upstream.set_timer(STALL_INTERVAL);
        self.upstream.event(Event::Connected(addr, link));
    }

    /// Called when a `Hello` arrives. `accepting` is false while the pool is
    /// shutting down.
    pub fn received_hello(
        &mut self,
        addr: SocketAddr,
        id: Uuid,
        hello: Hello,
        dir: &impl Directory,
        accepting: bool,
    ) -> HelloOutcome {
        let Some(Peer::Connected {
            conn,
            expected,
            probe,
            hello: session_hello,
            ..
        }) = self.peers_storage.get(&addr)
        else {
            return HelloOutcome::Ignored;
        };
        let link = conn.link;
        let expected = *expected;
        let probe = *probe;

        if session_hello.is_some() {
            // A second `Hello` on the same session is a protocol violation.
            self.disconnect(addr, DisconnectionReason::WireProtocolErr);
            return HelloOutcome::Rejected {
                pub_key: Some(hello.pub_key),
                reason: DisconnectionReason::WireProtocolErr,
                invalid_auth: false,
            };
        }

        // Self-connection. Also the success path of a reachability probe.
        if hello.pub_key == self.our_pub_key() {
            if probe {
                self.upstream.event(Event::AddressReachable(addr));
            }
            self.disconnect(addr, DisconnectionReason::ConnectedToSelf);
            return HelloOutcome::SelfConnection { probe };
        }

        if let Err(outcome) = self.validate_hello(addr, link, expected, dir, accepting, &hello) {
            return outcome;
        }

        // Duplicate session for a key we already have open.
        if self.admitted.contains_key(&hello.pub_key) {
            match self.resolve_duplicate(&hello.pub_key) {
                DuplicateAction::DropNew => {
                    let pub_key = hello.pub_key;
                    self.fail_plan_on_reject(link, expected, Error::NodeAlreadyConnected);
                    self.disconnect(addr, DisconnectionReason::AlreadyConnected);
                    return HelloOutcome::Rejected {
                        pub_key: Some(pub_key),
                        reason: DisconnectionReason::AlreadyConnected,
                        invalid_auth: false,
                    };
                }
                DuplicateAction::ParkNew => {
                    let pub_key = hello.pub_key;
                    let now = self.clock.local_time();

                    if let Some(Peer::Connected {
                        hello: session_hello,
                        parked_since,
                        ..
                    }) = self.peers_storage.get_mut(&addr)
                    {
                        *session_hello = Some(SessionInfo {
                            pub_key,
                            version: hello.version,
                            state: hello.node_state.sanitize(),
                        });
                        *parked_since = Some(now);
                    }
                    self.upstream.session_ack(addr, id);
                    self.upstream.set_timer(STALL_INTERVAL);
                    self.upstream.event(Event::DuplicateParked(addr, pub_key));

                    return HelloOutcome::Parked(pub_key);
                }
            }
        }

        let pub_key = hello.pub_key;
        if let Some(Peer::Connected {
            hello: session_hello,
            ..
        }) = self.peers_storage.get_mut(&addr)
        {
            *session_hello = Some(SessionInfo {
                pub_key,
                version: hello.version,
                state: hello.node_state.sanitize(),
            });
        }
        self.upstream.session_ack(addr, id);

        match self.try_admit(addr) {
            Some(info) => HelloOutcome::Admitted(info),
            None => HelloOutcome::Pending,
        }
    }

    /// The handshake validation gauntlet. On error, the session is already
    /// closing with the returned reason.
    fn validate_hello(
        &mut self,
        addr: SocketAddr,
        link: Link,
        expected: Option<PubKey>,
        dir: &impl Directory,
        accepting: bool,
        hello: &Hello,
    ) -> Result<(), HelloOutcome> {
        let reject = |mgr: &mut Self, reason, error: Option<Error>, invalid_auth| {
            if let Some(error) = error {
                mgr.fail_plan_on_reject(link, expected, error);
            }
            mgr.disconnect(addr, reason);
            Err(HelloOutcome::Rejected {
                pub_key: Some(hello.pub_key),
                reason,
                invalid_auth,
            })
        };

        let version = match Version::parse(&hello.version) {
            Ok(version) => version,
            Err(_) => {
                return reject(
                    self,
                    DisconnectionReason::MalformedVersion,
                    Some(Error::MalformedVersion(hello.version.clone())),
                    false,
                );
            }
        };
        if version < self.config.min_compatible_version {
            return reject(
                self,
                DisconnectionReason::IncompatibleProtocolVersion,
                Some(Error::IncompatibleVersion {
                    actual: hello.version.clone(),
                    min: self.config.min_compatible_version.to_string(),
                }),
                false,
            );
        }

        if !accepting {
            return reject(
                self,
                DisconnectionReason::NotAcceptingConnections,
                Some(Error::PoolClosed),
                false,
            );
        }

        if hello.nonce.len() != NONCE_SIZE
            || !identity::verify(&hello.pub_key, &hello.nonce, &hello.signature)
        {
            warn!(target: "p2p", "{}: Invalid session signature from {}", addr, hello.pub_key);
            return reject(self, DisconnectionReason::WireProtocolErr, None, true);
        }

        if let Some(expected) = expected {
            if expected != hello.pub_key {
                warn!(
                    target: "p2p",
                    "{}: Expected {} but peer identifies as {}", addr, expected, hello.pub_key
                );
                return reject(
                    self,
                    DisconnectionReason::WireProtocolErr,
                    Some(Error::NotConnected),
                    true,
                );
            }
        }

        if dir.is_banned(&hello.pub_key)
            || (self.config.strict_reputation && dir.reputation(&hello.pub_key) < 0)
        {
            return reject(
                self,
                DisconnectionReason::Banned,
                Some(Error::NodeIsBanned),
                false,
            );
        }

        Ok(())
    }

    /// Drop the dial plan behind an outbound session that was rejected
    /// during the handshake, surfacing `error` to the caller.
    fn fail_plan_on_reject(&mut self, link: Link, expected: Option<PubKey>, error: Error) {
        if link.is_outbound() {
            if let Some(pub_key) = expected {
                self.fail_plan(&pub_key, error, "handshake rejected");
            }
        }
    }

    /// Pick what to do with a second session for a key we already have open.
    ///
    /// The side with the higher key closes its new socket right away; the
    /// side with the lower key parks the new socket and waits (bounded by
    /// the stall interval) for the existing one to close. Both ends apply
    /// the same full-width comparison over raw key bytes, so whichever
    /// socket the higher side drops, exactly one survives and both sides
    /// agree on it.
    fn resolve_duplicate(&self, remote: &PubKey) -> DuplicateAction {
        if self.our_pub_key().cmp_ct(remote) == std::cmp::Ordering::Greater {
            DuplicateAction::DropNew
        } else {
            DuplicateAction::ParkNew
        }
    }

    /// Called when a `SessionAck` arrives.
    pub fn received_session_ack(&mut self, addr: SocketAddr) -> Option<PeerInfo> {
        match self.peers_storage.get_mut(&addr) {
            Some(Peer::Connected { acked, .. }) => {
                *acked = true;
            }
            _ => return None,
        }
        self.try_admit(addr)
    }

    /// Open the session if the handshake is complete on both sides and the
    /// session is not parked.
    fn try_admit(&mut self, addr: SocketAddr) -> Option<PeerInfo> {
        let pub_key = match self.peers_storage.get(&addr) {
            Some(Peer::Connected {
                hello: Some(session),
                acked: true,
                parked_since: None,
                open: false,
                ..
            }) => session.pub_key,
            _ => return None,
        };

        // Duplicate resolution applies at the moment of admission; two
        // handshakes may complete for the same identity back to back.
        if self.admitted.contains_key(&pub_key) {
            match self.resolve_duplicate(&pub_key) {
                DuplicateAction::DropNew => {
                    self.disconnect(addr, DisconnectionReason::AlreadyConnected);
                    return None;
                }
                DuplicateAction::ParkNew => {
                    let now = self.clock.local_time();
                    if let Some(Peer::Connected { parked_since, .. }) =
                        self.peers_storage.get_mut(&addr)
                    {
                        *parked_since = Some(now);
                    }
                    self.upstream.set_timer(STALL_INTERVAL);
                    self.upstream.event(Event::DuplicateParked(addr, pub_key));
                    return None;
                }
            }
        }

        let Some(Peer::Connected {
            conn,
            hello: Some(session),
            open,
            ..
        }) = self.peers_storage.get_mut(&addr)
        else {
            return None;
        };
        *open = true;

        let info = PeerInfo {
            pub_key: session.pub_key,
            alias: alias(&session.pub_key),
            addr: conn.addr,
            link: conn.link,
            version: session.version.clone(),
            state: session.state.clone(),
            since: conn.since,
        };
        self.admitted.insert(info.pub_key, info.clone());

        if let Some(plan) = self.plans.remove(&info.pub_key) {
            if let Some(reply) = plan.reply {
                reply.send(Ok(info.clone())).ok();
            }
        }
        self.upstream.event(Event::Negotiated {
            addr,
            link: info.link,
            pub_key: info.pub_key,
            version: info.version.clone(),
        });

        Some(info)
    }

    /// Record the reason a peer announced before hanging up.
    pub fn received_disconnecting(&mut self, addr: SocketAddr, reason: DisconnectionReason) {
        if let Some(Peer::Connected { recv_reason, .. }) = self.peers_storage.get_mut(&addr) {
            *recv_reason = Some(reason);
        }
    }

    /// A peer's advertised node state changed. Returns the identity, the
    /// pairs that were dropped, and the new state.
    pub fn update_node_state(
        &mut self,
        addr: SocketAddr,
        state: NodeState,
    ) -> Option<(PubKey, Vec<String>, NodeState)> {
        let state = state.sanitize();

        let Some(Peer::Connected {
            open: true,
            hello: Some(session),
            ..
        }) = self.peers_storage.get_mut(&addr)
        else {
            return None;
        };
        let dropped = session
            .state
            .pairs
            .iter()
            .filter(|p| !state.has_pair(p))
            .cloned()
            .collect::<Vec<_>>();
        session.state = state.clone();
        let pub_key = session.pub_key;

        if let Some(info) = self.admitted.get_mut(&pub_key) {
            info.state = state.clone();
        }

        Some((pub_key, dropped, state))
    }

    /// Disconnect a session, announcing the reason first when the socket has
    /// a live session exchange.
    pub fn disconnect(&mut self, addr: SocketAddr, reason: DisconnectionReason) {
        if let Some(Peer::Connected { sent_reason, .. }) = self.peers_storage.get_mut(&addr) {
            if sent_reason.is_none() {
                *sent_reason = Some(reason);
                self.upstream.disconnecting(addr, reason, None);
            }
        }
        self.upstream.disconnect(addr, reason);
    }

    /// Disconnect an admitted peer by identity.
    pub fn disconnect_peer(&mut self, pub_key: &PubKey, reason: DisconnectionReason) -> bool {
        match self.admitted.get(pub_key) {
            Some(info) => {
                let addr = info.addr;
                self.disconnect(addr, reason);
                true
            }
            None => false,
        }
    }

    /// Called when a socket has been closed.
    pub fn peer_disconnected(
        &mut self,
        addr: &SocketAddr,
        reason: &NetDisconnect<DisconnectionReason>,
    ) -> Departure {
        match self.peers_storage.remove(addr) {
            Some(Peer::Connecting { pub_key, probe, .. }) => {
                if probe {
                    warn!(target: "p2p", "{}: Reachability probe failed: {}", addr, reason);
                    return Departure::Probe;
                }
                if let Some(pub_key) = pub_key {
                    self.advance_plan(&pub_key, addr);
                    return Departure::Pending {
                        pub_key: Some(pub_key),
                    };
                }
                Departure::Pending { pub_key: None }
            }
            Some(Peer::Connected {
                probe: true, open, ..
            }) => {
                if !open {
                    debug!(target: "p2p", "{}: Probe socket closed: {}", addr, reason);
                }
                Departure::Probe
            }
            Some(Peer::Connected {
                open: false,
                expected,
                conn,
                ..
            }) => {
                if conn.link.is_outbound() {
                    if let Some(pub_key) = expected {
                        self.advance_plan(&pub_key, addr);
                        return Departure::Pending {
                            pub_key: Some(pub_key),
                        };
                    }
                }
                Departure::Pending { pub_key: expected }
            }
            Some(Peer::Connected {
                open: true,
                hello: Some(session),
                mut sent_reason,
                recv_reason,
                ..
            }) => {
                let info = match self.admitted.remove(&session.pub_key) {
                    Some(info) if info.addr == *addr => info,
                    Some(other) => {
                        // A replacement session took over this identity
                        // already; put it back.
                        self.admitted.insert(session.pub_key, other);
                        return Departure::Unknown;
                    }
                    None => return Departure::Unknown,
                };

                // A send-queue stall is our own doing; report it as if we
                // had sent `ResponseStalling`.
                if reason.is_write_stall() && sent_reason.is_none() {
                    sent_reason = Some(DisconnectionReason::ResponseStalling);
                }

                let replacement = self.unpark(&session.pub_key);

                Departure::Admitted {
                    info,
                    sent_reason,
                    recv_reason,
                    replacement,
                }
            }
            Some(Peer::Connected { .. }) | None => Departure::Unknown,
        }
    }

    /// Admit a parked duplicate session for `pub_key`, if one is waiting.
    fn unpark(&mut self, pub_key: &PubKey) -> Option<PeerInfo> {
        let addr = self.peers_storage.iter().find_map(|(addr, peer)| match peer {
            Peer::Connected {
                parked_since: Some(_),
                hello: Some(session),
                ..
            } if session.pub_key == *pub_key => Some(*addr),
            _ => None,
        })?;

        if let Some(Peer::Connected { parked_since, .. }) = self.peers_storage.get_mut(&addr) {
            *parked_since = None;
        }
        self.try_admit(addr)
    }

    /// A dial attempt's socket failed; move its plan along.
    fn advance_plan(&mut self, pub_key: &PubKey, addr: &SocketAddr) {
        let advance = match self.plans.get(pub_key) {
            Some(plan) => plan.current == Some(*addr),
            None => false,
        };
        if advance {
            self.dial_next(pub_key);
        }
    }

    /// Periodic sweep: dial timeouts, handshake deadlines, parked duplicates
    /// and scheduled retries.
    pub fn received_wake(&mut self) {
        let now = self.clock.local_time();

        let mut timed_out = Vec::new();
        let mut expired_parks = Vec::new();

        for (addr, peer) in &self.peers_storage {
            match peer {
                Peer::Connecting { since, .. } => {
                    if now - *since >= DIAL_TIMEOUT {
                        timed_out.push(*addr);
                    }
                }
                Peer::Connected {
                    open: false,
                    parked_since: Some(since),
                    ..
                } => {
                    if now - *since >= STALL_INTERVAL {
                        expired_parks.push(*addr);
                    }
                }
                Peer::Connected {
                    open: false,
                    parked_since: None,
                    conn,
                    ..
                } => {
                    if now - conn.since >= STALL_INTERVAL {
                        timed_out.push(*addr);
                    }
                }
                Peer::Connected { open: true, .. } => {}
            }
        }

        for addr in timed_out {
            debug!(target: "p2p", "{}: Session setup timed out", addr);
            self.disconnect(addr, DisconnectionReason::ResponseStalling);
        }
        for addr in expired_parks {
            debug!(target: "p2p", "{}: Existing session never closed, dropping duplicate", addr);
            self.disconnect(addr, DisconnectionReason::AlreadyConnected);
        }

        let due = self
            .plans
            .iter()
            .filter(|(_, plan)| plan.retry_at.map_or(false, |at| at <= now))
            .map(|(pk, _)| *pk)
            .collect::<Vec<_>>();

        for pub_key in due {
            if now - self.plans[&pub_key].started >= RETRY_MAX_PERIOD {
                self.fail_plan(
                    &pub_key,
                    Error::ConnectionRetriesMaxPeriodExceeded,
                    "maximum retry period exceeded",
                );
                continue;
            }
            // Retries redial the front of the list, which is the last
            // address that worked.
            if let Some(plan) = self.plans.get_mut(&pub_key) {
                plan.next = 0;
            }
            self.dial_next(&pub_key);
        }
    }

    /// Close every session and cancel every plan.
    pub fn shutdown(&mut self) {
        let addrs = self.peers_storage.keys().copied().collect::<Vec<_>>();
        for addr in addrs {
            self.disconnect(addr, DisconnectionReason::Shutdown);
        }

        let pks = self.plans.keys().copied().collect::<Vec<_>>();
        for pub_key in pks {
            self.fail_plan(&pub_key, Error::PoolClosed, "pool is shutting down");
        }
    }
}

enum DuplicateAction {
    DropNew,
    ParkNew,
}
