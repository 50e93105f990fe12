//! The durable catalog of known nodes.
//!
//! Keyed by node public key; tracks addresses, reputation, and ban state.
//! Every mutation is written through to the [`Store`], best-effort: a store
//! failure is logged and the in-memory state stays authoritative for the
//! session.
use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use dexd_types::{NodeAddress, PubKey};

use crate::common::node::{alias, Node, Store};
use crate::error::Error;
use crate::fsm::output::Wire;

/// Score below which a node is banned automatically.
pub const BAN_THRESHOLD: i64 = -100;

/// A named, signed contribution to a node's long-term score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEvent {
    /// An operator-requested ban.
    ManualBan,
    /// The peer deviated from a swap protocol.
    SwapMisbehavior,
    /// The peer abused a swap to our detriment.
    SwapAbuse,
    /// The peer sent bytes that don't parse as frames.
    WireProtocolErr,
    /// The peer failed session authentication.
    InvalidAuth,
    /// A swap with the peer completed successfully.
    SwapSuccess,
}

impl ReputationEvent {
    /// The signed score delta for this event.
    pub fn delta(&self) -> i64 {
        match self {
            Self::ManualBan => i64::MIN,
            Self::SwapMisbehavior => -50,
            Self::SwapAbuse => -100,
            Self::WireProtocolErr => -10,
            Self::InvalidAuth => -20,
            Self::SwapSuccess => 1,
        }
    }
}

impl std::fmt::Display for ReputationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ManualBan => write!(f, "ManualBan"),
            Self::SwapMisbehavior => write!(f, "SwapMisbehavior"),
            Self::SwapAbuse => write!(f, "SwapAbuse"),
            Self::WireProtocolErr => write!(f, "WireProtocolErr"),
            Self::InvalidAuth => write!(f, "InvalidAuth"),
            Self::SwapSuccess => write!(f, "SwapSuccess"),
        }
    }
}

/// An event emitted by the node catalog.
#[derive(Debug, Clone)]
pub enum Event {
    /// A node was seen for the first time.
    Created(PubKey),
    /// A node crossed the ban threshold or was banned explicitly.
    Banned(PubKey),
    /// A node's ban was lifted.
    Unbanned(PubKey),
    /// A reputation event was applied.
    Reputation {
        pub_key: PubKey,
        event: ReputationEvent,
        score: i64,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Created(pk) => write!(f, "New node {}", pk),
            Event::Banned(pk) => write!(f, "Node {} is banned", pk),
            Event::Unbanned(pk) => write!(f, "Node {} is no longer banned", pk),
            Event::Reputation {
                pub_key,
                event,
                score,
            } => {
                write!(f, "{} applied to {}, score now {}", event, pub_key, score)
            }
        }
    }
}

/// In-memory catalog backed by a [`Store`].
pub struct NodeList<S, U> {
    store: S,
    nodes: HashMap<PubKey, Node>,
    /// Insertion order, for `for_each`.
    order: Vec<PubKey>,
    /// Alias handles. Collisions are possible and kept.
    aliases: HashMap<String, Vec<PubKey>>,
    /// Hosts of banned nodes, for the cheap pre-handshake inbound filter.
    banned_hosts: HashSet<String>,
    upstream: U,
}

impl<S: Store, U: Wire<Event>> NodeList<S, U> {
    pub fn new(store: S, upstream: U) -> Self {
        Self {
            store,
            nodes: HashMap::new(),
            order: Vec::new(),
            aliases: HashMap::new(),
            banned_hosts: HashSet::new(),
            upstream,
        }
    }

    /// One-shot bulk read at startup. Store failures leave the catalog
    /// empty.
    pub fn load(&mut self) -> usize {
        match self.store.load() {
            Ok(nodes) => {
                for node in nodes {
                    self.index(node);
                }
            }
            Err(err) => {
                warn!(target: "p2p", "Failed to load node catalog: {}", err);
            }
        }
        self.nodes.len()
    }

    fn index(&mut self, node: Node) {
        let pub_key = node.pub_key;

        if node.banned {
            for addr in &node.addresses {
                self.banned_hosts.insert(addr.host.clone());
            }
        }
        self.aliases.entry(alias(&pub_key)).or_default().push(pub_key);
        self.order.push(pub_key);
        self.nodes.insert(pub_key, node);
    }

    fn persist(&mut self, pub_key: &PubKey) {
        if let Some(node) = self.nodes.get(pub_key) {
            if let Err(err) = self.store.upsert(node) {
                warn!(target: "p2p", "Failed to persist node {}: {}", pub_key, err);
            }
        }
    }

    pub fn get(&self, pub_key: &PubKey) -> Option<&Node> {
        self.nodes.get(pub_key)
    }

    pub fn has(&self, pub_key: &PubKey) -> bool {
        self.nodes.contains_key(pub_key)
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    /// The node's ordinal in the catalog.
    pub fn get_id(&self, pub_key: &PubKey) -> Option<usize> {
        self.order.iter().position(|pk| pk == pub_key)
    }

    pub fn get_alias(&self, pub_key: &PubKey) -> Option<String> {
        self.has(pub_key).then(|| alias(pub_key))
    }

    /// Resolve an alias back to a key. Fails when the alias is unknown or
    /// ambiguous.
    pub fn pub_key_for_alias(&self, alias: &str) -> Result<PubKey, Error> {
        match self.aliases.get(alias).map(Vec::as_slice) {
            Some([pub_key]) => Ok(*pub_key),
            _ => Err(Error::NodeNotFound),
        }
    }

    /// Insert a new node. Returns `false` if it was already present.
    pub fn create_node(&mut self, pub_key: PubKey, addresses: Vec<NodeAddress>) -> bool {
        if self.has(&pub_key) {
            return false;
        }
        self.index(Node::new(pub_key, addresses));
        self.upstream.event(Event::Created(pub_key));
        self.persist(&pub_key);

        true
    }

    /// Replace a node's address set, preserving `last_connected` on entries
    /// that survive the replacement.
    pub fn update_addresses(
        &mut self,
        pub_key: &PubKey,
        addresses: Vec<NodeAddress>,
        last_address: Option<NodeAddress>,
    ) -> Result<(), Error> {
        let node = self.nodes.get_mut(pub_key).ok_or(Error::NodeNotFound)?;

        let previous = std::mem::take(&mut node.addresses);
        node.addresses = dexd_types::address::dedup(addresses)
            .into_iter()
            .map(|mut addr| {
                if addr.last_connected.is_none() {
                    if let Some(old) = previous.iter().find(|a| a.same_endpoint(&addr)) {
                        addr.last_connected = old.last_connected;
                    }
                }
                addr
            })
            .collect();
        if let Some(last) = last_address {
            node.last_address = Some(last);
        }
        self.persist(pub_key);

        Ok(())
    }

    /// Record a successful handshake over `address`.
    pub fn record_connected(
        &mut self,
        pub_key: &PubKey,
        mut address: NodeAddress,
        now_secs: u64,
    ) -> Result<(), Error> {
        let node = self.nodes.get_mut(pub_key).ok_or(Error::NodeNotFound)?;

        address.last_connected = Some(now_secs);
        node.addresses.retain(|a| !a.same_endpoint(&address));
        node.addresses.insert(0, address.clone());
        node.last_address = Some(address);
        self.persist(pub_key);

        Ok(())
    }

    /// Prune an address that turned out to be unreachable.
    pub fn remove_address(&mut self, pub_key: &PubKey, address: &NodeAddress) -> Result<(), Error> {
        let node = self.nodes.get_mut(pub_key).ok_or(Error::NodeNotFound)?;

        node.addresses.retain(|a| !a.same_endpoint(address));
        if node.last_address.as_ref() == Some(address) {
            node.last_address = None;
        }
        self.persist(pub_key);

        Ok(())
    }

    /// Apply a reputation event. Returns `true` if the node was banned as a
    /// result.
    pub fn add_reputation_event(
        &mut self,
        pub_key: &PubKey,
        event: ReputationEvent,
    ) -> Result<bool, Error> {
        let node = self.nodes.get_mut(pub_key).ok_or(Error::NodeNotFound)?;

        node.reputation_score = node.reputation_score.saturating_add(event.delta());
        let score = node.reputation_score;

        self.upstream.event(Event::Reputation {
            pub_key: *pub_key,
            event,
            score,
        });

        let newly_banned = !node.banned && score < BAN_THRESHOLD;
        if newly_banned {
            debug!(target: "p2p", "Node {} fell below the ban threshold ({})", pub_key, score);
            self.set_banned(pub_key, true);
            self.upstream.event(Event::Banned(*pub_key));
        }
        self.persist(pub_key);

        Ok(newly_banned)
    }

    /// Ban a node explicitly.
    pub fn ban(&mut self, pub_key: &PubKey) -> Result<(), Error> {
        let node = self.nodes.get(pub_key).ok_or(Error::NodeNotFound)?;
        if node.banned {
            return Err(Error::NodeAlreadyBanned);
        }
        self.set_banned(pub_key, true);
        self.upstream.event(Event::Banned(*pub_key));
        self.persist(pub_key);

        Ok(())
    }

    /// Lift a node's ban. A score beneath the threshold is reset, otherwise
    /// the next reputation event would re-ban immediately.
    pub fn unban(&mut self, pub_key: &PubKey) -> Result<(), Error> {
        let node = self.nodes.get_mut(pub_key).ok_or(Error::NodeNotFound)?;
        if !node.banned {
            return Err(Error::NodeNotBanned);
        }
        if node.reputation_score < BAN_THRESHOLD {
            node.reputation_score = 0;
        }
        self.set_banned(pub_key, false);
        self.upstream.event(Event::Unbanned(*pub_key));
        self.persist(pub_key);

        Ok(())
    }

    fn set_banned(&mut self, pub_key: &PubKey, banned: bool) {
        let Some(node) = self.nodes.get_mut(pub_key) else {
            return;
        };
        node.banned = banned;

        for addr in &node.addresses {
            if banned {
                self.banned_hosts.insert(addr.host.clone());
            } else {
                self.banned_hosts.remove(&addr.host);
            }
        }
    }

    pub fn is_banned(&self, pub_key: &PubKey) -> bool {
        self.nodes.get(pub_key).map_or(false, |n| n.banned)
    }

    /// Pre-handshake filter: whether an inbound host belongs to a banned
    /// node.
    pub fn is_banned_host(&self, host: &str) -> bool {
        self.banned_hosts.contains(host)
    }

    pub fn reputation(&self, pub_key: &PubKey) -> i64 {
        self.nodes.get(pub_key).map_or(0, |n| n.reputation_score)
    }

    /// Visit nodes in insertion order.
    pub fn for_each<F: FnMut(&Node)>(&self, mut visitor: F) {
        for pub_key in &self.order {
            if let Some(node) = self.nodes.get(pub_key) {
                visitor(node);
            }
        }
    }
}

impl<S: Store, U: Wire<Event>> crate::common::node::Directory for NodeList<S, U> {
    fn is_banned(&self, pub_key: &PubKey) -> bool {
        NodeList::is_banned(self, pub_key)
    }

    fn reputation(&self, pub_key: &PubKey) -> i64 {
        NodeList::reputation(self, pub_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::nodes::MemoryStore;
    use crate::fsm::output::Outbox;

    fn list() -> NodeList<MemoryStore, Outbox> {
        NodeList::new(MemoryStore::default(), Outbox::default())
    }

    fn key(fill: u8) -> PubKey {
        PubKey::new([fill; 33])
    }

    #[test]
    fn create_is_idempotent() {
        let mut nodes = list();
        let pk = key(1);

        assert!(nodes.create_node(pk, vec![NodeAddress::new("10.0.0.1", 9735)]));
        assert!(!nodes.create_node(pk, vec![]));
        assert_eq!(nodes.count(), 1);
    }

    #[test]
    fn reputation_cascade_bans() {
        let mut nodes = list();
        let pk = key(2);
        nodes.create_node(pk, vec![NodeAddress::new("10.0.0.2", 9735)]);

        // -100 exactly does not ban; the threshold must be crossed.
        assert!(!nodes
            .add_reputation_event(&pk, ReputationEvent::SwapAbuse)
            .unwrap());
        assert!(!nodes.is_banned(&pk));

        // Another -20 crosses it.
        assert!(nodes
            .add_reputation_event(&pk, ReputationEvent::InvalidAuth)
            .unwrap());
        assert!(nodes.is_banned(&pk));
        assert!(nodes.is_banned_host("10.0.0.2"));

        // Already banned: further events don't re-ban.
        assert!(!nodes
            .add_reputation_event(&pk, ReputationEvent::WireProtocolErr)
            .unwrap());
    }

    #[test]
    fn manual_ban_saturates() {
        let mut nodes = list();
        let pk = key(3);
        nodes.create_node(pk, vec![]);

        assert!(nodes
            .add_reputation_event(&pk, ReputationEvent::ManualBan)
            .unwrap());
        assert!(nodes.is_banned(&pk));
    }

    #[test]
    fn ban_unban_round_trips() {
        let mut nodes = list();
        let pk = key(4);
        nodes.create_node(pk, vec![NodeAddress::new("10.0.0.4", 9735)]);
        nodes
            .add_reputation_event(&pk, ReputationEvent::SwapSuccess)
            .unwrap();
        let score = nodes.reputation(&pk);

        nodes.ban(&pk).unwrap();
        assert_eq!(nodes.ban(&pk), Err(Error::NodeAlreadyBanned));
        assert!(nodes.is_banned_host("10.0.0.4"));

        nodes.unban(&pk).unwrap();
        assert_eq!(nodes.unban(&pk), Err(Error::NodeNotBanned));

        // Indistinguishable from before, score included.
        assert!(!nodes.is_banned(&pk));
        assert!(!nodes.is_banned_host("10.0.0.4"));
        assert_eq!(nodes.reputation(&pk), score);
    }

    #[test]
    fn address_replacement_preserves_last_connected() {
        let mut nodes = list();
        let pk = key(5);
        nodes.create_node(pk, vec![NodeAddress::new("10.0.0.5", 9735)]);
        nodes
            .record_connected(&pk, NodeAddress::new("10.0.0.5", 9735), 1_700_000_000)
            .unwrap();

        nodes
            .update_addresses(
                &pk,
                vec![
                    NodeAddress::new("10.0.0.5", 9735),
                    NodeAddress::new("10.0.0.6", 9735),
                ],
                None,
            )
            .unwrap();

        let node = nodes.get(&pk).unwrap();
        let kept = node
            .addresses
            .iter()
            .find(|a| a.host == "10.0.0.5")
            .unwrap();

        assert_eq!(kept.last_connected, Some(1_700_000_000));
        assert_eq!(node.addresses.len(), 2);
        assert_eq!(
            node.last_address.as_ref().map(|a| a.host.as_str()),
            Some("10.0.0.5")
        );
    }

    #[test]
    fn for_each_visits_in_insertion_order() {
        let mut nodes = list();
        for fill in [9u8, 3, 7] {
            nodes.create_node(key(fill), vec![]);
        }

        let mut seen = Vec::new();
        nodes.for_each(|n| seen.push(n.pub_key));

        assert_eq!(seen, vec![key(9), key(3), key(7)]);
    }

    #[test]
    fn alias_resolution() {
        let mut nodes = list();
        let pk = key(6);
        nodes.create_node(pk, vec![]);

        let alias = nodes.get_alias(&pk).unwrap();
        assert_eq!(nodes.pub_key_for_alias(&alias), Ok(pk));
        assert_eq!(
            nodes.pub_key_for_alias("NoSuchAlias"),
            Err(Error::NodeNotFound)
        );
    }

    #[test]
    fn remove_address_clears_last_address() {
        let mut nodes = list();
        let pk = key(7);
        let addr = NodeAddress::new("10.0.0.7", 9735);
        nodes.create_node(pk, vec![addr.clone()]);
        nodes.record_connected(&pk, addr.clone(), 100).unwrap();

        nodes.remove_address(&pk, &addr).unwrap();

        let node = nodes.get(&pk).unwrap();
        assert!(node.addresses.is_empty());
        assert!(node.last_address.is_none());
    }
}
