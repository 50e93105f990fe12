//! Persistent node records.

use std::io;

use bitcoin::hashes::{sha256, Hash};
use serde::{Deserialize, Serialize};

use dexd_types::{address, NodeAddress, PubKey};

/// A known node: the durable identity behind any number of peer sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub pub_key: PubKey,
    /// Known addresses, most recently connected first.
    pub addresses: Vec<NodeAddress>,
    /// The last address that yielded a successful handshake.
    pub last_address: Option<NodeAddress>,
    pub reputation_score: i64,
    pub banned: bool,
}

impl Node {
    pub fn new(pub_key: PubKey, addresses: Vec<NodeAddress>) -> Self {
        Self {
            pub_key,
            addresses: address::dedup(addresses),
            last_address: None,
            reputation_score: 0,
            banned: false,
        }
    }

    /// Addresses in the order connection attempts should try them:
    /// `last_address` first, then the rest by `last_connected` descending,
    /// skipping any equal to `last_address`.
    pub fn connect_order(&self) -> Vec<NodeAddress> {
        let mut rest = self
            .addresses
            .iter()
            .filter(|a| Some(*a) != self.last_address.as_ref())
            .cloned()
            .collect::<Vec<_>>();
        address::sort_by_last_connected(&mut rest);

        let mut out = Vec::with_capacity(rest.len() + 1);
        if let Some(last) = &self.last_address {
            out.push(last.clone());
        }
        out.extend(rest);
        out
    }
}

/// Node storage.
///
/// The catalog persists through this interface on every mutation.
/// Persistence is best-effort: callers log store failures and carry on with
/// the in-memory state.
pub trait Store {
    /// One-shot bulk read at startup.
    fn load(&mut self) -> io::Result<Vec<Node>>;

    /// Insert or replace a node record.
    fn upsert(&mut self, node: &Node) -> io::Result<()>;

    /// Remove a node record.
    fn remove(&mut self, pub_key: &PubKey) -> io::Result<()>;
}

/// Read-only view of the node catalog, used by the session manager during
/// admission checks.
pub trait Directory {
    fn is_banned(&self, pub_key: &PubKey) -> bool;
    fn reputation(&self, pub_key: &PubKey) -> i64;
}

const ADJECTIVES: &[&str] = &[
    "Amber", "Bold", "Brisk", "Calm", "Civil", "Crisp", "Deft", "Eager", "Fleet", "Frank", "Grand",
    "Hardy", "Keen", "Lucid", "Merry", "Noble", "Pale", "Plain", "Proud", "Quick", "Quiet",
    "Rapid", "Sage", "Sharp", "Sleek", "Solid", "Stark", "Stern", "Swift", "Terse", "Vivid",
    "Wise",
];

const NOUNS: &[&str] = &[
    "Auk", "Bison", "Crane", "Dingo", "Egret", "Finch", "Gecko", "Heron", "Ibis", "Jay", "Kite",
    "Lemur", "Mole", "Newt", "Otter", "Pika", "Quail", "Raven", "Shrew", "Tern", "Urial", "Vole",
    "Wren", "Xerus", "Yak", "Zebu", "Falcon", "Badger", "Condor", "Dunlin", "Ermine", "Fulmar",
];

/// Derive the deterministic human-readable handle for a public key.
pub fn alias(pub_key: &PubKey) -> String {
    let digest = sha256::Hash::hash(pub_key.as_bytes());
    let bytes = digest.as_byte_array();

    format!(
        "{}{}{}",
        ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()],
        NOUNS[bytes[1] as usize % NOUNS.len()],
        hex::encode(&bytes[2..4]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_is_deterministic() {
        let key = PubKey::new([0xaa; 33]);

        assert_eq!(alias(&key), alias(&key));
        assert_ne!(alias(&key), alias(&PubKey::new([0xbb; 33])));
    }

    #[test]
    fn connect_order_tries_last_address_first() {
        let mut node = Node::new(
            PubKey::new([1; 33]),
            vec![
                NodeAddress::new("10.0.0.1", 1),
                NodeAddress {
                    last_connected: Some(50),
                    ..NodeAddress::new("10.0.0.2", 2)
                },
                NodeAddress {
                    last_connected: Some(90),
                    ..NodeAddress::new("10.0.0.3", 3)
                },
            ],
        );
        node.last_address = Some(NodeAddress::new("10.0.0.2", 2));

        let order = node.connect_order();
        let ports = order.iter().map(|a| a.port).collect::<Vec<_>>();

        // Last address first, then most recently connected, then the rest.
        assert_eq!(ports, vec![2, 3, 1]);
    }
}
