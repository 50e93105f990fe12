//! A node's self-declared capabilities.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::address::{self, NodeAddress};

/// The capability payload a node advertises during the handshake and keeps
/// current with `NodeStateUpdate` packets: listening addresses, supported
/// trading pairs, and identifiers for its auxiliary chain infrastructure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub addresses: Vec<NodeAddress>,
    pub pairs: Vec<String>,
    /// Auxiliary chain node identifiers, keyed by currency.
    pub aux_identifiers: BTreeMap<String, String>,
    /// Auxiliary chain public keys, keyed by currency.
    pub aux_pub_keys: BTreeMap<String, String>,
    /// Auxiliary chain connection URIs, keyed by currency.
    pub aux_uris: BTreeMap<String, Vec<String>>,
    /// On-chain token identifiers, keyed by currency.
    pub token_identifiers: BTreeMap<String, String>,
}

impl NodeState {
    /// Drop duplicate advertised addresses, keeping first occurrences.
    pub fn sanitize(mut self) -> Self {
        self.addresses = address::dedup(self.addresses);
        self
    }

    pub fn has_pair(&self, pair_id: &str) -> bool {
        self.pairs.iter().any(|p| p == pair_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_dedups_addresses() {
        let state = NodeState {
            addresses: vec![
                NodeAddress::new("10.0.0.1", 9735),
                NodeAddress::new("10.0.0.1", 9735),
                NodeAddress::new("10.0.0.2", 9735),
            ],
            ..NodeState::default()
        }
        .sanitize();

        assert_eq!(state.addresses.len(), 2);
    }

    #[test]
    fn pair_lookup() {
        let state = NodeState {
            pairs: vec!["LTC/BTC".into()],
            ..NodeState::default()
        };

        assert!(state.has_pair("LTC/BTC"));
        assert!(!state.has_pair("ETH/BTC"));
    }
}
