//! Shared types for the dexd overlay trading network.
//!
//! Everything both ends of a peer session must agree on lives here: node
//! public keys, network addresses, advertised node state, and the wire
//! packet taxonomy with its encoding.

pub mod address;
pub mod messages;
pub mod node_state;
pub mod pubkey;

pub use address::NodeAddress;
pub use messages::p2p::{
    DisconnectionReason, Hello, NodeEntry, Order, OrderPortion, Packet, PacketBody, PacketHeader,
    PacketType, SanitySwapInit, SwapAccepted, SwapFailed, SwapRequest,
};
pub use node_state::NodeState;
pub use pubkey::PubKey;
