//! The dexd peer pool.
//!
//! The pool discovers, connects to, authenticates, tracks, and exchanges
//! framed messages with other nodes on the overlay trading network. It is
//! the sole module through which higher-level subsystems (order book, swap
//! engine, RPC surface) interact with remote nodes.
//!
//! The protocol logic lives in [`fsm`] as a deterministic, I/O-free state
//! machine; [`net`] houses the poll-based reactor that drives it; [`client`]
//! wraps both in a tokio-facing API with a command [`client::handle::Handle`]
//! and typed [`events`] subscriptions.
#![allow(clippy::type_complexity)]

pub mod client;
pub mod common;
pub mod error;
pub mod events;
pub mod fsm;
pub mod net;

pub use client::{PoolClient, PoolConfig};
pub use common::identity::NodeKey;
pub use common::node::{Node, Store};
pub use error::Error;
pub use events::{Events, NodeEvent, PacketEvent, PeerEvent};
pub use fsm::nodelist::ReputationEvent;
pub use fsm::peermgr::PeerInfo;
