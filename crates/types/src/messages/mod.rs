//! Wire messages exchanged between peers.

pub mod p2p;
