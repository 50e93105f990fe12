//! Pool handles are created from the client by users of the library, to
//! communicate with the running pool.
use std::net::SocketAddr;

use async_trait::async_trait;
use flume as chan;
use thiserror::Error;

use dexd_types::{DisconnectionReason, NodeAddress, Order, OrderPortion, Packet, PubKey};

use crate::fsm::handler::Command;
use crate::fsm::nodelist::ReputationEvent;
use crate::fsm::peermgr::PeerInfo;
use crate::net::reactor;
use crate::net::Wake;

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The pool rejected the operation.
    #[error(transparent)]
    Pool(#[from] crate::error::Error),
    /// The command channel disconnected.
    #[error("command channel disconnected")]
    Disconnected,
    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::Disconnected
    }
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Disconnected
    }
}

/// A handle for communicating with the running pool.
#[async_trait]
pub trait Handle: Sized + Send + Sync + Clone {
    /// Open an outbound connection, returning the admitted peer.
    async fn add_outbound(
        &self,
        pub_key: PubKey,
        address: Option<NodeAddress>,
        retry: bool,
        revoke_pending: bool,
    ) -> Result<PeerInfo, Error>;

    /// Cancel pending connection retries for a node.
    async fn revoke_connection_retries(&self, pub_key: PubKey) -> Result<(), Error>;

    /// Close an open peer session.
    async fn close_peer(
        &self,
        pub_key: PubKey,
        reason: Option<DisconnectionReason>,
    ) -> Result<(), Error>;

    /// Ban a node, closing its session.
    async fn ban_node(&self, pub_key: PubKey) -> Result<(), Error>;

    /// Lift a ban, optionally reconnecting right away.
    async fn unban_node(&self, pub_key: PubKey, reconnect: bool) -> Result<(), Error>;

    /// Ask a peer for its known nodes.
    async fn discover_nodes(&self, pub_key: PubKey) -> Result<(), Error>;

    /// Apply a reputation event to a node.
    async fn add_reputation_event(
        &self,
        pub_key: PubKey,
        event: ReputationEvent,
    ) -> Result<(), Error>;

    /// Send a packet to one peer.
    async fn send_to_peer(&self, pub_key: PubKey, packet: Packet) -> Result<(), Error>;

    /// Send an order to every peer trading its pair. Returns the recipients.
    async fn broadcast_order(&self, order: Order) -> Result<Vec<PubKey>, Error>;

    /// Invalidate part of an order network-wide.
    async fn broadcast_order_invalidation(
        &self,
        portion: OrderPortion,
        exclude: Option<PubKey>,
    ) -> Result<Vec<PubKey>, Error>;

    /// Get one peer's info, if connected.
    async fn get_peer(&self, pub_key: PubKey) -> Result<Option<PeerInfo>, Error>;

    /// List open peers.
    async fn list_peers(&self) -> Result<Vec<PeerInfo>, Error>;

    /// Replace the set of pairs we advertise.
    async fn update_pairs(&self, pairs: Vec<String>) -> Result<(), Error>;

    /// Update one currency's auxiliary advertised state.
    async fn update_aux_state(
        &self,
        currency: String,
        identifier: Option<String>,
        pub_key: Option<String>,
        uris: Option<Vec<String>>,
        token_identifier: Option<String>,
    ) -> Result<(), Error>;

    /// Resolve an alias to a node key.
    async fn resolve_alias(&self, alias: String) -> Result<PubKey, Error>;
}

/// The concrete handle backed by the reactor's command channel.
#[derive(Clone)]
pub struct PoolHandle {
    pub(crate) commands: chan::Sender<Command>,
    pub(crate) waker: reactor::Waker,
    /// Announces the bound listen address once the reactor is up.
    pub listening: chan::Receiver<SocketAddr>,
}

impl PoolHandle {
    /// Send a command to the command channel, and wake up the event loop.
    async fn command(&self, cmd: Command) -> Result<(), Error> {
        self.commands.send_async(cmd).await?;
        self.waker.wake()?;

        Ok(())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(chan::Sender<T>) -> Command + Send,
    ) -> Result<T, Error> {
        let (reply, receive) = chan::bounded(1);
        self.command(build(reply)).await?;

        Ok(receive.recv_async().await?)
    }
}

#[async_trait]
impl Handle for PoolHandle {
    async fn add_outbound(
        &self,
        pub_key: PubKey,
        address: Option<NodeAddress>,
        retry: bool,
        revoke_pending: bool,
    ) -> Result<PeerInfo, Error> {
        let info = self
            .request(|reply| Command::Connect {
                pub_key,
                address,
                retry,
                revoke_pending,
                reply,
            })
            .await??;

        Ok(info)
    }

    async fn revoke_connection_retries(&self, pub_key: PubKey) -> Result<(), Error> {
        self.command(Command::RevokeRetries { pub_key }).await
    }

    async fn close_peer(
        &self,
        pub_key: PubKey,
        reason: Option<DisconnectionReason>,
    ) -> Result<(), Error> {
        Ok(self
            .request(|reply| Command::ClosePeer {
                pub_key,
                reason,
                reply,
            })
            .await??)
    }

    async fn ban_node(&self, pub_key: PubKey) -> Result<(), Error> {
        Ok(self
            .request(|reply| Command::Ban { pub_key, reply })
            .await??)
    }

    async fn unban_node(&self, pub_key: PubKey, reconnect: bool) -> Result<(), Error> {
        Ok(self
            .request(|reply| Command::Unban {
                pub_key,
                reconnect,
                reply,
            })
            .await??)
    }

    async fn discover_nodes(&self, pub_key: PubKey) -> Result<(), Error> {
        Ok(self
            .request(|reply| Command::DiscoverNodes { pub_key, reply })
            .await??)
    }

    async fn add_reputation_event(
        &self,
        pub_key: PubKey,
        event: ReputationEvent,
    ) -> Result<(), Error> {
        Ok(self
            .request(|reply| Command::Reputation {
                pub_key,
                event,
                reply,
            })
            .await??)
    }

    async fn send_to_peer(&self, pub_key: PubKey, packet: Packet) -> Result<(), Error> {
        Ok(self
            .request(|reply| Command::SendToPeer {
                pub_key,
                packet,
                reply,
            })
            .await??)
    }

    async fn broadcast_order(&self, order: Order) -> Result<Vec<PubKey>, Error> {
        self.request(|reply| Command::BroadcastOrder { order, reply })
            .await
    }

    async fn broadcast_order_invalidation(
        &self,
        portion: OrderPortion,
        exclude: Option<PubKey>,
    ) -> Result<Vec<PubKey>, Error> {
        self.request(|reply| Command::BroadcastOrderInvalidation {
            portion,
            exclude,
            reply,
        })
        .await
    }

    async fn get_peer(&self, pub_key: PubKey) -> Result<Option<PeerInfo>, Error> {
        self.request(|reply| Command::GetPeer { pub_key, reply })
            .await
    }

    async fn list_peers(&self) -> Result<Vec<PeerInfo>, Error> {
        self.request(|reply| Command::ListPeers { reply }).await
    }

    async fn update_pairs(&self, pairs: Vec<String>) -> Result<(), Error> {
        self.command(Command::UpdatePairs { pairs }).await
    }

    async fn update_aux_state(
        &self,
        currency: String,
        identifier: Option<String>,
        pub_key: Option<String>,
        uris: Option<Vec<String>>,
        token_identifier: Option<String>,
    ) -> Result<(), Error> {
        self.command(Command::UpdateAuxState {
            currency,
            identifier,
            pub_key,
            uris,
            token_identifier,
        })
        .await
    }

    async fn resolve_alias(&self, alias: String) -> Result<PubKey, Error> {
        Ok(self
            .request(|reply| Command::ResolveAlias { alias, reply })
            .await??)
    }
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Handle {}

    impl Clone for Handle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Handle for Handle {
        async fn add_outbound(
            &self,
            pub_key: PubKey,
            address: Option<NodeAddress>,
            retry: bool,
            revoke_pending: bool,
        ) -> Result<PeerInfo, Error>;
        async fn revoke_connection_retries(&self, pub_key: PubKey) -> Result<(), Error>;
        async fn close_peer(
            &self,
            pub_key: PubKey,
            reason: Option<DisconnectionReason>,
        ) -> Result<(), Error>;
        async fn ban_node(&self, pub_key: PubKey) -> Result<(), Error>;
        async fn unban_node(&self, pub_key: PubKey, reconnect: bool) -> Result<(), Error>;
        async fn discover_nodes(&self, pub_key: PubKey) -> Result<(), Error>;
        async fn add_reputation_event(
            &self,
            pub_key: PubKey,
            event: ReputationEvent,
        ) -> Result<(), Error>;
        async fn send_to_peer(&self, pub_key: PubKey, packet: Packet) -> Result<(), Error>;
        async fn broadcast_order(&self, order: Order) -> Result<Vec<PubKey>, Error>;
        async fn broadcast_order_invalidation(
            &self,
            portion: OrderPortion,
            exclude: Option<PubKey>,
        ) -> Result<Vec<PubKey>, Error>;
        async fn get_peer(&self, pub_key: PubKey) -> Result<Option<PeerInfo>, Error>;
        async fn list_peers(&self) -> Result<Vec<PeerInfo>, Error>;
        async fn update_pairs(&self, pairs: Vec<String>) -> Result<(), Error>;
        async fn update_aux_state(
            &self,
            currency: String,
            identifier: Option<String>,
            pub_key: Option<String>,
            uris: Option<Vec<String>>,
            token_identifier: Option<String>,
        ) -> Result<(), Error>;
        async fn resolve_alias(&self, alias: String) -> Result<PubKey, Error>;
    }
}
