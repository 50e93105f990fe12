//! Socket-level networking core types.
//!
//! The protocol itself is a deterministic state machine ([`Machine`]); this
//! module defines the contract between it and the poll-based reactor that
//! performs the actual I/O. The state machine never touches a socket: it
//! emits [`Io`] instructions and the reactor carries them out.

use std::time::Duration;
use std::{borrow::Cow, fmt, io, net, sync::Arc};

use async_trait::async_trait;

pub use reactor::{Reactor, Waker};
pub use time::{LocalTime, Timers};

pub mod error;
pub mod reactor;
pub mod socket;
pub mod time;

/// A source of poll events.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Source {
    Peer(net::SocketAddr),
    Listener,
    Waker,
}

/// Link direction of the peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// Inbound connection.
    Inbound,
    /// Outbound connection.
    Outbound,
}

impl Link {
    /// Check whether the link is outbound.
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    /// Check whether the link is inbound.
    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

/// Output of a state transition of the state machine.
#[derive(Debug)]
pub enum Io<M, E, D> {
    /// There are some bytes ready to be sent to a peer.
    Write(net::SocketAddr, M),
    /// Connect to a peer.
    Connect(net::SocketAddr),
    /// Disconnect from a peer.
    Disconnect(net::SocketAddr, D),
    /// Ask for a wakeup in a specified amount of time.
    SetTimer(Duration),
    /// Emit an event.
    Event(E),
}

/// Disconnection event which includes the reason.
#[derive(Debug, Clone)]
pub enum Disconnect<T> {
    /// Error while dialing the remote. This error occurs before a connection
    /// is even established.
    DialError(Arc<std::io::Error>),
    /// Error with an underlying established connection.
    ConnectionError(Arc<std::io::Error>),
    /// The peer's send queue failed to drain within the allowed window.
    WriteStall,
    /// Peer was disconnected by the state machine.
    StateMachine(T),
}

impl<T> Disconnect<T> {
    pub fn is_dial_err(&self) -> bool {
        matches!(self, Self::DialError(_))
    }

    pub fn is_connection_err(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }

    pub fn is_write_stall(&self) -> bool {
        matches!(self, Self::WriteStall)
    }
}

impl<T: fmt::Display> fmt::Display for Disconnect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialError(err) => write!(f, "{}", err),
            Self::ConnectionError(err) => write!(f, "{}", err),
            Self::WriteStall => write!(f, "send queue stalled"),
            Self::StateMachine(reason) => write!(f, "{}", reason),
        }
    }
}

/// A service state machine implementing the network protocol's logic.
///
/// The machine emits [`Io`] instructions to the reactor via its [`Iterator`]
/// implementation.
#[async_trait]
pub trait Machine:
    Iterator<Item = Io<Vec<u8>, Self::Event, Self::DisconnectReason>> + Send
{
    /// Events emitted by the state machine, forwarded by the reactor for
    /// tracing.
    type Event: fmt::Debug + Send;
    /// Reason a peer was disconnected by the state machine itself.
    type DisconnectReason: fmt::Debug + fmt::Display + Send + Sync;

    /// Initialize the state machine. Called once, after the listener is
    /// bound and before any network event is delivered. `local_addr` is the
    /// resolved listen address, if we are listening.
    async fn initialize(&mut self, time: LocalTime, local_addr: Option<net::SocketAddr>);
    /// Called upon receiving bytes from a remote peer.
    async fn message_received(&mut self, addr: &net::SocketAddr, bytes: Cow<'_, [u8]>);
    /// An outbound connection attempt is underway. Always precedes
    /// [`Machine::connected`] for outbound links; inbound links go straight
    /// to `connected`.
    fn attempted(&mut self, addr: &net::SocketAddr);
    /// A connection with a peer was established. Returns `false` to refuse
    /// the connection.
    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link)
        -> bool;
    /// A peer socket was closed, either by a network event or by an
    /// [`Io::Disconnect`] instruction.
    async fn disconnected(&mut self, addr: &net::SocketAddr, reason: Disconnect<Self::DisconnectReason>);
    /// Called every time the event loop gets data from the network or times
    /// out. Updates the machine's internal clock.
    fn tick(&mut self, local_time: LocalTime);
    /// A timer set with [`Io::SetTimer`] has expired.
    async fn timer_expired(&mut self);
    /// The reactor is shutting down; emit farewells for all open peers.
    async fn shutdown(&mut self);
}

/// A network service drivable by the reactor: a [`Machine`] plus an external
/// command channel.
#[async_trait]
pub trait Service: Machine {
    /// Commands handled by the service, originating from user threads. They
    /// are passed through the reactor via the channel given to
    /// [`Reactor::run`].
    type Command: Send + Sync;

    /// An external command has been received.
    async fn command_received(&mut self, cmd: Self::Command);
}

/// Used to wake the event loop, for example after sending a command so that
/// it is processed in a timely fashion.
pub trait Wake: Send + Sync + Clone {
    fn wake(&self) -> io::Result<()>;
}
