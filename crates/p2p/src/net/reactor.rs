//! Poll-based reactor. This is a single-threaded reactor using a `poll` loop.
use std::collections::{HashMap, HashSet};
use std::io;
use std::io::Read;
use std::net;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time;
use std::time::SystemTime;

use flume as chan;
use popol::Event;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::net::error::Error;
use crate::net::socket::Socket;
use crate::net::{Disconnect, Io, Link, LocalTime, Service, Source, Timers, Wake};

/// Maximum time to wait when reading from a socket.
const READ_TIMEOUT: time::Duration = time::Duration::from_secs(6);
/// Maximum time to wait when writing to a socket.
const WRITE_TIMEOUT: time::Duration = time::Duration::from_secs(3);
/// Maximum amount of time to wait for i/o.
const WAIT_TIMEOUT: time::Duration = time::Duration::from_secs(5);
/// Time a peer's send queue may fail to drain before the peer is dropped.
const WRITE_STALL_TIMEOUT: time::Duration = time::Duration::from_secs(10);
/// Two timer deadlines closer than this are merged.
const TIMER_RESOLUTION: time::Duration = time::Duration::from_secs(1);
/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 1024 * 192;

/// Wakes the event loop from other threads.
#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    fn new(sources: &mut popol::Sources<Source>) -> io::Result<Self> {
        let waker = Arc::new(popol::Waker::new(sources, Source::Waker)?);

        Ok(Self(waker))
    }
}

impl Wake for Waker {
    fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// A single-threaded non-blocking reactor.
pub struct Reactor {
    peers: HashMap<SocketAddr, Socket<net::TcpStream>>,
    connecting: HashSet<SocketAddr>,
    sources: popol::Sources<Source>,
    waker: Waker,
    timers: Timers,
    listening: chan::Sender<net::SocketAddr>,
}

impl Reactor {
    /// Construct a new reactor, given a channel on which to announce the
    /// bound listen address.
    pub fn new(listening: chan::Sender<net::SocketAddr>) -> Result<Self, io::Error> {
        let peers = HashMap::new();

        let mut sources = popol::Sources::new();
        let waker = Waker::new(&mut sources)?;
        let timers = Timers::new(TIMER_RESOLUTION);
        let connecting = HashSet::new();

        Ok(Self {
            peers,
            connecting,
            sources,
            waker,
            timers,
            listening,
        })
    }

    /// Return a new waker.
    ///
    /// Used to wake up the main event loop.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Register a peer with the reactor.
    fn register_peer(&mut self, addr: SocketAddr, stream: net::TcpStream, link: Link) {
        self.sources
            .register(Source::Peer(addr), &stream, popol::interest::ALL);
        self.peers.insert(addr, Socket::from(stream, addr, link));
    }

    /// Unregister a peer from the reactor.
    async fn unregister_peer<S>(
        &mut self,
        addr: SocketAddr,
        reason: Disconnect<S::DisconnectReason>,
        service: &mut S,
    ) where
        S: Service,
    {
        self.connecting.remove(&addr);
        self.peers.remove(&addr);
        self.sources.unregister(&Source::Peer(addr));

        service.disconnected(&addr, reason).await;
    }

    /// Run the given service with the reactor.
    pub async fn run<S>(
        &mut self,
        listen_addr: Option<&SocketAddr>,
        mut service: S,
        commands: chan::Receiver<S::Command>,
        cancellation: CancellationToken,
    ) -> Result<(), Error>
    where
        S: Service + Send + Sync,
    {
        let mut local_addr = None;
        let listener = match listen_addr {
            Some(addr) => {
                let listener = listen(addr).map_err(|source| Error::Listen {
                    addr: *addr,
                    source,
                })?;
                let bound = listener.local_addr().map_err(|source| Error::Listen {
                    addr: *addr,
                    source,
                })?;

                self.sources
                    .register(Source::Listener, &listener, popol::interest::READ);
                self.listening.send_async(bound).await.ok();

                debug!(target: "net", "Listening for incoming connections on {}", bound);

                local_addr = Some(bound);
                Some(listener)
            }
            None => None,
        };

        let local_time = SystemTime::now().into();
        service.initialize(local_time, local_addr).await;

        self.process(&mut service, local_time).await;

        // I/O readiness events populated by `popol::Sources::wait_timeout`.
        let mut events = Vec::with_capacity(32);

        loop {
            select! {
                _ = cancellation.cancelled() => {
                    trace!(target: "net", "Reactor cancelled");

                    service.shutdown().await;
                    let local_time = SystemTime::now().into();
                    self.process(&mut service, local_time).await;

                    // Best-effort delivery of farewell frames.
                    for socket in self.peers.values_mut() {
                        socket.flush().ok();
                    }
                    break Ok(());
                }
                result = self.handle(&mut events, &mut service, &commands, &listener) => {
                    if let Err(e) = result {
                        break Err(e);
                    }
                }
            }
        }
    }

    async fn handle<S>(
        &mut self,
        events: &mut Vec<Event<Source>>,
        service: &mut S,
        commands: &chan::Receiver<S::Command>,
        listener: &Option<net::TcpListener>,
    ) -> Result<(), Error>
    where
        S: Service + Send + Sync,
    {
        tokio::task::yield_now().await;

        let wait = self
            .timers
            .next_wait(LocalTime::now())
            .unwrap_or(WAIT_TIMEOUT)
            .min(WAIT_TIMEOUT);

        trace!(
            target: "net",
            "Polling {} source(s) and {} timer(s), waking up in {:?}..",
            self.sources.len(),
            self.timers.len(),
            wait,
        );

        let result = self.sources.wait_timeout(events, wait); // Blocking.
        let local_time = SystemTime::now().into();

        service.tick(local_time);

        match result {
            Ok(n) => {
                trace!(target: "net", "Woke up with {n} source(s) ready");

                for event in events.drain(..) {
                    match &event.key {
                        Source::Peer(addr) => {
                            let addr = *addr;

                            if event.is_error() || event.is_hangup() {
                                // Let the subsequent read fail.
                                trace!(target: "net", "{}: Socket error triggered: {:?}", addr, event);
                            }
                            if event.is_invalid() {
                                // File descriptor was closed and is invalid.
                                // Nb. This shouldn't happen. It means the source wasn't
                                // properly unregistered, or there is a duplicate source.
                                error!(target: "net", "{}: Socket is invalid, removing", addr);

                                self.sources.unregister(&event.key);
                                continue;
                            }

                            if event.is_writable() {
                                self.handle_writable(addr, &event.key, service).await;
                            }
                            if event.is_readable() {
                                self.handle_readable(addr, service).await;
                            }
                        }
                        Source::Listener => self.handle_incoming(listener, service).await,
                        Source::Waker => {
                            trace!(target: "net", "Woken up by waker ({} command(s))", commands.len());

                            popol::Waker::reset(event.source).ok();

                            while let Ok(cmd) = commands.try_recv() {
                                service.command_received(cmd).await;
                            }
                        }
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => return Err(Error::Poll(err)),
        }

        // Nb. Which deadline fired is irrelevant; as long as something is
        // due, the service gets its wake-up and sweeps everything.
        if self.timers.expire(local_time) > 0 {
            service.timer_expired().await;
        }

        self.sweep_write_stalls(service, local_time).await;
        self.process(service, local_time).await;

        Ok(())
    }

    /// Process service state machine outputs.
    async fn process<S>(&mut self, service: &mut S, local_time: LocalTime)
    where
        S: Service,
    {
        // Note that there may be messages destined for a peer that has since
        // been disconnected.
        while let Some(out) = service.next() {
            match out {
                Io::Write(addr, bytes) => {
                    if let Some((socket, source)) = self.peers.get_mut(&addr).and_then(|socket| {
                        self.sources
                            .get_mut(&Source::Peer(addr))
                            .map(|source| (socket, source))
                    }) {
                        socket.push(&bytes, local_time);
                        source.set(popol::interest::WRITE);
                    }
                }
                Io::Connect(addr) => {
                    match dial(&addr) {
                        Ok(stream) => {
                            trace!(target: "net", "{}: Dialing peer", addr);

                            self.register_peer(addr, stream, Link::Outbound);
                            self.connecting.insert(addr);

                            service.attempted(&addr);
                        }
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                            // Ignore. We are already establishing a connection
                            // through this socket.
                        }
                        Err(err) => {
                            error!(target: "net", "{}: Dial error: {}", addr, err.to_string());

                            service
                                .disconnected(&addr, Disconnect::DialError(Arc::new(err)))
                                .await;
                        }
                    }
                }
                Io::Disconnect(addr, reason) => {
                    // Shutdown the connection, ignoring any potential errors.
                    // If the socket was already disconnected, this will yield
                    // an error that is safe to ignore (`ENOTCONN`). The other
                    // possible errors relate to an invalid file descriptor.
                    if let Some(peer) = self.peers.get_mut(&addr) {
                        // Deliver what we can of the farewell frame first.
                        peer.flush().ok();
                        peer.disconnect().ok();
                    }
                    self.unregister_peer(addr, Disconnect::StateMachine(reason), service)
                        .await;
                }
                Io::SetTimer(timeout) => {
                    self.timers.schedule(local_time + timeout);
                }
                Io::Event(event) => {
                    trace!(target: "net", "Event: {:?}", event);
                }
            }
        }
    }

    async fn handle_incoming<S>(&mut self, listener: &Option<net::TcpListener>, service: &mut S)
    where
        S: Service,
    {
        while let Some(listener) = listener {
            let (conn, addr) = match listener.accept() {
                Ok((conn, addr)) => (conn, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(target: "net", "Accept error: {}", e.to_string());
                    break;
                }
            };
            trace!(target: "net", "{}: Accepting peer connection", addr);

            // An accepted socket we can't prepare is dropped; the listener
            // itself is fine.
            if let Err(err) = conn.set_nonblocking(true) {
                error!(target: "net", "{}: Accepted socket unusable: {}", addr, err);
                continue;
            }
            let local_addr = match conn.local_addr() {
                Ok(local_addr) => local_addr,
                Err(err) => {
                    error!(target: "net", "{}: Accepted socket unusable: {}", addr, err);
                    continue;
                }
            };
            let link = Link::Inbound;

            self.register_peer(addr, conn, link);

            if !service.connected(addr, &local_addr, link) {
                // Refused before any byte is exchanged, e.g. a banned host.
                if let Some(peer) = self.peers.get(&addr) {
                    peer.disconnect().ok();
                }
                self.peers.remove(&addr);
                self.sources.unregister(&Source::Peer(addr));
            }
        }
    }

    async fn handle_readable<S>(&mut self, addr: SocketAddr, service: &mut S)
    where
        S: Service,
    {
        // Nb. If the socket was readable and writable at the same time, and
        // it was disconnected during an attempt to write, it will no longer
        // be registered and hence available for reads.
        let Some(socket) = self.peers.get_mut(&addr) else {
            return;
        };
        let mut buffer = [0; READ_BUFFER_SIZE];

        trace!(target: "net", "{}: Socket is readable", addr);

        // Nb. Since `poll`, which this reactor is based on, is
        // *level-triggered*, we will be notified again if there is still data
        // to be read on the socket. Hence, there is no use in putting this
        // socket read in a loop, as the second invocation would likely block.
        match socket.read(&mut buffer) {
            Ok(count) => {
                if count > 0 {
                    service
                        .message_received(&addr, std::borrow::Cow::Borrowed(&buffer[..count]))
                        .await;
                } else {
                    // If we get zero bytes read as a return value, it means
                    // the peer has performed an orderly shutdown.
                    socket.disconnect().ok();

                    self.unregister_peer(
                        addr,
                        Disconnect::ConnectionError(Arc::new(io::Error::from(
                            io::ErrorKind::ConnectionReset,
                        ))),
                        service,
                    )
                    .await;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                // This shouldn't normally happen, since this function is only
                // called when there's data on the socket. We leave it here
                // in case external conditions change.
            }
            Err(err) => {
                trace!(target: "net", "{}: Read error: {}", addr, err.to_string());

                socket.disconnect().ok();
                self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service)
                    .await;
            }
        }
    }

    async fn handle_writable<S: Service>(
        &mut self,
        addr: SocketAddr,
        source: &Source,
        service: &mut S,
    ) {
        trace!(target: "net", "{}: Socket is writable", addr);

        let Some(source) = self.sources.get_mut(source) else {
            return;
        };
        let Some(socket) = self.peers.get_mut(&addr) else {
            return;
        };

        // "A file descriptor for a socket that is connecting asynchronously
        // shall indicate that it is ready for writing, once a connection has
        // been established."
        //
        // Since we perform a non-blocking connect, we're only really
        // connected once the socket is writable.
        if self.connecting.remove(&addr) {
            let local_addr = match socket.local_address() {
                Ok(local_addr) => local_addr,
                Err(err) => {
                    socket.disconnect().ok();
                    self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service)
                        .await;
                    return;
                }
            };

            if !service.connected(addr, &local_addr, socket.link) {
                socket.disconnect().ok();
                self.peers.remove(&addr);
                self.sources.unregister(&Source::Peer(addr));

                return;
            }
        }

        match socket.flush() {
            // In this case, we've written all the data, we are no longer
            // interested in writing to this socket.
            Ok(()) => {
                source.unset(popol::interest::WRITE);
            }
            // In this case, the write couldn't complete. Set our interest to
            // `WRITE` to be notified when the socket is ready to write again.
            Err(err)
                if [io::ErrorKind::WouldBlock, io::ErrorKind::WriteZero].contains(&err.kind()) =>
            {
                source.set(popol::interest::WRITE);
            }
            Err(err) => {
                error!(target: "net", "{}: Write error: {}", addr, err.to_string());

                socket.disconnect().ok();
                self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service)
                    .await;
            }
        }
    }

    /// Drop peers whose send queue has not drained within the stall window.
    /// This is what puts backpressure on broadcasters: a slow consumer is
    /// closed rather than allowed to grow an unbounded queue.
    async fn sweep_write_stalls<S>(&mut self, service: &mut S, local_time: LocalTime)
    where
        S: Service,
    {
        let stalled = self
            .peers
            .iter()
            .filter(|(_, socket)| socket.stalled(local_time, WRITE_STALL_TIMEOUT))
            .map(|(addr, _)| *addr)
            .collect::<Vec<_>>();

        for addr in stalled {
            debug!(target: "net", "{}: Send queue stalled, dropping peer", addr);

            if let Some(socket) = self.peers.get(&addr) {
                socket.disconnect().ok();
            }
            self.unregister_peer(addr, Disconnect::WriteStall, service)
                .await;
        }
    }

    /// Check whether a peer is registered. Used in tests.
    pub fn is_peer_connected(&self, addr: SocketAddr) -> bool {
        self.peers.contains_key(&addr)
    }
}

/// Start a non-blocking outbound connection.
fn dial(addr: &SocketAddr) -> Result<net::TcpStream, io::Error> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;

    socket.set_nonblocking(true)?;
    socket.set_read_timeout(Some(READ_TIMEOUT))?;
    socket.set_write_timeout(Some(WRITE_TIMEOUT))?;

    // A non-blocking connect almost never completes on the spot. EINPROGRESS
    // (or a plain would-block) means the attempt is underway and the socket
    // will turn writable once it settles; EALREADY means we raced an earlier
    // attempt through the same socket, which the caller treats as "already
    // exists" and skips.
    if let Err(e) = socket.connect(&(*addr).into()) {
        match e.raw_os_error() {
            Some(libc::EINPROGRESS) => {}
            Some(libc::EALREADY) => return Err(io::Error::from(io::ErrorKind::AlreadyExists)),
            _ if e.kind() == io::ErrorKind::WouldBlock => {}
            _ => return Err(e),
        }
    }
    Ok(socket.into())
}

/// Bind the listening socket, with a non-blocking `accept`.
fn listen(addr: &SocketAddr) -> Result<net::TcpListener, io::Error> {
    let listener = net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;

    Ok(listener)
}
