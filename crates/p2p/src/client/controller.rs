//! The pool client: configuration, construction, and the run loop.
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use flume as chan;
use semver::Version;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

use dexd_types::{address, NodeAddress, NodeState};

use crate::client::error::Error;
use crate::client::handle::PoolHandle;
use crate::client::service::Service;
use crate::common::identity::NodeKey;
use crate::common::node::Store;
use crate::common::time::RefClock;
use crate::events::Events;
use crate::fsm::handler::{self, Command};
use crate::net::{LocalTime, Reactor};

/// Default overlay listen port.
pub const DEFAULT_PORT: u16 = 8885;
/// Default Tor SOCKS port.
pub const DEFAULT_TOR_PORT: u16 = 9050;
/// Default periodic rediscovery interval, in minutes.
pub const DEFAULT_DISCOVER_MINUTES: u32 = 720;
/// Plain-http service answering with the caller's public address.
const EXTERNAL_IP_URL: &str = "http://api.ipify.org";

/// Pool configuration options.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Accept inbound connections.
    #[serde(default = "default_true")]
    pub listen: bool,
    /// Overlay listen port. Zero asks the OS for one.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Addresses to advertise, as `host` or `host:port` strings.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Discover our external address and advertise it too.
    #[serde(default)]
    pub detect_external_ip: bool,
    /// Whether a Tor proxy is expected to be running.
    #[serde(default)]
    pub tor: bool,
    /// The Tor proxy's SOCKS port.
    #[serde(default = "default_tor_port")]
    pub tor_port: u16,
    /// Ask peers for other nodes.
    #[serde(default = "default_true")]
    pub discover: bool,
    /// Minutes between periodic rediscovery rounds; zero disables.
    #[serde(default = "default_discover_minutes")]
    pub discover_minutes: u32,
    /// Reject peers below this version.
    #[serde(default)]
    pub min_compatible_version: Option<String>,
    /// Refuse peers with any negative reputation score.
    #[serde(default)]
    pub strict_reputation: bool,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_tor_port() -> u16 {
    DEFAULT_TOR_PORT
}

fn default_discover_minutes() -> u32 {
    DEFAULT_DISCOVER_MINUTES
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            listen: true,
            port: DEFAULT_PORT,
            addresses: Vec::new(),
            detect_external_ip: false,
            tor: false,
            tor_port: DEFAULT_TOR_PORT,
            discover: true,
            discover_minutes: DEFAULT_DISCOVER_MINUTES,
            min_compatible_version: None,
            strict_reputation: false,
        }
    }
}

/// Runs a pre-loaded pool.
pub struct PoolClient<S> {
    handle: PoolHandle,
    service: Service<S, RefClock<LocalTime>>,
    listen: Option<SocketAddr>,
    commands: chan::Receiver<Command>,
    reactor: Reactor,
    events: Events,
}

impl<S: Store + Send + Sync> PoolClient<S> {
    /// Create a new client. Resolves configured addresses and, when asked,
    /// the external IP; failures here are fatal, per the startup contract.
    pub async fn new(config: PoolConfig, key: NodeKey, store: S) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();
        let (listening_tx, listening_rx) = chan::bounded(1);

        let reactor = Reactor::new(listening_tx)?;

        let min_compatible_version = match &config.min_compatible_version {
            Some(raw) => Version::parse(raw)
                .map_err(|e| Error::Config(format!("min_compatible_version `{raw}`: {e}")))?,
            None => Version::new(0, 1, 0),
        };

        let mut advertised = Vec::new();
        for raw in &config.addresses {
            advertised.push(resolve_address(raw, config.port).await?);
        }
        if config.detect_external_ip {
            match detect_external_ip().await {
                Ok(ip) => {
                    info!(target: "p2p", "Detected external address {}", ip);
                    advertised.push(NodeAddress::new(ip.to_string(), config.port));
                }
                Err(err) => {
                    warn!(target: "p2p", "External address detection failed: {}", err);
                }
            }
        }
        let node_state = NodeState {
            addresses: address::dedup(advertised),
            ..NodeState::default()
        };

        let events = Events::new();
        let service = Service::new(
            handler::Config {
                version: handler::POOL_VERSION.to_owned(),
                min_compatible_version,
                discover: config.discover,
                discover_minutes: config.discover_minutes,
                strict_reputation: config.strict_reputation,
            },
            key,
            node_state,
            store,
            fastrand::Rng::new(),
            events.clone(),
            RefClock::from(LocalTime::from(SystemTime::now())),
        );

        let listen = config
            .listen
            .then(|| SocketAddr::from(([0, 0, 0, 0], config.port)));

        let handle = PoolHandle {
            commands: commands_tx,
            waker: reactor.waker(),
            listening: listening_rx,
        };

        Ok(PoolClient {
            handle,
            service,
            listen,
            commands: commands_rx,
            reactor,
            events,
        })
    }

    /// Run the pool until cancelled.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let result = self
            .reactor
            .run(self.listen.as_ref(), self.service, self.commands, cancellation)
            .await;

        if let Err(e) = result {
            tracing::error!(target: "p2p", "Pool is down. Client run error: {}", e);
        }
    }

    /// Create a new handle to communicate with the pool.
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// The pool's event subscription surface.
    pub fn events(&self) -> &Events {
        &self.events
    }
}

/// Resolve a configured `host` or `host:port` string into an address we can
/// advertise, looking hostnames up over DNS.
async fn resolve_address(raw: &str, default_port: u16) -> Result<NodeAddress, Error> {
    let address = match raw.parse::<NodeAddress>() {
        Ok(address) => address,
        // A bare host takes the configured port.
        Err(_) => NodeAddress::new(raw, default_port),
    };

    if address.is_onion() || address.socket_addr().is_some() {
        return Ok(address);
    }

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    let response = resolver
        .lookup_ip(address.host.clone())
        .await
        .map_err(|e| Error::Resolve(raw.to_owned(), e.to_string()))?;

    let ip = response
        .iter()
        .next()
        .ok_or_else(|| Error::Resolve(raw.to_owned(), "no records".to_owned()))?;

    debug!(target: "p2p", "Resolved {} to {}", address.host, ip);
    Ok(NodeAddress::new(ip.to_string(), address.port))
}

/// Best-effort external IP discovery.
async fn detect_external_ip() -> Result<IpAddr, Error> {
    let text = reqwest::get(EXTERNAL_IP_URL)
        .await
        .map_err(|e| Error::Resolve(EXTERNAL_IP_URL.to_owned(), e.to_string()))?
        .text()
        .await
        .map_err(|e| Error::Resolve(EXTERNAL_IP_URL.to_owned(), e.to_string()))?;

    text.trim()
        .parse()
        .map_err(|_| Error::Resolve(EXTERNAL_IP_URL.to_owned(), format!("bad answer `{text}`")))
}
