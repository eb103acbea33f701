//! Tunnel client: binds the device to a remote rendezvous server.
//!
//! The framing protocol is opaque to the daemon; it is spoken by an injected
//! [`TunnelTransport`] adapter. The client owns the session lifecycle
//! (configure, connect, exponential reconnect) and the routing of inbound
//! connect requests to local public ports. While the tunnel is down only
//! remote reachability is lost; the local proxy listeners keep serving.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{EndpointEvent, ServiceRegistry};

pub const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
pub const RECONNECT_MULTIPLIER: f64 = 1.5;
pub const RECONNECT_CAP: Duration = Duration::from_secs(300);

#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
    /// No local endpoint matches the request; the rendezvous should fail the
    /// stream cleanly.
    #[error("no local route for {hostname:?} port {port}")]
    NoRoute { hostname: String, port: u16 },
    #[error("dial 127.0.0.1:{port} failed: {source}")]
    Dial {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Metadata attached to each inbound stream by the rendezvous server.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Hostname as originally requested by the remote peer, if the
    /// rendezvous preserved it.
    pub original_hostname: Option<String>,
    /// Hostname the rendezvous routed on.
    pub hostname: String,
    /// Port the remote peer targeted; used as a last resort when neither
    /// hostname resolves.
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub portal_host: String,
    pub device_secret: String,
}

/// Resolves an externally-advertised hostname to a local public port.
pub trait HostnameResolver: Send + Sync {
    fn resolve(&self, hostname: &str) -> Option<u16>;
}

/// Handles one inbound connect request by producing the local TCP stream
/// the rendezvous should splice the remote stream onto.
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<TcpStream, TunnelError>;
}

/// Adapter over the rendezvous framing protocol. `start` runs one session
/// and returns when the session ends; a clean shutdown (cancellation) is
/// `Ok`, a broken session is `Err`.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    async fn configure(&self, config: &TunnelConfig) -> Result<(), TunnelError>;
    async fn start(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn ConnectHandler>,
    ) -> Result<(), TunnelError>;
    async fn stop(&self) -> Result<(), TunnelError>;
}

/// Routes connect requests: injected resolver first (original hostname,
/// then routed hostname), direct public port as last resort.
pub struct Router {
    resolver: Option<Arc<dyn HostnameResolver>>,
    live_ports: Arc<RwLock<HashSet<u16>>>,
}

impl Router {
    fn resolve(&self, request: &ConnectRequest) -> Result<u16, TunnelError> {
        if let Some(resolver) = &self.resolver {
            if let Some(original) = &request.original_hostname {
                if let Some(port) = resolver.resolve(original) {
                    return Ok(port);
                }
            }
            if let Some(port) = resolver.resolve(&request.hostname) {
                return Ok(port);
            }
        }
        if self.live_ports.read().contains(&request.port) {
            return Ok(request.port);
        }
        Err(TunnelError::NoRoute {
            hostname: request.hostname.clone(),
            port: request.port,
        })
    }
}

#[async_trait]
impl ConnectHandler for Router {
    async fn connect(&self, request: ConnectRequest) -> Result<TcpStream, TunnelError> {
        let port = self.resolve(&request)?;
        debug!(hostname = %request.hostname, port, "routing inbound stream");
        TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|source| TunnelError::Dial { port, source })
    }
}

pub struct TunnelClient {
    transport: Arc<dyn TunnelTransport>,
    registry: Arc<ServiceRegistry>,
    router: Arc<Router>,
    live_ports: Arc<RwLock<HashSet<u16>>>,
}

impl TunnelClient {
    pub fn new(
        transport: Arc<dyn TunnelTransport>,
        registry: Arc<ServiceRegistry>,
        resolver: Option<Arc<dyn HostnameResolver>>,
    ) -> Self {
        let live_ports: Arc<RwLock<HashSet<u16>>> = Arc::new(RwLock::new(
            registry
                .all_endpoints()
                .into_iter()
                .map(|endpoint| endpoint.public_port)
                .collect(),
        ));
        let router = Arc::new(Router {
            resolver,
            live_ports: Arc::clone(&live_ports),
        });
        Self {
            transport,
            registry,
            router,
            live_ports,
        }
    }

    /// Runs the session until cancelled: registry-event driven routing table
    /// plus the reconnect loop.
    pub async fn run(&self, config: TunnelConfig, cancel: CancellationToken) {
        let route_task = tokio::spawn(route_updates(
            Arc::clone(&self.registry),
            Arc::clone(&self.live_ports),
            cancel.clone(),
        ));

        if let Err(err) = self.transport.configure(&config).await {
            warn!(target: "resilience", %err, "tunnel configure failed; remote access disabled");
            let _ = route_task.await;
            return;
        }

        let mut backoff = RECONNECT_INITIAL;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let session = self
                .transport
                .start(cancel.clone(), Arc::clone(&self.router) as Arc<dyn ConnectHandler>);
            match session.await {
                Ok(()) => {
                    // Session ended cleanly; only shutdown does that.
                    break;
                }
                Err(err) => {
                    warn!(
                        target: "resilience",
                        %err,
                        retry_in = ?backoff,
                        "tunnel session lost; local reachability continues"
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff);
        }

        if let Err(err) = self.transport.stop().await {
            debug!(%err, "tunnel transport stop failed");
        }
        let _ = route_task.await;
        info!("tunnel client stopped");
    }
}

fn next_backoff(current: Duration) -> Duration {
    current.mul_f64(RECONNECT_MULTIPLIER).min(RECONNECT_CAP)
}

/// Keeps the live-port set in sync with the registry. A lagged receiver
/// resyncs from a full registry snapshot.
async fn route_updates(
    registry: Arc<ServiceRegistry>,
    live_ports: Arc<RwLock<HashSet<u16>>>,
    cancel: CancellationToken,
) {
    let mut events = registry.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Ok(EndpointEvent::Added(endpoint)) => {
                    live_ports.write().insert(endpoint.public_port);
                }
                Ok(EndpointEvent::Removed(endpoint)) => {
                    live_ports.write().remove(&endpoint.public_port);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "registry event stream lagged; resyncing routes");
                    let snapshot: HashSet<u16> = registry
                        .all_endpoints()
                        .into_iter()
                        .map(|endpoint| endpoint.public_port)
                        .collect();
                    *live_ports.write() = snapshot;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}
