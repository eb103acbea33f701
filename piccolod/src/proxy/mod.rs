//! The service proxy engine.
//!
//! One TCP listener per service endpoint, bound on the wildcard address at
//! the endpoint's public port. What happens to an accepted connection
//! depends on the endpoint's `(flow, protocol)`:
//!
//! * `tls` flow, or `tcp` flow with the `raw`/`websocket` protocol: the
//!   bytes are spliced to the loopback backend untouched, half-close
//!   propagated in both directions.
//! * `tcp` flow with the `http` protocol: a reverse proxy to
//!   `http://127.0.0.1:host_bind` with the middleware pipeline and baseline
//!   security response headers.
//!
//! Listeners are keyed by public port. Starting a listener on a live port
//! is a no-op; stopping waits for the accept loop to exit while in-flight
//! connections drain on their own tasks.

mod http;
mod middleware;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use piccolo_api::{Flow, Protocol};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::ServiceEndpoint;

/// How long a backend dial may take before the client connection is closed.
pub const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("failed to bind 0.0.0.0:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

struct ListenerHandle {
    endpoint: ServiceEndpoint,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ProxyEngine {
    listeners: Mutex<HashMap<u16, ListenerHandle>>,
    http: Arc<http::HttpProxyState>,
    shutdown: CancellationToken,
}

impl Default for ProxyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyEngine {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            http: Arc::new(http::HttpProxyState::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Opens the public listener for an endpoint. Idempotent: a second start
    /// on a live port is a no-op.
    pub async fn start(&self, endpoint: &ServiceEndpoint) -> Result<(), ProxyError> {
        let port = endpoint.public_port;
        if self.listeners.lock().contains_key(&port) {
            debug!(port, "proxy listener already live");
            return Ok(());
        }

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ProxyError::Bind { port, source })?;

        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(accept_loop(
            listener,
            endpoint.clone(),
            Arc::clone(&self.http),
            cancel.clone(),
        ));

        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&port) {
            // Lost a start/start race; the first listener wins.
            cancel.cancel();
            task.abort();
            return Ok(());
        }
        listeners.insert(
            port,
            ListenerHandle {
                endpoint: endpoint.clone(),
                cancel,
                task,
            },
        );
        info!(
            app = %endpoint.app,
            listener = %endpoint.name,
            port,
            backend = endpoint.host_bind,
            flow = ?endpoint.flow,
            protocol = ?endpoint.protocol,
            "proxy listener started"
        );
        Ok(())
    }

    /// Closes the listener on a public port and returns once its accept loop
    /// has exited. In-flight connections drain on their own tasks.
    pub async fn stop_port(&self, port: u16) {
        let handle = self.listeners.lock().remove(&port);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
            info!(port, "proxy listener stopped");
        }
    }

    /// Stops every listener and waits for all accept loops to exit.
    pub async fn stop_all(&self) {
        let handles: Vec<ListenerHandle> = {
            let mut listeners = self.listeners.lock();
            listeners.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.cancel.cancel();
        }
        futures::future::join_all(handles.into_iter().map(|handle| handle.task)).await;
    }

    pub fn is_live(&self, port: u16) -> bool {
        self.listeners.lock().contains_key(&port)
    }

    pub fn live_endpoint(&self, port: u16) -> Option<ServiceEndpoint> {
        self.listeners
            .lock()
            .get(&port)
            .map(|handle| handle.endpoint.clone())
    }
}

async fn accept_loop(
    listener: TcpListener,
    endpoint: ServiceEndpoint,
    http: Arc<http::HttpProxyState>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(port = endpoint.public_port, "accept loop cancelled");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((client, peer)) => {
                        let endpoint = endpoint.clone();
                        let http = Arc::clone(&http);
                        tokio::spawn(async move {
                            handle_connection(client, peer, endpoint, http).await;
                        });
                    }
                    Err(err) => {
                        // Transient accept errors (EMFILE, ECONNABORTED);
                        // back off briefly instead of spinning.
                        warn!(port = endpoint.public_port, ?err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    client: TcpStream,
    peer: SocketAddr,
    endpoint: ServiceEndpoint,
    http: Arc<http::HttpProxyState>,
) {
    match (endpoint.flow, endpoint.protocol) {
        (Flow::Tcp, Protocol::Http) => {
            http::serve_client(client, peer, endpoint, http).await;
        }
        // TLS passthrough and raw/websocket TCP are byte-for-byte splices.
        _ => splice_to_backend(client, peer, &endpoint).await,
    }
}

async fn splice_to_backend(mut client: TcpStream, peer: SocketAddr, endpoint: &ServiceEndpoint) {
    let backend_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, endpoint.host_bind));
    let backend = match tokio::time::timeout(BACKEND_DIAL_TIMEOUT, TcpStream::connect(backend_addr))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(%peer, backend = %backend_addr, ?err, "backend dial failed");
            return;
        }
        Err(_) => {
            warn!(%peer, backend = %backend_addr, "backend dial timed out");
            return;
        }
    };

    let mut backend = backend;
    // copy_bidirectional propagates read-EOF as a write shutdown on the
    // opposite side, which is exactly the half-close contract.
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((tx, rx)) => {
            debug!(%peer, backend = %backend_addr, tx, rx, "connection closed");
        }
        Err(err) => {
            debug!(%peer, backend = %backend_addr, ?err, "connection errored");
        }
    }
}
