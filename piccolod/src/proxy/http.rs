//! HTTP reverse proxy for `flow=tcp, protocol=http` endpoints.
//!
//! Each accepted connection is served as HTTP/1.1; every request is
//! forwarded to `http://127.0.0.1:<host_bind>` with the original path and
//! headers, and every response is stamped with the baseline security
//! headers before it reaches the client. Upstream unavailability is
//! reflected to the client by closing the connection; the proxy never
//! retries.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::uri::Uri;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::middleware::{self, MiddlewareState};
use super::BACKEND_DIAL_TIMEOUT;
use crate::registry::ServiceEndpoint;

pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

pub(crate) struct HttpProxyState {
    client: Client<HttpConnector, Incoming>,
    middleware: MiddlewareState,
}

impl HttpProxyState {
    pub(crate) fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(BACKEND_DIAL_TIMEOUT));
        connector.set_nodelay(true);
        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            middleware: MiddlewareState::new(),
        }
    }
}

pub(crate) async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: ServiceEndpoint,
    state: Arc<HttpProxyState>,
) {
    let endpoint = Arc::new(endpoint);
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        proxy_request(req, peer, Arc::clone(&endpoint), Arc::clone(&state))
    });
    if let Err(err) = http1::Builder::new()
        .serve_connection(io, service)
        .await
    {
        debug!(%peer, ?err, "http connection ended with error");
    }
}

async fn proxy_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    endpoint: Arc<ServiceEndpoint>,
    state: Arc<HttpProxyState>,
) -> Result<Response<ProxyBody>, hyper_util::client::legacy::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let decision = middleware::apply_request(&state.middleware, &endpoint.middleware, peer, &req);
    if let Some((status, reason)) = decision.deny {
        if decision.log {
            info!(target: "request", %peer, %method, %path, status = %status, reason, "request denied");
        }
        return Ok(short_circuit(status, reason));
    }

    let (mut parts, body) = req.into_parts();
    parts.uri = rewrite_uri(&parts.uri, endpoint.host_bind);
    append_forwarded_for(&mut parts.headers, peer);
    // The backend is addressed by loopback; keep the client's Host header
    // out of the way so virtual-host backends see a consistent value.
    if !parts.headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(&format!("127.0.0.1:{}", endpoint.host_bind)) {
            parts.headers.insert(HOST, value);
        }
    }

    let upstream = Request::from_parts(parts, body);
    match state.client.request(upstream).await {
        Ok(response) => {
            let status = response.status();
            if decision.log {
                info!(target: "request", %peer, %method, %path, status = %status, "request proxied");
            }
            let mut response = response.map(BodyExt::boxed);
            stamp_security_headers(response.headers_mut());
            Ok(response)
        }
        Err(err) => {
            // Spec'd behavior for upstream unavailability: log at WARN and
            // close the client connection.
            warn!(%peer, backend = endpoint.host_bind, ?err, "upstream request failed");
            Err(err)
        }
    }
}

fn rewrite_uri(original: &Uri, host_bind: u16) -> Uri {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme("http")
        .authority(format!("127.0.0.1:{host_bind}"))
        .path_and_query(path_and_query)
        .build()
        // The inputs are a fixed scheme, a numeric authority and an already
        // parsed path; this cannot fail.
        .unwrap_or_else(|_| Uri::from_static("http://127.0.0.1/"))
}

fn append_forwarded_for(headers: &mut http::HeaderMap, peer: SocketAddr) {
    let addr = peer.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR) {
        Some(existing) => match existing.to_str() {
            Ok(existing) => format!("{existing}, {addr}"),
            Err(_) => addr,
        },
        None => addr,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Baseline security response headers stamped on every proxied response.
pub(crate) fn stamp_security_headers(headers: &mut http::HeaderMap) {
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "x-xss-protection",
        HeaderValue::from_static("1; mode=block"),
    );
}

fn short_circuit(status: StatusCode, reason: &'static str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(reason.as_bytes()))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::builder()
        .status(status)
        .body(body)
        .expect("static response");
    stamp_security_headers(response.headers_mut());
    response
}
