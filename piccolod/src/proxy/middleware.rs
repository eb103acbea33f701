//! The middleware pipeline for HTTP endpoints.
//!
//! Middleware is dispatched over the sealed [`Middleware`] set; the names
//! were validated at reconciliation time, so an unknown name can never show
//! up here. Checks run in the declared order and the first denial wins.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use http::header::{HeaderMap, REFERER};
use http::{Method, Request, StatusCode};
use parking_lot::Mutex;
use piccolo_api::Middleware;
use tracing::warn;

/// Sustained requests/second allowed per client IP by `rate_limit`.
const HTTP_RATE_LIMIT_RPS: f64 = 10.0;
const HTTP_RATE_LIMIT_BURST: f64 = 20.0;
/// Websocket upgrade attempts/second per client IP.
const WS_RATE_LIMIT_RPS: f64 = 2.0;
const WS_RATE_LIMIT_BURST: f64 = 5.0;

/// Outcome of the request-phase pipeline.
pub(crate) struct Decision {
    pub deny: Option<(StatusCode, &'static str)>,
    /// Set when the chain contains `request_logging`.
    pub log: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Admitted,
    Limited,
}

struct TokenBucket {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(burst: f64) -> Self {
        Self {
            tokens: burst,
            last: Instant::now(),
        }
    }

    fn admit(&mut self, rps: f64, burst: f64) -> RateLimitDecision {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * rps).min(burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateLimitDecision::Admitted
        } else {
            RateLimitDecision::Limited
        }
    }
}

pub(crate) struct MiddlewareState {
    http_buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
    ws_buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl MiddlewareState {
    pub(crate) fn new() -> Self {
        Self {
            http_buckets: Mutex::new(HashMap::new()),
            ws_buckets: Mutex::new(HashMap::new()),
        }
    }

    fn admit_http(&self, ip: IpAddr) -> RateLimitDecision {
        self.http_buckets
            .lock()
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(HTTP_RATE_LIMIT_BURST))
            .admit(HTTP_RATE_LIMIT_RPS, HTTP_RATE_LIMIT_BURST)
    }

    fn admit_websocket(&self, ip: IpAddr) -> RateLimitDecision {
        self.ws_buckets
            .lock()
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(WS_RATE_LIMIT_BURST))
            .admit(WS_RATE_LIMIT_RPS, WS_RATE_LIMIT_BURST)
    }
}

/// Runs the request-phase checks in declared order.
pub(crate) fn apply_request<B>(
    state: &MiddlewareState,
    chain: &[Middleware],
    peer: SocketAddr,
    req: &Request<B>,
) -> Decision {
    let mut log = false;
    for middleware in chain {
        let deny = match middleware {
            Middleware::RequestLogging => {
                log = true;
                None
            }
            Middleware::RateLimit => match state.admit_http(peer.ip()) {
                RateLimitDecision::Admitted => None,
                RateLimitDecision::Limited => {
                    warn!(target: "security", %peer, "http rate limit exceeded");
                    Some((StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"))
                }
            },
            Middleware::WebsocketRateLimit => {
                if is_websocket_upgrade(req.headers()) {
                    match state.admit_websocket(peer.ip()) {
                        RateLimitDecision::Admitted => None,
                        RateLimitDecision::Limited => {
                            warn!(target: "security", %peer, "websocket rate limit exceeded");
                            Some((StatusCode::TOO_MANY_REQUESTS, "websocket rate limit exceeded"))
                        }
                    }
                } else {
                    None
                }
            }
            Middleware::IpWhitelist | Middleware::EnforcePrivateAuth => {
                if is_private_ip(peer.ip()) {
                    None
                } else {
                    warn!(target: "security", %peer, ?middleware, "non-private source rejected");
                    Some((StatusCode::FORBIDDEN, "forbidden"))
                }
            }
            Middleware::CsrfProtection => check_csrf(req),
        };
        if deny.is_some() {
            return Decision { deny, log };
        }
    }
    Decision { deny: None, log }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// State-changing requests must carry an Origin or Referer agreeing with the
/// Host header.
fn check_csrf<B>(req: &Request<B>) -> Option<(StatusCode, &'static str)> {
    match *req.method() {
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE => {}
        _ => return None,
    }

    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(strip_port);
    let Some(host) = host else {
        return Some((StatusCode::FORBIDDEN, "missing host header"));
    };

    let source = req
        .headers()
        .get(http::header::ORIGIN)
        .or_else(|| req.headers().get(REFERER))
        .and_then(|value| value.to_str().ok());
    let Some(source) = source else {
        return Some((StatusCode::FORBIDDEN, "cross-site request rejected"));
    };

    match source.parse::<http::Uri>() {
        Ok(uri) if uri.host().map(|h| h == host).unwrap_or(false) => None,
        _ => Some((StatusCode::FORBIDDEN, "cross-site request rejected")),
    }
}

fn strip_port(host: &str) -> &str {
    // v6 literals keep their brackets; everything else drops the port.
    if host.starts_with('[') {
        host.split(']').next().map(|h| &h[1..]).unwrap_or(host)
    } else {
        host.split(':').next().unwrap_or(host)
    }
}

/// Loopback, RFC 1918, link-local, and IPv6 unique-local sources count as
/// private.
pub(crate) fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // unique-local fc00::/7
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().method(method).uri("/submit");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    fn peer() -> SocketAddr {
        "192.168.1.50:40000".parse().unwrap()
    }

    #[test]
    fn empty_chain_passes() {
        let state = MiddlewareState::new();
        let decision = apply_request(&state, &[], peer(), &request(Method::GET, &[]));
        assert!(decision.deny.is_none());
        assert!(!decision.log);
    }

    #[test]
    fn request_logging_only_marks() {
        let state = MiddlewareState::new();
        let decision = apply_request(
            &state,
            &[Middleware::RequestLogging],
            peer(),
            &request(Method::GET, &[]),
        );
        assert!(decision.deny.is_none());
        assert!(decision.log);
    }

    #[test]
    fn rate_limit_kicks_in_after_burst() {
        let state = MiddlewareState::new();
        let chain = [Middleware::RateLimit];
        let req = request(Method::GET, &[]);
        let mut denied = 0;
        for _ in 0..50 {
            if apply_request(&state, &chain, peer(), &req).deny.is_some() {
                denied += 1;
            }
        }
        // Burst of 20 admitted, the rest denied (modulo refill during the
        // loop, which at 10 rps is negligible).
        assert!(denied >= 25, "denied only {denied} of 50");
    }

    #[test]
    fn ip_whitelist_rejects_public_sources() {
        let state = MiddlewareState::new();
        let chain = [Middleware::IpWhitelist];
        let public: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        let req = request(Method::GET, &[]);
        assert!(apply_request(&state, &chain, peer(), &req).deny.is_none());
        assert_eq!(
            apply_request(&state, &chain, public, &req).deny,
            Some((StatusCode::FORBIDDEN, "forbidden"))
        );
    }

    #[test]
    fn csrf_allows_same_origin_posts() {
        let state = MiddlewareState::new();
        let chain = [Middleware::CsrfProtection];
        let ok = request(
            Method::POST,
            &[("host", "device.local:35001"), ("origin", "http://device.local:35001")],
        );
        assert!(apply_request(&state, &chain, peer(), &ok).deny.is_none());

        let cross = request(
            Method::POST,
            &[("host", "device.local"), ("origin", "http://evil.example")],
        );
        assert!(apply_request(&state, &chain, peer(), &cross).deny.is_some());

        let missing = request(Method::POST, &[("host", "device.local")]);
        assert!(apply_request(&state, &chain, peer(), &missing).deny.is_some());

        // Reads are exempt.
        let get = request(Method::GET, &[("host", "device.local")]);
        assert!(apply_request(&state, &chain, peer(), &get).deny.is_none());
    }

    #[test]
    fn websocket_rate_limit_ignores_plain_requests() {
        let state = MiddlewareState::new();
        let chain = [Middleware::WebsocketRateLimit];
        let plain = request(Method::GET, &[]);
        for _ in 0..20 {
            assert!(apply_request(&state, &chain, peer(), &plain).deny.is_none());
        }
        let upgrade = request(Method::GET, &[("upgrade", "websocket")]);
        let mut denied = 0;
        for _ in 0..20 {
            if apply_request(&state, &chain, peer(), &upgrade).deny.is_some() {
                denied += 1;
            }
        }
        assert!(denied >= 10, "denied only {denied} of 20 upgrades");
    }

    #[test]
    fn private_ip_classification() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("10.1.2.3".parse().unwrap()));
        assert!(is_private_ip("192.168.0.9".parse().unwrap()));
        assert!(is_private_ip("fd00::1".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(!is_private_ip("203.0.113.9".parse().unwrap()));
        assert!(!is_private_ip("2001:db8::1".parse().unwrap()));
    }
}
