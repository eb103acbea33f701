//! Per-client query rate limiting for the mDNS responder.
//!
//! Limits are ≤10 queries per second and ≤100 per minute for each client
//! IP. A breach blocks the client for five minutes and is logged as a
//! security event. Client state is created lazily on first query, its
//! counters reset after a minute of silence, and idle entries are reaped
//! after an hour unless blocked.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

pub const PER_SECOND_LIMIT: u32 = 10;
pub const PER_MINUTE_LIMIT: u32 = 100;
pub const BLOCK_DURATION: Duration = Duration::from_secs(5 * 60);
pub const IDLE_RESET: Duration = Duration::from_secs(60);
pub const REAP_AFTER: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Accepted,
    /// This query tripped the limit; the client is now blocked.
    NewlyBlocked,
    /// The client was already blocked.
    Blocked,
}

struct ClientState {
    second_start: Instant,
    second_count: u32,
    minute_start: Instant,
    minute_count: u32,
    last_query: Instant,
    blocked_until: Option<Instant>,
}

impl ClientState {
    fn new(now: Instant) -> Self {
        Self {
            second_start: now,
            second_count: 0,
            minute_start: now,
            minute_count: 0,
            last_query: now,
            blocked_until: None,
        }
    }
}

pub struct QueryRateLimiter {
    clients: Mutex<HashMap<IpAddr, ClientState>>,
    hits: AtomicU64,
}

impl Default for QueryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRateLimiter {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
        }
    }

    pub fn check(&self, client: IpAddr) -> RateDecision {
        self.check_at(client, Instant::now())
    }

    /// Clock-explicit variant so tests are deterministic.
    pub fn check_at(&self, client: IpAddr, now: Instant) -> RateDecision {
        let mut clients = self.clients.lock();
        let state = clients
            .entry(client)
            .or_insert_with(|| ClientState::new(now));

        if let Some(until) = state.blocked_until {
            if now < until {
                return RateDecision::Blocked;
            }
            state.blocked_until = None;
        }

        // A minute of silence resets the windows entirely.
        if now.duration_since(state.last_query) >= IDLE_RESET {
            *state = ClientState::new(now);
        }
        state.last_query = now;

        if now.duration_since(state.second_start) >= Duration::from_secs(1) {
            state.second_start = now;
            state.second_count = 0;
        }
        if now.duration_since(state.minute_start) >= Duration::from_secs(60) {
            state.minute_start = now;
            state.minute_count = 0;
        }

        state.second_count += 1;
        state.minute_count += 1;

        if state.second_count > PER_SECOND_LIMIT || state.minute_count > PER_MINUTE_LIMIT {
            state.blocked_until = Some(now + BLOCK_DURATION);
            self.hits.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "security",
                %client,
                per_second = state.second_count,
                per_minute = state.minute_count,
                "mDNS query rate limit exceeded; client blocked"
            );
            return RateDecision::NewlyBlocked;
        }
        RateDecision::Accepted
    }

    /// Drops entries idle for longer than [`REAP_AFTER`], keeping blocked
    /// clients so their block outlasts their silence.
    pub fn reap(&self, now: Instant) {
        self.clients.lock().retain(|_, state| {
            let blocked = state
                .blocked_until
                .map(|until| now < until)
                .unwrap_or(false);
            blocked || now.duration_since(state.last_query) < REAP_AFTER
        });
    }

    /// Number of times any client tripped the limit.
    pub fn rate_limit_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> IpAddr {
        "192.0.2.99".parse().unwrap()
    }

    #[test]
    fn accepts_at_most_ten_in_one_second() {
        let limiter = QueryRateLimiter::new();
        let start = Instant::now();
        let mut accepted = 0;
        // 50 queries at 100 qps: 10ms apart, all inside one second.
        for i in 0..50u32 {
            let at = start + Duration::from_millis(u64::from(i) * 10);
            if limiter.check_at(client(), at) == RateDecision::Accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(limiter.rate_limit_hits(), 1);
        // Still blocked one second later.
        assert_eq!(
            limiter.check_at(client(), start + Duration::from_secs(1)),
            RateDecision::Blocked
        );
    }

    #[test]
    fn block_expires_after_five_minutes() {
        let limiter = QueryRateLimiter::new();
        let start = Instant::now();
        for i in 0..12u32 {
            limiter.check_at(client(), start + Duration::from_millis(u64::from(i)));
        }
        let after_block = start + BLOCK_DURATION + Duration::from_secs(1);
        assert_eq!(
            limiter.check_at(client(), after_block),
            RateDecision::Accepted
        );
    }

    #[test]
    fn minute_limit_applies_to_slow_clients() {
        let limiter = QueryRateLimiter::new();
        let start = Instant::now();
        let mut decisions = Vec::new();
        // ~2 qps for a minute: never trips the second limit, trips the
        // minute limit at query 101.
        for i in 0..110u32 {
            let at = start + Duration::from_millis(u64::from(i) * 500);
            decisions.push(limiter.check_at(client(), at));
        }
        let accepted = decisions
            .iter()
            .filter(|d| **d == RateDecision::Accepted)
            .count();
        assert!(accepted <= 100, "accepted {accepted}");
        assert!(decisions.contains(&RateDecision::NewlyBlocked));
    }

    #[test]
    fn silence_resets_counters() {
        let limiter = QueryRateLimiter::new();
        let start = Instant::now();
        for i in 0..10u32 {
            assert_eq!(
                limiter.check_at(client(), start + Duration::from_millis(u64::from(i))),
                RateDecision::Accepted
            );
        }
        // After a minute of silence the full budget is back.
        let later = start + Duration::from_secs(61);
        for i in 0..10u32 {
            assert_eq!(
                limiter.check_at(client(), later + Duration::from_millis(u64::from(i))),
                RateDecision::Accepted
            );
        }
    }

    #[test]
    fn reap_keeps_blocked_clients() {
        let limiter = QueryRateLimiter::new();
        let start = Instant::now();
        let quiet: IpAddr = "192.0.2.1".parse().unwrap();
        limiter.check_at(quiet, start);
        for i in 0..12u32 {
            limiter.check_at(client(), start + Duration::from_millis(u64::from(i)));
        }
        assert_eq!(limiter.tracked_clients(), 2);

        limiter.reap(start + REAP_AFTER + Duration::from_secs(1));
        // The quiet client is reaped; the blocked one survives its hour of
        // silence only while the block lasts, which has expired by now too.
        assert_eq!(limiter.tracked_clients(), 0);

        for i in 0..12u32 {
            limiter.check_at(client(), start + Duration::from_millis(u64::from(i)));
        }
        limiter.reap(start + Duration::from_secs(120));
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
