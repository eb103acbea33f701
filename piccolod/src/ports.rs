//! Host port allocation.
//!
//! Every listener gets a pair of host ports: a private backend port that the
//! container publishes to on the loopback interface, and a public-facing
//! port that the proxy engine accepts on. The two ranges are disjoint so a
//! port number alone identifies which side of the proxy it belongs to.

use std::collections::BTreeSet;
use std::fmt;

use parking_lot::Mutex;

/// Container-publish side, bound on 127.0.0.1.
pub const HOST_BIND_RANGE: PortRange = PortRange::new(15000, 25000);
/// Proxy accept side, bound on 0.0.0.0.
pub const PUBLIC_RANGE: PortRange = PortRange::new(35000, 45000);

/// An inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// No free port exists in the targeted range. The caller must not retry
    /// without freeing something first.
    #[error("port range {range} exhausted")]
    ExhaustedRange { range: PortRange },
    #[error("port {port} is outside range {range}")]
    OutOfRange { port: u16, range: PortRange },
    #[error("port {port} is already held")]
    AlreadyHeld { port: u16 },
}

/// A host-bind / public port pair handed out by [`PortAllocator::allocate_pair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub host_bind: u16,
    pub public_port: u16,
}

struct RangeState {
    range: PortRange,
    /// Next candidate for sequential allocation; wraps inside the range.
    next: u16,
    held: BTreeSet<u16>,
}

impl RangeState {
    fn new(range: PortRange) -> Self {
        Self {
            range,
            next: range.start,
            held: BTreeSet::new(),
        }
    }

    fn allocate(&mut self) -> Result<u16, PortError> {
        if self.held.len() >= self.range.len() {
            return Err(PortError::ExhaustedRange { range: self.range });
        }
        let mut candidate = self.next;
        loop {
            if !self.held.contains(&candidate) {
                self.held.insert(candidate);
                self.next = if candidate == self.range.end {
                    self.range.start
                } else {
                    candidate + 1
                };
                return Ok(candidate);
            }
            candidate = if candidate == self.range.end {
                self.range.start
            } else {
                candidate + 1
            };
            if candidate == self.next {
                // Wrapped all the way around; the len() check above should
                // have caught this.
                return Err(PortError::ExhaustedRange { range: self.range });
            }
        }
    }

    fn reserve(&mut self, port: u16) -> Result<(), PortError> {
        if !self.range.contains(port) {
            return Err(PortError::OutOfRange {
                port,
                range: self.range,
            });
        }
        if !self.held.insert(port) {
            return Err(PortError::AlreadyHeld { port });
        }
        Ok(())
    }

    fn release(&mut self, port: u16) {
        self.held.remove(&port);
    }
}

/// Hands out unique ports from the two disjoint ranges and recycles them on
/// release. The allocator exclusively owns the availability maps; no other
/// component tracks which ports are free.
pub struct PortAllocator {
    inner: Mutex<Inner>,
}

struct Inner {
    host: RangeState,
    public: RangeState,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(HOST_BIND_RANGE, PUBLIC_RANGE)
    }
}

impl PortAllocator {
    /// The ranges are compile-time defaults but may be overridden here, e.g.
    /// to tiny ranges in exhaustion tests.
    pub fn new(host_range: PortRange, public_range: PortRange) -> Self {
        assert!(
            host_range.end < public_range.start || public_range.end < host_range.start,
            "host-bind and public port ranges must be disjoint"
        );
        Self {
            inner: Mutex::new(Inner {
                host: RangeState::new(host_range),
                public: RangeState::new(public_range),
            }),
        }
    }

    /// Allocates one port from each range. Nothing is held on failure.
    pub fn allocate_pair(&self) -> Result<PortPair, PortError> {
        let mut inner = self.inner.lock();
        let host_bind = inner.host.allocate()?;
        let public_port = match inner.public.allocate() {
            Ok(port) => port,
            Err(err) => {
                inner.host.release(host_bind);
                return Err(err);
            }
        };
        Ok(PortPair {
            host_bind,
            public_port,
        })
    }

    /// Marks a host-bind port as held without allocating it, used when
    /// restoring state from a live container's publish table.
    pub fn reserve_host(&self, port: u16) -> Result<(), PortError> {
        self.inner.lock().host.reserve(port)
    }

    /// Allocates only a public port, pairing it with an externally observed
    /// host-bind port.
    pub fn allocate_public(&self) -> Result<u16, PortError> {
        self.inner.lock().public.allocate()
    }

    /// Idempotent: releasing an unheld port is a no-op.
    pub fn release(&self, host_bind: u16, public_port: u16) {
        let mut inner = self.inner.lock();
        inner.host.release(host_bind);
        inner.public.release(public_port);
    }

    pub fn release_public(&self, public_port: u16) {
        self.inner.lock().public.release(public_port);
    }

    /// Number of held ports, `(host, public)`.
    pub fn held_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.host.held.len(), inner.public.held.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_from_range_start() {
        let alloc = PortAllocator::default();
        let pair = alloc.allocate_pair().unwrap();
        assert_eq!(pair.host_bind, 15000);
        assert_eq!(pair.public_port, 35000);
        let pair = alloc.allocate_pair().unwrap();
        assert_eq!(pair.host_bind, 15001);
        assert_eq!(pair.public_port, 35001);
    }

    #[test]
    fn release_returns_allocator_to_initial_state() {
        let alloc = PortAllocator::default();
        let a = alloc.allocate_pair().unwrap();
        let b = alloc.allocate_pair().unwrap();
        alloc.release(a.host_bind, a.public_port);
        alloc.release(b.host_bind, b.public_port);
        assert_eq!(alloc.held_counts(), (0, 0));
    }

    #[test]
    fn release_is_idempotent() {
        let alloc = PortAllocator::default();
        let pair = alloc.allocate_pair().unwrap();
        alloc.release(pair.host_bind, pair.public_port);
        alloc.release(pair.host_bind, pair.public_port);
        assert_eq!(alloc.held_counts(), (0, 0));
    }

    #[test]
    fn exhaustion_is_reported_and_nothing_leaks() {
        let alloc = PortAllocator::new(PortRange::new(100, 101), PortRange::new(200, 201));
        alloc.allocate_pair().unwrap();
        alloc.allocate_pair().unwrap();
        let err = alloc.allocate_pair().unwrap_err();
        assert!(matches!(err, PortError::ExhaustedRange { .. }));
        assert_eq!(alloc.held_counts(), (2, 2));
    }

    #[test]
    fn public_exhaustion_rolls_back_host_allocation() {
        let alloc = PortAllocator::new(PortRange::new(100, 105), PortRange::new(200, 200));
        alloc.allocate_pair().unwrap();
        let err = alloc.allocate_pair().unwrap_err();
        assert!(matches!(err, PortError::ExhaustedRange { .. }));
        // The host port grabbed before the public range ran dry was returned.
        assert_eq!(alloc.held_counts(), (1, 1));
    }

    #[test]
    fn reservation_checks_range_and_collisions() {
        let alloc = PortAllocator::default();
        alloc.reserve_host(15123).unwrap();
        assert_eq!(
            alloc.reserve_host(15123),
            Err(PortError::AlreadyHeld { port: 15123 })
        );
        assert!(matches!(
            alloc.reserve_host(30000),
            Err(PortError::OutOfRange { .. })
        ));
    }

    #[test]
    fn allocation_skips_reserved_ports() {
        let alloc = PortAllocator::default();
        alloc.reserve_host(15000).unwrap();
        let pair = alloc.allocate_pair().unwrap();
        assert_eq!(pair.host_bind, 15001);
    }

    #[test]
    fn wrap_around_reuses_released_ports() {
        let alloc = PortAllocator::new(PortRange::new(100, 101), PortRange::new(200, 201));
        let a = alloc.allocate_pair().unwrap();
        let _b = alloc.allocate_pair().unwrap();
        alloc.release(a.host_bind, a.public_port);
        let c = alloc.allocate_pair().unwrap();
        assert_eq!(c.host_bind, a.host_bind);
        assert_eq!(c.public_port, a.public_port);
    }
}
