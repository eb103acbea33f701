//! Name-conflict detection.
//!
//! Every answer seen in the normal read path is fed through here; a foreign
//! responder answering for our current name is a conflict regardless of
//! whether a probe is in flight. Probe cycles additionally open an
//! expectation window so the responder knows how long to keep listening
//! before declaring a probe clean.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// 250 ms per probe plus a grace second for late answers.
pub const PROBE_WAIT: Duration = Duration::from_millis(250);
pub const PROBE_GRACE: Duration = Duration::from_secs(1);
pub const PROBE_COUNT: u32 = 3;

/// What we know about another responder that has answered for our name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponderSighting {
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub query_count: u64,
}

#[derive(Debug, Default)]
struct Inner {
    responders: HashMap<IpAddr, ResponderSighting>,
    conflict_detected: bool,
    resolution_attempts: u32,
    probe_window_until: Option<Instant>,
}

#[derive(Default)]
pub struct ConflictDetector {
    inner: Mutex<Inner>,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the listen window for one probe cycle.
    pub fn open_probe_window(&self, now: Instant) {
        let until = now + PROBE_WAIT * PROBE_COUNT + PROBE_GRACE;
        self.inner.lock().probe_window_until = Some(until);
    }

    pub fn probe_window_open(&self, now: Instant) -> bool {
        self.inner
            .lock()
            .probe_window_until
            .map(|until| now < until)
            .unwrap_or(false)
    }

    /// Records an answer owning `name` from `source`. Returns true when this
    /// sighting newly put the detector into the conflicted state.
    pub fn observe_answer(
        &self,
        name: &str,
        current_name: &str,
        source: IpAddr,
        our_addresses: &[IpAddr],
        now: Instant,
    ) -> bool {
        if !name.eq_ignore_ascii_case(current_name) {
            return false;
        }
        if our_addresses.contains(&source) {
            // Our own announcement looped back.
            return false;
        }

        let mut inner = self.inner.lock();
        let sighting = inner
            .responders
            .entry(source)
            .or_insert(ResponderSighting {
                first_seen: now,
                last_seen: now,
                query_count: 0,
            });
        sighting.last_seen = now;
        sighting.query_count += 1;

        if inner.conflict_detected {
            return false;
        }
        inner.conflict_detected = true;
        warn!(
            target: "conflict",
            name = current_name,
            %source,
            "foreign responder answers for our name"
        );
        true
    }

    /// Marks the start of a resolution attempt and arms the detector again
    /// for the new name.
    pub fn begin_resolution(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.conflict_detected = false;
        inner.resolution_attempts += 1;
        inner.resolution_attempts
    }

    pub fn conflict_detected(&self) -> bool {
        self.inner.lock().conflict_detected
    }

    pub fn resolution_attempts(&self) -> u32 {
        self.inner.lock().resolution_attempts
    }

    pub fn sighting(&self, source: IpAddr) -> Option<ResponderSighting> {
        self.inner.lock().responders.get(&source).copied()
    }
}
