//! Per-interface health tracking and recovery scheduling.
//!
//! Hot-path counters are atomics so the health monitor can read them
//! without contending with the socket tasks; the state machine and score
//! live behind a small mutex that is only touched on state transitions and
//! periodic evaluation.
//!
//! State machine: `Active → (I/O error) → Failing → (backoff elapsed) →
//! Recovering → Active` or `→ Removed`. The health score decays with
//! errors and failures and recovers on its own over roughly ten minutes of
//! quiet operation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
pub const BACKOFF_MULTIPLIER: u32 = 2;
pub const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// Time for a fully degraded score to climb back to 1.0.
const SCORE_RECOVERY: Duration = Duration::from_secs(10 * 60);
const ERROR_PENALTY: f64 = 0.05;
const FAILURE_PENALTY: f64 = 0.25;

/// System-wide thresholds for entering and leaving recovery mode.
pub const SYSTEM_RECOVERY_ENTER: f64 = 0.3;
pub const SYSTEM_RECOVERY_EXIT: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceStatus {
    Active,
    Failing,
    Recovering,
    Removed,
}

struct Meta {
    status: InterfaceStatus,
    /// Score as of `score_at`; the current value adds time-based recovery.
    score: f64,
    score_at: Instant,
    last_failure: Option<Instant>,
    backoff: Duration,
    backoff_until: Option<Instant>,
}

pub struct InterfaceHealth {
    query_count: AtomicU64,
    error_count: AtomicU64,
    failure_count: AtomicU64,
    recovery_attempts: AtomicU64,
    meta: Mutex<Meta>,
}

impl InterfaceHealth {
    pub fn new(now: Instant) -> Self {
        Self {
            query_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            recovery_attempts: AtomicU64::new(0),
            meta: Mutex::new(Meta {
                status: InterfaceStatus::Active,
                score: 1.0,
                score_at: now,
                last_failure: None,
                backoff: BACKOFF_INITIAL,
                backoff_until: None,
            }),
        }
    }

    pub fn record_query(&self) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
    }

    /// A transient I/O error: cheap penalty, no state change.
    pub fn record_error(&self, now: Instant) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let mut meta = self.meta.lock();
        let current = current_score(&meta, now);
        meta.score = (current - ERROR_PENALTY).max(0.0);
        meta.score_at = now;
    }

    /// A persistent fault: the interface transitions to Failing and gets an
    /// exponentially growing backoff before the next recovery attempt.
    pub fn record_failure(&self, now: Instant) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let mut meta = self.meta.lock();
        let current = current_score(&meta, now);
        meta.score = (current - FAILURE_PENALTY).max(0.0);
        meta.score_at = now;
        meta.status = InterfaceStatus::Failing;
        meta.last_failure = Some(now);
        meta.backoff_until = Some(now + meta.backoff);
        meta.backoff = (meta.backoff * BACKOFF_MULTIPLIER).min(BACKOFF_CAP);
    }

    /// True when a failing interface's backoff has elapsed; flips the state
    /// to Recovering and counts the attempt.
    pub fn try_begin_recovery(&self, now: Instant) -> bool {
        let mut meta = self.meta.lock();
        if meta.status != InterfaceStatus::Failing {
            return false;
        }
        let due = meta.backoff_until.map(|until| now >= until).unwrap_or(true);
        if !due {
            return false;
        }
        meta.status = InterfaceStatus::Recovering;
        drop(meta);
        self.recovery_attempts.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// A recovery attempt succeeded: back to Active, backoff reset.
    pub fn recovered(&self, now: Instant) {
        let mut meta = self.meta.lock();
        meta.status = InterfaceStatus::Active;
        meta.backoff = BACKOFF_INITIAL;
        meta.backoff_until = None;
        // The score is not bumped here: it climbs back with quiet uptime.
        let current = current_score(&meta, now);
        meta.score = current;
        meta.score_at = now;
    }

    pub fn removed(&self) {
        self.meta.lock().status = InterfaceStatus::Removed;
    }

    pub fn status(&self) -> InterfaceStatus {
        self.meta.lock().status
    }

    /// Health in [0, 1] with time-based recovery applied.
    pub fn score(&self, now: Instant) -> f64 {
        current_score(&self.meta.lock(), now)
    }

    pub fn queries(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn recovery_attempts(&self) -> u64 {
        self.recovery_attempts.load(Ordering::Relaxed)
    }
}

fn current_score(meta: &Meta, now: Instant) -> f64 {
    let elapsed = now.saturating_duration_since(meta.score_at);
    let regained = elapsed.as_secs_f64() / SCORE_RECOVERY.as_secs_f64();
    (meta.score + regained).clamp(0.0, 1.0)
}

/// Aggregate health over every tracked interface, with hysteresis between
/// the recovery-mode thresholds.
pub struct SystemHealth {
    in_recovery: Mutex<bool>,
}

impl Default for SystemHealth {
    fn default() -> Self {
        Self {
            in_recovery: Mutex::new(false),
        }
    }
}

impl SystemHealth {
    /// Feeds the current per-interface scores; returns true when the system
    /// is (now) in recovery mode.
    pub fn evaluate(&self, scores: &[f64]) -> bool {
        let average = if scores.is_empty() {
            1.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        let mut in_recovery = self.in_recovery.lock();
        if *in_recovery {
            if average > SYSTEM_RECOVERY_EXIT {
                *in_recovery = false;
            }
        } else if average < SYSTEM_RECOVERY_ENTER {
            *in_recovery = true;
        }
        *in_recovery
    }

    pub fn in_recovery(&self) -> bool {
        *self.in_recovery.lock()
    }
}
