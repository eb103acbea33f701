//! Multi-interface mDNS responder.
//!
//! Advertises `<name>.local` on every LAN the device is attached to. Each
//! active interface runs a dual-stack socket pair with its own read loop;
//! the responder owns all per-interface state and consumes observations
//! from the interface watcher to set up, tear down and recover interfaces
//! as links come and go.
//!
//! The advertised name starts as the configured base ("piccolo") and, on a
//! probe conflict, deterministically becomes `<base>-<6 hex>` derived from
//! the machine identity, so the same device re-adopts the same name across
//! reboots.

pub mod conflict;
pub mod health;
pub mod interfaces;
pub mod packet;
pub mod ratelimit;
pub mod socket;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::machine_id::MachineId;
use conflict::{ConflictDetector, PROBE_COUNT, PROBE_WAIT};
use health::{InterfaceHealth, InterfaceStatus, SystemHealth};
use interfaces::{InterfaceObservation, InterfaceSource};
use packet::{Inbound, ParsedQuery, QueryKind, ResponseRecord, RECORD_TTL};
use ratelimit::{QueryRateLimiter, RateDecision};

pub const DEFAULT_BASE_NAME: &str = "piccolo";

/// The read deadline that doubles as the cancellation polling period.
const READ_DEADLINE: Duration = Duration::from_secs(1);
/// Consecutive receive errors before an interface is declared failing.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

#[derive(Debug, Clone)]
pub struct MdnsConfig {
    pub base_name: String,
    /// Interface list polling period.
    pub poll_interval: Duration,
    /// Periodic conflict probe period.
    pub probe_interval: Duration,
    /// Steady-state announcement period.
    pub announce_interval: Duration,
    /// Concurrent query-processing permits; excess queries are dropped.
    pub query_permits: usize,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            base_name: DEFAULT_BASE_NAME.to_string(),
            poll_interval: Duration::from_secs(10),
            probe_interval: Duration::from_secs(5 * 60),
            announce_interval: Duration::from_secs(60),
            query_permits: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stack {
    V4,
    V6,
}

#[derive(Default)]
pub struct MdnsMetrics {
    queries_received: AtomicU64,
    queries_answered: AtomicU64,
    packets_dropped: AtomicU64,
    responses_oversized: AtomicU64,
    announcements: AtomicU64,
    name_changes: AtomicU64,
}

impl MdnsMetrics {
    pub fn queries_received(&self) -> u64 {
        self.queries_received.load(Ordering::Relaxed)
    }
    pub fn queries_answered(&self) -> u64 {
        self.queries_answered.load(Ordering::Relaxed)
    }
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }
    pub fn responses_oversized(&self) -> u64 {
        self.responses_oversized.load(Ordering::Relaxed)
    }
    pub fn announcements(&self) -> u64 {
        self.announcements.load(Ordering::Relaxed)
    }
    pub fn name_changes(&self) -> u64 {
        self.name_changes.load(Ordering::Relaxed)
    }
}

struct IfaceRuntime {
    obs: InterfaceObservation,
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
    health: Arc<InterfaceHealth>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    base_name: String,
    /// Deterministic conflict suffix from the machine identity.
    suffix: String,
    /// Current advertised host name, without the `.local` suffix.
    name: RwLock<String>,
    conflict: ConflictDetector,
    limiter: QueryRateLimiter,
    permits: Semaphore,
    system: SystemHealth,
    metrics: MdnsMetrics,
    interfaces: Mutex<HashMap<String, IfaceRuntime>>,
    cancel: CancellationToken,
}

impl Shared {
    fn current_name(&self) -> String {
        self.name.read().clone()
    }

    fn full_name(&self) -> String {
        format!("{}.local", self.name.read())
    }

    fn our_addresses(&self) -> Vec<IpAddr> {
        self.interfaces
            .lock()
            .values()
            .flat_map(|entry| entry.obs.addresses.iter().copied())
            .collect()
    }
}

pub struct MdnsResponder {
    config: MdnsConfig,
    source: Arc<dyn InterfaceSource>,
    shared: Arc<Shared>,
}

impl MdnsResponder {
    pub fn new(
        config: MdnsConfig,
        machine_id: &MachineId,
        source: Arc<dyn InterfaceSource>,
    ) -> Self {
        let shared = Arc::new(Shared {
            base_name: config.base_name.clone(),
            suffix: machine_id.suffix6(),
            name: RwLock::new(config.base_name.clone()),
            conflict: ConflictDetector::new(),
            limiter: QueryRateLimiter::new(),
            permits: Semaphore::new(config.query_permits),
            system: SystemHealth::default(),
            metrics: MdnsMetrics::default(),
            interfaces: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        Self {
            config,
            source,
            shared,
        }
    }

    /// The currently advertised `<name>.local`.
    pub fn advertised_name(&self) -> String {
        self.shared.full_name()
    }

    pub fn metrics(&self) -> &MdnsMetrics {
        &self.shared.metrics
    }

    pub fn rate_limit_hits(&self) -> u64 {
        self.shared.limiter.rate_limit_hits()
    }

    /// Runs until cancelled: interface sync, probe and announce schedules,
    /// rate-limiter reaping and system health evaluation.
    pub async fn run(&self, cancel: CancellationToken) {
        let shared = &self.shared;
        sync_interfaces(shared, self.source.as_ref()).await;

        // RFC 6762 wants a random short delay before the first probe so
        // simultaneous reboots don't collide.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        tokio::time::sleep(jitter).await;
        probe_all(shared).await;

        // Startup announcement burst at t = 0, 1, 2 s.
        for round in 0..3 {
            announce_all(shared).await;
            if round < 2 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut announce = tokio::time::interval(self.config.announce_interval);
        let mut probe = tokio::time::interval(self.config.probe_interval);
        // Intervals fire immediately on the first tick; those are done above.
        poll.tick().await;
        announce.tick().await;
        probe.tick().await;

        let mut was_in_recovery = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => {
                    sync_interfaces(shared, self.source.as_ref()).await;
                    shared.limiter.reap(Instant::now());

                    let now = Instant::now();
                    let scores: Vec<f64> = shared
                        .interfaces
                        .lock()
                        .values()
                        .filter(|entry| entry.health.status() != InterfaceStatus::Removed)
                        .map(|entry| entry.health.score(now))
                        .collect();
                    let in_recovery = shared.system.evaluate(&scores);
                    if in_recovery && !was_in_recovery {
                        warn!(target: "resilience", "system health degraded; re-enumerating all interfaces");
                        teardown_all(shared).await;
                        sync_interfaces(shared, self.source.as_ref()).await;
                    } else if !in_recovery && was_in_recovery {
                        info!(target: "resilience", "system health recovered");
                    }
                    was_in_recovery = in_recovery;
                }
                _ = announce.tick() => announce_all(shared).await,
                _ = probe.tick() => probe_all(shared).await,
            }
        }

        // Goodbye: withdraw the name with TTL 0, then release the sockets.
        send_records(shared, &self.advertised_name(), 0).await;
        teardown_all(shared).await;
        shared.cancel.cancel();
        info!("mDNS responder stopped");
    }
}

/// Diffs the latest interface snapshot against running state: new
/// interfaces are set up, changed ones rebuilt, vanished ones removed, and
/// failing ones retried once their backoff elapses.
async fn sync_interfaces(shared: &Arc<Shared>, source: &dyn InterfaceSource) {
    let snapshot = match source.enumerate() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(target: "resilience", %err, "interface enumeration failed");
            return;
        }
    };
    let now = Instant::now();

    enum Action {
        Setup(InterfaceObservation, Option<Arc<InterfaceHealth>>),
        Remove(String),
    }

    let mut actions = Vec::new();
    {
        let map = shared.interfaces.lock();
        for obs in &snapshot {
            match map.get(&obs.name) {
                None => actions.push(Action::Setup(obs.clone(), None)),
                Some(entry) => {
                    let changed = entry.obs.ipv4 != obs.ipv4
                        || entry.obs.ipv6 != obs.ipv6
                        || entry.obs.index != obs.index;
                    let retry = entry.health.status() == InterfaceStatus::Failing
                        && entry.health.try_begin_recovery(now);
                    if changed || retry {
                        actions.push(Action::Setup(obs.clone(), Some(Arc::clone(&entry.health))));
                    }
                }
            }
        }
        for name in map.keys() {
            if !snapshot.iter().any(|obs| &obs.name == name) {
                actions.push(Action::Remove(name.clone()));
            }
        }
    }

    for action in actions {
        match action {
            Action::Remove(name) => {
                let entry = shared.interfaces.lock().remove(&name);
                if let Some(entry) = entry {
                    entry.health.removed();
                    teardown_entry(entry).await;
                    info!(iface = %name, "interface removed");
                }
            }
            Action::Setup(obs, health) => {
                let previous = shared.interfaces.lock().remove(&obs.name);
                if let Some(previous) = previous {
                    teardown_entry(previous).await;
                }
                setup_interface(shared, obs, health);
            }
        }
    }
}

fn setup_interface(
    shared: &Arc<Shared>,
    obs: InterfaceObservation,
    health: Option<Arc<InterfaceHealth>>,
) {
    let now = Instant::now();
    let health = health.unwrap_or_else(|| Arc::new(InterfaceHealth::new(now)));
    let pair = socket::open_pair(&obs);

    if pair.is_empty() {
        warn!(target: "resilience", iface = %obs.name, "no mDNS socket on either stack; interface failing");
        health.record_failure(now);
        shared.interfaces.lock().insert(
            obs.name.clone(),
            IfaceRuntime {
                obs,
                v4: None,
                v6: None,
                health,
                cancel: shared.cancel.child_token(),
                tasks: Vec::new(),
            },
        );
        return;
    }

    let cancel = shared.cancel.child_token();
    let v4 = pair.v4.map(Arc::new);
    let v6 = pair.v6.map(Arc::new);
    let mut tasks = Vec::new();
    if let Some(sock) = &v4 {
        tasks.push(tokio::spawn(read_loop(
            Arc::clone(shared),
            Arc::clone(sock),
            Stack::V4,
            obs.clone(),
            Arc::clone(&health),
            cancel.clone(),
        )));
    }
    if let Some(sock) = &v6 {
        tasks.push(tokio::spawn(read_loop(
            Arc::clone(shared),
            Arc::clone(sock),
            Stack::V6,
            obs.clone(),
            Arc::clone(&health),
            cancel.clone(),
        )));
    }

    health.recovered(now);
    info!(
        iface = %obs.name,
        ipv4 = ?obs.ipv4,
        ipv6 = ?obs.ipv6,
        "interface active"
    );
    shared.interfaces.lock().insert(
        obs.name.clone(),
        IfaceRuntime {
            obs,
            v4,
            v6,
            health,
            cancel,
            tasks,
        },
    );
}

async fn teardown_entry(mut entry: IfaceRuntime) {
    entry.cancel.cancel();
    futures::future::join_all(entry.tasks.drain(..)).await;
}

async fn teardown_all(shared: &Arc<Shared>) {
    let entries: Vec<IfaceRuntime> = {
        let mut map = shared.interfaces.lock();
        map.drain().map(|(_, entry)| entry).collect()
    };
    for entry in entries {
        teardown_entry(entry).await;
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    sock: Arc<UdpSocket>,
    stack: Stack,
    obs: InterfaceObservation,
    health: Arc<InterfaceHealth>,
    cancel: CancellationToken,
) {
    // One byte beyond the maximum so oversized datagrams are detectable.
    let mut buf = vec![0u8; packet::MAX_PACKET_SIZE + 1];
    let mut consecutive_errors = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(READ_DEADLINE, sock.recv_from(&mut buf)) => {
                match result {
                    // Deadline lapses are just cancellation polling.
                    Err(_) => continue,
                    Ok(Err(err)) => {
                        health.record_error(Instant::now());
                        consecutive_errors += 1;
                        debug!(iface = %obs.name, ?stack, %err, "mDNS receive error");
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            warn!(
                                target: "resilience",
                                iface = %obs.name,
                                ?stack,
                                "interface failing after repeated receive errors"
                            );
                            health.record_failure(Instant::now());
                            return;
                        }
                    }
                    Ok(Ok((len, peer))) => {
                        consecutive_errors = 0;
                        handle_datagram(&shared, &sock, stack, &obs, &health, &buf[..len], peer)
                            .await;
                    }
                }
            }
        }
    }
}

async fn handle_datagram(
    shared: &Arc<Shared>,
    sock: &UdpSocket,
    stack: Stack,
    obs: &InterfaceObservation,
    health: &InterfaceHealth,
    data: &[u8],
    peer: SocketAddr,
) {
    shared.metrics.queries_received.fetch_add(1, Ordering::Relaxed);

    match shared.limiter.check(peer.ip()) {
        RateDecision::Accepted => {}
        RateDecision::NewlyBlocked | RateDecision::Blocked => {
            shared.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    // Bounded concurrency: beyond the permit pool, drop rather than queue.
    let Ok(_permit) = shared.permits.try_acquire() else {
        shared.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
        debug!(%peer, "query permits exhausted; dropping");
        return;
    };

    match packet::parse_packet(data) {
        Err(err) => {
            shared.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(target: "security", %peer, %err, "rejected mDNS packet");
        }
        Ok(Inbound::Response(answers)) => {
            process_response_answers(shared, &answers, peer.ip());
        }
        Ok(Inbound::Query(query)) => {
            health.record_query();
            answer_query(shared, sock, stack, obs, &query, peer).await;
        }
    }
}

/// Builds the records answering one question on the stack it arrived on.
fn records_for(
    kind: QueryKind,
    stack: Stack,
    obs: &InterfaceObservation,
    full_name: &str,
) -> Vec<ResponseRecord> {
    let mut records = Vec::new();
    match stack {
        Stack::V4 => {
            if kind.wants_a() {
                if let Some(ipv4) = obs.ipv4 {
                    records.push(ResponseRecord {
                        name: full_name.to_string(),
                        ip: IpAddr::V4(ipv4),
                    });
                }
            }
        }
        Stack::V6 => {
            if kind.wants_aaaa() {
                if let Some(ipv6) = obs.ipv6 {
                    records.push(ResponseRecord {
                        name: full_name.to_string(),
                        ip: IpAddr::V6(ipv6),
                    });
                }
            }
        }
    }
    records
}

async fn answer_query(
    shared: &Arc<Shared>,
    sock: &UdpSocket,
    stack: Stack,
    obs: &InterfaceObservation,
    query: &ParsedQuery,
    peer: SocketAddr,
) {
    let full_name = shared.full_name();
    let mut records: Vec<ResponseRecord> = Vec::new();
    let mut unicast = query.probe;
    for question in &query.questions {
        if question.name != full_name {
            continue;
        }
        unicast |= question.unicast_reply;
        for record in records_for(question.kind, stack, obs, &full_name) {
            if !records.contains(&record) {
                records.push(record);
            }
        }
    }
    if records.is_empty() {
        return;
    }

    let (dest, id) = if unicast {
        (peer, query.id)
    } else {
        (multicast_dest(stack, obs), 0)
    };

    match packet::encode_response(id, &records, RECORD_TTL) {
        Ok(bytes) => {
            if let Err(err) = sock.send_to(&bytes, dest).await {
                debug!(%dest, %err, "mDNS send failed");
            } else {
                shared.metrics.queries_answered.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(err) => {
            shared
                .metrics
                .responses_oversized
                .fetch_add(1, Ordering::Relaxed);
            warn!(target: "security", %err, "dropping oversized mDNS response");
        }
    }
}

fn multicast_dest(stack: Stack, obs: &InterfaceObservation) -> SocketAddr {
    match stack {
        Stack::V4 => socket::group_addr_v4(),
        Stack::V6 => socket::group_addr_v6(obs.index),
    }
}

/// Feeds foreign answers into the conflict detector; a fresh conflict
/// triggers deterministic name resolution.
fn process_response_answers(
    shared: &Arc<Shared>,
    answers: &[packet::AnswerRecord],
    source: IpAddr,
) {
    let full_name = shared.full_name();
    let ours = shared.our_addresses();
    let now = Instant::now();
    for (name, _ip) in answers {
        if shared
            .conflict
            .observe_answer(name, &full_name, source, &ours, now)
        {
            resolve_conflict(shared);
        }
    }
}

/// Adopts the suffixed name and bursts three announcements one second
/// apart, after withdrawing the old name.
fn resolve_conflict(shared: &Arc<Shared>) {
    let attempts = shared.conflict.begin_resolution();
    let old_name = shared.current_name();
    let new_name = format!("{}-{}", shared.base_name, shared.suffix);
    *shared.name.write() = new_name.clone();
    if old_name != new_name {
        shared.metrics.name_changes.fetch_add(1, Ordering::Relaxed);
    }
    info!(
        target: "conflict",
        old = %old_name,
        new = %new_name,
        attempts,
        "adopting conflict-free name"
    );

    let shared = Arc::clone(shared);
    let old_full = format!("{old_name}.local");
    tokio::spawn(async move {
        if old_full != shared.full_name() {
            send_records(&shared, &old_full, 0).await;
        }
        for round in 0..3 {
            announce_all(&shared).await;
            if round < 2 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });
}

/// Sends authoritative records for `name` on every active stack; TTL 120
/// announces, TTL 0 withdraws.
async fn send_records(shared: &Arc<Shared>, name: &str, ttl: u32) {
    let sends: Vec<(Arc<UdpSocket>, SocketAddr, ResponseRecord)> = {
        let map = shared.interfaces.lock();
        let mut sends = Vec::new();
        for entry in map.values() {
            if let (Some(sock), Some(ipv4)) = (&entry.v4, entry.obs.ipv4) {
                sends.push((
                    Arc::clone(sock),
                    socket::group_addr_v4(),
                    ResponseRecord {
                        name: name.to_string(),
                        ip: IpAddr::V4(ipv4),
                    },
                ));
            }
            if let (Some(sock), Some(ipv6)) = (&entry.v6, entry.obs.ipv6) {
                sends.push((
                    Arc::clone(sock),
                    socket::group_addr_v6(entry.obs.index),
                    ResponseRecord {
                        name: name.to_string(),
                        ip: IpAddr::V6(ipv6),
                    },
                ));
            }
        }
        sends
    };

    for (sock, dest, record) in sends {
        match packet::encode_response(0, std::slice::from_ref(&record), ttl) {
            Ok(bytes) => {
                if let Err(err) = sock.send_to(&bytes, dest).await {
                    debug!(%dest, %err, "announcement send failed");
                }
            }
            Err(err) => {
                shared
                    .metrics
                    .responses_oversized
                    .fetch_add(1, Ordering::Relaxed);
                warn!(target: "security", %err, "dropping oversized announcement");
            }
        }
    }
}

async fn announce_all(shared: &Arc<Shared>) {
    let full_name = shared.full_name();
    send_records(shared, &full_name, RECORD_TTL).await;
    shared.metrics.announcements.fetch_add(1, Ordering::Relaxed);
}

/// One probe cycle: a type-ANY query for the current name on every active
/// stack, repeated with the standard spacing while the conflict window is
/// open. Responses are handled by the normal read path.
async fn probe_all(shared: &Arc<Shared>) {
    shared.conflict.open_probe_window(Instant::now());
    let full_name = shared.full_name();
    let bytes = match packet::encode_query(&full_name, QueryKind::Any) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%err, "probe query encoding failed");
            return;
        }
    };

    for round in 0..PROBE_COUNT {
        let sends: Vec<(Arc<UdpSocket>, SocketAddr)> = {
            let map = shared.interfaces.lock();
            let mut sends = Vec::new();
            for entry in map.values() {
                if let Some(sock) = &entry.v4 {
                    sends.push((Arc::clone(sock), socket::group_addr_v4()));
                }
                if let Some(sock) = &entry.v6 {
                    sends.push((Arc::clone(sock), socket::group_addr_v6(entry.obs.index)));
                }
            }
            sends
        };
        for (sock, dest) in sends {
            if let Err(err) = sock.send_to(&bytes, dest).await {
                debug!(%dest, %err, "probe send failed");
            }
        }
        if round + 1 < PROBE_COUNT {
            tokio::time::sleep(PROBE_WAIT).await;
        }
    }
}
