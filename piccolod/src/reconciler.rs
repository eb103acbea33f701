//! Reconciliation of declared application specs against running state.
//!
//! The reconciler is the sole writer to the service registry and the only
//! component that launches or kills containers. Operations on the same app
//! are serialized through a per-app lock; different apps reconcile
//! concurrently.
//!
//! Container changes are never silent: whenever a listener is added or
//! removed, or a guest port moves, the outcome tells the caller the
//! container process must be replaced.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use piccolo_api::{AppSpec, Listener};
use tracing::{info, warn};

use crate::ports::{PortAllocator, PortError};
use crate::proxy::{ProxyEngine, ProxyError};
use crate::registry::{ServiceEndpoint, ServiceRegistry};
use crate::runtime::{ContainerRuntime, LaunchSpec, RuntimeError};

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Validate(#[from] piccolo_api::ValidateError),
    #[error(transparent)]
    Ports(#[from] PortError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    /// The container runtime failed; previously-running services were not
    /// disturbed. The underlying runtime message is preserved.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("app {app:?} is not installed")]
    UnknownApp { app: String },
    #[error("app {app:?} is already installed")]
    AlreadyInstalled { app: String },
}

/// What a reconcile pass changed, by listener name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub guest_port_changed: Vec<String>,
    /// Listeners whose proxy was restarted in place (flow, protocol or
    /// middleware changed; ports retained).
    pub proxy_restarted: Vec<String>,
    /// True when the container process must be replaced for the new spec to
    /// take effect.
    pub container_change: bool,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        !self.container_change
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.guest_port_changed.is_empty()
            && self.proxy_restarted.is_empty()
    }
}

pub struct Reconciler {
    allocator: Arc<PortAllocator>,
    registry: Arc<ServiceRegistry>,
    proxy: Arc<ProxyEngine>,
    runtime: Arc<dyn ContainerRuntime>,
    app_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(
        allocator: Arc<PortAllocator>,
        registry: Arc<ServiceRegistry>,
        proxy: Arc<ProxyEngine>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            allocator,
            registry,
            proxy,
            runtime,
            app_locks: Mutex::new(HashMap::new()),
        }
    }

    fn app_lock(&self, app: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.app_locks
                .lock()
                .entry(app.to_string())
                .or_default(),
        )
    }

    /// Allocates a port pair per listener, records the endpoints and starts
    /// their proxies. Any failure rolls back everything allocated by this
    /// call.
    pub async fn allocate_for_app(
        &self,
        app: &str,
        listeners: &[Listener],
    ) -> Result<Vec<ServiceEndpoint>, ReconcileError> {
        let mut created: Vec<ServiceEndpoint> = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let result = async {
                let pair = self.allocator.allocate_pair()?;
                let endpoint =
                    ServiceEndpoint::from_listener(app, listener, pair.host_bind, pair.public_port);
                self.registry.insert(endpoint.clone());
                self.proxy.start(&endpoint).await?;
                Ok::<_, ReconcileError>(endpoint)
            }
            .await;
            match result {
                Ok(endpoint) => created.push(endpoint),
                Err(err) => {
                    self.rollback_endpoints(&created).await;
                    return Err(err);
                }
            }
        }
        Ok(created)
    }

    async fn rollback_endpoints(&self, endpoints: &[ServiceEndpoint]) {
        for endpoint in endpoints {
            self.proxy.stop_port(endpoint.public_port).await;
            self.registry.remove(&endpoint.app, &endpoint.name);
            self.allocator
                .release(endpoint.host_bind, endpoint.public_port);
        }
    }

    /// Rebuilds registry state for a container that survived a daemon
    /// restart. Observed host ports are reserved in the allocator so live
    /// publish mappings stay stable; a listener whose observed port cannot
    /// be reserved is skipped at the cost of proxy coverage for it. On
    /// success the adopted container reference is recorded; any other
    /// failure rolls back everything restored by this call.
    pub async fn restore_from_runtime(
        &self,
        app: &str,
        listeners: &[Listener],
        host_by_guest: &HashMap<u16, u16>,
    ) -> Result<Vec<ServiceEndpoint>, ReconcileError> {
        let _guard = self.app_lock(app).lock_owned().await;
        let mut restored = Vec::new();
        for listener in listeners {
            let Some(&host_bind) = host_by_guest.get(&listener.guest_port) else {
                warn!(
                    app,
                    listener = %listener.name,
                    guest_port = listener.guest_port,
                    "no live publish mapping; listener not restored"
                );
                continue;
            };
            if let Err(err) = self.allocator.reserve_host(host_bind) {
                warn!(
                    app,
                    listener = %listener.name,
                    host_bind,
                    %err,
                    "observed host port not reservable; listener not restored"
                );
                continue;
            }
            let public_port = match self.allocator.allocate_public() {
                Ok(port) => port,
                Err(err) => {
                    self.allocator.release(host_bind, 0);
                    self.rollback_endpoints(&restored).await;
                    return Err(err.into());
                }
            };
            let endpoint = ServiceEndpoint::from_listener(app, listener, host_bind, public_port);
            self.registry.insert(endpoint.clone());
            if let Err(err) = self.proxy.start(&endpoint).await {
                self.registry.remove(app, &listener.name);
                self.allocator.release(host_bind, public_port);
                self.rollback_endpoints(&restored).await;
                return Err(err.into());
            }
            restored.push(endpoint);
        }
        // The runtime keys the adopted container by the app name; record it
        // so apply and uninstall treat the container as owned.
        self.registry.set_container(app, app.to_string());
        info!(app, restored = restored.len(), "registry restored from runtime");
        Ok(restored)
    }

    /// Diffs the declared listener set against the registry and converges.
    /// Retained listeners keep their port pair; their proxy is restarted
    /// only when flow, protocol or middleware changed.
    pub async fn reconcile(
        &self,
        app: &str,
        listeners: &[Listener],
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let _guard = self.app_lock(app).lock_owned().await;
        self.reconcile_locked(app, listeners).await
    }

    async fn reconcile_locked(
        &self,
        app: &str,
        listeners: &[Listener],
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let mut outcome = ReconcileOutcome::default();
        let existing: HashMap<String, ServiceEndpoint> = self
            .registry
            .endpoints_for_app(app)
            .into_iter()
            .map(|endpoint| (endpoint.name.clone(), endpoint))
            .collect();

        let mut added_endpoints = Vec::new();
        for listener in listeners {
            match existing.get(&listener.name) {
                None => {
                    let result = async {
                        let pair = self.allocator.allocate_pair()?;
                        let endpoint = ServiceEndpoint::from_listener(
                            app,
                            listener,
                            pair.host_bind,
                            pair.public_port,
                        );
                        self.registry.insert(endpoint.clone());
                        self.proxy.start(&endpoint).await?;
                        Ok::<_, ReconcileError>(endpoint)
                    }
                    .await;
                    match result {
                        Ok(endpoint) => {
                            added_endpoints.push(endpoint);
                            outcome.added.push(listener.name.clone());
                            outcome.container_change = true;
                        }
                        Err(err) => {
                            self.rollback_endpoints(&added_endpoints).await;
                            return Err(err);
                        }
                    }
                }
                Some(current) => {
                    let updated = ServiceEndpoint::from_listener(
                        app,
                        listener,
                        current.host_bind,
                        current.public_port,
                    );
                    if updated.guest_port != current.guest_port {
                        outcome.guest_port_changed.push(listener.name.clone());
                        outcome.container_change = true;
                    }
                    let restart_proxy = updated.proxy_config_differs(current);
                    if updated != *current {
                        self.registry.insert(updated.clone());
                    }
                    if restart_proxy {
                        self.proxy.stop_port(updated.public_port).await;
                        self.proxy.start(&updated).await?;
                        outcome.proxy_restarted.push(listener.name.clone());
                    }
                }
            }
        }

        let declared: std::collections::HashSet<&str> =
            listeners.iter().map(|l| l.name.as_str()).collect();
        for (name, endpoint) in &existing {
            if !declared.contains(name.as_str()) {
                self.proxy.stop_port(endpoint.public_port).await;
                self.registry.remove(app, name);
                self.allocator
                    .release(endpoint.host_bind, endpoint.public_port);
                outcome.removed.push(name.clone());
                outcome.container_change = true;
            }
        }

        info!(
            app,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            guest_port_changed = outcome.guest_port_changed.len(),
            proxy_restarted = outcome.proxy_restarted.len(),
            container_change = outcome.container_change,
            "reconcile complete"
        );
        Ok(outcome)
    }

    /// Stops all listeners of an app, releases their port pairs and forgets
    /// the container reference. Does not touch the container process.
    pub async fn remove_app(&self, app: &str) {
        let _guard = self.app_lock(app).lock_owned().await;
        let removed = self.registry.remove_app(app);
        for endpoint in removed {
            self.proxy.stop_port(endpoint.public_port).await;
            self.allocator
                .release(endpoint.host_bind, endpoint.public_port);
        }
    }

    /// Full install: validate, allocate, wire proxies, launch the container.
    pub async fn install(&self, spec: &AppSpec) -> Result<(), ReconcileError> {
        spec.validate()?;
        let _guard = self.app_lock(&spec.name).lock_owned().await;
        if !self.registry.endpoints_for_app(&spec.name).is_empty() {
            return Err(ReconcileError::AlreadyInstalled {
                app: spec.name.clone(),
            });
        }
        let endpoints = self.allocate_for_app(&spec.name, &spec.listeners).await?;
        match self.launch(spec, &endpoints).await {
            Ok(container_id) => {
                self.registry.set_container(&spec.name, container_id);
                Ok(())
            }
            Err(err) => {
                self.rollback_endpoints(&endpoints).await;
                self.registry.remove_app(&spec.name);
                Err(err)
            }
        }
    }

    /// Applies a new revision of an installed app: reconcile listeners, and
    /// replace the container process only when the outcome demands it.
    pub async fn apply(&self, spec: &AppSpec) -> Result<ReconcileOutcome, ReconcileError> {
        spec.validate()?;
        let _guard = self.app_lock(&spec.name).lock_owned().await;
        if self.registry.endpoints_for_app(&spec.name).is_empty() {
            return Err(ReconcileError::UnknownApp {
                app: spec.name.clone(),
            });
        }
        let outcome = self.reconcile_locked(&spec.name, &spec.listeners).await?;
        if outcome.container_change {
            if let Some(old) = self.registry.container_id(&spec.name) {
                info!(app = %spec.name, container = %old, "replacing container");
                if let Err(err) = self.runtime.stop(&spec.name).await {
                    warn!(app = %spec.name, %err, "stopping old container failed");
                }
                if let Err(err) = self.runtime.remove(&spec.name).await {
                    warn!(app = %spec.name, %err, "removing old container failed");
                }
            }
            let endpoints = self.registry.endpoints_for_app(&spec.name);
            let container_id = self.launch(spec, &endpoints).await?;
            self.registry.set_container(&spec.name, container_id);
        }
        Ok(outcome)
    }

    /// Tears an app down completely: container first, then endpoints.
    pub async fn uninstall(&self, app: &str) -> Result<(), ReconcileError> {
        {
            let _guard = self.app_lock(app).lock_owned().await;
            if self.registry.container_id(app).is_some() {
                if let Err(err) = self.runtime.stop(app).await {
                    warn!(app, %err, "stopping container failed");
                }
                if let Err(err) = self.runtime.remove(app).await {
                    warn!(app, %err, "removing container failed");
                }
            }
        }
        self.remove_app(app).await;
        Ok(())
    }

    /// Re-adopts a still-running container after a daemon restart, or does a
    /// fresh install when the container is gone.
    pub async fn adopt_or_install(&self, spec: &AppSpec) -> Result<(), ReconcileError> {
        spec.validate()?;
        if self.runtime.is_running(&spec.name).await? {
            let mappings = self.runtime.port_map(&spec.name).await?;
            let host_by_guest: HashMap<u16, u16> = mappings
                .iter()
                .map(|m| (m.guest_port, m.host_port))
                .collect();
            self.restore_from_runtime(&spec.name, &spec.listeners, &host_by_guest)
                .await?;
            Ok(())
        } else {
            self.install(spec).await
        }
    }

    async fn launch(
        &self,
        spec: &AppSpec,
        endpoints: &[ServiceEndpoint],
    ) -> Result<String, ReconcileError> {
        let by_name: HashMap<&str, &ServiceEndpoint> = endpoints
            .iter()
            .map(|endpoint| (endpoint.name.as_str(), endpoint))
            .collect();
        // Publishes follow the declared listener order.
        let publishes: Vec<(u16, u16)> = spec
            .listeners
            .iter()
            .filter_map(|listener| by_name.get(listener.name.as_str()))
            .map(|endpoint| (endpoint.host_bind, endpoint.guest_port))
            .collect();
        let launch = LaunchSpec::from_app(spec, publishes)?;
        Ok(self.runtime.run(&launch).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortRange;
    use crate::runtime::PortMapping;
    use async_trait::async_trait;
    use piccolo_api::{Flow, Protocol};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct MockRuntime {
        fail_run: AtomicBool,
        launches: Mutex<Vec<LaunchSpec>>,
        running: Mutex<std::collections::HashSet<String>>,
        port_tables: Mutex<HashMap<String, Vec<PortMapping>>>,
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn run(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
            if self.fail_run.load(Ordering::SeqCst) {
                return Err(RuntimeError::BadPortLine {
                    line: "simulated launch failure".to_string(),
                });
            }
            self.launches.lock().push(spec.clone());
            self.running.lock().insert(spec.name.clone());
            Ok(format!("id-{}", spec.name))
        }

        async fn start(&self, _name: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
            self.running.lock().remove(name);
            Ok(())
        }

        async fn remove(&self, _name: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn port_map(&self, name: &str) -> Result<Vec<PortMapping>, RuntimeError> {
            Ok(self.port_tables.lock().get(name).cloned().unwrap_or_default())
        }

        async fn is_running(&self, name: &str) -> Result<bool, RuntimeError> {
            Ok(self.running.lock().contains(name))
        }
    }

    struct Fixture {
        allocator: Arc<PortAllocator>,
        registry: Arc<ServiceRegistry>,
        proxy: Arc<ProxyEngine>,
        runtime: Arc<MockRuntime>,
        reconciler: Reconciler,
    }

    /// Each test gets its own public sub-range so parallel tests never race
    /// on a wildcard bind.
    fn fixture(host_base: u16, public_base: u16) -> Fixture {
        fixture_ranges(
            PortRange::new(host_base, host_base + 20),
            PortRange::new(public_base, public_base + 20),
        )
    }

    fn fixture_ranges(host: PortRange, public: PortRange) -> Fixture {
        let allocator = Arc::new(PortAllocator::new(host, public));
        let registry = Arc::new(ServiceRegistry::new());
        let proxy = Arc::new(ProxyEngine::new());
        let runtime = Arc::new(MockRuntime::default());
        let reconciler = Reconciler::new(
            Arc::clone(&allocator),
            Arc::clone(&registry),
            Arc::clone(&proxy),
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        );
        Fixture {
            allocator,
            registry,
            proxy,
            runtime,
            reconciler,
        }
    }

    fn listener(name: &str, guest_port: u16) -> Listener {
        Listener {
            name: name.to_string(),
            guest_port,
            flow: Flow::Tcp,
            protocol: Protocol::Raw,
            middleware: vec![],
            remote_ports: vec![],
        }
    }

    fn spec(name: &str, listeners: Vec<Listener>) -> AppSpec {
        AppSpec {
            name: name.to_string(),
            image: "demo-image:latest".to_string(),
            listeners,
            environment: Default::default(),
            volumes: vec![],
            resources: Default::default(),
            permissions: Default::default(),
        }
    }

    #[tokio::test]
    async fn install_allocates_first_fit_and_publishes_loopback() {
        let f = fixture(15000, 35100);
        f.reconciler
            .install(&spec("demo", vec![listener("http", 80)]))
            .await
            .unwrap();

        let endpoint = f.registry.get("demo", "http").unwrap();
        assert_eq!(endpoint.host_bind, 15000);
        assert_eq!(endpoint.public_port, 35100);
        assert!(f.proxy.is_live(35100));

        let launches = f.runtime.launches.lock();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].publishes, vec![(15000, 80)]);
        assert_eq!(f.registry.container_id("demo").as_deref(), Some("id-demo"));
        f.proxy.stop_all().await;
    }

    #[tokio::test]
    async fn install_failure_rolls_everything_back() {
        let f = fixture(15100, 35150);
        f.runtime.fail_run.store(true, Ordering::SeqCst);
        let err = f
            .reconciler
            .install(&spec("demo", vec![listener("http", 80)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Runtime(_)));
        assert_eq!(f.allocator.held_counts(), (0, 0));
        assert!(f.registry.endpoints_for_app("demo").is_empty());
        assert!(!f.proxy.is_live(35150));
    }

    #[tokio::test]
    async fn reconcile_add_then_remove() {
        let f = fixture(15200, 35200);
        f.reconciler
            .install(&spec("multi", vec![listener("a", 80)]))
            .await
            .unwrap();
        let a_before = f.registry.get("multi", "a").unwrap();

        let outcome = f
            .reconciler
            .apply(&spec("multi", vec![listener("a", 80), listener("b", 8080)]))
            .await
            .unwrap();
        assert_eq!(outcome.added, vec!["b".to_string()]);
        assert!(outcome.removed.is_empty());
        assert!(outcome.container_change);
        // A's proxy and ports are untouched.
        assert_eq!(f.registry.get("multi", "a").unwrap(), a_before);

        let b = f.registry.get("multi", "b").unwrap();
        let outcome = f
            .reconciler
            .apply(&spec("multi", vec![listener("a", 80)]))
            .await
            .unwrap();
        assert_eq!(outcome.removed, vec!["b".to_string()]);
        assert!(outcome.container_change);
        assert!(!f.proxy.is_live(b.public_port));
        assert_eq!(f.registry.get("multi", "a").unwrap(), a_before);
        f.proxy.stop_all().await;
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let f = fixture(15300, 35250);
        let listeners = vec![listener("a", 80), listener("b", 8080)];
        f.reconciler
            .install(&spec("demo", listeners.clone()))
            .await
            .unwrap();
        let outcome = f.reconciler.apply(&spec("demo", listeners)).await.unwrap();
        assert!(outcome.is_noop(), "outcome: {outcome:?}");
        f.proxy.stop_all().await;
    }

    #[tokio::test]
    async fn guest_port_change_flags_container_change() {
        let f = fixture(15400, 35300);
        f.reconciler
            .install(&spec("demo", vec![listener("http", 80)]))
            .await
            .unwrap();
        let before = f.registry.get("demo", "http").unwrap();

        let outcome = f
            .reconciler
            .apply(&spec("demo", vec![listener("http", 8080)]))
            .await
            .unwrap();
        assert_eq!(outcome.guest_port_changed, vec!["http".to_string()]);
        assert!(outcome.container_change);

        let after = f.registry.get("demo", "http").unwrap();
        // Port pair retained even though the guest port moved.
        assert_eq!(after.host_bind, before.host_bind);
        assert_eq!(after.public_port, before.public_port);
        assert_eq!(after.guest_port, 8080);

        // The replacement container publishes to the new guest port.
        let launches = f.runtime.launches.lock();
        assert_eq!(
            launches.last().unwrap().publishes,
            vec![(before.host_bind, 8080)]
        );
        drop(launches);
        f.proxy.stop_all().await;
    }

    #[tokio::test]
    async fn protocol_change_restarts_proxy_without_container_change() {
        let f = fixture(15500, 35350);
        f.reconciler
            .install(&spec("demo", vec![listener("http", 80)]))
            .await
            .unwrap();

        let mut changed = listener("http", 80);
        changed.protocol = Protocol::Http;
        let outcome = f.reconciler.apply(&spec("demo", vec![changed])).await.unwrap();
        assert_eq!(outcome.proxy_restarted, vec!["http".to_string()]);
        assert!(!outcome.container_change);
        assert_eq!(f.runtime.launches.lock().len(), 1);
        f.proxy.stop_all().await;
    }

    #[tokio::test]
    async fn remove_app_returns_allocator_to_initial_state() {
        let f = fixture(15600, 35400);
        f.reconciler
            .install(&spec("demo", vec![listener("a", 80), listener("b", 81)]))
            .await
            .unwrap();
        assert_eq!(f.allocator.held_counts(), (2, 2));
        f.reconciler.uninstall("demo").await.unwrap();
        assert_eq!(f.allocator.held_counts(), (0, 0));
        assert!(f.registry.endpoints_for_app("demo").is_empty());
        assert!(f.registry.container_id("demo").is_none());
    }

    #[tokio::test]
    async fn restore_reserves_observed_ports_and_skips_collisions() {
        let f = fixture(15700, 35450);
        // A previous daemon run left the container publishing 80 -> 15703.
        let host_by_guest: HashMap<u16, u16> =
            [(80u16, 15703u16), (81u16, 15703u16)].into_iter().collect();
        let restored = f
            .reconciler
            .restore_from_runtime(
                "demo",
                &[listener("a", 80), listener("b", 81)],
                &host_by_guest,
            )
            .await
            .unwrap();
        // Listener b collides with a's reserved host port and is skipped.
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].name, "a");
        assert_eq!(restored[0].host_bind, 15703);
        // A fresh allocation skips the reserved port.
        let pair = f.allocator.allocate_pair().unwrap();
        assert_ne!(pair.host_bind, 15703);
        f.proxy.stop_all().await;
    }

    #[tokio::test]
    async fn adopt_running_container_keeps_publish_table() {
        let f = fixture(15800, 35500);
        f.runtime.running.lock().insert("demo".to_string());
        f.runtime.port_tables.lock().insert(
            "demo".to_string(),
            vec![PortMapping {
                guest_port: 80,
                host_ip: "127.0.0.1".parse().unwrap(),
                host_port: 15805,
            }],
        );
        f.reconciler
            .adopt_or_install(&spec("demo", vec![listener("http", 80)]))
            .await
            .unwrap();
        let endpoint = f.registry.get("demo", "http").unwrap();
        assert_eq!(endpoint.host_bind, 15805);
        // No new container was launched, but the adopted one is recorded so
        // apply and uninstall manage its lifecycle.
        assert!(f.runtime.launches.lock().is_empty());
        assert!(f.registry.container_id("demo").is_some());
        f.proxy.stop_all().await;
    }

    #[tokio::test]
    async fn uninstall_stops_an_adopted_container() {
        let f = fixture(15900, 35550);
        f.runtime.running.lock().insert("demo".to_string());
        f.runtime.port_tables.lock().insert(
            "demo".to_string(),
            vec![PortMapping {
                guest_port: 80,
                host_ip: "127.0.0.1".parse().unwrap(),
                host_port: 15905,
            }],
        );
        f.reconciler
            .adopt_or_install(&spec("demo", vec![listener("http", 80)]))
            .await
            .unwrap();

        f.reconciler.uninstall("demo").await.unwrap();
        assert!(!f.runtime.running.lock().contains("demo"));
        assert!(f.registry.container_id("demo").is_none());
        assert_eq!(f.allocator.held_counts(), (0, 0));
    }

    #[tokio::test]
    async fn restore_failure_rolls_back_restored_endpoints() {
        // A single public slot: the second listener's allocation must fail.
        let f = fixture_ranges(PortRange::new(16000, 16020), PortRange::new(35600, 35600));
        let host_by_guest: HashMap<u16, u16> =
            [(80u16, 16001u16), (81u16, 16002u16)].into_iter().collect();
        let err = f
            .reconciler
            .restore_from_runtime(
                "demo",
                &[listener("a", 80), listener("b", 81)],
                &host_by_guest,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Ports(_)));
        // The first listener's restored state was torn down again.
        assert_eq!(f.allocator.held_counts(), (0, 0));
        assert!(f.registry.endpoints_for_app("demo").is_empty());
        assert!(f.registry.container_id("demo").is_none());
        assert!(!f.proxy.is_live(35600));
    }
}
