//! The service registry: the canonical map from applications to their
//! allocated endpoints.
//!
//! The reconciler is the sole writer. Everything else (the tunnel client,
//! the admin surface, the proxy engine's liveness checks) reads through the
//! shared reference, so the map sits behind a reader/writer lock and readers
//! never block each other. Changes are fanned out on a broadcast channel so
//! the tunnel client can reconfigure its routing table live.

use std::collections::HashMap;

use parking_lot::RwLock;
use piccolo_api::{Flow, Listener, Middleware, Protocol};
use serde::Serialize;
use tokio::sync::broadcast;

/// An allocated runtime record linking a declared listener to its port pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEndpoint {
    pub app: String,
    /// Listener name; `(app, name)` is the registry's primary key.
    pub name: String,
    pub guest_port: u16,
    /// Loopback-bound port the container publishes to, in 15000-25000.
    pub host_bind: u16,
    /// Wildcard-bound port the proxy accepts on, in 35000-45000.
    pub public_port: u16,
    pub flow: Flow,
    pub protocol: Protocol,
    pub middleware: Vec<Middleware>,
    pub remote_ports: Vec<u16>,
}

impl ServiceEndpoint {
    pub fn from_listener(
        app: &str,
        listener: &Listener,
        host_bind: u16,
        public_port: u16,
    ) -> Self {
        Self {
            app: app.to_string(),
            name: listener.name.clone(),
            guest_port: listener.guest_port,
            host_bind,
            public_port,
            flow: listener.flow,
            protocol: listener.protocol,
            middleware: listener.parsed_middleware().unwrap_or_default(),
            remote_ports: listener.remote_ports.clone(),
        }
    }

    /// True when the proxy listener serving this endpoint must be restarted
    /// for the new declaration to take effect. Port identity is unchanged.
    pub fn proxy_config_differs(&self, other: &ServiceEndpoint) -> bool {
        self.flow != other.flow
            || self.protocol != other.protocol
            || self.middleware != other.middleware
    }
}

#[derive(Debug, Clone)]
pub enum EndpointEvent {
    Added(ServiceEndpoint),
    Removed(ServiceEndpoint),
}

#[derive(Default)]
struct RegistryInner {
    /// app -> listener name -> endpoint
    apps: HashMap<String, HashMap<String, ServiceEndpoint>>,
    /// app -> container id
    containers: HashMap<String, String>,
}

pub struct ServiceRegistry {
    inner: RwLock<RegistryInner>,
    events: broadcast::Sender<EndpointEvent>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    /// Inserts or replaces an endpoint. Reconciler-only.
    pub fn insert(&self, endpoint: ServiceEndpoint) {
        {
            let mut inner = self.inner.write();
            inner
                .apps
                .entry(endpoint.app.clone())
                .or_default()
                .insert(endpoint.name.clone(), endpoint.clone());
        }
        // A lagging subscriber only means it must resync; ignore send errors
        // when nobody is listening.
        let _ = self.events.send(EndpointEvent::Added(endpoint));
    }

    /// Removes one endpoint. Reconciler-only.
    pub fn remove(&self, app: &str, listener: &str) -> Option<ServiceEndpoint> {
        let removed = {
            let mut inner = self.inner.write();
            let endpoints = inner.apps.get_mut(app)?;
            let removed = endpoints.remove(listener);
            if endpoints.is_empty() {
                inner.apps.remove(app);
            }
            removed
        };
        if let Some(endpoint) = removed.clone() {
            let _ = self.events.send(EndpointEvent::Removed(endpoint));
        }
        removed
    }

    /// Removes every endpoint of an app and forgets its container reference.
    pub fn remove_app(&self, app: &str) -> Vec<ServiceEndpoint> {
        let removed: Vec<ServiceEndpoint> = {
            let mut inner = self.inner.write();
            inner.containers.remove(app);
            inner
                .apps
                .remove(app)
                .map(|endpoints| endpoints.into_values().collect())
                .unwrap_or_default()
        };
        for endpoint in &removed {
            let _ = self.events.send(EndpointEvent::Removed(endpoint.clone()));
        }
        removed
    }

    pub fn get(&self, app: &str, listener: &str) -> Option<ServiceEndpoint> {
        self.inner.read().apps.get(app)?.get(listener).cloned()
    }

    pub fn endpoints_for_app(&self, app: &str) -> Vec<ServiceEndpoint> {
        self.inner
            .read()
            .apps
            .get(app)
            .map(|endpoints| endpoints.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_endpoints(&self) -> Vec<ServiceEndpoint> {
        self.inner
            .read()
            .apps
            .values()
            .flat_map(|endpoints| endpoints.values().cloned())
            .collect()
    }

    /// Proxies hold a stable reference to their endpoint through this lookup.
    pub fn lookup_public_port(&self, public_port: u16) -> Option<ServiceEndpoint> {
        self.inner
            .read()
            .apps
            .values()
            .flat_map(|endpoints| endpoints.values())
            .find(|endpoint| endpoint.public_port == public_port)
            .cloned()
    }

    pub fn set_container(&self, app: &str, container_id: String) {
        self.inner
            .write()
            .containers
            .insert(app.to_string(), container_id);
    }

    pub fn container_id(&self, app: &str) -> Option<String> {
        self.inner.read().containers.get(app).cloned()
    }

    pub fn app_names(&self) -> Vec<String> {
        self.inner.read().apps.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(app: &str, name: &str, host_bind: u16, public_port: u16) -> ServiceEndpoint {
        ServiceEndpoint {
            app: app.to_string(),
            name: name.to_string(),
            guest_port: 80,
            host_bind,
            public_port,
            flow: Flow::Tcp,
            protocol: Protocol::Http,
            middleware: vec![],
            remote_ports: vec![],
        }
    }

    #[test]
    fn insert_get_remove() {
        let registry = ServiceRegistry::new();
        registry.insert(endpoint("demo", "http", 15000, 35000));
        assert_eq!(
            registry.get("demo", "http").unwrap().public_port,
            35000
        );
        assert!(registry.remove("demo", "http").is_some());
        assert!(registry.get("demo", "http").is_none());
        assert!(registry.app_names().is_empty());
    }

    #[test]
    fn lookup_by_public_port() {
        let registry = ServiceRegistry::new();
        registry.insert(endpoint("demo", "http", 15000, 35000));
        registry.insert(endpoint("demo", "admin", 15001, 35001));
        assert_eq!(registry.lookup_public_port(35001).unwrap().name, "admin");
        assert!(registry.lookup_public_port(40000).is_none());
    }

    #[test]
    fn events_reflect_mutations() {
        let registry = ServiceRegistry::new();
        let mut events = registry.subscribe();
        registry.insert(endpoint("demo", "http", 15000, 35000));
        registry.remove_app("demo");

        match events.try_recv().unwrap() {
            EndpointEvent::Added(e) => assert_eq!(e.public_port, 35000),
            other => panic!("unexpected event {other:?}"),
        }
        match events.try_recv().unwrap() {
            EndpointEvent::Removed(e) => assert_eq!(e.public_port, 35000),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn container_side_table() {
        let registry = ServiceRegistry::new();
        registry.insert(endpoint("demo", "http", 15000, 35000));
        registry.set_container("demo", "abc123".to_string());
        assert_eq!(registry.container_id("demo").as_deref(), Some("abc123"));
        registry.remove_app("demo");
        assert!(registry.container_id("demo").is_none());
    }

    #[test]
    fn proxy_config_differs_ignores_ports() {
        let a = endpoint("demo", "http", 15000, 35000);
        let mut b = endpoint("demo", "http", 15555, 35555);
        assert!(!a.proxy_config_differs(&b));
        b.protocol = Protocol::Raw;
        assert!(a.proxy_config_differs(&b));
    }
}
