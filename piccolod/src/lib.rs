//! Piccolo device daemon: turns a single machine into a secure,
//! remotely-reachable container host.
//!
//! The runtime core has three tightly coupled subsystems: a multi-interface
//! mDNS responder advertising the device on every attached LAN, a
//! three-layer service proxy that fronts each application listener with a
//! public port and splices or reverse-proxies traffic to the container's
//! loopback publish port, and a registry/reconciliation engine that keeps
//! running containers and proxies converged with the declared application
//! specs. A tunnel client binds the device to a remote rendezvous server
//! through an injected transport adapter.

pub mod config;
pub mod machine_id;
pub mod mdns;
pub mod ports;
pub mod proxy;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod tunnel;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AppsDocument, JsonStore, RemoteConfig};
use crate::machine_id::MachineId;
use crate::mdns::interfaces::SystemInterfaces;
use crate::mdns::{MdnsConfig, MdnsResponder};
use crate::ports::PortAllocator;
use crate::proxy::ProxyEngine;
use crate::reconciler::Reconciler;
use crate::registry::ServiceRegistry;
use crate::runtime::{CliRuntime, ContainerRuntime};
use crate::tunnel::{TunnelClient, TunnelConfig, TunnelTransport};

pub struct DaemonConfig {
    /// Container runtime binary, e.g. `podman`.
    pub runtime_binary: String,
    /// Installed-application document.
    pub apps_path: Utf8PathBuf,
    /// Remote-access configuration document.
    pub remote_config_path: Utf8PathBuf,
    pub mdns: MdnsConfig,
}

/// Wires the runtime core together and owns the long-lived tasks.
pub struct Daemon {
    config: DaemonConfig,
    registry: Arc<ServiceRegistry>,
    proxy: Arc<ProxyEngine>,
    reconciler: Arc<Reconciler>,
    responder: Arc<MdnsResponder>,
    tunnel_transport: Option<Arc<dyn TunnelTransport>>,
}

impl Daemon {
    /// `tunnel_transport` is the injected rendezvous adapter; without one,
    /// the device is reachable locally only.
    pub fn new(config: DaemonConfig, tunnel_transport: Option<Arc<dyn TunnelTransport>>) -> Self {
        let allocator = Arc::new(PortAllocator::default());
        let registry = Arc::new(ServiceRegistry::new());
        let proxy = Arc::new(ProxyEngine::new());
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(CliRuntime::new(config.runtime_binary.clone()));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&allocator),
            Arc::clone(&registry),
            Arc::clone(&proxy),
            runtime,
        ));
        let machine_id = MachineId::detect();
        let responder = Arc::new(MdnsResponder::new(
            config.mdns.clone(),
            &machine_id,
            Arc::new(SystemInterfaces),
        ));
        Self {
            config,
            registry,
            proxy,
            reconciler,
            responder,
            tunnel_transport,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        // Re-adopt or launch the installed applications first so the proxy
        // map is populated before anything is advertised.
        let apps_store: JsonStore<AppsDocument> = JsonStore::new(self.config.apps_path.clone());
        let apps = apps_store.load().await.context("loading apps document")?;
        for spec in &apps.apps {
            if let Err(err) = self.reconciler.adopt_or_install(spec).await {
                // One broken app must not take the device down.
                error!(app = %spec.name, %err, "failed to bring up application");
            }
        }

        let mdns_cancel = cancel.child_token();
        let responder = Arc::clone(&self.responder);
        let mdns_task = tokio::spawn({
            let cancel = mdns_cancel.clone();
            async move { responder.run(cancel).await }
        });
        info!(name = %self.responder.advertised_name(), "mDNS advertisement started");

        let remote_store: JsonStore<RemoteConfig> =
            JsonStore::new(self.config.remote_config_path.clone());
        let mut remote = remote_store
            .load()
            .await
            .context("loading remote config document")?;
        let (mut tunnel_cancel, mut tunnel_task) = self.spawn_tunnel(&remote, &cancel);

        // The remote config document is re-read periodically; a change
        // restarts the tunnel session with the new settings.
        let mut refresh = tokio::time::interval(Duration::from_secs(30));
        refresh.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = refresh.tick() => {
                    match remote_store.load().await {
                        Ok(latest) if latest != remote => {
                            info!("remote config changed; reconfiguring tunnel");
                            tunnel_cancel.cancel();
                            if let Some(task) = tunnel_task.take() {
                                let _ = task.await;
                            }
                            remote = latest;
                            (tunnel_cancel, tunnel_task) = self.spawn_tunnel(&remote, &cancel);
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "remote config reload failed"),
                    }
                }
            }
        }
        info!("shutting down");

        // Graceful order: stop intake first (tunnel, then the local
        // listeners), let in-flight streams drain, withdraw the mDNS name
        // last so LAN peers stop resolving us.
        tunnel_cancel.cancel();
        if let Some(task) = tunnel_task {
            let _ = task.await;
        }
        self.proxy.stop_all().await;
        mdns_cancel.cancel();
        let _ = mdns_task.await;
        Ok(())
    }

    fn spawn_tunnel(
        &self,
        remote: &RemoteConfig,
        parent: &CancellationToken,
    ) -> (CancellationToken, Option<tokio::task::JoinHandle<()>>) {
        let tunnel_cancel = parent.child_token();
        let task = match (&self.tunnel_transport, remote.enabled) {
            (Some(transport), true) => {
                let client = TunnelClient::new(
                    Arc::clone(transport),
                    Arc::clone(&self.registry),
                    None,
                );
                let config = TunnelConfig {
                    portal_host: remote.portal_host.clone(),
                    device_secret: remote.device_secret.clone(),
                };
                let cancel = tunnel_cancel.clone();
                Some(tokio::spawn(async move {
                    client.run(config, cancel).await;
                }))
            }
            (None, true) => {
                warn!("remote access enabled but no tunnel transport injected");
                None
            }
            _ => None,
        };
        (tunnel_cancel, task)
    }
}
