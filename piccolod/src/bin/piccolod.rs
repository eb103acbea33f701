use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use piccolod::mdns::MdnsConfig;
use piccolod::{Daemon, DaemonConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Piccolo device daemon
#[derive(Parser)]
#[command(about, version)]
struct CliArgs {
    /// Container runtime binary to drive
    #[clap(long, default_value = "podman", env = "PICCOLO_RUNTIME")]
    runtime: String,
    /// Installed-applications document
    #[clap(long, default_value = "/var/lib/piccolo/apps.json")]
    apps_config: Utf8PathBuf,
    /// Remote-access configuration document
    #[clap(long, default_value = "/var/lib/piccolo/remote.json")]
    remote_config: Utf8PathBuf,
    /// Base mDNS host name advertised as <name>.local
    #[clap(long, default_value = piccolod::mdns::DEFAULT_BASE_NAME)]
    mdns_name: String,
    /// Interface poll period
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    interface_poll: Duration,
    /// Conflict probe period
    #[clap(long, default_value = "5m", value_parser = humantime::parse_duration)]
    probe_interval: Duration,
    /// Steady-state announcement period
    #[clap(long, default_value = "60s", value_parser = humantime::parse_duration)]
    announce_interval: Duration,
    /// Concurrent mDNS query-processing permits
    #[clap(long, default_value_t = 50)]
    query_permits: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = DaemonConfig {
        runtime_binary: args.runtime,
        apps_path: args.apps_config,
        remote_config_path: args.remote_config,
        mdns: MdnsConfig {
            base_name: args.mdns_name,
            poll_interval: args.interface_poll,
            probe_interval: args.probe_interval,
            announce_interval: args.announce_interval,
            query_permits: args.query_permits,
        },
    };

    // The rendezvous transport is provided by the remote-access component;
    // the core runs local-only without one.
    let daemon = Daemon::new(config, None);

    let cancel = CancellationToken::new();
    tokio::spawn(handle_signals(cancel.clone()));

    daemon.run(cancel).await.context("daemon run failed")
}

async fn handle_signals(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
    cancel.cancel();
}
