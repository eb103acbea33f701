//! Adapter for the external container runtime CLI.
//!
//! The daemon drives the runtime (podman-compatible) exclusively through
//! argument vectors: user data never passes through a shell, and every
//! value placed into an argv slot has already been validated against the
//! classes in `piccolo_api`. The [`ContainerRuntime`] trait is the seam the
//! reconciler is tested through.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::process::Stdio;

use async_trait::async_trait;
use piccolo_api::{AppSpec, InternetAccess};
use tokio::process::Command;
use tracing::{debug, info};

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{binary} {subcommand} exited with {status}: {stderr}")]
    Failed {
        binary: String,
        subcommand: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("unparseable publish table line {line:?}")]
    BadPortLine { line: String },
}

/// One entry of the runtime's live publish table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub guest_port: u16,
    pub host_ip: IpAddr,
    pub host_port: u16,
}

/// Everything needed to launch a container, already validated and with the
/// host side of every publish pinned to the loopback interface.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    /// (host_bind, guest_port) pairs; published as `127.0.0.1:host:guest`.
    pub publishes: Vec<(u16, u16)>,
    pub environment: BTreeMap<String, String>,
    /// (host_path, guest_path, read_only)
    pub volumes: Vec<(String, String, bool)>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub internet: InternetAccess,
}

impl LaunchSpec {
    /// Builds a launch spec from a validated app spec and its allocated
    /// host-bind ports. Re-validates: this is the last gate before exec.
    pub fn from_app(
        spec: &AppSpec,
        publishes: Vec<(u16, u16)>,
    ) -> Result<Self, piccolo_api::ValidateError> {
        spec.validate()?;
        Ok(Self {
            name: spec.name.clone(),
            image: spec.image.clone(),
            publishes,
            environment: spec.environment.clone(),
            volumes: spec
                .volumes
                .iter()
                .map(|v| (v.host_path.clone(), v.guest_path.clone(), v.read_only))
                .collect(),
            cpu: spec.resources.cpu.clone(),
            memory: spec.resources.memory.clone(),
            internet: spec.permissions.network.internet,
        })
    }

    /// The argument vector for `run`, minus the binary itself.
    fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--restart".to_string(),
            "unless-stopped".to_string(),
        ];
        for (host_bind, guest_port) in &self.publishes {
            args.push("--publish".to_string());
            // Never the wildcard address: only the proxy engine faces out.
            args.push(format!("127.0.0.1:{host_bind}:{guest_port}"));
        }
        for (host_path, guest_path, read_only) in &self.volumes {
            args.push("--volume".to_string());
            if *read_only {
                args.push(format!("{host_path}:{guest_path}:ro"));
            } else {
                args.push(format!("{host_path}:{guest_path}"));
            }
        }
        if let Some(memory) = &self.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        if let Some(cpu) = &self.cpu {
            args.push("--cpus".to_string());
            args.push(cpu.clone());
        }
        for (key, value) in &self.environment {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        if self.internet == InternetAccess::Deny {
            args.push("--network".to_string());
            args.push("none".to_string());
        }
        args.push(self.image.clone());
        args
    }
}

/// The operations the reconciler needs from the runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launches a container and returns its id.
    async fn run(&self, spec: &LaunchSpec) -> Result<String, RuntimeError>;
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;
    /// Reads the live publish table of a running container.
    async fn port_map(&self, name: &str) -> Result<Vec<PortMapping>, RuntimeError>;
    /// Whether a container with this name is currently running.
    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError>;
}

/// Drives a podman-compatible CLI.
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(
        &self,
        subcommand: &'static str,
        args: &[String],
    ) -> Result<String, RuntimeError> {
        debug!(binary = %self.binary, subcommand, ?args, "invoking container runtime");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(RuntimeError::Failed {
                binary: self.binary.clone(),
                subcommand,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn run(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        let args = spec.run_args();
        let stdout = self.exec("run", &args).await?;
        let id = stdout.trim().to_string();
        info!(container = %spec.name, id = %id, "container launched");
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.exec("start", &["start".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.exec("stop", &["stop".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.exec("rm", &["rm".to_string(), "--force".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    async fn port_map(&self, name: &str) -> Result<Vec<PortMapping>, RuntimeError> {
        let stdout = self
            .exec("port", &["port".to_string(), name.to_string()])
            .await?;
        parse_port_table(&stdout)
    }

    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError> {
        let stdout = self
            .exec(
                "ps",
                &[
                    "ps".to_string(),
                    "--filter".to_string(),
                    format!("name={name}"),
                    "--format".to_string(),
                    "{{.Names}}".to_string(),
                ],
            )
            .await?;
        Ok(stdout.lines().any(|line| line.trim() == name))
    }
}

/// Parses `port` output: one line per publish, `"<guest>/tcp -> <ip>:<host>"`.
pub fn parse_port_table(stdout: &str) -> Result<Vec<PortMapping>, RuntimeError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_port_line)
        .collect()
}

fn parse_port_line(line: &str) -> Result<PortMapping, RuntimeError> {
    let bad = || RuntimeError::BadPortLine {
        line: line.to_string(),
    };

    let (guest, host) = line.split_once("->").ok_or_else(bad)?;
    let guest_port = guest
        .trim()
        .split_once('/')
        .ok_or_else(bad)?
        .0
        .parse::<u16>()
        .map_err(|_| bad())?;

    // The host side may be a v6 address; split on the last colon.
    let host = host.trim();
    let (ip, port) = host.rsplit_once(':').ok_or_else(bad)?;
    let host_port = port.parse::<u16>().map_err(|_| bad())?;
    let host_ip = ip
        .trim_matches(&['[', ']'][..])
        .parse::<IpAddr>()
        .map_err(|_| bad())?;

    Ok(PortMapping {
        guest_port,
        host_ip,
        host_port,
    })
}
