//! Declarative application specification.
//!
//! A spec revision is immutable: the daemon never mutates it, it only diffs
//! one revision against the currently reconciled state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::validate::{self, ValidateError};

/// One application, as declared by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSpec {
    /// Application name, also used as the container name.
    pub name: String,
    /// Container image reference.
    pub image: String,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    /// Environment passed to the container process.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub permissions: Permissions,
}

/// A port the container process listens on, plus how the daemon should
/// expose it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    /// Port the process listens on inside the container.
    pub guest_port: u16,
    #[serde(default)]
    pub flow: Flow,
    #[serde(default)]
    pub protocol: Protocol,
    /// Middleware names, applied in declared order. Kept as strings here so
    /// that an unknown name is a reconciliation-time validation error with a
    /// useful message rather than a deserialization failure.
    #[serde(default)]
    pub middleware: Vec<String>,
    /// Remote ports the rendezvous server may route to this listener.
    #[serde(default)]
    pub remote_ports: Vec<u16>,
}

impl Listener {
    /// Resolves the declared middleware names against the sealed set.
    pub fn parsed_middleware(&self) -> Result<Vec<Middleware>, ValidateError> {
        self.middleware
            .iter()
            .map(|name| {
                name.parse::<Middleware>()
                    .map_err(|_| ValidateError::UnknownMiddleware {
                        listener: self.name.clone(),
                        middleware: name.clone(),
                    })
            })
            .collect()
    }
}

/// Whether the proxy terminates the transport or passes it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    #[default]
    Tcp,
    /// The container terminates TLS itself; the proxy never touches the
    /// byte stream.
    Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Websocket,
    Raw,
}

/// The sealed set of middleware the proxy engine knows how to apply.
///
/// Dispatch is by this enum, never by raw string: an unknown name fails
/// validation at reconciliation time.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::EnumString,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Middleware {
    RateLimit,
    RequestLogging,
    EnforcePrivateAuth,
    CsrfProtection,
    IpWhitelist,
    WebsocketRateLimit,
}

/// A host directory mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub guest_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Resource limits, in the runtime's own unit syntax (`512mb`, `1.5g`, …).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub network: NetworkPermissions,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkPermissions {
    #[serde(default)]
    pub internet: InternetAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternetAccess {
    #[default]
    Allow,
    /// Maps to the runtime's "no network" mode.
    Deny,
}

impl AppSpec {
    /// Validates the whole spec. No state is mutated on failure; the daemon
    /// calls this before allocating anything and again immediately before
    /// building the container argument vector.
    pub fn validate(&self) -> Result<(), ValidateError> {
        validate::app_name(&self.name)?;
        validate::image_ref(&self.image)?;

        let mut seen = std::collections::BTreeSet::new();
        for listener in &self.listeners {
            validate::listener_name(&listener.name)?;
            if listener.guest_port == 0 {
                return Err(ValidateError::InvalidGuestPort {
                    listener: listener.name.clone(),
                });
            }
            if !seen.insert(listener.name.as_str()) {
                return Err(ValidateError::DuplicateListener {
                    listener: listener.name.clone(),
                });
            }
            listener.parsed_middleware()?;
        }

        for (key, value) in &self.environment {
            validate::env_key(key)?;
            validate::env_value(key, value)?;
        }

        for volume in &self.volumes {
            validate::fs_path(&volume.host_path)?;
            validate::fs_path(&volume.guest_path)?;
        }

        if let Some(cpu) = &self.resources.cpu {
            validate::resource_value("cpu", cpu)?;
        }
        if let Some(memory) = &self.resources.memory {
            validate::resource_value("memory", memory)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec() -> AppSpec {
        AppSpec {
            name: "demo".to_string(),
            image: "docker.io/library/nginx:1.27".to_string(),
            listeners: vec![Listener {
                name: "http".to_string(),
                guest_port: 80,
                flow: Flow::Tcp,
                protocol: Protocol::Http,
                middleware: vec![],
                remote_ports: vec![],
            }],
            environment: BTreeMap::new(),
            volumes: vec![],
            resources: Resources::default(),
            permissions: Permissions::default(),
        }
    }

    #[test]
    fn minimal_spec_is_valid() {
        minimal_spec().validate().unwrap();
    }

    #[test]
    fn middleware_names_parse_into_sealed_set() {
        let mut spec = minimal_spec();
        spec.listeners[0].middleware =
            vec!["rate_limit".to_string(), "request_logging".to_string()];
        spec.validate().unwrap();
        assert_eq!(
            spec.listeners[0].parsed_middleware().unwrap(),
            vec![Middleware::RateLimit, Middleware::RequestLogging]
        );
    }

    #[test]
    fn unknown_middleware_is_rejected() {
        let mut spec = minimal_spec();
        spec.listeners[0].middleware = vec!["shiny_new_thing".to_string()];
        assert!(matches!(
            spec.validate(),
            Err(ValidateError::UnknownMiddleware { .. })
        ));
    }

    #[test]
    fn duplicate_listener_names_are_rejected() {
        let mut spec = minimal_spec();
        let dup = spec.listeners[0].clone();
        spec.listeners.push(dup);
        assert!(matches!(
            spec.validate(),
            Err(ValidateError::DuplicateListener { .. })
        ));
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = minimal_spec();
        let json = serde_json::to_string(&spec).unwrap();
        let back: AppSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }

    #[test]
    fn flow_and_protocol_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Flow::Tls).unwrap(), "\"tls\"");
        assert_eq!(
            serde_json::to_string(&Protocol::Websocket).unwrap(),
            "\"websocket\""
        );
    }
}
