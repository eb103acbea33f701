//! Validation rules for application specs.
//!
//! These classes are fixed: they are applied before any exec call and are
//! never relaxed at runtime. Everything here rejects synchronously without
//! touching daemon state.

use once_cell::sync::Lazy;
use regex::Regex;

/// Container/app names: also accepted by the container runtime as-is.
static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._:/-]*[a-z0-9]$").expect("static regex"));

static ENV_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

static RESOURCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?[kmgt]?b?$").expect("static regex"));

static PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._/-]+$").expect("static regex"));

const MAX_NAME_LEN: usize = 255;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidateError {
    #[error("invalid name {name:?}")]
    InvalidName { name: String },
    #[error("name {name:?} exceeds {MAX_NAME_LEN} characters")]
    NameTooLong { name: String },
    #[error("invalid image reference {image:?}")]
    InvalidImage { image: String },
    #[error("listener {listener:?} declares guest port 0")]
    InvalidGuestPort { listener: String },
    #[error("duplicate listener name {listener:?}")]
    DuplicateListener { listener: String },
    #[error("listener {listener:?} references unknown middleware {middleware:?}")]
    UnknownMiddleware { listener: String, middleware: String },
    #[error("invalid environment key {key:?}")]
    InvalidEnvKey { key: String },
    #[error("environment value for {key:?} contains a control character")]
    InvalidEnvValue { key: String },
    #[error("path {path:?} is not absolute")]
    PathNotAbsolute { path: String },
    #[error("path {path:?} contains a parent-directory component")]
    PathTraversal { path: String },
    #[error("path {path:?} contains characters outside the allowed set")]
    PathCharset { path: String },
    #[error("invalid {field} value {value:?}")]
    InvalidResource { field: &'static str, value: String },
}

pub(crate) fn app_name(name: &str) -> Result<(), ValidateError> {
    if name.len() > MAX_NAME_LEN {
        return Err(ValidateError::NameTooLong {
            name: name.to_string(),
        });
    }
    if !NAME_RE.is_match(name) {
        return Err(ValidateError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn listener_name(name: &str) -> Result<(), ValidateError> {
    app_name(name)
}

/// Image references share the name character class; tags and digests fit it.
pub(crate) fn image_ref(image: &str) -> Result<(), ValidateError> {
    if image.len() > MAX_NAME_LEN || !NAME_RE.is_match(image) {
        return Err(ValidateError::InvalidImage {
            image: image.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn env_key(key: &str) -> Result<(), ValidateError> {
    if !ENV_KEY_RE.is_match(key) {
        return Err(ValidateError::InvalidEnvKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// All C0 control characters are rejected except HT/LF/CR.
pub(crate) fn env_value(key: &str, value: &str) -> Result<(), ValidateError> {
    let forbidden = value
        .chars()
        .any(|c| c.is_control() && c != '\t' && c != '\n' && c != '\r');
    if forbidden {
        return Err(ValidateError::InvalidEnvValue {
            key: key.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn fs_path(path: &str) -> Result<(), ValidateError> {
    if !path.starts_with('/') {
        return Err(ValidateError::PathNotAbsolute {
            path: path.to_string(),
        });
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(ValidateError::PathTraversal {
            path: path.to_string(),
        });
    }
    if !PATH_RE.is_match(path) {
        return Err(ValidateError::PathCharset {
            path: path.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn resource_value(field: &'static str, value: &str) -> Result<(), ValidateError> {
    if !RESOURCE_RE.is_match(value) {
        return Err(ValidateError::InvalidResource {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        app_name("demo").unwrap();
        app_name("my-app.v2").unwrap();
        app_name("a0").unwrap();
        assert!(app_name("Demo").is_err());
        assert!(app_name("-demo").is_err());
        assert!(app_name("demo-").is_err());
        assert!(app_name("").is_err());
        assert!(app_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn image_refs() {
        image_ref("nginx").unwrap();
        image_ref("docker.io/library/nginx:1.27").unwrap();
        assert!(image_ref("ghcr.io/foo/bar@sha256:abcd").is_err()); // '@' not in class
        assert!(image_ref("nginx; rm -rf /").is_err());
    }

    #[test]
    fn env_keys_and_values() {
        env_key("PATH").unwrap();
        env_key("_private").unwrap();
        assert!(env_key("1BAD").is_err());
        assert!(env_key("WITH-DASH").is_err());

        env_value("K", "plain value with\ttab and\nnewline").unwrap();
        assert!(env_value("K", "escape\u{1b}[0m").is_err());
        assert!(env_value("K", "nul\u{0}").is_err());
    }

    #[test]
    fn paths() {
        fs_path("/var/lib/piccolo/data").unwrap();
        assert!(fs_path("relative/path").is_err());
        assert!(fs_path("/var/../etc/passwd").is_err());
        assert!(fs_path("/tmp/$(evil)").is_err());
    }

    #[test]
    fn resource_values() {
        resource_value("memory", "512mb").unwrap();
        resource_value("cpu", "1.5").unwrap();
        resource_value("memory", "2g").unwrap();
        assert!(resource_value("memory", "lots").is_err());
        assert!(resource_value("memory", "-1").is_err());
    }
}
