//! Persisted daemon state documents.
//!
//! Each subsystem keeps one JSON document on disk. The daemon reads a
//! document at startup and on change, and writes it back through a single
//! save point that serializes the whole document indented, so a partially
//! applied edit can never exist on disk (write to a sibling temp file, then
//! rename).

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use piccolo_api::AppSpec;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::info;

/// Remote-access configuration consumed by the tunnel client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub portal_host: String,
    #[serde(default)]
    pub device_secret: String,
    /// Hostnames the rendezvous routes to this device.
    #[serde(default)]
    pub hostnames: Vec<String>,
}

/// The installed-application set, reconciled at startup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppsDocument {
    #[serde(default)]
    pub apps: Vec<AppSpec>,
}

/// One JSON document at a fixed path.
pub struct JsonStore<T> {
    path: Utf8PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// An absent file yields the default document.
    pub async fn load(&self) -> anyhow::Result<T> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", self.path)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", self.path)),
        }
    }

    /// The single save point: the whole document, indented, written
    /// atomically.
    pub async fn save(&self, document: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(document).context("serializing document")?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {parent}"))?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {tmp}"))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming {tmp} into place"))?;
        info!(path = %self.path, "document saved");
        Ok(())
    }
}
