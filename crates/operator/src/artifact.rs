//! Compressed configuration stored in a secret named after the target

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use tracing::{debug, instrument};

use crate::Result;

/// Secret key holding the compressed Prometheus configuration
pub const PROMETHEUS_CONFIG_KEY: &str = "prometheus.yaml.gz";

/// Secret key holding the compressed Alertmanager configuration
pub const ALERTMANAGER_CONFIG_KEY: &str = "alertmanager.yaml.gz";

/// A compressed configuration payload and where it is stored
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigArtifact {
    /// Name of the secret; derived from the target, never from content
    pub name: String,
    /// Key inside the secret
    pub key: String,
    /// Gzip stream of the payload
    pub data: Vec<u8>,
}

/// Builds [`ConfigArtifact`]s with a fixed compression level
#[derive(Clone, Debug)]
pub struct ConfigArtifactBuilder {
    name: String,
    key: String,
    level: Compression,
}

impl ConfigArtifactBuilder {
    /// Artifact stored in secret `name` under `key`
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            level: Compression::best(),
        }
    }

    /// Compresses `payload`.
    ///
    /// The gzip header carries no file name and a zero modification time so
    /// the same payload always yields the same bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CompressionError`](crate::Error::CompressionError) when
    /// the encoder fails.
    #[instrument(skip(self, payload), fields(name = %self.name, size = payload.len()))]
    pub fn build(self, payload: &[u8]) -> Result<ConfigArtifact> {
        let mut encoder = GzBuilder::new().mtime(0).write(Vec::new(), self.level);
        encoder.write_all(payload)?;
        let data = encoder.finish()?;

        debug!(compressed = data.len(), "compressed configuration");

        Ok(ConfigArtifact {
            name: self.name,
            key: self.key,
            data,
        })
    }
}

impl ConfigArtifact {
    /// Returns the uncompressed payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CompressionError`](crate::Error::CompressionError) when
    /// the data is not a valid gzip stream.
    pub fn decompress(&self) -> Result<Vec<u8>> {
        decompress(&self.data)
    }

    /// Wraps the artifact into a secret; `metadata.name` is replaced.
    #[must_use]
    pub fn into_secret(self, mut metadata: ObjectMeta) -> Secret {
        metadata.name = Some(self.name);
        Secret {
            metadata,
            data: Some(BTreeMap::from([(self.key, ByteString(self.data))])),
            ..Default::default()
        }
    }

    /// Reads the stored payload of a secret written by [`Self::into_secret`].
    /// Returns `None` when `key` is absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CompressionError`](crate::Error::CompressionError) when
    /// the stored data is not a valid gzip stream.
    pub fn payload_from_secret(secret: &Secret, key: &str) -> Result<Option<Vec<u8>>> {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|ByteString(bytes)| decompress(bytes))
            .transpose()
    }
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    GzDecoder::new(data).read_to_end(&mut payload)?;
    Ok(payload)
}
