//! Reading layers out of a containerd content store.
//!
//! Daemons backed by the containerd snapshotter expose their content store
//! over a gRPC endpoint reachable through the daemon socket. The engine
//! consumes it through the [`ContentStore`] trait; the metadata fast path
//! resolves an image's manifest and config and seeds the layer store with
//! [`ContentLayer`]s without decompressing anything.

use crate::errors::Result;
use crate::layer::{Layer, LayerReader};
use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use oci_registry::config::ImageConfig;
use oci_registry::digest::Digest;
use oci_registry::manifest::{
    is_gzip_layer_media_type, is_index_media_type, OciDescriptor, OciImageIndex, OciImageManifest,
    Platform,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::debug;

/// Metadata for one piece of stored content.
#[derive(Debug, Clone)]
pub struct ContentInfo {
    /// The content's digest.
    pub digest: Digest,
    /// The content's size in bytes.
    pub size: i64,
}

/// The content-store operations the fast path consumes.
///
/// The connection behind an implementation is owned by the layer store for
/// the store's lifetime; dropping the store drops the connection.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Resolve an image reference to its top-level descriptor.
    async fn resolve(&self, reference: &str) -> anyhow::Result<OciDescriptor>;

    /// Stat a piece of content; errors when the store does not hold it.
    async fn info(&self, digest: &Digest) -> anyhow::Result<ContentInfo>;

    /// Open a piece of content for reading.
    async fn reader(&self, digest: &Digest) -> anyhow::Result<LayerReader>;
}

/// A layer whose compressed bytes live in a content store.
///
/// The compressed size is known from the manifest descriptor, so nothing is
/// decompressed until the uncompressed stream is actually read.
pub struct ContentLayer {
    store: Arc<dyn ContentStore>,
    diff_id: Digest,
    digest: Digest,
    size: i64,
    gzipped: bool,
    media_type: String,
}

impl ContentLayer {
    /// Wrap stored content as a layer.
    pub fn new(
        store: Arc<dyn ContentStore>,
        diff_id: Digest,
        descriptor: &OciDescriptor,
    ) -> Self {
        Self {
            store,
            diff_id,
            digest: descriptor.digest.clone(),
            size: descriptor.size,
            gzipped: is_gzip_layer_media_type(&descriptor.media_type),
            media_type: descriptor.media_type.clone(),
        }
    }
}

#[async_trait]
impl Layer for ContentLayer {
    fn diff_id(&self) -> &Digest {
        &self.diff_id
    }

    async fn digest(&self) -> Result<Digest> {
        Ok(self.digest.clone())
    }

    async fn size(&self) -> Result<i64> {
        Ok(self.size)
    }

    async fn compressed_reader(&self) -> Result<LayerReader> {
        Ok(self.store.reader(&self.digest).await?)
    }

    async fn uncompressed_reader(&self) -> Result<LayerReader> {
        let raw = self.store.reader(&self.digest).await?;
        if self.gzipped {
            Ok(Box::new(GzipDecoder::new(BufReader::new(raw))))
        } else {
            Ok(raw)
        }
    }

    fn media_type(&self) -> &str {
        &self.media_type
    }
}

impl std::fmt::Debug for ContentLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentLayer")
            .field("diff_id", &self.diff_id)
            .field("digest", &self.digest)
            .field("size", &self.size)
            .field("gzipped", &self.gzipped)
            .finish()
    }
}

/// What the fast path learned about an image.
pub(crate) struct ResolvedImage {
    pub config: ImageConfig,
    pub layers: Vec<(Digest, Arc<ContentLayer>)>,
}

/// Resolve `reference` through the content store and wrap every layer as a
/// [`ContentLayer`], reading only the manifest and config JSON.
///
/// When the top-level descriptor is an index, the first per-platform child
/// actually present in the store is used; attestation children (platform
/// `unknown/unknown`) are skipped.
pub(crate) async fn resolve_image(
    store: &Arc<dyn ContentStore>,
    reference: &str,
    platform: Option<&Platform>,
) -> anyhow::Result<ResolvedImage> {
    let mut descriptor = store.resolve(reference).await?;

    if is_index_media_type(&descriptor.media_type) {
        let index: OciImageIndex = serde_json::from_slice(&read_all(store, &descriptor.digest).await?)?;
        let mut selected = None;
        for child in &index.manifests {
            let skip = match &child.platform {
                Some(p) => {
                    p.is_unknown() || platform.map_or(false, |filter| !p.satisfies(filter))
                }
                None => false,
            };
            if skip {
                continue;
            }
            // Multi-platform stores usually hold only the host's manifest.
            if store.info(&child.digest).await.is_ok() {
                selected = Some(child.clone());
                break;
            }
        }
        descriptor = selected
            .ok_or_else(|| anyhow::anyhow!("no usable manifest for {} in content store", reference))?;
        debug!(digest = %descriptor.digest, "selected per-platform manifest");
    }

    let manifest: OciImageManifest =
        serde_json::from_slice(&read_all(store, &descriptor.digest).await?)?;
    let config: ImageConfig =
        serde_json::from_slice(&read_all(store, &manifest.config.digest).await?)?;

    if manifest.layers.len() != config.rootfs.diff_ids.len() {
        anyhow::bail!(
            "manifest holds {} layers but config holds {} diff-IDs",
            manifest.layers.len(),
            config.rootfs.diff_ids.len()
        );
    }

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for (layer_desc, diff_id) in manifest.layers.iter().zip(&config.rootfs.diff_ids) {
        let layer = Arc::new(ContentLayer::new(
            Arc::clone(store),
            diff_id.clone(),
            layer_desc,
        ));
        layers.push((diff_id.clone(), layer));
    }
    Ok(ResolvedImage { config, layers })
}

async fn read_all(store: &Arc<dyn ContentStore>, digest: &Digest) -> anyhow::Result<Vec<u8>> {
    let mut reader = store.reader(digest).await?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await?;
    Ok(bytes)
}
