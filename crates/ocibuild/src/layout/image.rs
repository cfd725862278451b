//! Binding an [`Image`] to an OCI layout directory.

use crate::errors::{Error, Result};
use crate::image::{options::ImageOptions, Identifier, Image};
use crate::layer::{FacadeLayer, FileLayer, SharedLayer};
use crate::layout::LayoutDir;
use oci_registry::config::ImageConfig;
use oci_registry::manifest::{
    OciDescriptor, OciImageIndex, OciImageManifest, Platform, REF_NAME_ANNOTATION,
};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

/// An image that saves to an OCI layout directory.
///
/// Derefs to [`Image`], so all config and layer mutators are available
/// directly.
pub struct LayoutImage {
    image: Image,
    path: PathBuf,
}

impl Deref for LayoutImage {
    type Target = Image;

    fn deref(&self) -> &Image {
        &self.image
    }
}

impl DerefMut for LayoutImage {
    fn deref_mut(&mut self) -> &mut Image {
        &mut self.image
    }
}

impl LayoutImage {
    /// Create an image bound to `path`.
    ///
    /// The base comes from `opts.base_image` or from the layout at
    /// `opts.base_image_path`; a missing base layout is ignored and the
    /// image starts empty. A previous build at `opts.previous_image_path`
    /// feeds `reuse_layer`.
    #[instrument(level = "debug", skip(opts))]
    pub async fn new(path: impl Into<PathBuf> + std::fmt::Debug, mut opts: ImageOptions) -> Result<Self> {
        let path = path.into();
        let name = path.to_string_lossy().into_owned();

        let mut image = match opts.base_image.take() {
            Some(mut base) => {
                base.rename(&name);
                base
            }
            None => match &opts.base_image_path {
                Some(base_path) => match load_base_parts(base_path, opts.platform.as_ref()).await? {
                    Some(parts) => parts.into_image(&name, &opts),
                    None => Image::empty(&name, &opts),
                },
                None => Image::empty(&name, &opts),
            },
        };

        if let Some(prev_path) = &opts.previous_image_path {
            if let Some(parts) = load_base_parts(prev_path, opts.platform.as_ref()).await? {
                image.set_prev_layers(parts.layers);
            }
        }

        Ok(Self { image, path })
    }

    /// The layout directory this image saves to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The content identifier: the manifest digest.
    pub async fn identifier(&self) -> Result<Identifier> {
        Ok(Identifier::Digest(self.image.digest().await?))
    }

    /// Save to the bound path.
    ///
    /// At most one additional name is accepted, and it becomes the
    /// `org.opencontainers.image.ref.name` annotation on the image's index
    /// descriptor.
    pub async fn save(&mut self, additional_names: &[&str]) -> Result<OciDescriptor> {
        let path = self.path.clone();
        self.save_as(path, additional_names).await
    }

    /// Save to an arbitrary layout path.
    #[instrument(level = "info", skip(self, path), fields(image = self.image.name()))]
    pub async fn save_as(
        &mut self,
        path: impl Into<PathBuf>,
        additional_names: &[&str],
    ) -> Result<OciDescriptor> {
        if additional_names.len() > 1 {
            return Err(Error::MultipleNamesNotAllowed {
                names: additional_names.iter().map(|s| s.to_string()).collect(),
            });
        }
        if let Some(name) = additional_names.first() {
            self.image.annotate_ref_name(*name);
        }

        let committed = self.image.commit().await?;
        let layout = LayoutDir::ensure(path.into()).await?;

        let annotations = self.image.ref_name_annotation().map(|tag| {
            let mut map = BTreeMap::new();
            map.insert(REF_NAME_ANNOTATION.to_owned(), tag.to_owned());
            map
        });

        let descriptor = if self.image.save_without_layers() {
            debug!("saving without layer blobs");
            layout
                .append_image_without_layers(&committed, annotations)
                .await?
        } else {
            layout
                .append_image(&committed, self.image.layers(), annotations)
                .await?
        };
        Ok(descriptor)
    }

    /// Push the image to a registry under `reference`: every materialized
    /// layer blob, then the config, then the manifest.
    ///
    /// Layers whose compressed bytes are not locally available (sparse
    /// bases) are skipped; their blobs are assumed to exist in the remote
    /// already, matching the index push contract.
    #[instrument(level = "info", skip(self, client), fields(image = self.image.name()))]
    pub async fn push(
        &mut self,
        client: &oci_registry::client::Client,
        reference: &oci_registry::Reference,
    ) -> Result<oci_registry::Digest> {
        use tokio::io::AsyncReadExt;

        let committed = self.image.commit().await?;
        for layer in self.image.layers() {
            if layer.size().await? < 0 {
                continue;
            }
            let digest = layer.digest().await?;
            let mut reader = layer.compressed_reader().await?;
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes).await?;
            if bytes.is_empty() {
                continue;
            }
            client
                .push_blob(reference, &digest, bytes)
                .await
                .map_err(Error::Other)?;
        }
        client
            .push_blob(
                reference,
                &committed.image_id(),
                committed.config_raw.clone(),
            )
            .await
            .map_err(Error::Other)?;
        let media_type = committed
            .manifest
            .media_type
            .clone()
            .unwrap_or_else(|| self.image.media_type().to_owned());
        client
            .push_manifest(reference, committed.manifest_raw.clone(), &media_type)
            .await
            .map_err(Error::Other)
    }
}

impl std::fmt::Debug for LayoutImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutImage")
            .field("path", &self.path)
            .field("image", &self.image)
            .finish()
    }
}

/// Everything read out of a base layout for one image.
pub(crate) struct BaseParts {
    pub manifest_raw: Vec<u8>,
    pub config_raw: Vec<u8>,
    pub manifest: OciImageManifest,
    pub config: ImageConfig,
    pub layers: Vec<SharedLayer>,
}

impl BaseParts {
    fn into_image(self, repo_name: &str, opts: &ImageOptions) -> Image {
        Image::from_base(
            repo_name,
            self.manifest_raw,
            self.config_raw,
            &self.manifest,
            self.config,
            self.layers,
            opts,
        )
    }
}

/// Load an image from a layout directory, tolerating sparse blob trees.
///
/// Returns `None` when the path holds no layout or an empty index: at
/// construction time a missing base is not an error, it just leaves the
/// base slot empty.
pub(crate) async fn load_base_parts(
    path: &Path,
    platform: Option<&Platform>,
) -> Result<Option<BaseParts>> {
    let layout = match LayoutDir::open(path).await {
        Ok(layout) => layout,
        Err(Error::MalformedLayout { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    let index = layout.read_index().await?;
    if index.manifests.is_empty() {
        return Ok(None);
    }
    let descriptor = select_descriptor(&index, platform, &path.to_string_lossy())?;
    let parts = read_image_at(&layout, descriptor).await?;
    Ok(Some(parts))
}

/// Read the manifest, config and layer set behind `descriptor`.
pub(crate) async fn read_image_at(
    layout: &LayoutDir,
    descriptor: &OciDescriptor,
) -> Result<BaseParts> {
    let manifest_raw = layout.read_blob(&descriptor.digest).await?;
    let manifest: OciImageManifest = serde_json::from_slice(&manifest_raw)?;
    let config_raw = layout.read_blob(&manifest.config.digest).await?;
    let config: ImageConfig = serde_json::from_slice(&config_raw)?;

    let mut layers: Vec<SharedLayer> = Vec::with_capacity(manifest.layers.len());
    for (i, layer_desc) in manifest.layers.iter().enumerate() {
        layers.push(layer_or_facade(layout, &manifest, &config, i, layer_desc).await?);
    }
    Ok(BaseParts {
        manifest_raw,
        config_raw,
        manifest,
        config,
        layers,
    })
}

/// Build the layer for position `index`: file-backed when the blob is
/// materialized, a facade otherwise.
async fn layer_or_facade(
    layout: &LayoutDir,
    manifest: &OciImageManifest,
    config: &ImageConfig,
    index: usize,
    descriptor: &OciDescriptor,
) -> Result<SharedLayer> {
    if index >= config.rootfs.diff_ids.len() {
        return Err(Error::LayerCountMismatch {
            layers: manifest.layers.len(),
            diff_ids: config.rootfs.diff_ids.len(),
            descriptors: manifest.layers.len(),
        });
    }
    let diff_id = config.rootfs.diff_ids[index].clone();
    if layout.has_blob(&descriptor.digest).await {
        Ok(Arc::new(FileLayer::with_descriptor(
            layout.blob_path(&descriptor.digest),
            diff_id,
            descriptor.digest.clone(),
            descriptor.size,
            descriptor.media_type.clone(),
        )))
    } else {
        Ok(Arc::new(FacadeLayer::new(
            diff_id,
            descriptor.digest.clone(),
            descriptor.size,
            descriptor.media_type.clone(),
        )))
    }
}

/// Pick the descriptor to load from an index.
///
/// A single-manifest index is unambiguous. With several children, exactly
/// one non-attestation child must match the requested (or host) platform;
/// zero or several matches demand an explicit platform from the caller.
fn select_descriptor<'a>(
    index: &'a OciImageIndex,
    platform: Option<&Platform>,
    repo_name: &str,
) -> Result<&'a OciDescriptor> {
    match index.manifests.as_slice() {
        [] => Err(Error::ImageNotFound(repo_name.to_owned())),
        [single] => Ok(single),
        manifests => {
            let host = Platform::host();
            let filter = platform.unwrap_or(&host);
            let mut matches = manifests.iter().filter(|d| match &d.platform {
                Some(p) => !p.is_unknown() && p.satisfies(filter),
                // A descriptor without a platform cannot be ruled out.
                None => true,
            });
            match (matches.next(), matches.next()) {
                (Some(only), None) => Ok(only),
                _ => Err(Error::PlatformRequired {
                    repo_name: repo_name.to_owned(),
                }),
            }
        }
    }
}
