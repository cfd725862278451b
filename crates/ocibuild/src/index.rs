//! Image indexes (Docker: manifest lists).
//!
//! An [`ImageIndex`] owns a manifest list materialized in an OCI layout
//! directory and mediates per-child descriptor edits: platform fields,
//! annotations and URLs are rewritten on the descriptor only, never on the
//! referenced manifest.

use crate::errors::{Error, Result};
use crate::layout::LayoutDir;
use oci_registry::client::Client;
use oci_registry::digest::Digest;
use oci_registry::manifest::{
    is_index_media_type, MediaTypeFamily, OciDescriptor, OciImageIndex, OciImageManifest, Platform,
};
use oci_registry::reference::Reference;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Options for [`ImageIndex::add`].
#[derive(Debug, Default, Clone)]
pub struct AddOptions {
    /// Append every non-attestation child of a referenced index.
    pub all: bool,
    /// Explicit platform filters for selecting one child of an index.
    pub os: Option<String>,
    /// See [`AddOptions::os`].
    pub architecture: Option<String>,
    /// See [`AddOptions::os`].
    pub variant: Option<String>,
    /// See [`AddOptions::os`].
    pub os_version: Option<String>,
}

impl AddOptions {
    fn platform_filter(&self) -> Option<Platform> {
        if self.os.is_none()
            && self.architecture.is_none()
            && self.variant.is_none()
            && self.os_version.is_none()
        {
            return None;
        }
        Some(Platform {
            os: self.os.clone().unwrap_or_default(),
            architecture: self.architecture.clone().unwrap_or_default(),
            variant: self.variant.clone(),
            os_version: self.os_version.clone(),
            os_features: None,
        })
    }
}

/// A manifest list bound to an on-disk layout.
pub struct ImageIndex {
    repo_name: String,
    path: PathBuf,
    index: OciImageIndex,
    media_types: MediaTypeFamily,
    dirty: bool,
}

impl ImageIndex {
    /// Create a fresh, empty index at `path`.
    pub async fn create(
        repo_name: impl Into<String>,
        path: impl Into<PathBuf>,
        media_types: MediaTypeFamily,
    ) -> Result<Self> {
        let path = path.into();
        LayoutDir::ensure(&path).await?;
        let index = OciImageIndex {
            media_type: Some(media_types.index().to_owned()),
            ..Default::default()
        };
        Ok(Self {
            repo_name: repo_name.into(),
            path,
            index,
            media_types,
            dirty: true,
        })
    }

    /// Load the index materialized at `path`.
    pub async fn load(repo_name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let layout = LayoutDir::open(&path).await?;
        let index = layout.read_index().await?;
        let media_types = index
            .media_type
            .as_deref()
            .and_then(MediaTypeFamily::of)
            .unwrap_or(MediaTypeFamily::Oci);
        Ok(Self {
            repo_name: repo_name.into(),
            path,
            index,
            media_types,
            dirty: false,
        })
    }

    /// The name this index pushes under.
    pub fn name(&self) -> &str {
        &self.repo_name
    }

    /// The layout directory backing this index.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current child descriptors.
    pub fn manifests(&self) -> &[OciDescriptor] {
        &self.index.manifests
    }

    /// Append the image or index behind `reference`.
    ///
    /// A single-image reference contributes one descriptor carrying the
    /// platform read from its config. An index reference contributes every
    /// non-attestation child when `opts.all` is set, or the single child
    /// matching the explicit filters (the host platform when no filter is
    /// given).
    #[instrument(level = "info", skip(self, client, opts), fields(index = %self.repo_name))]
    pub async fn add(
        &mut self,
        client: &Client,
        reference: &Reference,
        opts: AddOptions,
    ) -> Result<()> {
        let (raw, digest, media_type) = client
            .pull_manifest_raw(reference)
            .await
            .map_err(Error::Other)?;

        if is_index_media_type(&media_type) {
            let child_index: OciImageIndex = serde_json::from_slice(&raw)?;
            if opts.all {
                for descriptor in child_index.manifests {
                    let attestation = descriptor
                        .platform
                        .as_ref()
                        .map_or(false, Platform::is_unknown);
                    if !attestation {
                        self.push_unique(descriptor);
                    }
                }
                return Ok(());
            }
            let host = Platform::host();
            let filter = opts.platform_filter().unwrap_or(host);
            let child = child_index
                .manifests
                .into_iter()
                .find(|d| {
                    d.platform
                        .as_ref()
                        .map_or(false, |p| !p.is_unknown() && p.satisfies(&filter))
                })
                .ok_or_else(|| Error::ImageNotFound(reference.whole()))?;
            self.push_unique(child);
            return Ok(());
        }

        let manifest: OciImageManifest = serde_json::from_slice(&raw)?;
        let (config, _) = client
            .pull_config(reference, &manifest.config)
            .await
            .map_err(Error::Other)?;
        let mut descriptor = OciDescriptor::new(media_type, digest, raw.len() as i64);
        descriptor.platform = Some(Platform {
            os: config.os,
            architecture: config.architecture,
            variant: config.variant,
            os_version: config.os_version,
            os_features: config.os_features,
        });
        self.push_unique(descriptor);
        Ok(())
    }

    /// Append an already-known descriptor, replacing any child with the
    /// same digest. This is the local composition path; [`ImageIndex::add`]
    /// is the registry-backed one.
    pub fn add_descriptor(&mut self, descriptor: OciDescriptor) {
        self.push_unique(descriptor);
    }

    fn push_unique(&mut self, descriptor: OciDescriptor) {
        self.index
            .manifests
            .retain(|existing| existing.digest != descriptor.digest);
        self.index.manifests.push(descriptor);
        self.dirty = true;
    }

    /// Drop the child with this digest. Removing an absent digest is a
    /// no-op; subsequent attribute reads for it fail.
    pub fn remove(&mut self, digest: &Digest) {
        let before = self.index.manifests.len();
        self.index.manifests.retain(|d| &d.digest != digest);
        if self.index.manifests.len() != before {
            self.dirty = true;
        }
    }

    fn descriptor(&self, digest: &Digest) -> Result<&OciDescriptor> {
        self.index
            .manifests
            .iter()
            .find(|d| &d.digest == digest)
            .ok_or_else(|| Error::NoImageOrIndexFound {
                digest: digest.clone(),
            })
    }

    fn descriptor_mut(&mut self, digest: &Digest) -> Result<&mut OciDescriptor> {
        let position = self
            .index
            .manifests
            .iter()
            .position(|d| &d.digest == digest)
            .ok_or_else(|| Error::NoImageOrIndexFound {
                digest: digest.clone(),
            })?;
        self.dirty = true;
        Ok(&mut self.index.manifests[position])
    }

    // ---- per-child reads ----

    /// The child's OS.
    pub fn os(&self, digest: &Digest) -> Result<String> {
        let descriptor = self.descriptor(digest)?;
        descriptor
            .platform
            .as_ref()
            .map(|p| p.os.clone())
            .filter(|os| !os.is_empty())
            .ok_or_else(|| Error::OsUndefined {
                digest: digest.clone(),
            })
    }

    /// The child's architecture.
    pub fn architecture(&self, digest: &Digest) -> Result<String> {
        let descriptor = self.descriptor(digest)?;
        descriptor
            .platform
            .as_ref()
            .map(|p| p.architecture.clone())
            .filter(|arch| !arch.is_empty())
            .ok_or_else(|| Error::ArchitectureUndefined {
                digest: digest.clone(),
            })
    }

    /// The child's architecture variant.
    pub fn variant(&self, digest: &Digest) -> Result<String> {
        let descriptor = self.descriptor(digest)?;
        descriptor
            .platform
            .as_ref()
            .and_then(|p| p.variant.clone())
            .ok_or_else(|| Error::VariantUndefined {
                digest: digest.clone(),
            })
    }

    /// The child's OS version.
    pub fn os_version(&self, digest: &Digest) -> Result<String> {
        let descriptor = self.descriptor(digest)?;
        descriptor
            .platform
            .as_ref()
            .and_then(|p| p.os_version.clone())
            .ok_or_else(|| Error::OsVersionUndefined {
                digest: digest.clone(),
            })
    }

    /// The child's OS features.
    pub fn os_features(&self, digest: &Digest) -> Result<Vec<String>> {
        let descriptor = self.descriptor(digest)?;
        descriptor
            .platform
            .as_ref()
            .and_then(|p| p.os_features.clone())
            .ok_or_else(|| Error::OsFeaturesUndefined {
                digest: digest.clone(),
            })
    }

    /// The child's annotations. Docker manifest lists carry none.
    pub fn annotations(&self, digest: &Digest) -> Result<BTreeMap<String, String>> {
        if self.media_types == MediaTypeFamily::Docker {
            return Err(Error::AnnotationsUndefined {
                digest: digest.clone(),
            });
        }
        let descriptor = self.descriptor(digest)?;
        descriptor
            .annotations
            .clone()
            .ok_or_else(|| Error::AnnotationsUndefined {
                digest: digest.clone(),
            })
    }

    /// The child's URLs.
    pub fn urls(&self, digest: &Digest) -> Result<Vec<String>> {
        let descriptor = self.descriptor(digest)?;
        descriptor
            .urls
            .clone()
            .ok_or_else(|| Error::UrlsUndefined {
                digest: digest.clone(),
            })
    }

    // ---- per-child edits; descriptor-only rewrites ----

    /// Set the child's OS.
    pub fn set_os(&mut self, digest: &Digest, os: impl Into<String>) -> Result<()> {
        let descriptor = self.descriptor_mut(digest)?;
        descriptor.platform.get_or_insert_with(Platform::default).os = os.into();
        Ok(())
    }

    /// Set the child's architecture.
    pub fn set_architecture(
        &mut self,
        digest: &Digest,
        architecture: impl Into<String>,
    ) -> Result<()> {
        let descriptor = self.descriptor_mut(digest)?;
        descriptor
            .platform
            .get_or_insert_with(Platform::default)
            .architecture = architecture.into();
        Ok(())
    }

    /// Set the child's architecture variant.
    pub fn set_variant(&mut self, digest: &Digest, variant: impl Into<String>) -> Result<()> {
        let descriptor = self.descriptor_mut(digest)?;
        descriptor
            .platform
            .get_or_insert_with(Platform::default)
            .variant = Some(variant.into());
        Ok(())
    }

    /// Set the child's OS version.
    pub fn set_os_version(&mut self, digest: &Digest, os_version: impl Into<String>) -> Result<()> {
        let descriptor = self.descriptor_mut(digest)?;
        descriptor
            .platform
            .get_or_insert_with(Platform::default)
            .os_version = Some(os_version.into());
        Ok(())
    }

    /// Set the child's OS features.
    pub fn set_os_features(&mut self, digest: &Digest, os_features: Vec<String>) -> Result<()> {
        let descriptor = self.descriptor_mut(digest)?;
        descriptor
            .platform
            .get_or_insert_with(Platform::default)
            .os_features = Some(os_features);
        Ok(())
    }

    /// Set the child's annotations. Unsupported on Docker manifest lists.
    pub fn set_annotations(
        &mut self,
        digest: &Digest,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        if self.media_types == MediaTypeFamily::Docker {
            return Err(Error::AnnotationsUndefined {
                digest: digest.clone(),
            });
        }
        let descriptor = self.descriptor_mut(digest)?;
        descriptor.annotations = Some(annotations);
        Ok(())
    }

    /// Set the child's URLs. Unsupported on Docker manifest lists.
    pub fn set_urls(&mut self, digest: &Digest, urls: Vec<String>) -> Result<()> {
        if self.media_types == MediaTypeFamily::Docker {
            return Err(Error::UrlsUndefined {
                digest: digest.clone(),
            });
        }
        let descriptor = self.descriptor_mut(digest)?;
        descriptor.urls = Some(urls);
        Ok(())
    }

    /// The legacy `features` field is not part of the OCI platform and is
    /// not carried by this engine.
    pub fn set_features(&mut self, digest: &Digest, _features: Vec<String>) -> Result<()> {
        Err(Error::FeaturesUndefined {
            digest: digest.clone(),
        })
    }

    // ---- persistence ----

    /// Serialize the current list to the backing layout, with the media
    /// type of the index's declared family.
    #[instrument(level = "info", skip(self), fields(index = %self.repo_name))]
    pub async fn save(&mut self) -> Result<()> {
        self.index.media_type = Some(self.media_types.index().to_owned());
        let layout = LayoutDir::ensure(&self.path).await?;
        layout.write_index(&self.index).await?;
        self.dirty = false;
        debug!(manifests = self.index.manifests.len(), "index saved");
        Ok(())
    }

    /// Upload the index to the registry under this index's repo name. The
    /// referenced per-platform manifests must already exist there. Unsaved
    /// changes are saved first.
    pub async fn push(&mut self, client: &Client) -> Result<Digest> {
        if self.dirty {
            self.save().await?;
        }
        let reference = Reference::parse(&self.repo_name)
            .map_err(|_| Error::InvalidRepoName(self.repo_name.clone()))?;
        let body = serde_json::to_vec(&self.index)?;
        let digest = client
            .push_manifest(&reference, body, self.media_types.index())
            .await
            .map_err(Error::Other)?;
        Ok(digest)
    }

    /// The index manifest as a human-readable JSON string. Fails while
    /// unsaved edits exist, since the string would not match the on-disk
    /// state.
    pub fn inspect(&self) -> Result<String> {
        if self.dirty {
            return Err(Error::UnsavedChanges);
        }
        Ok(serde_json::to_string_pretty(&self.index)?)
    }

    /// Remove this index's on-disk directory tree.
    pub async fn delete(self) -> Result<()> {
        let layout = LayoutDir::open(&self.path).await?;
        layout.delete().await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_descriptor(n: u8, platform: Option<Platform>) -> OciDescriptor {
        let mut d = OciDescriptor::new(
            oci_registry::manifest::OCI_MANIFEST_MEDIA_TYPE,
            Digest::sha256_of(&[n]),
            123,
        );
        d.platform = platform;
        d
    }

    async fn index_with_two_children(dir: &Path) -> ImageIndex {
        let mut index = ImageIndex::create("example.com/idx:latest", dir, MediaTypeFamily::Oci)
            .await
            .expect("create index");
        index.push_unique(sample_descriptor(
            1,
            Some(Platform {
                os: "linux".into(),
                architecture: "amd64".into(),
                ..Default::default()
            }),
        ));
        index.push_unique(sample_descriptor(
            2,
            Some(Platform {
                os: "linux".into(),
                architecture: "arm64".into(),
                ..Default::default()
            }),
        ));
        index
    }

    #[tokio::test]
    async fn descriptor_edits_touch_only_the_target_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = index_with_two_children(dir.path()).await;
        let a = Digest::sha256_of(&[1]);
        let b = Digest::sha256_of(&[2]);

        index.set_os(&a, "some-os").expect("set os");
        index.save().await.expect("save");

        let reloaded = ImageIndex::load("example.com/idx:latest", dir.path())
            .await
            .expect("reload");
        assert_eq!("some-os", reloaded.os(&a).expect("os"));
        assert_eq!("linux", reloaded.os(&b).expect("os"));
        assert_eq!("arm64", reloaded.architecture(&b).expect("arch"));
    }

    #[tokio::test]
    async fn removed_digest_reads_fail_typed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = index_with_two_children(dir.path()).await;
        let a = Digest::sha256_of(&[1]);

        index.remove(&a);
        let err = index.os(&a).expect_err("removed");
        assert!(matches!(err, Error::NoImageOrIndexFound { .. }));
        assert_eq!(
            format!("no image or image index found for digest {}", a),
            err.to_string()
        );
        assert_eq!(1, index.manifests().len());
    }

    #[tokio::test]
    async fn undefined_attributes_are_distinct_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = index_with_two_children(dir.path()).await;
        let a = Digest::sha256_of(&[1]);

        assert!(matches!(
            index.variant(&a),
            Err(Error::VariantUndefined { .. })
        ));
        assert!(matches!(
            index.os_version(&a),
            Err(Error::OsVersionUndefined { .. })
        ));
        assert!(matches!(
            index.os_features(&a),
            Err(Error::OsFeaturesUndefined { .. })
        ));
        assert!(matches!(index.urls(&a), Err(Error::UrlsUndefined { .. })));
        assert!(matches!(
            index.annotations(&a),
            Err(Error::AnnotationsUndefined { .. })
        ));
    }

    #[tokio::test]
    async fn docker_lists_reject_annotations_and_urls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index =
            ImageIndex::create("example.com/idx:latest", dir.path(), MediaTypeFamily::Docker)
                .await
                .expect("create");
        index.push_unique(sample_descriptor(1, None));
        let a = Digest::sha256_of(&[1]);

        assert!(matches!(
            index.set_annotations(&a, BTreeMap::new()),
            Err(Error::AnnotationsUndefined { .. })
        ));
        assert!(matches!(
            index.set_urls(&a, vec![]),
            Err(Error::UrlsUndefined { .. })
        ));
        // Platform fields stay editable.
        index.set_os(&a, "linux").expect("set os");
    }

    #[tokio::test]
    async fn save_declares_the_family_media_type() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index =
            ImageIndex::create("example.com/idx:latest", dir.path(), MediaTypeFamily::Docker)
                .await
                .expect("create");
        index.push_unique(sample_descriptor(1, None));
        index.save().await.expect("save");

        let reloaded = ImageIndex::load("example.com/idx:latest", dir.path())
            .await
            .expect("reload");
        assert_eq!(
            Some(oci_registry::manifest::DOCKER_MANIFEST_LIST_MEDIA_TYPE),
            reloaded.index.media_type.as_deref()
        );
    }

    #[tokio::test]
    async fn inspect_requires_a_saved_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = index_with_two_children(dir.path()).await;
        assert!(matches!(index.inspect(), Err(Error::UnsavedChanges)));
        index.save().await.expect("save");
        let printed = index.inspect().expect("inspect");
        assert!(printed.contains("manifests"));
    }

    #[tokio::test]
    async fn delete_removes_the_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("idx");
        let mut index = ImageIndex::create("example.com/idx:latest", &root, MediaTypeFamily::Oci)
            .await
            .expect("create");
        index.save().await.expect("save");
        index.delete().await.expect("delete");
        assert!(!root.exists());
    }
}
