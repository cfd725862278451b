//! The mutable image core.
//!
//! An [`Image`] holds the current config, the ordered layer list and the
//! bookkeeping needed to re-project a consistent manifest/config pair after
//! every edit. Backends (`layout`, `local`) wrap it with a target to save
//! to; the core itself never touches a backend.
//!
//! Two properties drive the design:
//!
//! - **Digest stability.** An image loaded from a base and never mutated
//!   re-serializes byte-identically: the raw base manifest and config bytes
//!   are retained and written verbatim, so documents we did not edit are
//!   never re-serialized (extra fields in a foreign config survive a
//!   round trip). The first mutation marks the image dirty and projection
//!   switches to rebuilding both documents canonically.
//! - **Alignment.** `layers`, `config.rootfs.diff_ids` and the projected
//!   `manifest.layers` move in lockstep; every save re-checks the
//!   invariant before any blob is written.

pub mod options;

use crate::errors::{Error, Result};
use crate::layer::{FileLayer, Layer, SharedLayer};
use chrono::{DateTime, TimeZone, Utc};
use oci_registry::config::{History, ImageConfig};
use oci_registry::digest::Digest;
use oci_registry::manifest::{
    MediaTypeFamily, OciDescriptor, OciImageManifest, Platform, SCHEMA_VERSION,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use options::ImageOptions;

/// The timestamp stamped onto configs and history entries when the caller
/// does not provide one. Using a constant makes two byte-identical builds
/// produce byte-identical digests.
pub fn normalized_date_time() -> DateTime<Utc> {
    // 1980-01-01T00:00:01Z
    Utc.timestamp(315_532_801, 0)
}

/// An image projection committed for saving: the exact bytes each backend
/// will write, plus their parsed forms for descriptor bookkeeping.
#[derive(Debug)]
pub struct CommittedImage {
    /// The manifest bytes to write.
    pub manifest_raw: Vec<u8>,
    /// The config bytes to write.
    pub config_raw: Vec<u8>,
    /// The parsed manifest the bytes encode.
    pub manifest: OciImageManifest,
    /// The parsed config the bytes encode.
    pub config: ImageConfig,
}

impl CommittedImage {
    /// The manifest digest, i.e. the image's content identifier.
    pub fn manifest_digest(&self) -> Digest {
        Digest::sha256_of(&self.manifest_raw)
    }

    /// The daemon-style image ID: the digest of the config bytes.
    pub fn image_id(&self) -> Digest {
        Digest::sha256_of(&self.config_raw)
    }
}

/// How an image is identified in its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    /// The manifest digest; used by layout and registry backends.
    Digest(Digest),
    /// The config digest; the daemon's notion of an image ID.
    ImageId(Digest),
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::Digest(d) => write!(f, "{}", d),
            Identifier::ImageId(d) => write!(f, "{}", d),
        }
    }
}

/// The mutable image.
#[derive(Clone)]
pub struct Image {
    repo_name: String,
    config: ImageConfig,
    layers: Vec<SharedLayer>,
    prev_layers: Vec<SharedLayer>,
    media_types: MediaTypeFamily,
    manifest_annotations: Option<BTreeMap<String, String>>,
    ref_name_annotation: Option<String>,
    preserve_history: bool,
    preserve_digest: bool,
    save_without_layers: bool,
    created_at: DateTime<Utc>,
    base_manifest_raw: Option<Vec<u8>>,
    base_config_raw: Option<Vec<u8>>,
    dirty: bool,
}

impl Image {
    /// Build an empty image from the options' platform, media types and
    /// starting config. Defaults are `linux`/`amd64` and OCI media types.
    pub fn empty(repo_name: impl Into<String>, opts: &ImageOptions) -> Self {
        let mut config = opts.config.clone().unwrap_or_default();
        let platform = opts.platform.clone().unwrap_or(Platform {
            os: "linux".to_owned(),
            architecture: "amd64".to_owned(),
            ..Default::default()
        });
        if config.os.is_empty() {
            config.os = platform.os;
        }
        if config.architecture.is_empty() {
            config.architecture = platform.architecture;
        }
        if config.variant.is_none() {
            config.variant = platform.variant;
        }
        if config.os_version.is_none() {
            config.os_version = platform.os_version;
        }
        Self {
            repo_name: repo_name.into(),
            config,
            layers: vec![],
            prev_layers: vec![],
            media_types: opts.media_types.unwrap_or(MediaTypeFamily::Oci),
            manifest_annotations: None,
            ref_name_annotation: None,
            preserve_history: opts.preserve_history,
            preserve_digest: opts.preserve_digest,
            save_without_layers: opts.without_layers,
            created_at: opts.created_at.unwrap_or_else(normalized_date_time),
            base_manifest_raw: None,
            base_config_raw: None,
            dirty: true,
        }
    }

    /// Build an image on top of a loaded base: raw manifest/config bytes,
    /// their parsed forms, and the base's layers (facades where blobs are
    /// missing).
    pub fn from_base(
        repo_name: impl Into<String>,
        manifest_raw: Vec<u8>,
        config_raw: Vec<u8>,
        manifest: &OciImageManifest,
        config: ImageConfig,
        layers: Vec<SharedLayer>,
        opts: &ImageOptions,
    ) -> Self {
        let base_family = manifest
            .media_type
            .as_deref()
            .and_then(MediaTypeFamily::of)
            .unwrap_or(MediaTypeFamily::Oci);
        let media_types = opts.media_types.unwrap_or(base_family);
        // Coercing to the other family rewrites the manifest, so the raw
        // bytes can no longer be replayed.
        let dirty = media_types != base_family;
        Self {
            repo_name: repo_name.into(),
            config,
            layers,
            prev_layers: vec![],
            media_types,
            manifest_annotations: manifest.annotations.clone(),
            ref_name_annotation: None,
            preserve_history: opts.preserve_history,
            preserve_digest: opts.preserve_digest,
            save_without_layers: opts.without_layers,
            created_at: opts.created_at.unwrap_or_else(normalized_date_time),
            base_manifest_raw: Some(manifest_raw),
            base_config_raw: Some(config_raw),
            dirty,
        }
    }

    /// Build an image from daemon-side metadata: a parsed config and
    /// store-backed layers, with no raw manifest to replay.
    pub(crate) fn from_daemon_base(
        repo_name: impl Into<String>,
        config: ImageConfig,
        layers: Vec<SharedLayer>,
        opts: &ImageOptions,
    ) -> Self {
        Self {
            repo_name: repo_name.into(),
            config,
            layers,
            prev_layers: vec![],
            media_types: opts.media_types.unwrap_or(MediaTypeFamily::Oci),
            manifest_annotations: None,
            ref_name_annotation: None,
            preserve_history: opts.preserve_history,
            preserve_digest: opts.preserve_digest,
            save_without_layers: opts.without_layers,
            created_at: opts.created_at.unwrap_or_else(normalized_date_time),
            base_manifest_raw: None,
            base_config_raw: None,
            dirty: true,
        }
    }

    /// The name this image saves under.
    pub fn name(&self) -> &str {
        &self.repo_name
    }

    /// Point the image at a different name.
    pub fn rename(&mut self, repo_name: impl Into<String>) {
        self.repo_name = repo_name.into();
    }

    /// The manifest media type the image declares.
    pub fn media_type(&self) -> &'static str {
        self.media_types.manifest()
    }

    /// The media-type family the image declares.
    pub fn media_type_family(&self) -> MediaTypeFamily {
        self.media_types
    }

    /// The current config.
    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// The ordered layer list, base first.
    pub fn layers(&self) -> &[SharedLayer] {
        &self.layers
    }

    pub(crate) fn set_prev_layers(&mut self, layers: Vec<SharedLayer>) {
        self.prev_layers = layers;
    }

    pub(crate) fn save_without_layers(&self) -> bool {
        self.save_without_layers
    }

    pub(crate) fn force_save_without_layers(&mut self) {
        self.save_without_layers = true;
    }

    /// The buffered ref-name annotation, if any.
    pub fn ref_name_annotation(&self) -> Option<&str> {
        self.ref_name_annotation.as_deref()
    }

    /// Record the value written to the index descriptor as
    /// `org.opencontainers.image.ref.name` on the next layout save.
    pub fn annotate_ref_name(&mut self, tag: impl Into<String>) {
        self.ref_name_annotation = Some(tag.into());
    }

    // ---- config getters ----

    /// The config OS.
    pub fn os(&self) -> &str {
        &self.config.os
    }

    /// The config architecture.
    pub fn architecture(&self) -> &str {
        &self.config.architecture
    }

    /// The config architecture variant.
    pub fn variant(&self) -> Option<&str> {
        self.config.variant.as_deref()
    }

    /// The config OS version, empty when unset.
    pub fn os_version(&self) -> &str {
        self.config.os_version.as_deref().unwrap_or("")
    }

    /// The config OS features.
    pub fn os_features(&self) -> &[String] {
        self.config.os_features.as_deref().unwrap_or(&[])
    }

    /// All environment entries, `KEY=value` each.
    pub fn env(&self) -> &[String] {
        self.config.config.env.as_deref().unwrap_or(&[])
    }

    /// Look up one environment variable. Keys fold ASCII case on a
    /// windows-OS config, matching [`Image::set_env`].
    pub fn env_var(&self, key: &str) -> Option<&str> {
        let case_insensitive = self.config.os == "windows";
        self.env().iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            let matched = if case_insensitive {
                k.eq_ignore_ascii_case(key)
            } else {
                k == key
            };
            matched.then(|| v)
        })
    }

    /// The entrypoint.
    pub fn entrypoint(&self) -> &[String] {
        self.config.config.entrypoint.as_deref().unwrap_or(&[])
    }

    /// The default command.
    pub fn cmd(&self) -> &[String] {
        self.config.config.cmd.as_deref().unwrap_or(&[])
    }

    /// The working directory, empty when unset.
    pub fn working_dir(&self) -> &str {
        self.config.config.working_dir.as_deref().unwrap_or("")
    }

    /// All labels.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.config.config.labels.clone().unwrap_or_default()
    }

    /// Look up one label.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    /// The config creation timestamp.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.config.created
    }

    /// The build history.
    pub fn history(&self) -> &[History] {
        &self.config.history
    }

    // ---- config setters ----

    /// Set the config OS.
    pub fn set_os(&mut self, os: impl Into<String>) {
        self.config.os = os.into();
        self.mark_dirty();
    }

    /// Set the config architecture.
    pub fn set_architecture(&mut self, architecture: impl Into<String>) {
        self.config.architecture = architecture.into();
        self.mark_dirty();
    }

    /// Set the architecture variant.
    pub fn set_variant(&mut self, variant: impl Into<String>) {
        self.config.variant = Some(variant.into());
        self.mark_dirty();
    }

    /// Set the OS version.
    pub fn set_os_version(&mut self, os_version: impl Into<String>) {
        self.config.os_version = Some(os_version.into());
        self.mark_dirty();
    }

    /// Set the OS features.
    pub fn set_os_features(&mut self, os_features: Vec<String>) {
        self.config.os_features = Some(os_features);
        self.mark_dirty();
    }

    /// Set one environment variable.
    ///
    /// On a windows-OS config, keys are compared case-insensitively, so
    /// `set_env("env_key", ..)` followed by `set_env("ENV_KEY", ..)` leaves
    /// a single entry.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let case_insensitive = self.config.os == "windows";
        let matches = |entry: &str| -> bool {
            match entry.split_once('=') {
                Some((k, _)) if case_insensitive => k.eq_ignore_ascii_case(key),
                Some((k, _)) => k == key,
                None => false,
            }
        };
        let env = self.config.config.env.get_or_insert_with(Vec::new);
        let formatted = format!("{}={}", key, value);
        match env.iter().position(|entry| matches(entry)) {
            Some(i) => env[i] = formatted,
            None => env.push(formatted),
        }
        self.mark_dirty();
    }

    /// Set one label.
    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config
            .config
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self.mark_dirty();
    }

    /// Remove one label. Removing an absent label is a no-op.
    pub fn remove_label(&mut self, key: &str) {
        if let Some(labels) = self.config.config.labels.as_mut() {
            labels.remove(key);
        }
        self.mark_dirty();
    }

    /// Set the entrypoint.
    pub fn set_entrypoint(&mut self, entrypoint: Vec<String>) {
        self.config.config.entrypoint = Some(entrypoint);
        self.mark_dirty();
    }

    /// Set the default command.
    pub fn set_cmd(&mut self, cmd: Vec<String>) {
        self.config.config.cmd = Some(cmd);
        self.mark_dirty();
    }

    /// Set the working directory.
    pub fn set_working_dir(&mut self, working_dir: impl Into<String>) {
        self.config.config.working_dir = Some(working_dir.into());
        self.mark_dirty();
    }

    /// Replace the build history wholesale.
    pub fn set_history(&mut self, history: Vec<History>) {
        self.config.history = history;
        self.mark_dirty();
    }

    // ---- layer operations ----

    /// The image's top (most recently added) layer.
    pub fn top_layer(&self) -> Result<SharedLayer> {
        self.layers.last().cloned().ok_or_else(|| Error::NoLayers {
            repo_name: self.repo_name.clone(),
        })
    }

    /// Look up a layer by diff-ID.
    pub fn get_layer(&self, diff_id: &Digest) -> Result<SharedLayer> {
        self.layers
            .iter()
            .find(|l| l.diff_id() == diff_id)
            .cloned()
            .ok_or_else(|| Error::LayerNotFound {
                repo_name: self.repo_name.clone(),
                diff_id: diff_id.clone(),
            })
    }

    /// Append a layer tarball, computing its diff-ID by reading the file.
    pub async fn add_layer(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let layer = FileLayer::from_path(path.as_ref()).await?;
        self.push_layer(Arc::new(layer), History::default());
        Ok(())
    }

    /// Append a layer tarball whose diff-ID the caller already knows.
    pub fn add_layer_with_diff_id(&mut self, path: impl AsRef<Path>, diff_id: Digest) {
        let layer = FileLayer::new(path.as_ref(), diff_id);
        self.push_layer(Arc::new(layer), History::default());
    }

    /// Append a layer tarball with an explicit history entry.
    pub fn add_layer_with_diff_id_and_history(
        &mut self,
        path: impl AsRef<Path>,
        diff_id: Digest,
        history: History,
    ) {
        let layer = FileLayer::new(path.as_ref(), diff_id);
        self.push_layer(Arc::new(layer), history);
    }

    /// Append an already-constructed layer.
    pub fn add_shared_layer(&mut self, layer: SharedLayer) {
        self.push_layer(layer, History::default());
    }

    /// Append the previous image's layer with this diff-ID. Only
    /// `prev_layers` is consulted.
    pub fn reuse_layer(&mut self, diff_id: &Digest) -> Result<()> {
        self.reuse_layer_with_history(diff_id, History::default())
    }

    /// Like [`Image::reuse_layer`], with an explicit history entry.
    pub fn reuse_layer_with_history(&mut self, diff_id: &Digest, history: History) -> Result<()> {
        let layer = self
            .prev_layers
            .iter()
            .find(|l| l.diff_id() == diff_id)
            .cloned()
            .ok_or_else(|| Error::LayerNotFound {
                repo_name: self.repo_name.clone(),
                diff_id: diff_id.clone(),
            })?;
        self.push_layer(layer, history);
        Ok(())
    }

    fn push_layer(&mut self, layer: SharedLayer, history: History) {
        self.config.rootfs.diff_ids.push(layer.diff_id().clone());
        self.config.history.push(history);
        self.layers.push(layer);
        self.mark_dirty();
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.base_manifest_raw = None;
        self.base_config_raw = None;
    }

    // ---- projection ----

    /// The image's manifest digest (content identifier).
    pub async fn digest(&self) -> Result<Digest> {
        Ok(self.commit().await?.manifest_digest())
    }

    /// The projected manifest.
    pub async fn manifest(&self) -> Result<OciImageManifest> {
        Ok(self.commit().await?.manifest)
    }

    /// Project the image into the exact bytes a backend will write,
    /// applying the save-time normalization rules.
    ///
    /// An unmutated base image replays its original manifest and config
    /// bytes verbatim, preserving digests and any foreign fields.
    pub async fn commit(&self) -> Result<CommittedImage> {
        self.enforce_alignment()?;
        if !self.dirty {
            if let (Some(manifest_raw), Some(config_raw)) =
                (&self.base_manifest_raw, &self.base_config_raw)
            {
                let manifest: OciImageManifest = serde_json::from_slice(manifest_raw)?;
                return Ok(CommittedImage {
                    manifest_raw: manifest_raw.clone(),
                    config_raw: config_raw.clone(),
                    manifest,
                    config: self.config.clone(),
                });
            }
        }

        let config = self.normalized_config();
        let config_raw = config.canonical_json()?;
        let config_descriptor = OciDescriptor::new(
            self.media_types.config(),
            Digest::sha256_of(&config_raw),
            config_raw.len() as i64,
        );
        let mut layer_descriptors = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            layer_descriptors.push(OciDescriptor::new(
                self.media_types.coerce_layer(layer.media_type()),
                layer.digest().await?,
                layer.size().await?,
            ));
        }
        let manifest = OciImageManifest {
            schema_version: SCHEMA_VERSION,
            media_type: Some(self.media_types.manifest().to_owned()),
            config: config_descriptor,
            layers: layer_descriptors,
            annotations: self.manifest_annotations.clone(),
        };
        let manifest_raw = serde_json::to_vec(&manifest)?;
        Ok(CommittedImage {
            manifest_raw,
            config_raw,
            manifest,
            config,
        })
    }

    /// The normalized config bytes for a daemon-format save, which never
    /// needs the manifest and so works with layers whose compressed
    /// digests are unknown.
    pub(crate) fn commit_config(&self) -> Result<Vec<u8>> {
        self.enforce_alignment()?;
        Ok(self.normalized_config().canonical_json()?)
    }

    /// Check that layers, diff-IDs and (for replayed bases) manifest
    /// entries agree.
    fn enforce_alignment(&self) -> Result<()> {
        let diff_ids = &self.config.rootfs.diff_ids;
        if diff_ids.len() != self.layers.len() {
            return Err(Error::LayerCountMismatch {
                layers: self.layers.len(),
                diff_ids: diff_ids.len(),
                descriptors: self.layers.len(),
            });
        }
        for (layer, diff_id) in self.layers.iter().zip(diff_ids) {
            if layer.diff_id() != diff_id {
                return Err(Error::DiffIdMismatch {
                    expected: diff_id.clone(),
                    actual: layer.diff_id().clone(),
                });
            }
        }
        if let Some(manifest_raw) = &self.base_manifest_raw {
            let manifest: OciImageManifest = serde_json::from_slice(manifest_raw)?;
            if manifest.layers.len() != self.layers.len() {
                return Err(Error::LayerCountMismatch {
                    layers: self.layers.len(),
                    diff_ids: diff_ids.len(),
                    descriptors: manifest.layers.len(),
                });
            }
        }
        Ok(())
    }

    fn normalized_config(&self) -> ImageConfig {
        let mut config = self.config.clone();
        if self.preserve_digest {
            return config;
        }
        config.created = Some(self.created_at);
        config.docker_version = None;
        config.container = None;
        if self.preserve_history {
            for entry in &mut config.history {
                entry.created = Some(self.created_at);
            }
        } else {
            config.history = self
                .layers
                .iter()
                .map(|_| History {
                    created: Some(self.created_at),
                    ..Default::default()
                })
                .collect();
        }
        config
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("repo_name", &self.repo_name)
            .field("layers", &self.layers.len())
            .field("media_types", &self.media_types)
            .field("dirty", &self.dirty)
            .finish()
    }
}
