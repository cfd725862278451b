//! The option bag for image construction.
//!
//! Every backend constructor takes an [`ImageOptions`]; the fields a
//! backend cannot honour (for example a previous-image repo name on a
//! layout target) are ignored. Missing base or previous images are not
//! errors: the corresponding slot is simply left empty and the image starts
//! from scratch.

use crate::image::Image;
use chrono::{DateTime, Utc};
use oci_registry::config::ImageConfig;
use oci_registry::manifest::{MediaTypeFamily, Platform};
use std::path::PathBuf;

/// Declarative construction options, consumed once by a backend
/// constructor.
#[derive(Default)]
pub struct ImageOptions {
    /// An already-materialized base image to build on.
    pub base_image: Option<Image>,
    /// The name the base image is known by in the backend.
    pub base_image_repo_name: Option<String>,
    /// An OCI layout directory to read the base image from.
    pub base_image_path: Option<PathBuf>,
    /// An OCI layout directory holding a previous build, consulted only by
    /// `reuse_layer`.
    pub previous_image_path: Option<PathBuf>,
    /// The name of a previous build in the backend (daemon targets).
    pub previous_image_repo_name: Option<String>,
    /// Target platform for new images and for base-image selection.
    pub platform: Option<Platform>,
    /// The media-type family the image should declare.
    pub media_types: Option<MediaTypeFamily>,
    /// Keep base-image history entries instead of replacing them.
    pub preserve_history: bool,
    /// Re-save the image without normalizing timestamps or provenance.
    pub preserve_digest: bool,
    /// The timestamp stamped onto config and history at save time.
    pub created_at: Option<DateTime<Utc>>,
    /// Save manifest and config only, omitting all layer blobs.
    pub without_layers: bool,
    /// An explicit starting config.
    pub config: Option<ImageConfig>,
}

impl ImageOptions {
    /// Start from an image already held in memory.
    pub fn with_base_image(mut self, image: Image) -> Self {
        self.base_image = Some(image);
        self
    }

    /// Record the backend name of the base image.
    pub fn with_base_image_repo_name(mut self, name: impl Into<String>) -> Self {
        self.base_image_repo_name = Some(name.into());
        self
    }

    /// Read the base image from an OCI layout directory. A missing or empty
    /// directory is ignored.
    pub fn from_base_image_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_image_path = Some(path.into());
        self
    }

    /// Make a previous build's layers available to `reuse_layer`. A missing
    /// directory is ignored.
    pub fn with_previous_image_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.previous_image_path = Some(path.into());
        self
    }

    /// Make a previous daemon-resident build's layers available to
    /// `reuse_layer`.
    pub fn with_previous_image_repo_name(mut self, name: impl Into<String>) -> Self {
        self.previous_image_repo_name = Some(name.into());
        self
    }

    /// Set the target platform.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Declare the media-type family.
    pub fn with_media_types(mut self, family: MediaTypeFamily) -> Self {
        self.media_types = Some(family);
        self
    }

    /// Keep base-image history entries.
    pub fn with_history(mut self) -> Self {
        self.preserve_history = true;
        self
    }

    /// Skip save-time normalization so an unmutated image re-saves
    /// byte-identically.
    pub fn with_preserved_digest(mut self) -> Self {
        self.preserve_digest = true;
        self
    }

    /// Stamp this timestamp instead of the normalized default.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Save manifest and config only; all layer blobs are omitted.
    pub fn without_layers(mut self) -> Self {
        self.without_layers = true;
        self
    }

    /// Use an explicit starting config.
    pub fn with_config(mut self, config: ImageConfig) -> Self {
        self.config = Some(config);
        self
    }
}
