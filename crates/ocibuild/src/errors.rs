//! The engine's error taxonomy.
//!
//! Absence conditions get their own variants so callers can recover from
//! them (a missing layer triggers the daemon fallback path, an undefined
//! descriptor attribute is reported but not fatal, and so on). Everything
//! else surfaces unchanged.

use oci_registry::digest::{Digest, DigestError};
use oci_registry::reference::ReferenceError;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used across the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Any error the engine can produce.
#[derive(Error, Debug)]
pub enum Error {
    /// A repo name failed reference validation.
    #[error("invalid repo name {0:?}")]
    InvalidRepoName(String),

    /// A digest string failed validation.
    #[error(transparent)]
    Digest(#[from] DigestError),

    /// An image reference failed to parse.
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    /// A directory did not hold a readable OCI layout.
    #[error("malformed OCI layout at {path}: {reason}")]
    MalformedLayout {
        /// The layout root.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The named image does not exist in the backend.
    #[error("image {0:?} not found")]
    ImageNotFound(String),

    /// An image with no layers was asked for its top layer.
    #[error("image {repo_name:?} has no layers")]
    NoLayers {
        /// The image's repo name.
        repo_name: String,
    },

    /// No layer with this diff-ID exists in the consulted set.
    #[error("image {repo_name:?} does not have layer with diff id {diff_id:?}")]
    LayerNotFound {
        /// The image whose layers were consulted.
        repo_name: String,
        /// The requested diff-ID.
        diff_id: Digest,
    },

    /// An index holds no child with this digest.
    #[error("no image or image index found for digest {digest}")]
    NoImageOrIndexFound {
        /// The requested digest.
        digest: Digest,
    },

    /// An index holds several children and needs an explicit platform to
    /// pick one.
    #[error("multiple manifests matched in index for {repo_name:?}; a platform must be specified")]
    PlatformRequired {
        /// The index's repo name.
        repo_name: String,
    },

    /// `os` is not set on the descriptor.
    #[error("os is undefined for manifest {digest}")]
    OsUndefined {
        /// The descriptor's digest.
        digest: Digest,
    },

    /// `architecture` is not set on the descriptor.
    #[error("architecture is undefined for manifest {digest}")]
    ArchitectureUndefined {
        /// The descriptor's digest.
        digest: Digest,
    },

    /// `variant` is not set on the descriptor.
    #[error("variant is undefined for manifest {digest}")]
    VariantUndefined {
        /// The descriptor's digest.
        digest: Digest,
    },

    /// `os.version` is not set on the descriptor.
    #[error("os-version is undefined for manifest {digest}")]
    OsVersionUndefined {
        /// The descriptor's digest.
        digest: Digest,
    },

    /// `features` is not supported or not set on the descriptor.
    #[error("features is undefined for manifest {digest}")]
    FeaturesUndefined {
        /// The descriptor's digest.
        digest: Digest,
    },

    /// `os.features` is not supported or not set on the descriptor.
    #[error("os-features is undefined for manifest {digest}")]
    OsFeaturesUndefined {
        /// The descriptor's digest.
        digest: Digest,
    },

    /// `urls` is not supported or not set on the descriptor.
    #[error("urls is undefined for manifest {digest}")]
    UrlsUndefined {
        /// The descriptor's digest.
        digest: Digest,
    },

    /// `annotations` is not supported on this index format.
    #[error("annotations are undefined for manifest {digest}")]
    AnnotationsUndefined {
        /// The descriptor's digest.
        digest: Digest,
    },

    /// The manifest layer list, config diff-IDs and in-memory layer list
    /// disagree about how many layers the image has.
    #[error(
        "image is inconsistent: {layers} layers, {diff_ids} diff-IDs, {descriptors} manifest entries"
    )]
    LayerCountMismatch {
        /// Entries in the in-memory layer list.
        layers: usize,
        /// Entries in `rootfs.diff_ids`.
        diff_ids: usize,
        /// Entries in `manifest.layers`.
        descriptors: usize,
    },

    /// A layer's diff-ID did not match the caller-supplied value.
    #[error("layer diff-ID {actual} does not match requested {expected}")]
    DiffIdMismatch {
        /// The diff-ID the caller asked for.
        expected: Digest,
        /// The diff-ID actually found.
        actual: Digest,
    },

    /// A blob referenced by a manifest is absent from the blob store.
    #[error("blob {digest} referenced by the manifest is missing")]
    MissingBlob {
        /// The missing blob's digest.
        digest: Digest,
    },

    /// A blob body did not match its declared size.
    #[error("blob {digest}: declared {declared} bytes but wrote {written}")]
    BlobSizeMismatch {
        /// The blob being written.
        digest: Digest,
        /// The size the descriptor declared.
        declared: i64,
        /// The bytes actually copied.
        written: u64,
    },

    /// More than one additional name was passed to a layout save.
    #[error("multiple additional names {names:?} are not allow when OCI layout is used")]
    MultipleNamesNotAllowed {
        /// The offending name list.
        names: Vec<String>,
    },

    /// The index has unsaved changes that the requested operation cannot
    /// serialize.
    #[error("index has unsaved changes; save it before inspecting")]
    UnsavedChanges,

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Aggregated per-target save failure.
    #[error(transparent)]
    Save(#[from] SaveError),

    /// Daemon, registry or other external-collaborator failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The failure report for one save target.
#[derive(Debug)]
pub struct SaveDiagnostic {
    /// The name the image was being saved under.
    pub image_name: String,
    /// Why that target failed.
    pub cause: Error,
}

/// Aggregate error for a save that failed for one or more targets.
///
/// A save commits per-target; targets that succeeded before the failure
/// stay written, and each failed target contributes one diagnostic.
#[derive(Error, Debug)]
#[error("failed to write image to the following tags: [{}]", self.render_causes())]
pub struct SaveError {
    /// One entry per failed target.
    pub diagnostics: Vec<SaveDiagnostic>,
}

impl SaveError {
    /// Wrap a single-target failure.
    pub fn single(image_name: impl Into<String>, cause: Error) -> Self {
        Self {
            diagnostics: vec![SaveDiagnostic {
                image_name: image_name.into(),
                cause,
            }],
        }
    }

    fn render_causes(&self) -> String {
        self.diagnostics
            .iter()
            .map(|d| format!("{}: {}", d.image_name, d.cause))
            .collect::<Vec<_>>()
            .join(",")
    }
}
