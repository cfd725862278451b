//! Sparse images: full manifest and config, no layer blobs.
//!
//! A sparse save produces a layout whose manifest is complete but whose
//! blob directory holds only the manifest and config. Reading such a
//! layout back yields facade layers, and re-saving it preserves the
//! original manifest digest.

use crate::errors::Result;
use crate::image::options::ImageOptions;
use crate::layout::image::LayoutImage;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

/// A thin wrapper over [`LayoutImage`] that forces without-layers save
/// semantics regardless of the options it was built with.
pub struct SparseImage {
    inner: LayoutImage,
}

impl SparseImage {
    /// Create a sparse image bound to `path`.
    pub async fn new(path: impl Into<PathBuf>, opts: ImageOptions) -> Result<Self> {
        let mut inner = LayoutImage::new(path.into(), opts).await?;
        inner.force_save_without_layers();
        Ok(Self { inner })
    }
}

impl Deref for SparseImage {
    type Target = LayoutImage;

    fn deref(&self) -> &LayoutImage {
        &self.inner
    }
}

impl DerefMut for SparseImage {
    fn deref_mut(&mut self) -> &mut LayoutImage {
        &mut self.inner
    }
}
