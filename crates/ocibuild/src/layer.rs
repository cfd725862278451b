//! The layer model.
//!
//! A layer is observable through five attributes: its diff-ID (sha256 of
//! the uncompressed tar), its digest (sha256 of the compressed form, as it
//! appears in the manifest), its compressed size, and its two byte streams.
//! Implementations differ in where those bytes live:
//!
//! - [`FileLayer`]: a tarball on disk, plain or gzipped; digest and size
//!   are computed lazily, once.
//! - [`FacadeLayer`]: metadata lifted from a manifest/config pair with no
//!   bytes behind it. Base layers of a sparse image are facades, and their
//!   streams are deliberately empty rather than erroring.
//!
//! A reused layer is not a separate type: reuse clones the `Arc` out of the
//! previous image's layer list.

use crate::errors::{Error, Result};
use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder};
use async_trait::async_trait;
use oci_registry::digest::{sha256_of_reader, Digest};
use oci_registry::manifest::OCI_LAYER_GZIP_MEDIA_TYPE;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::OnceCell;

/// Sentinel size for a layer whose compressed content is not locally
/// available (base layers of sparse images).
pub const UNKNOWN_SIZE: i64 = -1;

/// A readable stream of layer bytes.
pub type LayerReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// A unit of image content.
///
/// Any method touching layer bytes may block on filesystem, network or
/// decompression work.
#[async_trait]
pub trait Layer: Send + Sync {
    /// sha256 of the layer's uncompressed tar.
    fn diff_id(&self) -> &Digest;

    /// sha256 of the layer's compressed form, as recorded in the manifest.
    async fn digest(&self) -> Result<Digest>;

    /// Byte length of the compressed form, or [`UNKNOWN_SIZE`].
    async fn size(&self) -> Result<i64>;

    /// The gzipped layer bytes. Empty for facade layers.
    async fn compressed_reader(&self) -> Result<LayerReader>;

    /// The raw tar bytes. Empty for facade layers.
    async fn uncompressed_reader(&self) -> Result<LayerReader>;

    /// The layer's media type.
    fn media_type(&self) -> &str;
}

/// A shared, immutable handle on a layer.
pub type SharedLayer = Arc<dyn Layer>;

impl std::fmt::Debug for dyn Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("diff_id", self.diff_id())
            .field("media_type", &self.media_type())
            .finish()
    }
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A layer backed by a tarball on disk.
///
/// The file may be plain tar or already gzipped; the two cases are told
/// apart by the gzip magic. A plain file is compressed on the fly when its
/// compressed stream, digest or size are requested. Digest and size are
/// computed in a single pass and cached.
pub struct FileLayer {
    path: PathBuf,
    diff_id: Digest,
    media_type: String,
    gzipped: OnceCell<bool>,
    descriptor: OnceCell<(Digest, i64)>,
}

impl FileLayer {
    /// Wrap a tarball whose diff-ID the caller already knows.
    pub fn new(path: impl Into<PathBuf>, diff_id: Digest) -> Self {
        Self {
            path: path.into(),
            diff_id,
            media_type: OCI_LAYER_GZIP_MEDIA_TYPE.to_owned(),
            gzipped: OnceCell::new(),
            descriptor: OnceCell::new(),
        }
    }

    /// Wrap a blob whose manifest metadata is already known, e.g. a layer
    /// materialized in a layout's blob directory. No hashing will happen.
    pub fn with_descriptor(
        path: impl Into<PathBuf>,
        diff_id: Digest,
        digest: Digest,
        size: i64,
        media_type: impl Into<String>,
    ) -> Self {
        let media_type = media_type.into();
        let gzipped = oci_registry::manifest::is_gzip_layer_media_type(&media_type);
        let layer = Self {
            path: path.into(),
            diff_id,
            media_type,
            gzipped: OnceCell::new(),
            descriptor: OnceCell::new(),
        };
        layer.gzipped.set(gzipped).ok();
        layer.descriptor.set((digest, size)).ok();
        layer
    }

    /// Wrap a tarball, computing its diff-ID by reading it once.
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let gzipped = sniff_gzip(&path).await?;
        let (diff_id, _) = if gzipped {
            let file = BufReader::new(File::open(&path).await?);
            sha256_of_reader(GzipDecoder::new(file)).await?
        } else {
            sha256_of_reader(File::open(&path).await?).await?
        };
        let layer = Self::new(path, diff_id);
        layer.gzipped.set(gzipped).ok();
        Ok(layer)
    }

    /// The tarball's location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn is_gzipped(&self) -> Result<bool> {
        self.gzipped
            .get_or_try_init(|| sniff_gzip(&self.path))
            .await
            .map(|gzipped| *gzipped)
            .map_err(Error::Io)
    }
}

#[async_trait]
impl Layer for FileLayer {
    fn diff_id(&self) -> &Digest {
        &self.diff_id
    }

    async fn digest(&self) -> Result<Digest> {
        let (digest, _) = self.compressed_descriptor().await?;
        Ok(digest)
    }

    async fn size(&self) -> Result<i64> {
        let (_, size) = self.compressed_descriptor().await?;
        Ok(size)
    }

    async fn compressed_reader(&self) -> Result<LayerReader> {
        let file = File::open(&self.path).await?;
        if self.is_gzipped().await? {
            Ok(Box::new(file))
        } else {
            Ok(Box::new(GzipEncoder::new(BufReader::new(file))))
        }
    }

    async fn uncompressed_reader(&self) -> Result<LayerReader> {
        let file = File::open(&self.path).await?;
        if self.is_gzipped().await? {
            Ok(Box::new(GzipDecoder::new(BufReader::new(file))))
        } else {
            Ok(Box::new(file))
        }
    }

    fn media_type(&self) -> &str {
        &self.media_type
    }
}

impl FileLayer {
    async fn compressed_descriptor(&self) -> Result<(Digest, i64)> {
        self.descriptor
            .get_or_try_init(|| async {
                let reader = self.compressed_reader().await?;
                let (digest, size) = sha256_of_reader(reader).await?;
                Ok::<_, Error>((digest, size as i64))
            })
            .await
            .map(|descriptor| descriptor.clone())
    }
}

impl std::fmt::Debug for FileLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLayer")
            .field("path", &self.path)
            .field("diff_id", &self.diff_id)
            .finish()
    }
}

/// A layer that carries metadata only.
///
/// Facades stand in for base layers whose compressed bytes were never
/// materialized locally (a sparse base image). Their streams yield empty
/// readers so that walking an image's layers never errors; the blob writer
/// recognizes the zero-byte body and skips the blob.
#[derive(Debug, Clone)]
pub struct FacadeLayer {
    diff_id: Digest,
    digest: Digest,
    size: i64,
    media_type: String,
}

impl FacadeLayer {
    /// Build a facade from the aligned manifest descriptor and config
    /// diff-ID.
    pub fn new(diff_id: Digest, digest: Digest, size: i64, media_type: impl Into<String>) -> Self {
        Self {
            diff_id,
            digest,
            size,
            media_type: media_type.into(),
        }
    }
}

#[async_trait]
impl Layer for FacadeLayer {
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
        Ok(Box::new(tokio::io::empty()))
    }

    async fn uncompressed_reader(&self) -> Result<LayerReader> {
        Ok(Box::new(tokio::io::empty()))
    }

    fn media_type(&self) -> &str {
        &self.media_type
    }
}

async fn sniff_gzip(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path).await?;
    let mut magic = [0u8; 2];
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..]).await?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(magic == GZIP_MAGIC)
}
