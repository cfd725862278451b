//! OCI image-layout directories.
//!
//! A layout is a directory holding an `oci-layout` marker, a top-level
//! `index.json` and a content-addressed blob tree `blobs/<algo>/<hex>`.
//! The writer here is sparse-aware: a zero-byte blob body means "skip this
//! blob", which is how facade layers save an image whose base blobs were
//! never materialized.

pub mod image;

use crate::errors::{Error, Result};
use crate::image::CommittedImage;
use crate::layer::SharedLayer;
use futures::future::try_join_all;
use oci_registry::digest::{Digest, Sha256Counter};
use oci_registry::manifest::{OciDescriptor, OciImageIndex, REF_NAME_ANNOTATION};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";

/// Completed blob metadata.
#[derive(Debug, Clone)]
pub struct Blob {
    /// The blob's digest.
    pub digest: Digest,
    /// The blob's size in bytes.
    pub size: u64,
}

impl Blob {
    /// A descriptor pointing at this blob.
    pub fn descriptor(&self, media_type: impl Into<String>) -> OciDescriptor {
        OciDescriptor::new(media_type, self.digest.clone(), self.size as i64)
    }
}

/// An opened OCI layout directory.
#[derive(Debug, Clone)]
pub struct LayoutDir {
    root: PathBuf,
}

impl LayoutDir {
    /// Open the layout at `root`, creating the standard metadata if it is
    /// not already there.
    pub async fn ensure(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(BLOBS_DIR).join("sha256")).await?;
        let marker = root.join(OCI_LAYOUT_FILE);
        if fs::metadata(&marker).await.is_err() {
            atomic_write(&root, OCI_LAYOUT_FILE, OCI_LAYOUT_CONTENT.as_bytes()).await?;
        }
        if fs::metadata(root.join(INDEX_FILE)).await.is_err() {
            let empty = serde_json::to_vec(&OciImageIndex::default())?;
            atomic_write(&root, INDEX_FILE, &empty).await?;
        }
        Ok(Self { root })
    }

    /// Open an existing layout; errors when `root` does not hold one.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if fs::metadata(root.join(OCI_LAYOUT_FILE)).await.is_err() {
            return Err(Error::MalformedLayout {
                path: root,
                reason: format!("missing {} marker", OCI_LAYOUT_FILE),
            });
        }
        Ok(Self { root })
    }

    /// The layout's root directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// The file path a blob with this digest lives at.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(digest.algorithm())
            .join(digest.hex())
    }

    /// Whether the blob is materialized in this layout.
    pub async fn has_blob(&self, digest: &Digest) -> bool {
        fs::metadata(self.blob_path(digest))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Read the top-level index; absent means empty.
    pub async fn read_index(&self) -> Result<OciImageIndex> {
        match fs::read(self.root.join(INDEX_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OciImageIndex::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the top-level index.
    pub async fn write_index(&self, index: &OciImageIndex) -> Result<()> {
        let bytes = serde_json::to_vec(index)?;
        atomic_write(&self.root, INDEX_FILE, &bytes).await
    }

    /// Read a whole blob into memory. Meant for manifests and configs, not
    /// layers.
    pub async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        match fs::read(self.blob_path(digest)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::MissingBlob {
                digest: digest.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a blob for streaming.
    pub async fn open_blob(&self, digest: &Digest) -> Result<fs::File> {
        match fs::File::open(self.blob_path(digest)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::MissingBlob {
                digest: digest.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a blob from a byte slice; the digest is computed up front and
    /// the write deduplicates against an existing file.
    pub async fn write_blob_bytes(&self, bytes: &[u8]) -> Result<Blob> {
        let digest = Digest::sha256_of(bytes);
        let written = self
            .write_blob(Some(&digest), bytes.len() as i64, bytes)
            .await?;
        Ok(written.unwrap_or(Blob {
            digest,
            size: bytes.len() as u64,
        }))
    }

    /// Write a blob with declared digest and size.
    ///
    /// The rules realize the sparse-image property:
    ///
    /// - An existing regular file at the blob path whose size matches the
    ///   declared size (`-1` matches anything) makes the write a no-op.
    /// - A known digest writes straight to the final name; an unknown
    ///   digest streams through a temp file that is renamed to the computed
    ///   digest after the reader is exhausted and dropped.
    /// - A zero-byte body deletes the file and reports `None`: the caller
    ///   asked to skip this blob (facade layers do exactly this).
    /// - A body that does not match a non-negative declared size is an
    ///   error.
    #[instrument(level = "debug", skip(self, reader))]
    pub async fn write_blob<R: AsyncRead + Unpin>(
        &self,
        digest: Option<&Digest>,
        declared_size: i64,
        mut reader: R,
    ) -> Result<Option<Blob>> {
        if let Some(digest) = digest {
            if let Ok(meta) = fs::metadata(self.blob_path(digest)).await {
                if meta.is_file() && (declared_size < 0 || meta.len() == declared_size as u64) {
                    debug!(%digest, "blob already present");
                    return Ok(Some(Blob {
                        digest: digest.clone(),
                        size: meta.len(),
                    }));
                }
            }
        }

        let blobs_dir = self.root.join(BLOBS_DIR).join("sha256");
        let target_path = match digest {
            Some(digest) => self.blob_path(digest),
            None => {
                let tmp = tempfile::Builder::new()
                    .prefix(".blob-")
                    .tempfile_in(&blobs_dir)?;
                tmp.into_temp_path().keep().map_err(|e| e.error)?
            }
        };

        let mut counter = Sha256Counter::new();
        let copied = {
            let mut file = fs::File::create(&target_path).await?;
            let mut buf = [0u8; 32 * 1024];
            let mut copied: u64 = 0;
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                counter.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                copied += n as u64;
            }
            file.flush().await?;
            copied
        };
        // The reader commits its digest on close, so drop it before any
        // rename below.
        drop(reader);

        if copied == 0 {
            fs::remove_file(&target_path).await?;
            debug!("zero-byte body, skipping blob");
            return Ok(None);
        }
        if declared_size >= 0 && copied != declared_size as u64 {
            fs::remove_file(&target_path).await.ok();
            let (computed, _) = counter.finalize();
            return Err(Error::BlobSizeMismatch {
                digest: digest.cloned().unwrap_or(computed),
                declared: declared_size,
                written: copied,
            });
        }

        let (computed, _) = counter.finalize();
        let final_digest = match digest {
            Some(digest) => digest.clone(),
            None => {
                let final_path = self.blob_path(&computed);
                fs::rename(&target_path, &final_path).await?;
                computed
            }
        };
        Ok(Some(Blob {
            digest: final_digest,
            size: copied,
        }))
    }

    /// Append a committed image: layer blobs first (in parallel), then the
    /// config and manifest blobs, then the descriptor in `index.json` with
    /// the supplied annotations. Readers never observe a descriptor whose
    /// config or manifest blob is missing.
    pub async fn append_image(
        &self,
        committed: &CommittedImage,
        layers: &[SharedLayer],
        annotations: Option<BTreeMap<String, String>>,
    ) -> Result<OciDescriptor> {
        try_join_all(layers.iter().map(|layer| async move {
            let digest = layer.digest().await?;
            let size = layer.size().await?;
            let reader = layer.compressed_reader().await?;
            self.write_blob(Some(&digest), size, reader).await?;
            Ok::<_, Error>(())
        }))
        .await?;
        self.append_image_without_layers(committed, annotations)
            .await
    }

    /// Append a committed image, omitting every layer blob. Used for
    /// sparse images and `without_layers` saves.
    pub async fn append_image_without_layers(
        &self,
        committed: &CommittedImage,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Result<OciDescriptor> {
        self.write_blob_bytes(&committed.config_raw).await?;
        let manifest_blob = self.write_blob_bytes(&committed.manifest_raw).await?;

        let media_type = committed
            .manifest
            .media_type
            .clone()
            .unwrap_or_else(|| oci_registry::manifest::OCI_MANIFEST_MEDIA_TYPE.to_owned());
        let mut descriptor = manifest_blob.descriptor(media_type);
        descriptor.annotations = annotations.filter(|a| !a.is_empty());

        let mut index = self.read_index().await?;
        let ref_name = descriptor
            .annotations
            .as_ref()
            .and_then(|a| a.get(REF_NAME_ANNOTATION).cloned());
        index.manifests.retain(|existing| {
            if existing.digest == descriptor.digest {
                return false;
            }
            match (&ref_name, existing.annotations.as_ref()) {
                (Some(tag), Some(annotations)) => {
                    annotations.get(REF_NAME_ANNOTATION) != Some(tag)
                }
                _ => true,
            }
        });
        index.manifests.push(descriptor.clone());
        self.write_index(&index).await?;
        Ok(descriptor)
    }

    /// Find the manifest whose index descriptor carries `tag` as its
    /// ref-name annotation.
    pub async fn find_manifest_with_ref_name(
        &self,
        tag: &str,
    ) -> Result<Option<oci_registry::manifest::OciImageManifest>> {
        let index = self.read_index().await?;
        for descriptor in &index.manifests {
            let tagged = descriptor
                .annotations
                .as_ref()
                .and_then(|a| a.get(REF_NAME_ANNOTATION))
                .map_or(false, |value| value == tag);
            if tagged {
                let manifest = serde_json::from_slice(&self.read_blob(&descriptor.digest).await?)?;
                return Ok(Some(manifest));
            }
        }
        Ok(None)
    }

    /// Remove the layout directory tree.
    pub async fn delete(self) -> Result<()> {
        fs::remove_dir_all(&self.root).await?;
        Ok(())
    }

    /// The number of materialized blobs, across algorithms.
    pub async fn blob_count(&self) -> Result<usize> {
        let mut count = 0;
        let mut algos = fs::read_dir(self.root.join(BLOBS_DIR)).await?;
        while let Some(algo) = algos.next_entry().await? {
            if !algo.file_type().await?.is_dir() {
                continue;
            }
            let mut blobs = fs::read_dir(algo.path()).await?;
            while let Some(entry) = blobs.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

async fn atomic_write(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let tmp = tempfile::Builder::new()
        .prefix(&format!(".{}-", name))
        .tempfile_in(dir)?;
    let tmp_path = tmp.into_temp_path();
    fs::write(&tmp_path, bytes).await?;
    let final_path = dir.join(name);
    tmp_path.persist(&final_path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn ensure_creates_the_standard_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = LayoutDir::ensure(dir.path()).await.expect("ensure");
        let marker = fs::read_to_string(dir.path().join(OCI_LAYOUT_FILE))
            .await
            .expect("read marker");
        assert_eq!(OCI_LAYOUT_CONTENT, marker);
        let index = layout.read_index().await.expect("read index");
        assert!(index.manifests.is_empty());
        assert_eq!(0, layout.blob_count().await.expect("count"));
    }

    #[tokio::test]
    async fn open_rejects_non_layout_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = LayoutDir::open(dir.path()).await.expect_err("not a layout");
        assert!(matches!(err, Error::MalformedLayout { .. }));
    }

    #[tokio::test]
    async fn blob_write_is_content_addressed_and_deduplicated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = LayoutDir::ensure(dir.path()).await.expect("ensure");
        let blob = layout.write_blob_bytes(b"hello blob").await.expect("write");
        assert_eq!(Digest::sha256_of(b"hello blob"), blob.digest);
        assert!(layout.has_blob(&blob.digest).await);
        assert_eq!(1, layout.blob_count().await.expect("count"));

        // Writing the same content again is a no-op.
        layout.write_blob_bytes(b"hello blob").await.expect("rewrite");
        assert_eq!(1, layout.blob_count().await.expect("count"));
        assert_eq!(
            b"hello blob".to_vec(),
            layout.read_blob(&blob.digest).await.expect("read")
        );
    }

    #[tokio::test]
    async fn zero_byte_body_skips_the_blob() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = LayoutDir::ensure(dir.path()).await.expect("ensure");
        let digest = Digest::sha256_of(b"never materialized");
        let skipped = layout
            .write_blob(Some(&digest), crate::layer::UNKNOWN_SIZE, tokio::io::empty())
            .await
            .expect("write");
        assert!(skipped.is_none());
        assert!(!layout.has_blob(&digest).await);
        assert_eq!(0, layout.blob_count().await.expect("count"));
    }

    #[tokio::test]
    async fn declared_size_mismatch_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = LayoutDir::ensure(dir.path()).await.expect("ensure");
        let digest = Digest::sha256_of(b"12345");
        let err = layout
            .write_blob(Some(&digest), 99, &b"12345"[..])
            .await
            .expect_err("size mismatch");
        assert!(matches!(err, Error::BlobSizeMismatch { declared: 99, .. }));
        assert!(!layout.has_blob(&digest).await);
    }

    #[tokio::test]
    async fn unknown_digest_streams_through_a_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = LayoutDir::ensure(dir.path()).await.expect("ensure");
        let blob = layout
            .write_blob(None, crate::layer::UNKNOWN_SIZE, &b"streamed"[..])
            .await
            .expect("write")
            .expect("not skipped");
        assert_eq!(Digest::sha256_of(b"streamed"), blob.digest);
        assert!(layout.has_blob(&blob.digest).await);
        // No temp leftovers.
        assert_eq!(1, layout.blob_count().await.expect("count"));
    }

    #[tokio::test]
    async fn missing_blob_read_is_a_typed_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = LayoutDir::ensure(dir.path()).await.expect("ensure");
        let digest = Digest::sha256_of(b"nope");
        let err = layout.read_blob(&digest).await.expect_err("missing");
        assert!(matches!(err, Error::MissingBlob { .. }));
    }
}
