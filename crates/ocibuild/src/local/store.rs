//! The daemon-side layer store and the Docker-format image tar.
//!
//! The store owns the only structure shared across images: a map from
//! diff-ID to a layer whose compressed bytes are retrievable. It is
//! effectively append-only; base layers start as unmaterialized
//! [`StoreLayer`]s that report [`UNKNOWN_SIZE`](crate::layer::UNKNOWN_SIZE)
//! until a download or a content-store resolution fills the map, at which
//! point the same layer object transparently becomes readable.

use crate::errors::{Error, Result};
use crate::layer::{FileLayer, Layer, LayerReader, SharedLayer, UNKNOWN_SIZE};
use crate::local::client::DockerClient;
use crate::local::content::ContentStore;
use async_trait::async_trait;
use oci_registry::config::ImageConfig;
use oci_registry::digest::Digest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// One element of the tar's `manifest.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct TarManifestEntry {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

struct StoreInner {
    layers_by_diff_id: RwLock<HashMap<Digest, SharedLayer>>,
    content_store: Option<Arc<dyn ContentStore>>,
    work_dir: TempDir,
}

/// The shared layer store.
///
/// Cloning is cheap and clones share the same map; the content-store
/// connection (when present) lives and dies with the last clone.
#[derive(Clone)]
pub struct LayerStore {
    inner: Arc<StoreInner>,
}

impl LayerStore {
    /// Create a store backed by a private scratch directory.
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(StoreInner {
                layers_by_diff_id: RwLock::new(HashMap::new()),
                content_store: None,
                work_dir: TempDir::new()?,
            }),
        })
    }

    /// Create a store that can additionally read blobs out of a containerd
    /// content store.
    pub fn with_content_store(content_store: Arc<dyn ContentStore>) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(StoreInner {
                layers_by_diff_id: RwLock::new(HashMap::new()),
                content_store: Some(content_store),
                work_dir: TempDir::new()?,
            }),
        })
    }

    /// The content store, when this store has one.
    pub fn content_store(&self) -> Option<&Arc<dyn ContentStore>> {
        self.inner.content_store.as_ref()
    }

    pub(crate) fn work_dir(&self) -> &Path {
        self.inner.work_dir.path()
    }

    /// Look up a materialized layer.
    pub async fn get(&self, diff_id: &Digest) -> Option<SharedLayer> {
        self.inner
            .layers_by_diff_id
            .read()
            .await
            .get(diff_id)
            .cloned()
    }

    /// Record a layer whose compressed bytes are retrievable.
    pub async fn register(&self, layer: SharedLayer) {
        self.inner
            .layers_by_diff_id
            .write()
            .await
            .insert(layer.diff_id().clone(), layer);
    }

    /// A handle on the (possibly not yet materialized) layer with this
    /// diff-ID.
    pub fn layer_handle(&self, diff_id: Digest) -> SharedLayer {
        Arc::new(StoreLayer {
            diff_id,
            store: self.clone(),
        })
    }
}

/// A base layer owned by the daemon, resolved through the store on demand.
///
/// Until the store holds the diff-ID, the layer reports an unknown size,
/// which is exactly the signal the save tar uses to elide it.
pub struct StoreLayer {
    diff_id: Digest,
    store: LayerStore,
}

#[async_trait]
impl Layer for StoreLayer {
    fn diff_id(&self) -> &Digest {
        &self.diff_id
    }

    async fn digest(&self) -> Result<Digest> {
        match self.store.get(&self.diff_id).await {
            Some(layer) => layer.digest().await,
            None => Err(Error::LayerNotFound {
                repo_name: String::new(),
                diff_id: self.diff_id.clone(),
            }),
        }
    }

    async fn size(&self) -> Result<i64> {
        match self.store.get(&self.diff_id).await {
            Some(layer) => layer.size().await,
            None => Ok(UNKNOWN_SIZE),
        }
    }

    async fn compressed_reader(&self) -> Result<LayerReader> {
        match self.store.get(&self.diff_id).await {
            Some(layer) => layer.compressed_reader().await,
            None => Err(Error::LayerNotFound {
                repo_name: String::new(),
                diff_id: self.diff_id.clone(),
            }),
        }
    }

    async fn uncompressed_reader(&self) -> Result<LayerReader> {
        match self.store.get(&self.diff_id).await {
            Some(layer) => layer.uncompressed_reader().await,
            None => Err(Error::LayerNotFound {
                repo_name: String::new(),
                diff_id: self.diff_id.clone(),
            }),
        }
    }

    fn media_type(&self) -> &str {
        oci_registry::manifest::OCI_LAYER_GZIP_MEDIA_TYPE
    }
}

/// Serialize an image into a Docker-format tar: the raw config as
/// `<configHex>.json`, one entry per layer, and a one-element
/// `manifest.json` last.
///
/// With `elide_unknown` set, layers whose size is unknown (base layers the
/// daemon already holds) become empty `blank_<i>` entries; otherwise an
/// unknown-size layer is an error, since a full tar cannot be built without
/// its bytes. A layer's uncompressed size is not known up front, so its
/// stream is spooled through a temp file to count bytes before the tar
/// header is written.
#[instrument(level = "debug", skip_all, fields(layers = layers.len(), elide_unknown))]
pub(crate) async fn write_save_tar<W>(
    config_raw: Vec<u8>,
    layers: Vec<SharedLayer>,
    repo_tags: Vec<String>,
    elide_unknown: bool,
    spool_dir: std::path::PathBuf,
    out: W,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut builder = tokio_tar::Builder::new_non_terminated(out);

    let config_name = format!("{}.json", Digest::sha256_of(&config_raw).hex());
    append_bytes(&mut builder, &config_name, &config_raw).await?;

    let mut layer_names = Vec::with_capacity(layers.len());
    for (i, layer) in layers.iter().enumerate() {
        if layer.size().await? == UNKNOWN_SIZE {
            if !elide_unknown {
                return Err(Error::LayerNotFound {
                    repo_name: String::new(),
                    diff_id: layer.diff_id().clone(),
                });
            }
            let name = format!("blank_{}", i);
            append_bytes(&mut builder, &name, b"").await?;
            layer_names.push(name);
            continue;
        }
        let name = format!("{}.tar", layer.diff_id().hex());
        let reader = layer.uncompressed_reader().await?;
        append_stream(&mut builder, &name, reader, &spool_dir).await?;
        layer_names.push(name);
    }

    let manifest = vec![TarManifestEntry {
        config: config_name,
        repo_tags,
        layers: layer_names,
    }];
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    append_bytes(&mut builder, "manifest.json", &manifest_bytes).await?;

    let mut out = builder.into_inner().await?;
    out.flush().await?;
    Ok(())
}

async fn append_bytes<W>(
    builder: &mut tokio_tar::Builder<W>,
    name: &str,
    bytes: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut header = tokio_tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, name, bytes).await?;
    Ok(())
}

/// Append a stream of unknown length: spool to a temp file while counting,
/// then write the header with the counted size and stream from the file.
async fn append_stream<W>(
    builder: &mut tokio_tar::Builder<W>,
    name: &str,
    mut reader: LayerReader,
    spool_dir: &Path,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let spool_path = tempfile::Builder::new()
        .prefix(".spool-")
        .tempfile_in(spool_dir)?
        .into_temp_path();
    let mut size: u64 = 0;
    {
        let mut spool = tokio::fs::File::create(&spool_path).await?;
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            spool.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        spool.flush().await?;
    }

    let mut header = tokio_tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    let spool = tokio::fs::File::open(&spool_path).await?;
    builder.append_data(&mut header, name, spool).await?;
    Ok(())
}

/// Materialize every layer of a daemon-resident image into the store by
/// exporting it as a tar and untarring.
///
/// This is the fallback the save path leans on when a daemon rejects a tar
/// with elided base layers, and the download path when the content store is
/// not available.
#[instrument(level = "info", skip(client, store))]
pub(crate) async fn download_layers_for(
    client: &dyn DockerClient,
    store: &LayerStore,
    image_name: &str,
) -> Result<()> {
    let tar = client
        .image_save(image_name)
        .await
        .map_err(Error::Other)?;

    let unpack_dir = tempfile::Builder::new()
        .prefix("image-export-")
        .tempdir_in(store.work_dir())?;
    let mut archive = tokio_tar::Archive::new(tar);
    archive.unpack(unpack_dir.path()).await?;

    let manifest_bytes = tokio::fs::read(unpack_dir.path().join("manifest.json")).await?;
    let manifest: Vec<TarManifestEntry> = serde_json::from_slice(&manifest_bytes)?;
    let entry = manifest.into_iter().next().ok_or_else(|| {
        Error::MalformedLayout {
            path: unpack_dir.path().to_owned(),
            reason: "exported tar holds no manifest entries".to_owned(),
        }
    })?;

    let config_bytes = tokio::fs::read(unpack_dir.path().join(&entry.config)).await?;
    let config: ImageConfig = serde_json::from_slice(&config_bytes)?;
    if config.rootfs.diff_ids.len() != entry.layers.len() {
        return Err(Error::LayerCountMismatch {
            layers: entry.layers.len(),
            diff_ids: config.rootfs.diff_ids.len(),
            descriptors: entry.layers.len(),
        });
    }

    // Move the layer files into the store's own directory so they outlive
    // the unpack dir.
    for (diff_id, layer_path) in config.rootfs.diff_ids.iter().zip(&entry.layers) {
        let source = unpack_dir.path().join(layer_path);
        let target = store.work_dir().join(format!("{}.tar", diff_id.hex()));
        tokio::fs::rename(&source, &target).await?;
        store
            .register(Arc::new(FileLayer::new(&target, diff_id.clone())))
            .await;
        debug!(%diff_id, "layer materialized");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::{options::ImageOptions, Image};
    use crate::layer::FacadeLayer;
    use oci_registry::manifest::OCI_LAYER_GZIP_MEDIA_TYPE;
    use tokio::io::AsyncRead;

    async fn read_tar_entries<R: AsyncRead + Unpin + Send + 'static>(
        reader: R,
    ) -> Vec<(String, Vec<u8>)> {
        use futures::StreamExt;
        let mut archive = tokio_tar::Archive::new(reader);
        let mut out = Vec::new();
        let mut entries = archive.entries().expect("entries");
        while let Some(entry) = entries.next().await {
            let mut entry = entry.expect("entry");
            let name = entry
                .path()
                .expect("path")
                .to_string_lossy()
                .into_owned();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).await.expect("read entry");
            out.push((name, bytes));
        }
        out
    }

    fn config_for_layers(layers: &[SharedLayer]) -> Vec<u8> {
        let mut image = Image::empty("some/repo:latest", &ImageOptions::default());
        for layer in layers {
            image.add_shared_layer(Arc::clone(layer));
        }
        image.commit_config().expect("commit config")
    }

    #[tokio::test]
    async fn save_tar_has_config_layers_and_manifest_in_order() {
        let store = LayerStore::new().expect("store");
        let layer_path = store.work_dir().join("l1.tar");
        tokio::fs::write(&layer_path, b"layer-one-bytes")
            .await
            .expect("write layer");
        let layer: SharedLayer = Arc::new(
            FileLayer::from_path(&layer_path).await.expect("file layer"),
        );
        let config_raw = config_for_layers(std::slice::from_ref(&layer));
        let config_digest = Digest::sha256_of(&config_raw);

        let mut tar = std::io::Cursor::new(Vec::new());
        write_save_tar(
            config_raw.clone(),
            vec![layer.clone()],
            vec!["some/repo:latest".to_owned()],
            false,
            store.work_dir().to_owned(),
            &mut tar,
        )
        .await
        .expect("write tar");

        let entries = read_tar_entries(std::io::Cursor::new(tar.into_inner())).await;
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            vec![
                format!("{}.json", config_digest.hex()),
                format!("{}.tar", layer.diff_id().hex()),
                "manifest.json".to_owned(),
            ],
            names
        );

        // The config entry is the raw config bytes.
        assert_eq!(config_raw, entries[0].1);
        // The layer entry is the uncompressed tar.
        assert_eq!(b"layer-one-bytes".to_vec(), entries[1].1);

        let manifest: Vec<TarManifestEntry> =
            serde_json::from_slice(&entries[2].1).expect("manifest entry");
        assert_eq!(1, manifest.len());
        assert_eq!(vec!["some/repo:latest".to_owned()], manifest[0].repo_tags);
        assert_eq!(
            vec![format!("{}.tar", layer.diff_id().hex())],
            manifest[0].layers
        );
    }

    #[tokio::test]
    async fn unknown_size_layers_become_blank_entries_when_elided() {
        let store = LayerStore::new().expect("store");
        let base = store.layer_handle(Digest::sha256_of(b"base-layer"));
        let config_raw = config_for_layers(std::slice::from_ref(&base));

        let mut tar = std::io::Cursor::new(Vec::new());
        write_save_tar(
            config_raw,
            vec![base],
            vec!["some/repo:latest".to_owned()],
            true,
            store.work_dir().to_owned(),
            &mut tar,
        )
        .await
        .expect("write tar");

        let entries = read_tar_entries(std::io::Cursor::new(tar.into_inner())).await;
        let blank = entries
            .iter()
            .find(|(name, _)| name == "blank_0")
            .expect("blank entry");
        assert!(blank.1.is_empty());
    }

    #[tokio::test]
    async fn unknown_size_layers_error_without_elision() {
        let store = LayerStore::new().expect("store");
        let base = store.layer_handle(Digest::sha256_of(b"base-layer"));
        let config_raw = config_for_layers(std::slice::from_ref(&base));

        let err = write_save_tar(
            config_raw,
            vec![base],
            vec!["some/repo:latest".to_owned()],
            false,
            store.work_dir().to_owned(),
            &mut std::io::Cursor::new(Vec::new()),
        )
        .await
        .expect_err("cannot build full tar");
        assert!(matches!(err, Error::LayerNotFound { .. }));
    }

    #[tokio::test]
    async fn store_layer_materializes_when_the_map_fills() {
        let store = LayerStore::new().expect("store");
        let diff_id = Digest::sha256_of(b"later");
        let handle = store.layer_handle(diff_id.clone());
        assert_eq!(UNKNOWN_SIZE, handle.size().await.expect("size"));

        let backing = Arc::new(FacadeLayer::new(
            diff_id.clone(),
            Digest::sha256_of(b"compressed"),
            99,
            OCI_LAYER_GZIP_MEDIA_TYPE,
        ));
        store.register(backing).await;
        assert_eq!(99, handle.size().await.expect("size"));
        assert_eq!(
            Digest::sha256_of(b"compressed"),
            handle.digest().await.expect("digest")
        );
    }
}
