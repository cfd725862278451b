//! Binding an [`Image`] to a local Docker daemon.
//!
//! The save path serializes a Docker-format tar into the daemon's
//! image-load endpoint. Against a classic daemon it first tries the cheap
//! tar in which base layers the daemon already holds are elided as
//! `blank_<i>` entries, and falls back to materializing every layer and
//! retrying when the daemon rejects that. A daemon backed by the
//! containerd snapshotter cannot reconstruct elided layers, so the elision
//! step is skipped there; in exchange its content store lets the engine
//! load base metadata without a single decompression.

pub mod client;
pub mod content;
pub mod store;

use crate::errors::{Error, Result, SaveDiagnostic, SaveError};
use crate::image::{options::ImageOptions, Identifier, Image};
use crate::layer::{SharedLayer, UNKNOWN_SIZE};
use chrono::{DateTime, TimeZone, Utc};
use client::{DockerClient, HistoryLine, ImageInspect};
use oci_registry::config::{ContainerConfig, History, ImageConfig, RootFs};
use oci_registry::digest::Digest;
use oci_registry::reference::Reference;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use store::LayerStore;
use tracing::{debug, instrument, warn};

/// An image that saves into a local Docker daemon.
///
/// Derefs to [`Image`], so all config and layer mutators are available
/// directly.
pub struct LocalImage {
    image: Image,
    client: Arc<dyn DockerClient>,
    store: LayerStore,
    base_image_name: Option<String>,
    uses_containerd: bool,
}

impl Deref for LocalImage {
    type Target = Image;

    fn deref(&self) -> &Image {
        &self.image
    }
}

impl DerefMut for LocalImage {
    fn deref_mut(&mut self) -> &mut Image {
        &mut self.image
    }
}

impl LocalImage {
    /// Create an image that saves under `repo_name`.
    ///
    /// A base named by `opts.base_image_repo_name` is read from the daemon
    /// (metadata only); a missing base is ignored. A previous build named
    /// by `opts.previous_image_repo_name` feeds `reuse_layer`.
    #[instrument(level = "debug", skip(client, store, opts))]
    pub async fn new(
        repo_name: &str,
        client: Arc<dyn DockerClient>,
        store: LayerStore,
        mut opts: ImageOptions,
    ) -> Result<Self> {
        Reference::parse(repo_name).map_err(|_| Error::InvalidRepoName(repo_name.to_owned()))?;

        let uses_containerd = client
            .info()
            .await
            .map(|info| info.uses_containerd_snapshotter())
            .unwrap_or(false);

        let mut base_image_name = opts.base_image_repo_name.clone();
        let mut image = match opts.base_image.take() {
            Some(mut base) => {
                base.rename(repo_name);
                base
            }
            None => match &opts.base_image_repo_name {
                Some(base_name) => {
                    match load_base(&*client, &store, base_name, &opts, uses_containerd).await? {
                        Some((config, layers)) => {
                            Image::from_daemon_base(repo_name, config, layers, &opts)
                        }
                        None => {
                            base_image_name = None;
                            Image::empty(repo_name, &opts)
                        }
                    }
                }
                None => Image::empty(repo_name, &opts),
            },
        };

        if let Some(prev_name) = &opts.previous_image_repo_name {
            if let Some(inspect) = client.inspect_image(prev_name).await.map_err(Error::Other)? {
                let mut prev_layers: Vec<SharedLayer> = Vec::new();
                for raw in &inspect.rootfs_diff_ids {
                    prev_layers.push(store.layer_handle(Digest::parse(raw)?));
                }
                image.set_prev_layers(prev_layers);
            }
        }

        Ok(Self {
            image,
            client,
            store,
            base_image_name,
            uses_containerd,
        })
    }

    /// Whether an image with this name exists in the daemon.
    pub async fn found(&self) -> Result<bool> {
        Ok(self
            .client
            .inspect_image(self.image.name())
            .await
            .map_err(Error::Other)?
            .is_some())
    }

    /// The daemon-style identifier: `sha256:` + the config digest.
    pub fn identifier(&self) -> Result<Identifier> {
        let config_raw = self.image.commit_config()?;
        Ok(Identifier::ImageId(Digest::sha256_of(&config_raw)))
    }

    /// Save under the image's name plus any additional names.
    ///
    /// Per-target failures are aggregated into a [`SaveError`]; targets
    /// that were tagged before a failure stay tagged.
    #[instrument(level = "info", skip(self, additional_names), fields(image = self.image.name()))]
    pub async fn save(&mut self, additional_names: &[&str]) -> Result<Identifier> {
        let primary = self.image.name().to_owned();
        let config_raw = self
            .image
            .commit_config()
            .map_err(|cause| SaveError::single(&primary, cause))?;
        let image_id = Digest::sha256_of(&config_raw);

        let loaded = if self.uses_containerd {
            // The daemon cannot reconstruct elided base layers from the
            // tar, so materialize everything up front.
            match self.ensure_layers().await {
                Ok(()) => self.load_tar(&config_raw, &primary, false).await,
                Err(e) => Err(e),
            }
        } else {
            match self.load_tar(&config_raw, &primary, true).await {
                Ok(()) => Ok(()),
                Err(first_error) => {
                    debug!(%first_error, "daemon rejected elided tar, materializing base layers");
                    match self.ensure_layers().await {
                        Ok(()) => self.load_tar(&config_raw, &primary, false).await,
                        Err(e) => Err(e),
                    }
                }
            }
        };
        if let Err(cause) = loaded {
            return Err(SaveError::single(&primary, cause).into());
        }

        let mut diagnostics = Vec::new();
        for name in additional_names {
            let (repo, tag) = split_repo_tag(name);
            if let Err(cause) = self.client.image_tag(&primary, &repo, &tag).await {
                diagnostics.push(SaveDiagnostic {
                    image_name: (*name).to_owned(),
                    cause: Error::Other(cause),
                });
            }
        }
        if !diagnostics.is_empty() {
            return Err(SaveError { diagnostics }.into());
        }
        Ok(Identifier::ImageId(image_id))
    }

    /// Write the full Docker-format tar to a file instead of loading it.
    pub async fn save_file(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let config_raw = self.image.commit_config()?;
        self.ensure_layers().await?;
        let file = tokio::fs::File::create(path.as_ref()).await?;
        store::write_save_tar(
            config_raw,
            self.image.layers().to_vec(),
            vec![self.image.name().to_owned()],
            false,
            self.store.work_dir().to_owned(),
            file,
        )
        .await
    }

    /// Remove the image from the daemon, untagging every name and pruning.
    pub async fn delete(&self) -> Result<()> {
        self.client
            .remove_image(self.image.name(), true)
            .await
            .map_err(Error::Other)
    }

    /// Serialize the image into the daemon while a writer task feeds the
    /// pipe; both sides are joined before tagging happens.
    async fn load_tar(&self, config_raw: &[u8], primary: &str, elide: bool) -> Result<()> {
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let writer_task = tokio::spawn(store::write_save_tar(
            config_raw.to_vec(),
            self.image.layers().to_vec(),
            vec![primary.to_owned()],
            elide,
            self.store.work_dir().to_owned(),
            writer,
        ));
        let load = self.client.image_load(Box::new(reader), true);
        let (tar_result, load_result) = tokio::join!(writer_task, load);

        // A writer failure truncates the stream and fails the load too, so
        // report the writer's error first.
        tar_result
            .map_err(|e| Error::Other(anyhow::anyhow!("tar writer task failed: {}", e)))??;
        load_result.map_err(Error::Other)?;
        Ok(())
    }

    /// Materialize every layer whose compressed bytes are not yet
    /// retrievable by exporting the base image from the daemon.
    async fn ensure_layers(&self) -> Result<()> {
        let mut missing = false;
        for layer in self.image.layers() {
            if layer.size().await? == UNKNOWN_SIZE {
                missing = true;
                break;
            }
        }
        if !missing {
            return Ok(());
        }
        let base = self.base_image_name.as_deref().ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "image has unmaterialized layers and no base image to download them from"
            ))
        })?;
        store::download_layers_for(&*self.client, &self.store, base).await
    }
}

impl std::fmt::Debug for LocalImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalImage")
            .field("image", &self.image)
            .field("base_image_name", &self.base_image_name)
            .field("uses_containerd", &self.uses_containerd)
            .finish()
    }
}

/// Read base metadata out of the daemon: through the content store when
/// the daemon is containerd-backed and a store connection exists, else
/// from inspect + history. Layers come back as store handles that resolve
/// once materialized.
async fn load_base(
    client: &dyn DockerClient,
    store: &LayerStore,
    base_name: &str,
    opts: &ImageOptions,
    uses_containerd: bool,
) -> Result<Option<(ImageConfig, Vec<SharedLayer>)>> {
    let inspect = match client.inspect_image(base_name).await.map_err(Error::Other)? {
        Some(inspect) => inspect,
        // A missing base image is ignored; the image starts empty.
        None => return Ok(None),
    };

    if uses_containerd {
        if let Some(content_store) = store.content_store() {
            match content::resolve_image(content_store, base_name, opts.platform.as_ref()).await {
                Ok(resolved) => {
                    for (_, layer) in &resolved.layers {
                        let shared: SharedLayer = Arc::clone(layer) as SharedLayer;
                        store.register(shared).await;
                    }
                    let layers = resolved
                        .config
                        .rootfs
                        .diff_ids
                        .iter()
                        .map(|diff_id| store.layer_handle(diff_id.clone()))
                        .collect();
                    return Ok(Some((resolved.config, layers)));
                }
                Err(error) => {
                    warn!(%error, "content store resolution failed, using inspect metadata");
                }
            }
        }
    }

    let history = client.image_history(base_name).await.unwrap_or_default();
    let config = config_from_inspect(&inspect, &history)?;
    let layers = config
        .rootfs
        .diff_ids
        .iter()
        .map(|diff_id| store.layer_handle(diff_id.clone()))
        .collect();
    Ok(Some((config, layers)))
}

fn config_from_inspect(inspect: &ImageInspect, history: &[HistoryLine]) -> Result<ImageConfig> {
    let diff_ids = inspect
        .rootfs_diff_ids
        .iter()
        .map(|raw| Digest::parse(raw))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ImageConfig {
        created: inspect
            .created
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc)),
        architecture: inspect.architecture.clone(),
        os: inspect.os.clone(),
        variant: inspect.variant.clone(),
        os_version: inspect.os_version.clone(),
        config: ContainerConfig {
            user: inspect.user.clone(),
            env: non_empty(inspect.env.clone()),
            entrypoint: non_empty(inspect.entrypoint.clone()),
            cmd: non_empty(inspect.cmd.clone()),
            working_dir: inspect.working_dir.clone(),
            labels: (!inspect.labels.is_empty()).then(|| inspect.labels.clone()),
            ..Default::default()
        },
        rootfs: RootFs {
            fs_type: "layers".to_owned(),
            diff_ids,
        },
        history: history
            .iter()
            .map(|line| History {
                created: Some(Utc.timestamp(line.created, 0)),
                created_by: (!line.created_by.is_empty()).then(|| line.created_by.clone()),
                comment: (!line.comment.is_empty()).then(|| line.comment.clone()),
                empty_layer: line.empty_layer.then(|| true),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    })
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values)
}

fn split_repo_tag(name: &str) -> (String, String) {
    match name.rfind(':') {
        Some(colon) if name.rfind('/').map_or(true, |slash| colon > slash) => {
            (name[..colon].to_owned(), name[colon + 1..].to_owned())
        }
        _ => (name.to_owned(), "latest".to_owned()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use client::{DaemonInfo, DaemonVersion, TarStream};
    use std::collections::BTreeMap;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    /// A scripted in-memory daemon.
    struct FakeDaemon {
        images: Mutex<HashMap<String, ImageInspect>>,
        exports: Mutex<HashMap<String, Vec<u8>>>,
        loads: Mutex<Vec<Vec<u8>>>,
        tags: Mutex<Vec<(String, String, String)>>,
        reject_next_loads: Mutex<usize>,
        containerd: bool,
    }

    impl FakeDaemon {
        fn new() -> Self {
            Self {
                images: Mutex::new(HashMap::new()),
                exports: Mutex::new(HashMap::new()),
                loads: Mutex::new(Vec::new()),
                tags: Mutex::new(Vec::new()),
                reject_next_loads: Mutex::new(0),
                containerd: false,
            }
        }

        fn insert_image(&self, name: &str, inspect: ImageInspect) {
            self.images
                .lock()
                .expect("images lock")
                .insert(name.to_owned(), inspect);
        }

        fn insert_export(&self, name: &str, tar: Vec<u8>) {
            self.exports
                .lock()
                .expect("exports lock")
                .insert(name.to_owned(), tar);
        }

        fn reject_loads(&self, n: usize) {
            *self.reject_next_loads.lock().expect("reject lock") = n;
        }

        fn load_count(&self) -> usize {
            self.loads.lock().expect("loads lock").len()
        }

        fn loaded_tar(&self, i: usize) -> Vec<u8> {
            self.loads.lock().expect("loads lock")[i].clone()
        }

        fn tagged(&self) -> Vec<(String, String, String)> {
            self.tags.lock().expect("tags lock").clone()
        }
    }

    #[async_trait]
    impl DockerClient for FakeDaemon {
        async fn inspect_image(&self, name: &str) -> anyhow::Result<Option<ImageInspect>> {
            Ok(self.images.lock().expect("images lock").get(name).cloned())
        }

        async fn image_history(&self, _name: &str) -> anyhow::Result<Vec<HistoryLine>> {
            Ok(vec![])
        }

        async fn image_load(&self, mut tar: TarStream, _quiet: bool) -> anyhow::Result<()> {
            let mut bytes = Vec::new();
            tar.read_to_end(&mut bytes).await?;
            {
                let mut reject = self.reject_next_loads.lock().expect("reject lock");
                if *reject > 0 {
                    *reject -= 1;
                    anyhow::bail!("daemon rejected the tar");
                }
            }
            self.loads.lock().expect("loads lock").push(bytes);
            Ok(())
        }

        async fn image_save(&self, name: &str) -> anyhow::Result<TarStream> {
            let tar = self
                .exports
                .lock()
                .expect("exports lock")
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no export scripted for {}", name))?;
            Ok(Box::new(std::io::Cursor::new(tar)))
        }

        async fn image_tag(&self, source: &str, repo: &str, tag: &str) -> anyhow::Result<()> {
            if repo.contains("reject") {
                anyhow::bail!("tag rejected");
            }
            self.tags.lock().expect("tags lock").push((
                source.to_owned(),
                repo.to_owned(),
                tag.to_owned(),
            ));
            Ok(())
        }

        async fn remove_image(&self, name: &str, _force: bool) -> anyhow::Result<()> {
            self.images.lock().expect("images lock").remove(name);
            Ok(())
        }

        async fn server_version(&self) -> anyhow::Result<DaemonVersion> {
            Ok(DaemonVersion::default())
        }

        async fn info(&self) -> anyhow::Result<DaemonInfo> {
            Ok(if self.containerd {
                DaemonInfo {
                    driver: Some("overlayfs".to_owned()),
                    driver_status: vec![(
                        "driver-type".to_owned(),
                        "io.containerd.snapshotter.v1".to_owned(),
                    )],
                }
            } else {
                DaemonInfo {
                    driver: Some("overlay2".to_owned()),
                    driver_status: vec![],
                }
            })
        }
    }

    fn base_inspect(diff_ids: &[Digest]) -> ImageInspect {
        ImageInspect {
            id: Some("sha256:0000".to_owned()),
            os: "linux".to_owned(),
            architecture: "amd64".to_owned(),
            rootfs_diff_ids: diff_ids.iter().map(|d| d.to_string()).collect(),
            labels: BTreeMap::new(),
            ..Default::default()
        }
    }

    /// A Docker-format export tar for one single-layer image, as
    /// `image_save` would produce it.
    async fn export_tar_for(layer_bytes: &[u8], diff_id: &Digest) -> Vec<u8> {
        let config = ImageConfig {
            os: "linux".to_owned(),
            architecture: "amd64".to_owned(),
            rootfs: RootFs {
                fs_type: "layers".to_owned(),
                diff_ids: vec![diff_id.clone()],
            },
            ..Default::default()
        };
        let config_raw = serde_json::to_vec(&config).expect("config json");
        let config_name = format!("{}.json", Digest::sha256_of(&config_raw).hex());

        let mut tar = std::io::Cursor::new(Vec::new());
        {
            let mut builder = tokio_tar::Builder::new_non_terminated(&mut tar);
            let mut header = tokio_tar::Header::new_gnu();
            header.set_size(config_raw.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, &config_name, &config_raw[..])
                .await
                .expect("append config");

            let layer_name = "base-id/layer.tar";
            let mut header = tokio_tar::Header::new_gnu();
            header.set_size(layer_bytes.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, layer_name, layer_bytes)
                .await
                .expect("append layer");

            let manifest = vec![store::TarManifestEntry {
                config: config_name,
                repo_tags: vec!["base/app:latest".to_owned()],
                layers: vec![layer_name.to_owned()],
            }];
            let manifest_raw = serde_json::to_vec(&manifest).expect("manifest json");
            let mut header = tokio_tar::Header::new_gnu();
            header.set_size(manifest_raw.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, "manifest.json", &manifest_raw[..])
                .await
                .expect("append manifest");
            builder.finish().await.expect("finish tar");
        }
        tar.into_inner()
    }

    #[tokio::test]
    async fn save_elides_base_layers_on_classic_daemons() {
        let layer_bytes = b"base layer tar bytes";
        let diff_id = Digest::sha256_of(layer_bytes);
        let daemon = Arc::new(FakeDaemon::new());
        daemon.insert_image("base/app:latest", base_inspect(&[diff_id.clone()]));

        let store = LayerStore::new().expect("store");
        let opts = ImageOptions::default().with_base_image_repo_name("base/app:latest");
        let mut image = LocalImage::new("built/app:latest", daemon.clone(), store, opts)
            .await
            .expect("new image");

        image.save(&[]).await.expect("save");
        assert_eq!(1, daemon.load_count());
        let tar = daemon.loaded_tar(0);
        let text = String::from_utf8_lossy(&tar);
        assert!(text.contains("blank_0"));
    }

    #[tokio::test]
    async fn rejected_elided_save_downloads_layers_and_retries() {
        let layer_bytes = b"base layer tar bytes";
        let diff_id = Digest::sha256_of(layer_bytes);
        let daemon = Arc::new(FakeDaemon::new());
        daemon.insert_image("base/app:latest", base_inspect(&[diff_id.clone()]));
        daemon.insert_export("base/app:latest", export_tar_for(layer_bytes, &diff_id).await);
        daemon.reject_loads(1);

        let store = LayerStore::new().expect("store");
        let opts = ImageOptions::default().with_base_image_repo_name("base/app:latest");
        let mut image = LocalImage::new("built/app:latest", daemon.clone(), store, opts)
            .await
            .expect("new image");

        image.save(&[]).await.expect("save after fallback");
        assert_eq!(1, daemon.load_count());
        let tar = daemon.loaded_tar(0);
        let text = String::from_utf8_lossy(&tar);
        assert!(!text.contains("blank_0"));
        assert!(text.contains(&format!("{}.tar", diff_id.hex())));
    }

    #[tokio::test]
    async fn failed_tags_are_reported_per_name() {
        let daemon = Arc::new(FakeDaemon::new());
        let store = LayerStore::new().expect("store");
        let mut image = LocalImage::new(
            "built/app:latest",
            daemon.clone(),
            store,
            ImageOptions::default(),
        )
        .await
        .expect("new image");

        let err = image
            .save(&["built/app:extra", "reject/app:nope"])
            .await
            .expect_err("one tag fails");
        match err {
            Error::Save(save) => {
                assert_eq!(1, save.diagnostics.len());
                assert_eq!("reject/app:nope", save.diagnostics[0].image_name);
            }
            other => panic!("unexpected error {:?}", other),
        }
        // The successful tag happened.
        assert_eq!(
            vec![(
                "built/app:latest".to_owned(),
                "built/app".to_owned(),
                "extra".to_owned()
            )],
            daemon.tagged()
        );
    }

    #[tokio::test]
    async fn missing_base_image_is_ignored() {
        let daemon = Arc::new(FakeDaemon::new());
        let store = LayerStore::new().expect("store");
        let opts = ImageOptions::default().with_base_image_repo_name("ghost/app:latest");
        let image = LocalImage::new("built/app:latest", daemon, store, opts)
            .await
            .expect("new image");
        assert!(image.layers().is_empty());
        assert_eq!("linux", image.os());
    }

    #[tokio::test]
    async fn invalid_repo_name_is_rejected() {
        let daemon = Arc::new(FakeDaemon::new());
        let store = LayerStore::new().expect("store");
        let err = LocalImage::new("UPPER/Case:oops", daemon, store, ImageOptions::default())
            .await
            .expect_err("bad name");
        assert!(matches!(err, Error::InvalidRepoName(_)));
    }

    #[tokio::test]
    async fn reuse_layer_from_previous_daemon_image() {
        let layer_bytes = b"previous layer bytes";
        let diff_id = Digest::sha256_of(layer_bytes);
        let daemon = Arc::new(FakeDaemon::new());
        daemon.insert_image("prev/app:latest", base_inspect(&[diff_id.clone()]));
        daemon.insert_export("prev/app:latest", export_tar_for(layer_bytes, &diff_id).await);

        let store = LayerStore::new().expect("store");
        let opts = ImageOptions::default().with_previous_image_repo_name("prev/app:latest");
        let mut image = LocalImage::new("built/app:latest", daemon.clone(), store, opts)
            .await
            .expect("new image");

        image.reuse_layer(&diff_id).expect("reuse");
        assert_eq!(1, image.layers().len());
        assert_eq!(&diff_id, image.layers()[0].diff_id());

        // The reused layer is unmaterialized; on a classic daemon the save
        // elides it, so no download happens.
        image.save(&[]).await.expect("save");
        let text = String::from_utf8_lossy(&daemon.loaded_tar(0)).into_owned();
        assert!(text.contains("blank_0"));
    }

    #[rstest::rstest(
        name,
        repo,
        tag,
        case("repo/app:v1", "repo/app", "v1"),
        case("repo/app", "repo/app", "latest"),
        case("localhost:5000/app", "localhost:5000/app", "latest"),
        case("localhost:5000/app:v2", "localhost:5000/app", "v2")
    )]
    fn split_repo_tag_handles_ports_and_bare_names(name: &str, repo: &str, tag: &str) {
        assert_eq!((repo.to_owned(), tag.to_owned()), split_repo_tag(name));
    }
}
