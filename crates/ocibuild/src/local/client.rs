//! The daemon operations the save path consumes.
//!
//! [`DockerClient`] is the seam between the engine and a concrete daemon:
//! production code uses [`BollardClient`] over the Docker API socket, tests
//! substitute in-memory fakes. The DTOs here are engine-owned so that fakes
//! do not have to pull in the Docker API models.

use anyhow::Context;
use async_trait::async_trait;
use bollard::image::{ImportImageOptions, RemoveImageOptions, TagImageOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// A readable tar stream handed to or received from the daemon.
pub type TarStream = Box<dyn AsyncRead + Send + Unpin + 'static>;

/// What the engine needs to know about a daemon-resident image.
#[derive(Debug, Clone, Default)]
pub struct ImageInspect {
    /// The image ID, usually `sha256:<confighex>`.
    pub id: Option<String>,
    /// Config OS.
    pub os: String,
    /// Config architecture.
    pub architecture: String,
    /// Config variant.
    pub variant: Option<String>,
    /// Config OS version.
    pub os_version: Option<String>,
    /// Creation timestamp, RFC 3339.
    pub created: Option<String>,
    /// `rootfs.diff_ids`, base first.
    pub rootfs_diff_ids: Vec<String>,
    /// Environment entries.
    pub env: Vec<String>,
    /// Entrypoint.
    pub entrypoint: Vec<String>,
    /// Default command.
    pub cmd: Vec<String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// User.
    pub user: Option<String>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
}

/// One line of `image history` output.
#[derive(Debug, Clone, Default)]
pub struct HistoryLine {
    /// Unix timestamp of the step.
    pub created: i64,
    /// The command that produced the layer.
    pub created_by: String,
    /// Free-form comment.
    pub comment: String,
    /// Whether the step produced filesystem content.
    pub empty_layer: bool,
}

/// Daemon version information.
#[derive(Debug, Clone, Default)]
pub struct DaemonVersion {
    /// Engine version.
    pub version: String,
    /// API version.
    pub api_version: String,
    /// Daemon OS.
    pub os: String,
    /// Daemon architecture.
    pub arch: String,
}

/// Daemon storage information.
#[derive(Debug, Clone, Default)]
pub struct DaemonInfo {
    /// The storage driver name.
    pub driver: Option<String>,
    /// Driver status key/value pairs.
    pub driver_status: Vec<(String, String)>,
}

impl DaemonInfo {
    /// Whether the daemon stores images in containerd's snapshotter. Such
    /// daemons cannot reconstruct elided base layers from an image tar, and
    /// expose a content store the engine can read instead.
    pub fn uses_containerd_snapshotter(&self) -> bool {
        self.driver_status
            .iter()
            .any(|(key, value)| key == "driver-type" && value == "io.containerd.snapshotter.v1")
    }
}

/// The daemon operations the local save path invokes.
#[async_trait]
pub trait DockerClient: Send + Sync {
    /// Inspect an image; `None` when the daemon does not have it.
    async fn inspect_image(&self, name: &str) -> anyhow::Result<Option<ImageInspect>>;

    /// The image's build history, base step first.
    async fn image_history(&self, name: &str) -> anyhow::Result<Vec<HistoryLine>>;

    /// Stream a Docker-format image tar into the daemon.
    async fn image_load(&self, tar: TarStream, quiet: bool) -> anyhow::Result<()>;

    /// Stream a Docker-format image tar out of the daemon.
    async fn image_save(&self, name: &str) -> anyhow::Result<TarStream>;

    /// Apply an additional name to an image.
    async fn image_tag(&self, source: &str, repo: &str, tag: &str) -> anyhow::Result<()>;

    /// Remove an image, untagging and pruning parents.
    async fn remove_image(&self, name: &str, force: bool) -> anyhow::Result<()>;

    /// The daemon's version report.
    async fn server_version(&self) -> anyhow::Result<DaemonVersion>;

    /// The daemon's storage information.
    async fn info(&self) -> anyhow::Result<DaemonInfo>;
}

/// Resolve the daemon socket path: `DOCKER_HOST` (with the `unix://`
/// prefix stripped), then `$HOME/.docker/run/docker.sock`, then
/// `/var/run/docker.sock`.
pub fn daemon_socket() -> PathBuf {
    if let Ok(host) = std::env::var("DOCKER_HOST") {
        if let Some(path) = host.strip_prefix("unix://") {
            return PathBuf::from(path);
        }
    }
    if let Some(home) = dirs::home_dir() {
        let candidate = home.join(".docker").join("run").join("docker.sock");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("/var/run/docker.sock")
}

/// [`DockerClient`] over the Docker Engine API via bollard.
pub struct BollardClient {
    docker: Docker,
}

impl BollardClient {
    /// Connect to the daemon at the resolved socket location.
    pub fn connect() -> anyhow::Result<Self> {
        let socket = daemon_socket();
        let socket = socket
            .to_str()
            .context("daemon socket path is not valid UTF-8")?;
        let docker = Docker::connect_with_socket(
            socket,
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .context("connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Wrap an already-connected bollard handle.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl DockerClient for BollardClient {
    async fn inspect_image(&self, name: &str) -> anyhow::Result<Option<ImageInspect>> {
        let inspect = match self.docker.inspect_image(name).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(e).context("inspect image"),
        };
        let config = inspect.config.unwrap_or_default();
        Ok(Some(ImageInspect {
            id: inspect.id,
            os: inspect.os.unwrap_or_default(),
            architecture: inspect.architecture.unwrap_or_default(),
            variant: inspect.variant,
            os_version: inspect.os_version,
            created: inspect.created,
            rootfs_diff_ids: inspect
                .root_fs
                .and_then(|fs| fs.layers)
                .unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            working_dir: config.working_dir,
            user: config.user,
            labels: config.labels.map(|l| l.into_iter().collect()).unwrap_or_default(),
        }))
    }

    async fn image_history(&self, name: &str) -> anyhow::Result<Vec<HistoryLine>> {
        let mut lines: Vec<HistoryLine> = self
            .docker
            .image_history(name)
            .await
            .context("image history")?
            .into_iter()
            .map(|item| HistoryLine {
                created: item.created,
                created_by: item.created_by,
                comment: item.comment,
                empty_layer: item.size == 0,
            })
            .collect();
        // The daemon reports newest first; the config wants base first.
        lines.reverse();
        Ok(lines)
    }

    async fn image_load(&self, tar: TarStream, quiet: bool) -> anyhow::Result<()> {
        let body = hyper::Body::wrap_stream(ReaderStream::new(tar));
        let mut progress = self
            .docker
            .import_image(ImportImageOptions { quiet }, body, None);
        while let Some(update) = progress.next().await {
            let update = update.context("image load")?;
            debug!(?update, "load progress");
        }
        Ok(())
    }

    async fn image_save(&self, name: &str) -> anyhow::Result<TarStream> {
        let stream = self
            .docker
            .export_image(name)
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        Ok(Box::new(tokio_util::io::StreamReader::new(stream)))
    }

    async fn image_tag(&self, source: &str, repo: &str, tag: &str) -> anyhow::Result<()> {
        self.docker
            .tag_image(
                source,
                Some(TagImageOptions {
                    repo: repo.to_owned(),
                    tag: tag.to_owned(),
                }),
            )
            .await
            .with_context(|| format!("tag {} as {}:{}", source, repo, tag))?;
        Ok(())
    }

    async fn remove_image(&self, name: &str, force: bool) -> anyhow::Result<()> {
        self.docker
            .remove_image(
                name,
                Some(RemoveImageOptions {
                    force,
                    noprune: false,
                }),
                None,
            )
            .await
            .with_context(|| format!("remove image {}", name))?;
        Ok(())
    }

    async fn server_version(&self) -> anyhow::Result<DaemonVersion> {
        let version = self.docker.version().await.context("server version")?;
        Ok(DaemonVersion {
            version: version.version.unwrap_or_default(),
            api_version: version.api_version.unwrap_or_default(),
            os: version.os.unwrap_or_default(),
            arch: version.arch.unwrap_or_default(),
        })
    }

    async fn info(&self) -> anyhow::Result<DaemonInfo> {
        let info = self.docker.info().await.context("daemon info")?;
        let driver_status = info
            .driver_status
            .unwrap_or_default()
            .into_iter()
            .filter_map(|pair| {
                let mut pair = pair.into_iter();
                Some((pair.next()?, pair.next()?))
            })
            .collect();
        Ok(DaemonInfo {
            driver: info.driver,
            driver_status,
        })
    }
}
