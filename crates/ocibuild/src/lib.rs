//! A container-image construction and persistence engine.
//!
//! `ocibuild` assembles OCI/Docker images from a mixture of sources — a
//! base image in an on-disk OCI layout or a local daemon, a previous build
//! whose layers can be reused, and freshly produced layer tarballs — and
//! writes the result back as an OCI layout directory, a loaded image in a
//! Docker daemon, or a pushable remote image. Its value is the correctness
//! of the artifact: digests, diff-IDs, media types, manifest/config
//! relationships, history, reference annotations, and the layer-reuse
//! optimization ("sparse" images whose blob directory omits layers whose
//! compressed content is not needed).
//!
//! # Building and saving an image
//!
//! ```no_run
//! use ocibuild::image::options::ImageOptions;
//! use ocibuild::layout::image::LayoutImage;
//!
//! # async fn example() -> ocibuild::errors::Result<()> {
//! let opts = ImageOptions::default()
//!     .from_base_image_path("testdata/busybox")
//!     .with_previous_image_path("testdata/previous-build");
//! let mut image = LayoutImage::new("/tmp/built-image", opts).await?;
//! image.set_env("PATH", "/usr/local/bin");
//! image.add_layer("/tmp/new-layer.tar").await?;
//! image.save(&["latest"]).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The same [`image::Image`] core backs every target; `layout`, `local`
//! and the index module only differ in how they materialize it.

pub mod errors;
pub mod image;
pub mod index;
pub mod layer;
pub mod layout;
pub mod local;
pub mod sparse;

pub use errors::{Error, Result, SaveDiagnostic, SaveError};
pub use image::options::ImageOptions;
pub use image::{normalized_date_time, Identifier, Image};
pub use index::{AddOptions, ImageIndex};
pub use layer::{Layer, SharedLayer, UNKNOWN_SIZE};
pub use layout::image::LayoutImage;
pub use layout::LayoutDir;
pub use local::client::{BollardClient, DockerClient};
pub use local::store::LayerStore;
pub use local::LocalImage;
pub use sparse::SparseImage;
