//! Shared fixtures: programmatically built base layouts standing in for a
//! small busybox-like image.

use async_compression::tokio::bufread::GzipEncoder;
use oci_registry::config::{History, ImageConfig, RootFs};
use oci_registry::digest::Digest;
use oci_registry::manifest::{
    MediaTypeFamily, OciDescriptor, OciImageIndex, OciImageManifest, SCHEMA_VERSION,
};
use std::path::Path;
use tokio::io::{AsyncReadExt, BufReader};

pub struct BaseFixture {
    pub manifest_digest: Digest,
    pub config_digest: Digest,
    pub layer_digests: Vec<Digest>,
    pub diff_ids: Vec<Digest>,
}

pub async fn gzip(bytes: &[u8]) -> Vec<u8> {
    let cursor = std::io::Cursor::new(bytes.to_vec());
    let mut encoder = GzipEncoder::new(BufReader::new(cursor));
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).await.expect("gzip");
    out
}

/// Lay down a complete (or sparse) single-image OCI layout at `root`.
///
/// Each element of `layer_contents` becomes one gzipped layer; the config
/// gets one history entry per layer. With `sparse` set, layer blobs are
/// omitted from the blob directory while staying fully described by the
/// manifest. With `extra_config_field` set, the config JSON carries a
/// field outside the documented config schema, which a faithful round trip
/// must not drop.
pub async fn write_base_layout(
    root: &Path,
    layer_contents: &[&[u8]],
    family: MediaTypeFamily,
    sparse: bool,
    extra_config_field: bool,
) -> BaseFixture {
    let layout = ocibuild::LayoutDir::ensure(root).await.expect("ensure layout");

    let mut diff_ids = Vec::new();
    let mut layer_digests = Vec::new();
    let mut layer_descriptors = Vec::new();
    for content in layer_contents {
        let compressed = gzip(content).await;
        let digest = Digest::sha256_of(&compressed);
        if !sparse {
            layout
                .write_blob(Some(&digest), compressed.len() as i64, &compressed[..])
                .await
                .expect("write layer blob");
        }
        diff_ids.push(Digest::sha256_of(content));
        layer_descriptors.push(OciDescriptor::new(
            family.layer_gzip(),
            digest.clone(),
            compressed.len() as i64,
        ));
        layer_digests.push(digest);
    }

    let config = ImageConfig {
        created: Some(ocibuild::normalized_date_time()),
        architecture: "amd64".to_owned(),
        os: "linux".to_owned(),
        rootfs: RootFs {
            fs_type: "layers".to_owned(),
            diff_ids: diff_ids.clone(),
        },
        history: layer_contents
            .iter()
            .map(|_| History {
                created: Some(ocibuild::normalized_date_time()),
                created_by: Some("/bin/sh -c #(nop) ADD file:base in /".to_owned()),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };
    let config_raw = if extra_config_field {
        let mut value: serde_json::Value =
            serde_json::to_value(&config).expect("config to value");
        value["moby.buildkit.buildinfo.v1"] = serde_json::Value::String("eyJmcm9udGVuZCI6IiJ9".to_owned());
        serde_json::to_vec(&value).expect("config json")
    } else {
        serde_json::to_vec(&config).expect("config json")
    };
    let config_blob = layout
        .write_blob_bytes(&config_raw)
        .await
        .expect("write config blob");

    let manifest = OciImageManifest {
        schema_version: SCHEMA_VERSION,
        media_type: Some(family.manifest().to_owned()),
        config: OciDescriptor::new(
            family.config(),
            config_blob.digest.clone(),
            config_raw.len() as i64,
        ),
        layers: layer_descriptors,
        annotations: None,
    };
    let manifest_raw = serde_json::to_vec(&manifest).expect("manifest json");
    let manifest_blob = layout
        .write_blob_bytes(&manifest_raw)
        .await
        .expect("write manifest blob");

    let index = OciImageIndex {
        manifests: vec![OciDescriptor::new(
            family.manifest(),
            manifest_blob.digest.clone(),
            manifest_raw.len() as i64,
        )],
        ..Default::default()
    };
    layout.write_index(&index).await.expect("write index");

    BaseFixture {
        manifest_digest: manifest_blob.digest,
        config_digest: config_blob.digest,
        layer_digests,
        diff_ids,
    }
}

/// A random-ish uncompressed layer tarball on disk, returning its path and
/// diff-ID.
pub async fn write_layer_file(dir: &Path, name: &str, content: &[u8]) -> (std::path::PathBuf, Digest) {
    let path = dir.join(name);
    tokio::fs::write(&path, content).await.expect("write layer file");
    (path, Digest::sha256_of(content))
}
