//! OCI manifests, indexes and descriptors.
//!
//! These are the wire documents defined by the OCI image specification:
//! https://github.com/opencontainers/image-spec/blob/main/manifest.md
//!
//! Docker's schema-2 documents are structurally identical and differ only in
//! their media types, so both families share the types here; the
//! [`MediaTypeFamily`] helper translates between the two.

use crate::digest::Digest;
use std::collections::BTreeMap;

/// The mediatype for an OCI image manifest.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// The mediatype for an OCI image index.
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// The mediatype for an OCI image config.
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
/// The mediatype for an OCI layer that is gzipped.
pub const OCI_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// The mediatype for an OCI layer with no compression.
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
/// The mediatype Docker uses for a schema-2 image manifest.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// The mediatype Docker uses for a manifest list.
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// The mediatype Docker uses for an image config.
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
/// The mediatype Docker uses for a layer that is gzipped.
pub const DOCKER_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// The mediatype Docker uses for a layer with no compression.
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// The annotation key recording an image's human-readable tag on the
/// descriptor of that image inside an index.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Manifest schema version. The only value the specification allows is `2`.
pub const SCHEMA_VERSION: u8 = 2;

/// The two media-type families an image can declare.
///
/// A consistent image uses one family for its manifest, its config
/// descriptor and every layer descriptor; mixing families is an error that
/// the image core repairs by coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTypeFamily {
    /// `application/vnd.oci.*` media types.
    Oci,
    /// `application/vnd.docker.*` media types.
    Docker,
}

impl MediaTypeFamily {
    /// The manifest media type of this family.
    pub fn manifest(&self) -> &'static str {
        match self {
            MediaTypeFamily::Oci => OCI_MANIFEST_MEDIA_TYPE,
            MediaTypeFamily::Docker => DOCKER_MANIFEST_MEDIA_TYPE,
        }
    }

    /// The index / manifest-list media type of this family.
    pub fn index(&self) -> &'static str {
        match self {
            MediaTypeFamily::Oci => OCI_IMAGE_INDEX_MEDIA_TYPE,
            MediaTypeFamily::Docker => DOCKER_MANIFEST_LIST_MEDIA_TYPE,
        }
    }

    /// The config media type of this family.
    pub fn config(&self) -> &'static str {
        match self {
            MediaTypeFamily::Oci => OCI_CONFIG_MEDIA_TYPE,
            MediaTypeFamily::Docker => DOCKER_CONFIG_MEDIA_TYPE,
        }
    }

    /// The gzipped layer media type of this family.
    pub fn layer_gzip(&self) -> &'static str {
        match self {
            MediaTypeFamily::Oci => OCI_LAYER_GZIP_MEDIA_TYPE,
            MediaTypeFamily::Docker => DOCKER_LAYER_GZIP_MEDIA_TYPE,
        }
    }

    /// The uncompressed layer media type of this family.
    pub fn layer(&self) -> &'static str {
        match self {
            MediaTypeFamily::Oci => OCI_LAYER_MEDIA_TYPE,
            MediaTypeFamily::Docker => DOCKER_LAYER_MEDIA_TYPE,
        }
    }

    /// Determine the family a media type belongs to, if any.
    pub fn of(media_type: &str) -> Option<MediaTypeFamily> {
        if media_type.starts_with("application/vnd.oci.") {
            Some(MediaTypeFamily::Oci)
        } else if media_type.starts_with("application/vnd.docker.") {
            Some(MediaTypeFamily::Docker)
        } else {
            None
        }
    }

    /// Translate a layer media type into this family, preserving whether the
    /// layer is compressed. Unknown media types pass through unchanged.
    pub fn coerce_layer(&self, media_type: &str) -> String {
        match media_type {
            OCI_LAYER_GZIP_MEDIA_TYPE | DOCKER_LAYER_GZIP_MEDIA_TYPE => {
                self.layer_gzip().to_owned()
            }
            OCI_LAYER_MEDIA_TYPE | DOCKER_LAYER_MEDIA_TYPE => self.layer().to_owned(),
            other => other.to_owned(),
        }
    }
}

/// Whether a media type denotes a single-image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == OCI_MANIFEST_MEDIA_TYPE || media_type == DOCKER_MANIFEST_MEDIA_TYPE
}

/// Whether a media type denotes an index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == OCI_IMAGE_INDEX_MEDIA_TYPE || media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
}

/// Whether a layer media type denotes gzip-compressed content.
pub fn is_gzip_layer_media_type(media_type: &str) -> bool {
    media_type.ends_with("+gzip") || media_type.ends_with(".gzip")
}

/// A platform an image targets, as recorded on index descriptors and in
/// image configs.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,
    /// Architecture variant, e.g. `v7` for arm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// OS version; meaningful mostly on windows.
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Required OS features.
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
}

impl Platform {
    /// The platform of the running process, in OCI vocabulary.
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self {
            os: os.to_owned(),
            architecture: architecture.to_owned(),
            ..Default::default()
        }
    }

    /// Registries record attestation manifests under an `unknown/unknown`
    /// platform; those are not real images.
    pub fn is_unknown(&self) -> bool {
        self.os == "unknown" && self.architecture == "unknown"
    }

    /// Whether this platform satisfies `filter`. Empty filter fields match
    /// anything.
    pub fn satisfies(&self, filter: &Platform) -> bool {
        let field_matches = |have: &str, want: &str| want.is_empty() || have == want;
        field_matches(&self.os, &filter.os)
            && field_matches(&self.architecture, &filter.architecture)
            && match &filter.variant {
                None => true,
                Some(v) => self.variant.as_deref() == Some(v.as_str()),
            }
            && match &filter.os_version {
                None => true,
                Some(v) => self.os_version.as_deref() == Some(v.as_str()),
            }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// A descriptor points at another object (layer, config, manifest or index)
/// by digest.
///
/// Defined in the OCI image specification:
/// https://github.com/opencontainers/image-spec/blob/main/descriptor.md
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    /// The media type of the referenced content.
    pub media_type: String,
    /// The digest of the referenced content.
    pub digest: Digest,
    /// The size in bytes of the referenced content. `-1` is used internally
    /// as a sentinel for "compressed content not locally available".
    pub size: i64,
    /// Optional list of URLs the content may be downloaded from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    /// Arbitrary descriptor annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    /// The platform of the referenced manifest; only meaningful on index
    /// descriptors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl OciDescriptor {
    /// A descriptor with the given media type, digest and size and nothing
    /// else set.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            platform: None,
        }
    }
}

/// A single-image manifest: one config descriptor plus an ordered list of
/// layer descriptors.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciImageManifest {
    /// Always `2`.
    pub schema_version: u8,
    /// The manifest media type. Reserved for compatibility in the spec, but
    /// both registries and this library always set it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// The image configuration descriptor.
    pub config: OciDescriptor,
    /// The image layers, base first.
    pub layers: Vec<OciDescriptor>,
    /// Manifest-level annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Default for OciImageManifest {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_owned()),
            config: OciDescriptor::new(OCI_CONFIG_MEDIA_TYPE, Digest::sha256_of(b"{}"), 2),
            layers: vec![],
            annotations: None,
        }
    }
}

/// An image index (Docker: manifest list): an ordered list of manifest
/// descriptors, usually one per platform.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciImageIndex {
    /// Always `2`.
    pub schema_version: u8,
    /// The index media type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// The child manifests.
    pub manifests: Vec<OciDescriptor>,
    /// Index-level annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Default for OciImageIndex {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: Some(OCI_IMAGE_INDEX_MEDIA_TYPE.to_owned()),
            manifests: vec![],
            annotations: None,
        }
    }
}

/// Probe struct for sniffing the schema version and media type of an
/// unknown payload before committing to a full deserialization.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned {
    /// The manifest schema the payload follows.
    pub schema_version: i32,
    /// The payload's media type, when present.
    #[serde(default)]
    pub media_type: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    const TEST_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "size": 585,
            "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        },
        "layers": [
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "size": 2107098,
                "digest": "sha256:f9c91f4c280ab92aff9eb03b279c4774a80b84428741ab20855d32004b2b983f",
                "annotations": {
                    "org.opencontainers.image.title": "base"
                }
            }
        ]
    }
    "#;

    const TEST_INDEX: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": 459,
                "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
                "platform": { "os": "linux", "architecture": "amd64" }
            },
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": 459,
                "digest": "sha256:f9c91f4c280ab92aff9eb03b279c4774a80b84428741ab20855d32004b2b983f",
                "platform": { "os": "unknown", "architecture": "unknown" }
            }
        ]
    }
    "#;

    #[test]
    fn parses_manifest() {
        let manifest: OciImageManifest = serde_json::from_str(TEST_MANIFEST).expect("parse");
        assert_eq!(2, manifest.schema_version);
        assert_eq!(
            Some(OCI_MANIFEST_MEDIA_TYPE.to_owned()),
            manifest.media_type
        );
        assert_eq!(1, manifest.layers.len());
        assert_eq!(OCI_LAYER_GZIP_MEDIA_TYPE, manifest.layers[0].media_type);
        assert_eq!(2_107_098, manifest.layers[0].size);
    }

    #[test]
    fn parses_index_and_flags_attestations() {
        let index: OciImageIndex = serde_json::from_str(TEST_INDEX).expect("parse");
        assert_eq!(2, index.manifests.len());
        let platforms: Vec<bool> = index
            .manifests
            .iter()
            .map(|m| m.platform.as_ref().expect("platform").is_unknown())
            .collect();
        assert_eq!(vec![false, true], platforms);
    }

    #[test]
    fn family_detection_and_coercion() {
        assert_eq!(
            Some(MediaTypeFamily::Docker),
            MediaTypeFamily::of(DOCKER_MANIFEST_MEDIA_TYPE)
        );
        assert_eq!(
            Some(MediaTypeFamily::Oci),
            MediaTypeFamily::of(OCI_LAYER_GZIP_MEDIA_TYPE)
        );
        assert_eq!(None, MediaTypeFamily::of("application/json"));
        assert_eq!(
            OCI_LAYER_GZIP_MEDIA_TYPE,
            MediaTypeFamily::Oci.coerce_layer(DOCKER_LAYER_GZIP_MEDIA_TYPE)
        );
        assert_eq!(
            DOCKER_LAYER_MEDIA_TYPE,
            MediaTypeFamily::Docker.coerce_layer(OCI_LAYER_MEDIA_TYPE)
        );
    }

    #[test]
    fn platform_satisfies_empty_filter() {
        let p = Platform {
            os: "linux".into(),
            architecture: "arm64".into(),
            variant: Some("v8".into()),
            ..Default::default()
        };
        assert!(p.satisfies(&Platform::default()));
        assert!(p.satisfies(&Platform {
            os: "linux".into(),
            architecture: "arm64".into(),
            ..Default::default()
        }));
        assert!(!p.satisfies(&Platform {
            os: "linux".into(),
            architecture: "amd64".into(),
            ..Default::default()
        }));
        assert!(!p.satisfies(&Platform {
            os: String::new(),
            architecture: String::new(),
            variant: Some("v7".into()),
            ..Default::default()
        }));
    }

    #[test]
    fn annotations_serialize_sorted() {
        let mut annotations = BTreeMap::new();
        annotations.insert("zz".to_owned(), "1".to_owned());
        annotations.insert("aa".to_owned(), "2".to_owned());
        let desc = OciDescriptor {
            annotations: Some(annotations),
            ..OciDescriptor::new(
                OCI_MANIFEST_MEDIA_TYPE,
                Digest::sha256_of(b"x"),
                1,
            )
        };
        let json = serde_json::to_string(&desc).expect("serialize");
        assert!(json.find("\"aa\"").unwrap() < json.find("\"zz\"").unwrap());
    }
}
