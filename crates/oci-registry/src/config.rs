//! The image configuration document.
//!
//! This is the JSON blob the manifest's `config` descriptor points at:
//! https://github.com/opencontainers/image-spec/blob/main/config.md
//!
//! Serialization here is canonical: field order is fixed, absent fields are
//! omitted, and maps are sorted. Two serializations of equal values are
//! byte-identical, which the engine relies on for digest stability.

use crate::digest::Digest;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Timestamps in image configs are RFC 3339 with whole seconds and a `Z`
/// suffix; Docker and the OCI tooling both emit this shape.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}

/// The execution parameters recorded in an image config.
///
/// Docker serializes these keys in PascalCase, unlike the rest of the
/// document.
#[derive(Debug, Clone, PartialEq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// The layered filesystem an image config describes: an ordered list of
/// diff-IDs, base first.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub fs_type: String,
    /// sha256 digests of each layer's uncompressed tar.
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_owned(),
            diff_ids: vec![],
        }
    }
}

/// One entry in the image's build history, positionally aligned with the
/// non-empty layers.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
pub struct History {
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// The image configuration document.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ImageConfig {
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub os: String,
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(default)]
    pub config: ContainerConfig,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    /// Docker-specific provenance; scrubbed on save for digest stability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_version: Option<String>,
    /// Docker-specific provenance; scrubbed on save for digest stability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            created: None,
            author: None,
            architecture: String::new(),
            variant: None,
            os: String::new(),
            os_version: None,
            os_features: None,
            config: ContainerConfig::default(),
            rootfs: RootFs::default(),
            history: vec![],
            docker_version: None,
            container: None,
        }
    }
}

impl ImageConfig {
    /// Canonical JSON bytes of this config. Stable across runs for a given
    /// value, so the bytes' digest is usable as an image identifier.
    pub fn canonical_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn sample_config() -> ImageConfig {
        ImageConfig {
            created: Some(Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 1).unwrap()),
            architecture: "amd64".to_owned(),
            os: "linux".to_owned(),
            rootfs: RootFs {
                fs_type: "layers".to_owned(),
                diff_ids: vec![Digest::sha256_of(b"layer-0")],
            },
            history: vec![History {
                created: Some(Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 1).unwrap()),
                created_by: Some("ADD file:abc in /".to_owned()),
                ..Default::default()
            }],
            config: ContainerConfig {
                env: Some(vec!["PATH=/usr/bin".to_owned()]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn timestamps_use_whole_seconds_and_z() {
        let json = String::from_utf8(sample_config().canonical_json().unwrap()).unwrap();
        assert!(json.contains("\"created\":\"1980-01-01T00:00:01Z\""));
    }

    #[test]
    fn serialization_is_stable() {
        let a = sample_config().canonical_json().unwrap();
        let b = sample_config().canonical_json().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn round_trips_extra_free_fields() {
        let json = String::from_utf8(sample_config().canonical_json().unwrap()).unwrap();
        let back: ImageConfig = serde_json::from_str(&json).expect("round trip");
        assert_eq!(sample_config(), back);
    }

    #[test]
    fn parses_docker_provenance_fields() {
        let raw = r#"{
            "architecture": "amd64",
            "os": "linux",
            "docker_version": "24.0.2",
            "container": "52735dff2a33",
            "rootfs": {"type": "layers", "diff_ids": []}
        }"#;
        let config: ImageConfig = serde_json::from_str(raw).expect("parse");
        assert_eq!(Some("24.0.2".to_owned()), config.docker_version);
        assert_eq!(Some("52735dff2a33".to_owned()), config.container);
    }

    #[test]
    fn container_config_uses_pascal_case() {
        let json = String::from_utf8(sample_config().canonical_json().unwrap()).unwrap();
        assert!(json.contains("\"Env\":[\"PATH=/usr/bin\"]"));
    }
}
