//! Image references.
//!
//! A reference names an image in a registry:
//! `<registry>/<repository>[:<tag>][@<digest>]`. Bare names follow the
//! Docker conventions: the default registry is `index.docker.io`,
//! single-component repositories live under `library/`, and the implicit
//! tag is `latest`.

use crate::digest::Digest;
use lazy_static::lazy_static;
use regex::Regex;
use std::convert::TryFrom;
use std::path::PathBuf;

/// The registry applied to references that do not name one.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";
/// The namespace applied to single-component repositories on the default
/// registry.
pub const DEFAULT_NAMESPACE: &str = "library";
/// The tag applied to references carrying neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

lazy_static! {
    static ref REPOSITORY_RE: Regex = Regex::new(
        r"^[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*)*$"
    )
    .expect("repository regex");
    static ref TAG_RE: Regex = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("tag regex");
}

/// Errors produced while parsing a reference.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("invalid image reference {0:?}")]
    Invalid(String),
    #[error("invalid repository name {0:?}")]
    InvalidRepository(String),
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
    #[error("invalid digest in reference: {0}")]
    InvalidDigest(#[from] crate::digest::DigestError),
}

/// A fully resolved image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    /// Parse a reference string, applying the Docker defaulting rules.
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        if s.is_empty() {
            return Err(ReferenceError::Invalid(s.to_owned()));
        }

        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => (rest, Some(Digest::parse(digest)?)),
            None => (s, None),
        };

        // A colon after the last slash separates the tag; a colon before it
        // is a registry port.
        let last_slash = rest.rfind('/');
        let (name, tag) = match rest.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                (&rest[..colon], Some(rest[colon + 1..].to_owned()))
            }
            _ => (rest, None),
        };
        if let Some(tag) = &tag {
            if !TAG_RE.is_match(tag) {
                return Err(ReferenceError::InvalidTag(tag.clone()));
            }
        }

        // The first path component is a registry only when it can be one:
        // it contains a dot or a port, or is the literal `localhost`.
        let (registry, mut repository) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_owned(), remainder.to_owned())
            }
            _ => (DEFAULT_REGISTRY.to_owned(), name.to_owned()),
        };
        if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            repository = format!("{}/{}", DEFAULT_NAMESPACE, repository);
        }
        if !REPOSITORY_RE.is_match(&repository) {
            return Err(ReferenceError::InvalidRepository(repository));
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_owned()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The registry host (with optional port).
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path, namespace included.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, when the reference carries one.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The digest, when the reference pins one.
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// The full, defaulted string form.
    pub fn whole(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }

    /// The identifier used when talking to the registry: a pinned digest
    /// wins over a tag.
    pub fn version(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_owned(),
        }
    }

    /// The v2 manifest endpoint for this reference.
    pub fn to_v2_manifest_url(&self, protocol: &str) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            protocol,
            self.registry,
            self.repository,
            self.version()
        )
    }

    /// The v2 blob endpoint for a digest under this reference's repository.
    pub fn to_v2_blob_url(&self, protocol: &str, digest: &Digest) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            protocol, self.registry, self.repository, digest
        )
    }

    /// The v2 blob-upload endpoint for this reference's repository.
    pub fn to_v2_blob_upload_url(&self, protocol: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/uploads/",
            protocol, self.registry, self.repository
        )
    }

    /// Map this reference to a filesystem subtree:
    /// `<registry>/<repository>/<tag>` for tag references and
    /// `<registry>/<repository>/<algorithm>/<hex>` for digest references.
    pub fn to_layout_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.registry);
        for component in self.repository.split('/') {
            path.push(component);
        }
        match (&self.digest, &self.tag) {
            (Some(digest), _) => {
                path.push(digest.algorithm());
                path.push(digest.hex());
            }
            (None, Some(tag)) => path.push(tag),
            (None, None) => path.push(DEFAULT_TAG),
        }
        path
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.whole())
    }
}

impl TryFrom<&str> for Reference {
    type Error = ReferenceError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Reference {
    type Error = ReferenceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl std::str::FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
