//! Content-addressed digests.
//!
//! Every blob in an image (layer, config, manifest) is addressed by the
//! digest of its bytes. The canonical string form is `<algorithm>:<hex>`,
//! and in practice the algorithm is always `sha256`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// The only digest algorithm this library produces.
pub const SHA256_ALGORITHM: &str = "sha256";

/// Length of a hex-formatted sha256.
const SHA256_HEX_LEN: usize = 64;

/// Errors produced while parsing a digest string.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The string is not of the form `<algorithm>:<hex>`.
    #[error("malformed digest {0:?}: expected <algorithm>:<hex>")]
    Malformed(String),
    /// The algorithm component is not one we know how to verify.
    #[error("unsupported digest algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    /// The hex component has the wrong length or holds non-hex characters.
    #[error("invalid sha256 hex {0:?}")]
    InvalidHex(String),
}

/// A parsed content digest.
///
/// Equality of digests implies equality of the addressed bytes, so `Digest`
/// is usable as a map key wherever content identity is needed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Parse the canonical `<algorithm>:<hex>` form.
    ///
    /// `sha256` digests are fully validated; other algorithms are accepted
    /// structurally so that foreign manifests remain readable, but this
    /// library never produces them.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestError::Malformed(s.to_owned()))?;
        if algorithm.is_empty() || hex.is_empty() {
            return Err(DigestError::Malformed(s.to_owned()));
        }
        if algorithm == SHA256_ALGORITHM {
            Self::validate_sha256_hex(hex)?;
        }
        Ok(Self {
            algorithm: algorithm.to_owned(),
            hex: hex.to_owned(),
        })
    }

    /// Build a sha256 digest from an already-computed hex string.
    pub fn sha256(hex: impl Into<String>) -> Result<Self, DigestError> {
        let hex = hex.into();
        Self::validate_sha256_hex(&hex)?;
        Ok(Self {
            algorithm: SHA256_ALGORITHM.to_owned(),
            hex,
        })
    }

    /// Digest a byte slice.
    pub fn sha256_of(bytes: &[u8]) -> Self {
        Self {
            algorithm: SHA256_ALGORITHM.to_owned(),
            hex: format!("{:x}", Sha256::digest(bytes)),
        }
    }

    fn validate_sha256_hex(hex: &str) -> Result<(), DigestError> {
        if hex.len() != SHA256_HEX_LEN || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DigestError::InvalidHex(hex.to_owned()));
        }
        Ok(())
    }

    /// The algorithm component, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The hex component, lowercase.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(D::Error::custom)
    }
}

/// Incremental sha256 over a byte stream, counting bytes as it goes.
///
/// Blob writers use this to learn the digest and size of streamed content
/// in a single pass.
pub struct Sha256Counter {
    hasher: Sha256,
    bytes: u64,
}

impl Sha256Counter {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Finish the hash, returning the digest and the number of bytes seen.
    pub fn finalize(self) -> (Digest, u64) {
        let digest = Digest {
            algorithm: SHA256_ALGORITHM.to_owned(),
            hex: format!("{:x}", self.hasher.finalize()),
        };
        (digest, self.bytes)
    }
}

impl Default for Sha256Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest an async stream to exhaustion, returning digest and byte count.
pub async fn sha256_of_reader<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<(Digest, u64)> {
    let mut counter = Sha256Counter::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        counter.update(&buf[..n]);
    }
    Ok(counter.finalize())
}
