//! Errors returned by OCI distribution registries.

/// The error document registries attach to 4xx responses.
///
/// Formally described in the distribution specification:
/// https://github.com/opencontainers/distribution-spec/blob/main/spec.md#error-codes
#[derive(serde::Deserialize, Debug)]
pub struct OciError {
    /// The error code.
    pub code: OciErrorCode,
    /// An optional message associated with the error.
    #[serde(default)]
    pub message: String,
    /// Unstructured optional data associated with the error.
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl std::error::Error for OciError {}

impl std::fmt::Display for OciError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OCI API error: {}", self.message.as_str())
    }
}

/// The envelope the errors arrive in.
#[derive(serde::Deserialize, Debug)]
pub(crate) struct OciEnvelope {
    pub(crate) errors: Vec<OciError>,
}

/// Registry error codes, per the distribution specification.
#[derive(serde::Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OciErrorCode {
    /// Blob unknown to registry.
    BlobUnknown,
    /// The blob upload encountered an error and can no longer proceed.
    BlobUploadInvalid,
    /// Blob upload is unknown to registry.
    BlobUploadUnknown,
    /// Provided digest did not match uploaded content.
    DigestInvalid,
    /// A manifest references a blob the registry does not know.
    ManifestBlobUnknown,
    /// The uploaded manifest failed validation.
    ManifestInvalid,
    /// The manifest, identified by name and tag, is unknown to the
    /// repository.
    ManifestUnknown,
    /// Invalid repository name.
    NameInvalid,
    /// Repository name is not known.
    NameUnknown,
    /// Provided length did not match content length.
    SizeInvalid,
    /// Authentication required.
    Unauthorized,
    /// Requested access to the resource is denied.
    Denied,
    /// This operation is unsupported.
    Unsupported,
    /// Too many requests from client.
    Toomanyrequests,
}

#[cfg(test)]
mod test {
    use super::*;

    const EXAMPLE_ERROR: &str = r#"
      {"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown","detail":{"Tag":"v9"}}]}
      "#;

    #[test]
    fn deserializes_error_envelope() {
        let envelope: OciEnvelope = serde_json::from_str(EXAMPLE_ERROR).expect("parse envelope");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::ManifestUnknown, e.code);
        assert_eq!("manifest unknown", e.message);
        assert_ne!(serde_json::Value::Null, e.detail);
    }

    const EXAMPLE_ERROR_MISSING_FIELDS: &str = r#"
      {"errors":[{"code":"UNAUTHORIZED"}]}
      "#;

    #[test]
    fn tolerates_missing_message_and_detail() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR_MISSING_FIELDS).expect("parse envelope");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::Unauthorized, e.code);
        assert_eq!(String::default(), e.message);
        assert_eq!(serde_json::Value::Null, e.detail);
    }
}
