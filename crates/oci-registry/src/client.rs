//! OCI distribution client.
//!
//! Supports the operations the image engine needs: pulling manifests,
//! indexes, configs and layer blobs, and pushing blobs, manifests and
//! manifest lists. Most OCI registries require at least an OAuth2-style
//! token handshake even for anonymous pulls; the entry points perform it
//! lazily, and [`Client::auth`] does it with credentials. Tokens are
//! cached per (registry, repository, operation).

use crate::config::ImageConfig;
use crate::digest::Digest;
use crate::errors::OciEnvelope;
use crate::manifest::{
    is_index_media_type, is_manifest_media_type, OciDescriptor, OciImageIndex, OciImageManifest,
    Platform, OCI_MANIFEST_MEDIA_TYPE,
};
use crate::reference::Reference;
use crate::secrets::{Authenticable, RegistryAuth};

use anyhow::Context;
use futures_util::stream::StreamExt;
use hyperx::header::Header;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::debug;
use www_authenticate::{Challenge, ChallengeFields, RawChallenge, WwwAuthenticate};

const OCI_VERSION_KEY: &str = "Docker-Distribution-Api-Version";

/// The set of media types we tell registries we accept for a manifest
/// request.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json,application/vnd.oci.image.index.v1+json,application/vnd.docker.distribution.manifest.v2+json,application/vnd.docker.distribution.manifest.list.v2+json";

/// The operation a token is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryOperation {
    /// Pull manifests and blobs.
    Pull,
    /// Pull and push manifests and blobs.
    Push,
}

/// Tokens are scoped to a repository and an operation, so the cache is
/// keyed by all three coordinates.
type TokenKey = (String, String, RegistryOperation);

fn token_key(reference: &Reference, operation: RegistryOperation) -> TokenKey {
    (
        reference.registry().to_owned(),
        reference.repository().to_owned(),
        operation,
    )
}

/// A manifest payload as fetched, before interpretation: either a single
/// image manifest or an index.
#[derive(Debug, Clone)]
pub enum PulledManifest {
    /// A single-image manifest.
    Image(OciImageManifest),
    /// An index / manifest list.
    Index(OciImageIndex),
}

/// The OCI distribution client.
///
/// Create one and use the `pull_*`/`push_*` methods directly: each entry
/// point fetches an anonymous token lazily when the registry demands one
/// and none is cached yet. Credentialed access calls [`Client::auth`]
/// first; the token it caches is the one the entry points then reuse.
/// Tokens are cached per (registry, repository, operation) for the life of
/// the client, so a shared `&Client` is enough for both pulling and
/// pushing.
#[derive(Default)]
pub struct Client {
    config: ClientConfig,
    tokens: RwLock<HashMap<TokenKey, RegistryToken>>,
    client: reqwest::Client,
}

impl Client {
    /// Create a new client with the supplied config.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            tokens: RwLock::new(HashMap::new()),
            client: reqwest::Client::new(),
        }
    }

    /// According to the v2 specification, 200 and 401 responses MUST carry
    /// the version header; any other response means the host is not a v2
    /// registry.
    pub async fn version(&self, host: &str) -> anyhow::Result<String> {
        let url = format!("{}://{}/v2/", self.config.protocol.as_str(), host);
        let res = self.client.get(&url).send().await?;
        let dist_hdr = res.headers().get(OCI_VERSION_KEY);
        let version = dist_hdr
            .ok_or_else(|| anyhow::anyhow!("no v2 version header found"))?
            .to_str()?
            .to_owned();
        Ok(version)
    }

    /// Perform the token handshake for `reference`'s registry if it demands
    /// one, and cache the resulting token under the same key the entry
    /// points look up.
    pub async fn auth(
        &self,
        reference: &Reference,
        authentication: &RegistryAuth,
        operation: RegistryOperation,
    ) -> anyhow::Result<()> {
        debug!(reference = %reference, "authorizing");
        let url = format!(
            "{}://{}/v2/",
            self.config.protocol.as_str(),
            reference.registry()
        );
        let res = self.client.get(&url).send().await?;
        let dist_hdr = match res.headers().get(reqwest::header::WWW_AUTHENTICATE) {
            Some(h) => h,
            // No challenge; the registry is fully anonymous.
            None => return Ok(()),
        };

        let auth = WwwAuthenticate::parse_header(&dist_hdr.as_bytes().into())?;
        let challenge_opt = match auth.get::<BearerChallenge>() {
            Some(co) => co,
            // A header without a bearer challenge usually means a v1
            // compatibility endpoint; nothing for us to do.
            None => return Ok(()),
        };

        let scope = match operation {
            RegistryOperation::Pull => format!("repository:{}:pull", reference.repository()),
            RegistryOperation::Push => {
                format!("repository:{}:pull,push", reference.repository())
            }
        };
        let challenge = &challenge_opt[0];
        let realm = challenge
            .realm
            .as_ref()
            .context("bearer challenge carried no realm")?;
        let service = challenge
            .service
            .as_ref()
            .context("bearer challenge carried no service")?;

        debug!(%realm, %service, %scope, "requesting token");
        let auth_res = self
            .client
            .get(realm)
            .query(&[("service", service), ("scope", &scope)])
            .apply_authentication(authentication)
            .send()
            .await?;

        match auth_res.status() {
            reqwest::StatusCode::OK => {
                let text = auth_res.text().await?;
                let token: RegistryToken =
                    serde_json::from_str(&text).context("failed to decode registry token")?;
                debug!(reference = %reference, "authorized");
                self.tokens
                    .write()
                    .map_err(|_| anyhow::anyhow!("token cache poisoned"))?
                    .insert(token_key(reference, operation), token);
                Ok(())
            }
            _ => {
                let reason = auth_res.text().await?;
                Err(anyhow::anyhow!("failed to authenticate: {}", reason))
            }
        }
    }

    /// Fetch an anonymous token for `reference` when none is cached for
    /// this operation. Registries that issued a token through
    /// [`Client::auth`] are left alone.
    async fn ensure_token(
        &self,
        reference: &Reference,
        operation: RegistryOperation,
    ) -> anyhow::Result<()> {
        let cached = self
            .tokens
            .read()
            .map(|tokens| tokens.contains_key(&token_key(reference, operation)))
            .unwrap_or(false);
        if cached {
            return Ok(());
        }
        self.auth(reference, &RegistryAuth::Anonymous, operation)
            .await
    }

    /// Fetch the digest of `reference`'s manifest without pulling its body.
    pub async fn fetch_manifest_digest(&self, reference: &Reference) -> anyhow::Result<Digest> {
        self.ensure_token(reference, RegistryOperation::Pull).await?;
        let url = reference.to_v2_manifest_url(self.config.protocol.as_str());
        let res = self
            .client
            .head(&url)
            .headers(self.auth_headers(reference, RegistryOperation::Pull))
            .send()
            .await?;
        match res.status() {
            reqwest::StatusCode::OK => digest_header_value(&res),
            s => Err(anyhow::anyhow!("HEAD {} returned {}", url, s)),
        }
    }

    /// Pull the manifest bytes for `reference`, returning the raw body, its
    /// digest and its media type.
    pub async fn pull_manifest_raw(
        &self,
        reference: &Reference,
    ) -> anyhow::Result<(Vec<u8>, Digest, String)> {
        self.ensure_token(reference, RegistryOperation::Pull).await?;
        let url = reference.to_v2_manifest_url(self.config.protocol.as_str());
        debug!(%url, "pulling manifest");
        let res = self
            .client
            .get(&url)
            .headers(self.auth_headers(reference, RegistryOperation::Pull))
            .send()
            .await?;

        // The spec technically allows only 200, 401, 404 and 500; triage
        // anything else by class.
        match res.status() {
            reqwest::StatusCode::OK => {
                let digest = digest_header_value(&res)?;
                let media_type = res
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(OCI_MANIFEST_MEDIA_TYPE)
                    .to_owned();
                let body = res.bytes().await?.to_vec();
                Ok((body, digest, media_type))
            }
            s if s.is_client_error() => {
                let err = res.json::<OciEnvelope>().await?;
                Err(anyhow::anyhow!("{} on {}", err.errors[0], url))
            }
            s if s.is_server_error() => Err(anyhow::anyhow!("server error at {}", url)),
            s => Err(anyhow::anyhow!(
                "unexpected response: code={}, message='{}'",
                s,
                res.text().await?
            )),
        }
    }

    /// Pull and interpret the manifest at `reference`: a single-image
    /// manifest or an index, depending on what the registry serves.
    pub async fn pull_manifest(
        &self,
        reference: &Reference,
    ) -> anyhow::Result<(PulledManifest, Digest)> {
        let (body, digest, media_type) = self.pull_manifest_raw(reference).await?;
        let parsed = if is_index_media_type(&media_type) {
            PulledManifest::Index(
                serde_json::from_slice(&body)
                    .with_context(|| format!("parsing index for {}", reference))?,
            )
        } else if is_manifest_media_type(&media_type) {
            PulledManifest::Image(
                serde_json::from_slice(&body)
                    .with_context(|| format!("parsing manifest for {}", reference))?,
            )
        } else {
            // Some registries omit or mangle Content-Type; sniff the body.
            match serde_json::from_slice::<OciImageManifest>(&body) {
                Ok(m) if !m.layers.is_empty() || m.media_type.as_deref().map_or(true, is_manifest_media_type) => {
                    PulledManifest::Image(m)
                }
                _ => PulledManifest::Index(
                    serde_json::from_slice(&body)
                        .with_context(|| format!("parsing manifest for {}", reference))?,
                ),
            }
        };
        Ok((parsed, digest))
    }

    /// Pull the index at `reference`; errors when the registry serves a
    /// single-image manifest instead.
    pub async fn pull_index(
        &self,
        reference: &Reference,
    ) -> anyhow::Result<(OciImageIndex, Digest)> {
        match self.pull_manifest(reference).await? {
            (PulledManifest::Index(index), digest) => Ok((index, digest)),
            (PulledManifest::Image(_), _) => Err(anyhow::anyhow!(
                "{} is a single-image manifest, not an index",
                reference
            )),
        }
    }

    /// Pull the image manifest for `reference` that matches `platform`,
    /// resolving through an index when the registry serves one.
    pub async fn pull_manifest_for(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> anyhow::Result<(OciImageManifest, Digest)> {
        match self.pull_manifest(reference).await? {
            (PulledManifest::Image(manifest), digest) => Ok((manifest, digest)),
            (PulledManifest::Index(index), _) => {
                let child = index
                    .manifests
                    .iter()
                    .find(|d| {
                        d.platform
                            .as_ref()
                            .map_or(false, |p| !p.is_unknown() && p.satisfies(platform))
                    })
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "no manifest for platform {} in index {}",
                            platform,
                            reference
                        )
                    })?;
                let mut pinned = reference.whole();
                // Re-resolve by digest so a racing tag move cannot swap the
                // manifest under us.
                if reference.digest().is_none() {
                    pinned = format!(
                        "{}/{}@{}",
                        reference.registry(),
                        reference.repository(),
                        child.digest
                    );
                }
                let pinned = Reference::parse(&pinned)?;
                let (body, digest, _) = self.pull_manifest_raw(&pinned).await?;
                let manifest = serde_json::from_slice(&body)
                    .with_context(|| format!("parsing manifest for {}", pinned))?;
                Ok((manifest, digest))
            }
        }
    }

    /// Pull and parse the image config addressed by `descriptor`.
    pub async fn pull_config(
        &self,
        reference: &Reference,
        descriptor: &OciDescriptor,
    ) -> anyhow::Result<(ImageConfig, Vec<u8>)> {
        let mut raw = Vec::with_capacity(descriptor.size.max(0) as usize);
        self.pull_blob(reference, &descriptor.digest, &mut raw)
            .await?;
        let config = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing config {}", descriptor.digest))?;
        Ok((config, raw))
    }

    /// Pull a single blob into `out`.
    pub async fn pull_blob<T: AsyncWrite + Unpin>(
        &self,
        reference: &Reference,
        digest: &Digest,
        mut out: T,
    ) -> anyhow::Result<()> {
        self.ensure_token(reference, RegistryOperation::Pull).await?;
        let url = reference.to_v2_blob_url(self.config.protocol.as_str(), digest);
        let mut stream = self
            .client
            .get(&url)
            .headers(self.auth_headers(reference, RegistryOperation::Pull))
            .send()
            .await?
            .error_for_status()?
            .bytes_stream();

        while let Some(bytes) = stream.next().await {
            out.write_all(&bytes?).await?;
        }

        Ok(())
    }

    /// Open a blob as an async reader, for layer-sized payloads that should
    /// not be buffered whole.
    pub async fn blob_stream(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> anyhow::Result<impl AsyncRead + Send + Unpin> {
        self.ensure_token(reference, RegistryOperation::Pull).await?;
        let url = reference.to_v2_blob_url(self.config.protocol.as_str(), digest);
        let stream = self
            .client
            .get(&url)
            .headers(self.auth_headers(reference, RegistryOperation::Pull))
            .send()
            .await?
            .error_for_status()?
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)))
            .boxed();
        Ok(StreamReader::new(stream))
    }

    /// Whether the registry already holds a blob with this digest.
    pub async fn blob_exists(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> anyhow::Result<bool> {
        self.ensure_token(reference, RegistryOperation::Pull).await?;
        let url = reference.to_v2_blob_url(self.config.protocol.as_str(), digest);
        let res = self
            .client
            .head(&url)
            .headers(self.auth_headers(reference, RegistryOperation::Pull))
            .send()
            .await?;
        Ok(res.status() == reqwest::StatusCode::OK)
    }

    /// Push a blob using the monolithic upload flow: POST for an upload
    /// session, then PUT the bytes with the digest attached.
    pub async fn push_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        body: Vec<u8>,
    ) -> anyhow::Result<()> {
        if self.blob_exists(reference, digest).await.unwrap_or(false) {
            debug!(%digest, "blob already present, skipping upload");
            return Ok(());
        }
        self.ensure_token(reference, RegistryOperation::Push).await?;
        let url = reference.to_v2_blob_upload_url(self.config.protocol.as_str());
        let res = self
            .client
            .post(&url)
            .headers(self.auth_headers(reference, RegistryOperation::Push))
            .send()
            .await?;
        let location = res
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .context("upload session returned no location")?
            .to_owned();
        let location = self.absolute_upload_url(reference, &location);
        let sep = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{}{}digest={}", location, sep, digest);
        let res = self
            .client
            .put(&put_url)
            .headers(self.auth_headers(reference, RegistryOperation::Push))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        match res.status() {
            reqwest::StatusCode::CREATED => Ok(()),
            s => Err(anyhow::anyhow!(
                "blob upload of {} failed: code={}, message='{}'",
                digest,
                s,
                res.text().await?
            )),
        }
    }

    /// Push manifest (or manifest-list) bytes under `reference`'s tag or
    /// digest, returning the digest the registry computed.
    pub async fn push_manifest(
        &self,
        reference: &Reference,
        body: Vec<u8>,
        media_type: &str,
    ) -> anyhow::Result<Digest> {
        self.ensure_token(reference, RegistryOperation::Push).await?;
        let url = reference.to_v2_manifest_url(self.config.protocol.as_str());
        debug!(%url, media_type, "pushing manifest");
        let res = self
            .client
            .put(&url)
            .headers(self.auth_headers(reference, RegistryOperation::Push))
            .header(reqwest::header::CONTENT_TYPE, media_type)
            .body(body)
            .send()
            .await?;
        match res.status() {
            reqwest::StatusCode::CREATED => digest_header_value(&res),
            s if s.is_client_error() => {
                let err = res.json::<OciEnvelope>().await?;
                Err(anyhow::anyhow!("{} on {}", err.errors[0], url))
            }
            s => Err(anyhow::anyhow!(
                "manifest push failed: code={}, message='{}'",
                s,
                res.text().await?
            )),
        }
    }

    // Registries may return a relative upload location.
    fn absolute_upload_url(&self, reference: &Reference, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_owned()
        } else {
            format!(
                "{}://{}{}",
                self.config.protocol.as_str(),
                reference.registry(),
                location
            )
        }
    }

    /// Generate the headers every registry request needs: the Accept list
    /// and, when we hold one, the bearer token cached for this repository
    /// and operation.
    fn auth_headers(&self, reference: &Reference, operation: RegistryOperation) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", MANIFEST_ACCEPT.parse().unwrap());
        if let Ok(tokens) = self.tokens.read() {
            if let Some(token) = tokens.get(&token_key(reference, operation)) {
                headers.insert("Authorization", token.bearer_token().parse().unwrap());
            }
        }
        headers
    }
}

/// A client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Which protocol the client should use.
    pub protocol: ClientProtocol,
}

/// The protocol the client connects with.
#[derive(Debug, Clone)]
pub enum ClientProtocol {
    #[allow(missing_docs)]
    Http,
    #[allow(missing_docs)]
    Https,
}

impl Default for ClientProtocol {
    fn default() -> Self {
        ClientProtocol::Https
    }
}

impl ClientProtocol {
    fn as_str(&self) -> &str {
        match self {
            ClientProtocol::Https => "https",
            ClientProtocol::Http => "http",
        }
    }
}

/// A token granted during the OAuth2-like workflow for OCI registries.
#[derive(serde::Deserialize, Default)]
struct RegistryToken {
    #[serde(alias = "access_token")]
    token: String,
}

impl RegistryToken {
    fn bearer_token(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

#[derive(Clone)]
struct BearerChallenge {
    pub realm: Option<String>,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl Challenge for BearerChallenge {
    fn challenge_name() -> &'static str {
        "Bearer"
    }

    fn from_raw(raw: RawChallenge) -> Option<Self> {
        match raw {
            RawChallenge::Token68(_) => None,
            RawChallenge::Fields(mut map) => Some(BearerChallenge {
                realm: map.remove("realm"),
                scope: map.remove("scope"),
                service: map.remove("service"),
            }),
        }
    }

    fn into_raw(self) -> RawChallenge {
        let mut map = ChallengeFields::new();
        if let Some(realm) = self.realm {
            map.insert_static_quoting("realm", realm);
        }
        if let Some(scope) = self.scope {
            map.insert_static_quoting("scope", scope);
        }
        if let Some(service) = self.service {
            map.insert_static_quoting("service", service);
        }
        RawChallenge::Fields(map)
    }
}

fn digest_header_value(response: &reqwest::Response) -> anyhow::Result<Digest> {
    let digest_header = response.headers().get("Docker-Content-Digest");
    match digest_header {
        None => Err(anyhow::anyhow!("registry did not return a digest header")),
        Some(hv) => Ok(Digest::parse(hv.to_str()?)?),
    }
}
