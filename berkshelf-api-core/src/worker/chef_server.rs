//! Chef server source.
//!
//! Lists every cookbook version the server (or organization) knows about, resolves metadata
//! from the cookbook version manifest, and downloads cookbook files for repackaging.
//! Every request is signed with the Chef authentication protocol, version 1.3.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::Url;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::WorkerRegistration;
use crate::contract::Worker;
use crate::error::{ArchiveError, ConfigurationError, MetadataUnresolvedError, SourceUnavailableError};
use crate::model::{is_valid_cookbook_name, normalize_version, LocationType, Metadata, RemoteCookbook};
use crate::worker::{
    check_status, http_client, invalid, parse_endpoint_url, parse_options, DownloadTemplate,
};

pub const WORKER_TYPE: &str = "chef_server";

/// Width of each `X-Ops-Authorization-N` header value.
const AUTHORIZATION_CHUNK: usize = 60;

const SERVER_API_VERSION: &str = "0";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChefServerOptions {
    /// Server URL, including `/organizations/<org>` where applicable.
    #[serde(alias = "chef_url")]
    pub url: String,
    pub client_name: String,
    /// Path to the client's PEM private key.
    pub client_key: PathBuf,
    #[serde(default = "default_ssl_verify")]
    pub ssl_verify: bool,
    /// Where clients download the cookbook from, with `{name}` and `{version}` placeholders.
    pub download_url: String,
}

fn default_ssl_verify() -> bool {
    true
}

/// Signs requests on behalf of a Chef API client.
pub struct ChefSigner {
    client_name: String,
    key: SigningKey<Sha256>,
}

impl ChefSigner {
    /// Accepts PKCS#1 (`BEGIN RSA PRIVATE KEY`) and PKCS#8 (`BEGIN PRIVATE KEY`) PEM keys.
    pub fn from_pem(client_name: impl Into<String>, pem: &str) -> Result<Self, String> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| format!("unreadable RSA private key: {e}"))?;
        Ok(Self {
            client_name: client_name.into(),
            key: SigningKey::<Sha256>::new(key),
        })
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Authentication headers for one request.
    pub fn headers(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>, SourceUnavailableError> {
        let content_hash = content_hash(body);
        let timestamp = timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let canonical =
            canonical_request(method, path, &content_hash, &timestamp, &self.client_name);
        let signature = self
            .key
            .try_sign(canonical.as_bytes())
            .map_err(|e| SourceUnavailableError::Signing(e.to_string()))?;
        let encoded = BASE64.encode(signature.to_bytes());

        let mut headers = vec![
            ("Accept".to_string(), "application/json".to_string()),
            (
                "X-Chef-Version".to_string(),
                concat!("berkshelf-api/", env!("CARGO_PKG_VERSION")).to_string(),
            ),
            (
                "X-Ops-Sign".to_string(),
                "algorithm=sha256;version=1.3".to_string(),
            ),
            ("X-Ops-Userid".to_string(), self.client_name.clone()),
            ("X-Ops-Timestamp".to_string(), timestamp),
            ("X-Ops-Content-Hash".to_string(), content_hash),
            (
                "X-Ops-Server-API-Version".to_string(),
                SERVER_API_VERSION.to_string(),
            ),
        ];
        for (n, chunk) in encoded.as_bytes().chunks(AUTHORIZATION_CHUNK).enumerate() {
            headers.push((
                format!("X-Ops-Authorization-{}", n + 1),
                String::from_utf8_lossy(chunk).into_owned(),
            ));
        }
        Ok(headers)
    }
}

/// Base64 SHA-256 of a request body.
pub fn content_hash(body: &[u8]) -> String {
    BASE64.encode(Sha256::digest(body))
}

/// The string a v1.3 request signature covers.
pub fn canonical_request(
    method: &str,
    path: &str,
    content_hash: &str,
    timestamp: &str,
    user_id: &str,
) -> String {
    format!(
        "Method:{}\nPath:{}\nX-Ops-Content-Hash:{}\nX-Ops-Sign:version=1.3\nX-Ops-Timestamp:{}\nX-Ops-UserId:{}\nX-Ops-Server-API-Version:{}",
        method.to_uppercase(),
        canonical_path(path),
        content_hash,
        timestamp,
        user_id,
        SERVER_API_VERSION,
    )
}

/// Collapse repeated slashes and drop a trailing slash (except for the root).
fn canonical_path(path: &str) -> String {
    let mut canonical = String::with_capacity(path.len());
    for ch in path.chars() {
        if ch == '/' && canonical.ends_with('/') {
            continue;
        }
        canonical.push(ch);
    }
    if canonical.len() > 1 && canonical.ends_with('/') {
        canonical.pop();
    }
    canonical
}

#[derive(Debug, Deserialize)]
struct CookbookVersions {
    #[serde(default)]
    versions: Vec<VersionRef>,
}

#[derive(Debug, Deserialize)]
struct VersionRef {
    version: String,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestMetadata {
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    platforms: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestFile {
    path: String,
    url: String,
}

/// A cookbook version manifest. API v0 lists files per segment, later versions in `all_files`.
#[derive(Debug, Deserialize)]
struct CookbookManifest {
    #[serde(default)]
    metadata: ManifestMetadata,
    #[serde(default)]
    all_files: Vec<ManifestFile>,
    #[serde(default)]
    recipes: Vec<ManifestFile>,
    #[serde(default)]
    definitions: Vec<ManifestFile>,
    #[serde(default)]
    libraries: Vec<ManifestFile>,
    #[serde(default)]
    attributes: Vec<ManifestFile>,
    #[serde(default)]
    files: Vec<ManifestFile>,
    #[serde(default)]
    templates: Vec<ManifestFile>,
    #[serde(default)]
    resources: Vec<ManifestFile>,
    #[serde(default)]
    providers: Vec<ManifestFile>,
    #[serde(default)]
    root_files: Vec<ManifestFile>,
}

impl CookbookManifest {
    fn files(&self) -> Vec<ManifestFile> {
        if !self.all_files.is_empty() {
            return self.all_files.clone();
        }
        [
            &self.recipes,
            &self.definitions,
            &self.libraries,
            &self.attributes,
            &self.files,
            &self.templates,
            &self.resources,
            &self.providers,
            &self.root_files,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }
}

/// Constraint values are strings in practice; anything else is rendered as JSON.
fn constraint_map(raw: BTreeMap<String, serde_json::Value>) -> BTreeMap<String, String> {
    raw.into_iter()
        .map(|(name, value)| {
            let constraint = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (name, constraint)
        })
        .collect()
}

/// Reject manifest paths that would escape the destination directory.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let relative = Path::new(path);
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

pub struct ChefServerWorker {
    url: Url,
    client: reqwest::Client,
    signer: ChefSigner,
    download_url: DownloadTemplate,
    priority: i64,
    closed: AtomicBool,
}

impl ChefServerWorker {
    pub fn new(
        url: Url,
        client: reqwest::Client,
        signer: ChefSigner,
        download_url: DownloadTemplate,
        priority: i64,
    ) -> Self {
        Self {
            url,
            client,
            signer,
            download_url,
            priority,
            closed: AtomicBool::new(false),
        }
    }

    /// Registry constructor for `type: chef_server`.
    pub fn build(registration: &WorkerRegistration) -> Result<Arc<dyn Worker>, ConfigurationError> {
        let options: ChefServerOptions = parse_options(registration)?;
        let url = parse_endpoint_url(registration, &options.url)?;
        let pem = std::fs::read_to_string(&options.client_key).map_err(|e| {
            invalid(
                registration,
                format!("cannot read client_key {}: {e}", options.client_key.display()),
            )
        })?;
        let signer = ChefSigner::from_pem(&options.client_name, &pem)
            .map_err(|reason| invalid(registration, reason))?;
        let client = http_client(registration, options.ssl_verify)?;
        Ok(Arc::new(Self::new(
            url,
            client,
            signer,
            DownloadTemplate::new(options.download_url),
            registration.priority,
        )))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceUnavailableError> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceUnavailableError::Malformed {
                url: self.url.to_string(),
                reason: "server url cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<T, SourceUnavailableError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SourceUnavailableError::Closed);
        }
        let headers = self.signer.headers("GET", url.path(), b"", Utc::now())?;
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|source| SourceUnavailableError::Request {
                url: url.to_string(),
                source,
            })?;
        let response = check_status(response)?;
        response
            .json::<T>()
            .await
            .map_err(|e| SourceUnavailableError::Malformed {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn manifest(
        &self,
        remote: &RemoteCookbook,
    ) -> Result<CookbookManifest, MetadataUnresolvedError> {
        let url = self.endpoint(&["cookbooks", remote.name(), remote.version()])?;
        match self.get_json::<CookbookManifest>(url).await {
            Ok(manifest) => Ok(manifest),
            Err(SourceUnavailableError::Status { status, .. })
                if status == reqwest::StatusCode::NOT_FOUND =>
            {
                Err(MetadataUnresolvedError::NotFound {
                    name: remote.name().to_string(),
                    version: remote.version().to_string(),
                })
            }
            Err(SourceUnavailableError::Malformed { reason, .. }) => {
                Err(MetadataUnresolvedError::Unparsable {
                    name: remote.name().to_string(),
                    version: remote.version().to_string(),
                    reason,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_file(&self, file: &ManifestFile, destination: &Path) -> Result<(), ArchiveError> {
        let relative = safe_relative(&file.path)
            .ok_or_else(|| ArchiveError::Download(format!("unsafe file path '{}'", file.path)))?;
        // File URLs are pre-signed by the server; they take no Chef authentication.
        let response = self
            .client
            .get(&file.url)
            .send()
            .await
            .map_err(|source| SourceUnavailableError::Request {
                url: file.url.clone(),
                source,
            })?;
        let bytes = check_status(response)?
            .bytes()
            .await
            .map_err(|source| SourceUnavailableError::Request {
                url: file.url.clone(),
                source,
            })?;
        let target = destination.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl Worker for ChefServerWorker {
    fn describe(&self) -> String {
        format!("{WORKER_TYPE} worker: {}", self.url)
    }

    fn priority(&self) -> i64 {
        self.priority
    }

    async fn list_cookbooks(&self) -> Result<Vec<RemoteCookbook>, SourceUnavailableError> {
        let mut url = self.endpoint(&["cookbooks"])?;
        url.query_pairs_mut().append_pair("num_versions", "all");
        let listing: BTreeMap<String, CookbookVersions> = self.get_json(url).await?;

        let mut cookbooks = Vec::new();
        for (name, entry) in listing {
            if !is_valid_cookbook_name(&name) {
                warn!(worker = %self.describe(), cookbook = %name, "Unusable cookbook name, skipping");
                continue;
            }
            for version_ref in entry.versions {
                match normalize_version(&version_ref.version) {
                    Ok(version) => {
                        let location = self.download_url.render(&name, &version);
                        cookbooks.push(RemoteCookbook::new(
                            &name,
                            version,
                            LocationType::Uri,
                            location,
                            self.priority,
                        ));
                    }
                    Err(e) => {
                        debug!(worker = %self.describe(), cookbook = %name, error = %e, "Skipping cookbook version");
                    }
                }
            }
        }
        info!(worker = %self.describe(), count = cookbooks.len(), "Listed cookbooks");
        Ok(cookbooks)
    }

    async fn metadata(&self, remote: &RemoteCookbook) -> Option<Metadata> {
        debug!(worker = %self.describe(), name = remote.name(), version = remote.version(), "Loading cookbook metadata");
        match self.manifest(remote).await {
            Ok(manifest) => Some(Metadata {
                dependencies: constraint_map(manifest.metadata.dependencies),
                platforms: constraint_map(manifest.metadata.platforms),
            }),
            Err(e) => {
                warn!(worker = %self.describe(), error = %e, "Metadata unresolved");
                None
            }
        }
    }

    async fn download(&self, remote: &RemoteCookbook, destination: &Path) -> Result<(), ArchiveError> {
        let manifest = self.manifest(remote).await.map_err(|e| match e {
            MetadataUnresolvedError::Source(source) => ArchiveError::Source(source),
            other => ArchiveError::Download(other.to_string()),
        })?;
        let files = manifest.files();
        info!(worker = %self.describe(), name = remote.name(), version = remote.version(), files = files.len(), "Downloading cookbook files");
        for file in &files {
            self.fetch_file(file, destination).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(worker = %self.describe(), "Closed Chef server session");
        }
    }
}
