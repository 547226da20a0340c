//! GitLab source (API v4).
//!
//! Each public project in the configured group is a cookbook repository. Every branch that
//! names a version (or the default branch) is one candidate; its `metadata.rb` decides the
//! cookbook name and version.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::WorkerRegistration;
use crate::contract::Worker;
use crate::error::{
    ArchiveError, ConfigurationError, MetadataUnresolvedError, SourceUnavailableError, VersionError,
};
use crate::metadata_rb::{self, METADATA_FILE};
use crate::model::{
    accept_version_for_ref, is_valid_cookbook_name, LocationType, Metadata, RemoteCookbook,
};
use crate::worker::{
    check_status, http_client, invalid, parse_endpoint_url, parse_options, DownloadTemplate,
};

pub const WORKER_TYPE: &str = "gitlab";

/// Environment fallback for `options.private_token`.
pub const TOKEN_ENV: &str = "GITLAB_PRIVATE_TOKEN";

const PER_PAGE: &str = "100";

/// Branches inspected concurrently per project.
const BRANCH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitlabOptions {
    #[serde(alias = "gitlab_url")]
    pub url: String,
    #[serde(default)]
    pub private_token: Option<String>,
    pub group: String,
    #[serde(default = "default_ssl_verify")]
    pub ssl_verify: bool,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_ssl_verify() -> bool {
    true
}

fn default_branch() -> String {
    "master".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct Project {
    id: u64,
    #[serde(default)]
    path_with_namespace: String,
    web_url: String,
    #[serde(default)]
    visibility: Option<String>,
}

impl Project {
    fn is_public(&self) -> bool {
        self.visibility.as_deref() == Some("public")
    }
}

#[derive(Debug, Deserialize)]
struct Branch {
    name: String,
}

/// Branch names that can carry a cookbook: version-like names and the default branch.
pub fn branch_filter(default_branch: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"^([0-9][0-9.]+|{})$", regex::escape(default_branch)))
}

/// Split a `"{project_id}@{branch}"` reference.
pub fn parse_source_ref(source_ref: &str) -> Option<(u64, &str)> {
    let (id, branch) = source_ref.split_once('@')?;
    let id = id.parse().ok()?;
    (!branch.is_empty()).then_some((id, branch))
}

pub struct GitlabWorker {
    api: Url,
    client: reqwest::Client,
    token: Option<String>,
    group: String,
    default_branch: String,
    branches: Regex,
    download_url: Option<DownloadTemplate>,
    priority: i64,
    closed: AtomicBool,
}

impl GitlabWorker {
    /// `url` is the GitLab host; the `/api/v4` prefix is added here.
    pub fn new(
        url: &Url,
        client: reqwest::Client,
        options: &GitlabOptions,
        token: Option<String>,
        priority: i64,
    ) -> Result<Self, String> {
        let api = url
            .join(&format!("{}/api/v4/", url.path().trim_end_matches('/')))
            .map_err(|e| format!("invalid api url: {e}"))?;
        Ok(Self {
            api,
            client,
            token,
            group: options.group.clone(),
            default_branch: options.default_branch.clone(),
            branches: branch_filter(&options.default_branch)
                .map_err(|e| format!("invalid default_branch: {e}"))?,
            download_url: options.download_url.clone().map(DownloadTemplate::new),
            priority,
            closed: AtomicBool::new(false),
        })
    }

    /// Registry constructor for `type: gitlab`.
    pub fn build(registration: &WorkerRegistration) -> Result<Arc<dyn Worker>, ConfigurationError> {
        let options: GitlabOptions = parse_options(registration)?;
        let url = parse_endpoint_url(registration, &options.url)?;
        let token = options
            .private_token
            .clone()
            .or_else(|| std::env::var(TOKEN_ENV).ok())
            .filter(|t| !t.is_empty());
        let client = http_client(registration, options.ssl_verify)?;
        let worker = Self::new(&url, client, &options, token, registration.priority)
            .map_err(|reason| invalid(registration, reason))?;
        Ok(Arc::new(worker))
    }

    fn endpoint(&self, path: &str) -> Result<Url, SourceUnavailableError> {
        self.api.join(path).map_err(|e| SourceUnavailableError::Malformed {
            url: self.api.to_string(),
            reason: e.to_string(),
        })
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, SourceUnavailableError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SourceUnavailableError::Closed);
        }
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.header("PRIVATE-TOKEN", token);
        }
        request
            .send()
            .await
            .map_err(|source| SourceUnavailableError::Request {
                url: url.to_string(),
                source,
            })
    }

    /// Follow `X-Next-Page` until the listing is exhausted.
    async fn paginated<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Vec<T>, SourceUnavailableError> {
        let mut items = Vec::new();
        let mut page = "1".to_string();
        loop {
            let mut url = self.endpoint(path)?;
            url.query_pairs_mut()
                .append_pair("per_page", PER_PAGE)
                .append_pair("page", &page);
            let response = check_status(self.get(url.clone()).await?)?;
            let next = response
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string);
            let batch: Vec<T> =
                response
                    .json()
                    .await
                    .map_err(|e| SourceUnavailableError::Malformed {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })?;
            items.extend(batch);
            match next {
                Some(next) if next != page => page = next,
                _ => break,
            }
        }
        Ok(items)
    }

    /// Raw `metadata.rb` at `reference`, or `None` when the file does not exist there.
    async fn metadata_source(
        &self,
        project_id: u64,
        reference: &str,
    ) -> Result<Option<String>, SourceUnavailableError> {
        let mut url = self.endpoint(&format!(
            "projects/{project_id}/repository/files/{METADATA_FILE}/raw"
        ))?;
        url.query_pairs_mut().append_pair("ref", reference);
        let response = self.get(url.clone()).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = check_status(response)?
            .text()
            .await
            .map_err(|source| SourceUnavailableError::Request {
                url: url.to_string(),
                source,
            })?;
        Ok(Some(body))
    }

    fn location_for(&self, project: &Project, name: &str, branch: &str) -> String {
        match &self.download_url {
            Some(template) => template.render(name, branch),
            None => format!(
                "{}/repository/archive.tar.gz?ref={}",
                project.web_url.trim_end_matches('/'),
                branch
            ),
        }
    }

    /// One candidate per usable branch. Rejections are logged and skipped.
    async fn candidate(
        &self,
        project: &Project,
        branch: &str,
    ) -> Result<Option<RemoteCookbook>, SourceUnavailableError> {
        let Some(source) = self.metadata_source(project.id, branch).await? else {
            debug!(worker = %self.describe(), project = %project.path_with_namespace, branch, "No metadata.rb");
            return Ok(None);
        };
        let parsed = metadata_rb::parse(&source);
        let Some(name) = parsed.name else {
            warn!(worker = %self.describe(), project = %project.path_with_namespace, branch, "metadata.rb has no name, skipping");
            return Ok(None);
        };
        if !is_valid_cookbook_name(&name) {
            warn!(worker = %self.describe(), project = %project.path_with_namespace, branch, cookbook = %name, "Unusable cookbook name, skipping");
            return Ok(None);
        }
        let Some(declared) = parsed.version else {
            debug!(worker = %self.describe(), cookbook = %name, branch, "metadata.rb has no version, skipping");
            return Ok(None);
        };
        match accept_version_for_ref(branch, &declared, &self.default_branch) {
            Ok(version) => {
                let location = self.location_for(project, &name, branch);
                Ok(Some(
                    RemoteCookbook::new(name, version, LocationType::Uri, location, self.priority)
                        .with_source_ref(format!("{}@{}", project.id, branch)),
                ))
            }
            Err(VersionError::Invalid(raw)) => {
                debug!(worker = %self.describe(), cookbook = %name, branch, version = %raw, "Invalid cookbook version, skipping");
                Ok(None)
            }
            Err(e) => {
                warn!(worker = %self.describe(), cookbook = %name, branch, error = %e, "Version does not match branch, skipping");
                Ok(None)
            }
        }
    }

    async fn project_cookbooks(
        &self,
        project: &Project,
    ) -> Result<Vec<RemoteCookbook>, SourceUnavailableError> {
        let branches: Vec<Branch> = self
            .paginated(&format!("projects/{}/repository/branches", project.id))
            .await?;
        let names: Vec<String> = branches
            .into_iter()
            .map(|b| b.name)
            .filter(|name| self.branches.is_match(name))
            .collect();
        let found: Vec<Option<RemoteCookbook>> = stream::iter(names)
            .map(|branch| async move { self.candidate(project, &branch).await })
            .buffered(BRANCH_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(found.into_iter().flatten().collect())
    }

    fn resolve_ref<'a>(
        &self,
        remote: &'a RemoteCookbook,
    ) -> Result<(u64, &'a str), MetadataUnresolvedError> {
        let raw = remote.source_ref().unwrap_or_default();
        parse_source_ref(raw).ok_or_else(|| MetadataUnresolvedError::BadSourceRef(raw.to_string()))
    }

    async fn fetch_metadata(
        &self,
        remote: &RemoteCookbook,
    ) -> Result<Metadata, MetadataUnresolvedError> {
        let (project_id, branch) = self.resolve_ref(remote)?;
        let source = self.metadata_source(project_id, branch).await?.ok_or_else(|| {
            MetadataUnresolvedError::NotFound {
                name: remote.name().to_string(),
                version: remote.version().to_string(),
            }
        })?;
        Ok(metadata_rb::parse(&source).into_metadata())
    }
}

#[async_trait]
impl Worker for GitlabWorker {
    fn describe(&self) -> String {
        format!("{WORKER_TYPE} worker: {}{}", self.api, self.group)
    }

    fn priority(&self) -> i64 {
        self.priority
    }

    async fn list_cookbooks(&self) -> Result<Vec<RemoteCookbook>, SourceUnavailableError> {
        let projects: Vec<Project> = self
            .paginated(&format!("groups/{}/projects", self.group))
            .await?;
        let mut cookbooks = Vec::new();
        for project in projects.iter().filter(|p| p.is_public()) {
            match self.project_cookbooks(project).await {
                Ok(found) => cookbooks.extend(found),
                Err(e @ SourceUnavailableError::Unauthorized { .. }) => return Err(e),
                Err(e) => {
                    warn!(worker = %self.describe(), project = %project.path_with_namespace, error = %e, "Skipping project");
                }
            }
        }
        info!(worker = %self.describe(), projects = projects.len(), count = cookbooks.len(), "Listed cookbooks");
        Ok(cookbooks)
    }

    async fn metadata(&self, remote: &RemoteCookbook) -> Option<Metadata> {
        match self.fetch_metadata(remote).await {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(worker = %self.describe(), error = %e, "Metadata unresolved");
                None
            }
        }
    }

    async fn download(&self, remote: &RemoteCookbook, destination: &Path) -> Result<(), ArchiveError> {
        let (project_id, branch) = self
            .resolve_ref(remote)
            .map_err(|e| ArchiveError::Download(e.to_string()))?;
        let mut url = self.endpoint(&format!("projects/{project_id}/repository/archive.tar.gz"))?;
        url.query_pairs_mut().append_pair("sha", branch);
        info!(worker = %self.describe(), name = remote.name(), version = remote.version(), "Downloading cookbook archive");
        let response = check_status(self.get(url.clone()).await?)?;
        let bytes = response
            .bytes()
            .await
            .map_err(|source| SourceUnavailableError::Request {
                url: url.to_string(),
                source,
            })?;
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || crate::archive::unpack_stripped(&bytes, &destination))
            .await
            .map_err(|e| ArchiveError::Download(format!("unpack task failed: {e}")))??;
        Ok(())
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(worker = %self.describe(), "Closed GitLab session");
        }
    }
}
