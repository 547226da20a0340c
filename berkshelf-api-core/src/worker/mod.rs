//! Source connectors and the machinery that runs them.
//!
//! - [`WorkerRegistry`] maps a configuration `type` tag to a constructor, resolved once at startup.
//! - [`actor`] runs each worker as an isolated task behind a [`WorkerHandle`].
//! - [`chef_server`] and [`gitlab`] are the built-in sources.

pub mod actor;
pub mod chef_server;
pub mod gitlab;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::config::WorkerRegistration;
use crate::contract::Worker;
use crate::error::{ConfigurationError, SourceUnavailableError};

pub use actor::{spawn_worker, worker_actor, WorkerHandle, WorkerTask};

/// Constructor for one worker type.
pub type WorkerConstructor =
    fn(&WorkerRegistration) -> Result<Arc<dyn Worker>, ConfigurationError>;

/// Builds a fresh worker instance; called at group start and after a worker crash.
pub type WorkerFactory = Arc<dyn Fn() -> Result<Arc<dyn Worker>, ConfigurationError> + Send + Sync>;

/// Explicit map from configuration tag to worker constructor.
#[derive(Clone)]
pub struct WorkerRegistry {
    constructors: HashMap<&'static str, WorkerConstructor>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(chef_server::WORKER_TYPE, chef_server::ChefServerWorker::build);
        registry.register(gitlab::WORKER_TYPE, gitlab::GitlabWorker::build);
        registry
    }
}

impl WorkerRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, worker_type: &'static str, constructor: WorkerConstructor) {
        self.constructors.insert(worker_type, constructor);
    }

    pub fn worker_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.constructors.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn build(
        &self,
        registration: &WorkerRegistration,
    ) -> Result<Arc<dyn Worker>, ConfigurationError> {
        let constructor = self
            .constructors
            .get(registration.worker_type.as_str())
            .ok_or_else(|| ConfigurationError::UnknownWorkerType {
                index: registration.index,
                worker_type: registration.worker_type.clone(),
            })?;
        constructor(registration)
    }

    /// A factory that rebuilds the worker for `registration` on demand.
    ///
    /// Builds once immediately so malformed options fail at startup, not at crawl time.
    pub fn factory(
        &self,
        registration: WorkerRegistration,
    ) -> Result<WorkerFactory, ConfigurationError> {
        self.build(&registration)?;
        let registry = self.clone();
        Ok(Arc::new(move || registry.build(&registration)))
    }
}

/// Deserialize a registration's options into the worker's option struct.
pub(crate) fn parse_options<T: DeserializeOwned>(
    registration: &WorkerRegistration,
) -> Result<T, ConfigurationError> {
    serde_json::from_value(registration.options.clone()).map_err(|source| {
        ConfigurationError::InvalidOptions {
            index: registration.index,
            worker_type: registration.worker_type.clone(),
            source,
        }
    })
}

pub(crate) fn invalid(registration: &WorkerRegistration, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::Invalid {
        index: registration.index,
        worker_type: registration.worker_type.clone(),
        reason: reason.into(),
    }
}

/// Parse and check an endpoint URL from configuration.
pub(crate) fn parse_endpoint_url(
    registration: &WorkerRegistration,
    raw: &str,
) -> Result<reqwest::Url, ConfigurationError> {
    let url = reqwest::Url::parse(raw.trim_end_matches('/'))
        .map_err(|e| invalid(registration, format!("invalid url '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(
            registration,
            format!("url '{raw}' must use http or https"),
        ));
    }
    Ok(url)
}

/// HTTP client shared by the built-in workers.
pub(crate) fn http_client(
    registration: &WorkerRegistration,
    ssl_verify: bool,
) -> Result<reqwest::Client, ConfigurationError> {
    reqwest::Client::builder()
        .user_agent(concat!("berkshelf-api/", env!("CARGO_PKG_VERSION")))
        .danger_accept_invalid_certs(!ssl_verify)
        .connect_timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| invalid(registration, format!("failed to create HTTP client: {e}")))
}

/// Turn a non-success response into the matching [`SourceUnavailableError`].
pub(crate) fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, SourceUnavailableError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Err(SourceUnavailableError::Unauthorized { url, status })
    } else {
        Err(SourceUnavailableError::Status { url, status })
    }
}

/// Download location template with `{name}` and `{version}` placeholders.
///
/// The legacy positional form (`%s` for name, then `%s` for version) is also accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTemplate(String);

impl DownloadTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn render(&self, name: &str, version: &str) -> String {
        if self.0.contains("{name}") || self.0.contains("{version}") {
            return self.0.replace("{name}", name).replace("{version}", version);
        }
        let mut rendered = String::with_capacity(self.0.len() + name.len() + version.len());
        let mut values = [name, version].into_iter();
        let mut rest = self.0.as_str();
        while let Some(at) = rest.find("%s") {
            rendered.push_str(&rest[..at]);
            rendered.push_str(values.next().unwrap_or(""));
            rest = &rest[at + 2..];
        }
        rendered.push_str(rest);
        rendered
    }
}
