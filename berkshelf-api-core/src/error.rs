//! Error taxonomy for the aggregation engine.
//!
//! Only [`ConfigurationError`] and escalated [`UnitCrash`]es are allowed to become
//! process-visible. Everything a single source or a single cookbook can produce is
//! contained by the worker actor or the cache builder and only logged.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Malformed or incomplete startup configuration. Fatal: the process does not start.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("endpoint #{index}: unknown worker type '{worker_type}'")]
    UnknownWorkerType { index: usize, worker_type: String },

    #[error("endpoint #{index} ({worker_type}): invalid options: {source}")]
    InvalidOptions {
        index: usize,
        worker_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("endpoint #{index} ({worker_type}): {reason}")]
    Invalid {
        index: usize,
        worker_type: String,
        reason: String,
    },
}

/// A worker could not reach, authenticate to, or understand its source during this cycle.
#[derive(Debug, Error)]
pub enum SourceUnavailableError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("authentication rejected by {url} (HTTP {status})")]
    Unauthorized {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("{url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("failed to sign request: {0}")]
    Signing(String),

    #[error("worker has been shut down")]
    Closed,
}

/// A specific cookbook version has no resolvable metadata at its source.
#[derive(Debug, Error)]
pub enum MetadataUnresolvedError {
    #[error("no metadata found for {name} ({version})")]
    NotFound { name: String, version: String },

    #[error("metadata for {name} ({version}) could not be parsed: {reason}")]
    Unparsable {
        name: String,
        version: String,
        reason: String,
    },

    #[error("source reference '{0}' is not usable by this worker")]
    BadSourceRef(String),

    #[error(transparent)]
    Source(#[from] SourceUnavailableError),
}

/// Rejection of a reported version string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("'{0}' is not a valid cookbook version")]
    Invalid(String),

    #[error("version {version} does not match reference '{reference}'")]
    Mismatch { reference: String, version: String },

    #[error("unversioned 0.0.0 is only accepted on the default branch, got '{reference}'")]
    SentinelOutsideDefault { reference: String },
}

/// Failure to load a previously saved universe.
#[derive(Debug, Error)]
pub enum PersistenceLoadError {
    #[error("save file not found: {0}")]
    SaveNotFound(PathBuf),

    #[error("invalid save file {path}: {source}")]
    InvalidSave {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("save file {path} is not a cookbook universe")]
    InvalidShape { path: PathBuf },

    #[error("failed to read save file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PersistenceLoadError {
    /// Both content failures count as "invalid save" for callers that only need the split.
    pub fn is_invalid_save(&self) -> bool {
        matches!(self, Self::InvalidSave { .. } | Self::InvalidShape { .. })
    }
}

#[derive(Debug, Error)]
pub enum PersistenceSaveError {
    #[error("failed to serialize universe: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write save file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A call into a worker actor that produced no answer.
#[derive(Debug, Error)]
pub enum WorkerCallError {
    #[error(transparent)]
    Unavailable(#[from] SourceUnavailableError),

    #[error("worker crashed while serving the request")]
    Crashed,

    #[error("worker is no longer running")]
    Stopped,
}

/// On-demand download and repackaging of a cookbook artifact.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("'{0}' cannot be used as an archive path component")]
    UnsafeName(String),

    #[error(transparent)]
    Source(#[from] SourceUnavailableError),

    #[error("download failed: {0}")]
    Download(String),

    #[error("worker call failed: {0}")]
    Worker(#[from] WorkerCallError),

    #[error("archive i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// A supervised unit kept failing faster than its restart policy allows.
#[derive(Debug, Clone, Error)]
#[error("unit '{unit}' crashed {restarts} times within {within:?}: {reason}")]
pub struct UnitCrash {
    pub unit: String,
    pub restarts: usize,
    pub within: Duration,
    pub reason: String,
}

/// Failures that stop the supervisor from (re)starting the group.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Boxed error returned by supervised unit bodies.
pub type UnitError = Box<dyn std::error::Error + Send + Sync>;
