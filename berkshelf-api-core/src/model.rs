//! Data model shared by workers, the cache pipeline and the gateway.
//!
//! - [`RemoteCookbook`]: one (name, version) report from one source. Immutable.
//! - [`Metadata`]: dependency and platform constraints for one version.
//! - [`Universe`]: the aggregated `name -> version -> entry` index, serialised as the
//!   `/universe` payload and as the on-disk save file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::VersionError;

/// Sentinel version for an unversioned cookbook living on the default branch.
pub const UNVERSIONED: &str = "0.0.0";

/// Constraint used when metadata names a dependency or platform without one.
pub const DEFAULT_CONSTRAINT: &str = ">= 0.0.0";

/// How a client should fetch the cookbook artifact. Both built-in sources hand out URIs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    #[default]
    Uri,
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationType::Uri => f.write_str("uri"),
        }
    }
}

/// Identity of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CookbookKey {
    pub name: String,
    pub version: String,
}

impl CookbookKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for CookbookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.version)
    }
}

/// One discovered cookbook version, as reported by a single worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCookbook {
    name: String,
    version: String,
    location_type: LocationType,
    location_path: String,
    priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_ref: Option<String>,
}

impl RemoteCookbook {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        location_type: LocationType,
        location_path: impl Into<String>,
        priority: i64,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            location_type,
            location_path: location_path.into(),
            priority,
            source_ref: None,
        }
    }

    /// Attach the source-specific identifier the owning worker uses to refetch.
    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn location_type(&self) -> LocationType {
        self.location_type
    }

    pub fn location_path(&self) -> &str {
        &self.location_path
    }

    /// Lower value means higher precedence.
    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn source_ref(&self) -> Option<&str> {
        self.source_ref.as_deref()
    }

    pub fn key(&self) -> CookbookKey {
        CookbookKey::new(&self.name, &self.version)
    }

    pub fn is_unversioned(&self) -> bool {
        self.version == UNVERSIONED
    }
}

/// Descriptive record for one cookbook version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub platforms: BTreeMap<String, String>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty() && self.platforms.is_empty()
    }
}

/// One `name/version` entry of the published universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseEntry {
    #[serde(default)]
    pub location_type: LocationType,
    #[serde(default)]
    pub location_path: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub platforms: BTreeMap<String, String>,
}

impl UniverseEntry {
    pub fn new(remote: &RemoteCookbook, metadata: Metadata) -> Self {
        Self {
            location_type: remote.location_type(),
            location_path: remote.location_path().to_string(),
            dependencies: metadata.dependencies,
            platforms: metadata.platforms,
        }
    }

    pub fn metadata(&self) -> Metadata {
        Metadata {
            dependencies: self.dependencies.clone(),
            platforms: self.platforms.clone(),
        }
    }

    /// True when `remote` points at the same artifact this entry was built from.
    pub fn same_location(&self, remote: &RemoteCookbook) -> bool {
        self.location_type == remote.location_type() && self.location_path == remote.location_path()
    }
}

/// Aggregated index: package name to version to entry. Never mutated once published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Universe {
    cookbooks: BTreeMap<String, BTreeMap<String, UniverseEntry>>,
}

impl Universe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `remote`'s (name, version).
    pub fn insert(&mut self, remote: &RemoteCookbook, metadata: Metadata) {
        self.insert_entry(
            remote.name().to_string(),
            remote.version().to_string(),
            UniverseEntry::new(remote, metadata),
        );
    }

    pub fn insert_entry(&mut self, name: String, version: String, entry: UniverseEntry) {
        self.cookbooks.entry(name).or_default().insert(version, entry);
    }

    pub fn get(&self, name: &str, version: &str) -> Option<&UniverseEntry> {
        self.cookbooks.get(name).and_then(|versions| versions.get(version))
    }

    pub fn versions(&self, name: &str) -> Option<&BTreeMap<String, UniverseEntry>> {
        self.cookbooks.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cookbooks.keys().map(String::as_str)
    }

    /// Iterate over every `(name, version, entry)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &UniverseEntry)> {
        self.cookbooks.iter().flat_map(|(name, versions)| {
            versions
                .iter()
                .map(move |(version, entry)| (name.as_str(), version.as_str(), entry))
        })
    }

    /// Number of cookbook versions in the index.
    pub fn len(&self) -> usize {
        self.cookbooks.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cookbooks.is_empty()
    }

    /// The index as RemoteCookbook records, in name/version order.
    pub fn cookbooks(&self) -> Vec<RemoteCookbook> {
        self.iter()
            .map(|(name, version, entry)| {
                RemoteCookbook::new(
                    name,
                    version,
                    entry.location_type,
                    entry.location_path.clone(),
                    0,
                )
            })
            .collect()
    }
}

/// Whether `name` can be used as a single path component of the archive cache.
///
/// Names come from remote metadata and listings, so separators, `.`/`..` and NUL are refused.
pub fn is_valid_cookbook_name(name: &str) -> bool {
    if name.contains(['/', '\\', '\0']) || name.contains("..") {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Parse a cookbook version (`X.Y` or `X.Y.Z`) and return it normalised to `X.Y.Z`.
///
/// Pre-release and build suffixes are not valid cookbook versions.
pub fn normalize_version(raw: &str) -> Result<String, VersionError> {
    let trimmed = raw.trim();
    let components = trimmed.split('.').count();
    let padded = match components {
        2 => format!("{trimmed}.0"),
        3 => trimmed.to_string(),
        _ => return Err(VersionError::Invalid(raw.to_string())),
    };
    let version =
        semver::Version::parse(&padded).map_err(|_| VersionError::Invalid(raw.to_string()))?;
    if !version.pre.is_empty() || !version.build.is_empty() {
        return Err(VersionError::Invalid(raw.to_string()));
    }
    Ok(version.to_string())
}

/// Check a version declared in metadata against the git reference it was read from.
///
/// The `0.0.0` sentinel is only accepted on `default_branch`; any other version, once
/// normalised, must equal the reference exactly. Returns the normalised version.
pub fn accept_version_for_ref(
    reference: &str,
    declared: &str,
    default_branch: &str,
) -> Result<String, VersionError> {
    let version = normalize_version(declared)?;
    if version == UNVERSIONED {
        return if reference == default_branch {
            Ok(version)
        } else {
            Err(VersionError::SentinelOutsideDefault {
                reference: reference.to_string(),
            })
        };
    }
    if version == reference {
        Ok(version)
    } else {
        Err(VersionError::Mismatch {
            reference: reference.to_string(),
            version,
        })
    }
}
