//! On-disk universe snapshots ("dependency cache" files).
//!
//! The save format is the `/universe` payload. Loading is lenient per entry: individual
//! malformed entries are skipped, while a file that is not a JSON object is rejected.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{PersistenceLoadError, PersistenceSaveError};
use crate::model::{normalize_version, Universe, UniverseEntry};

/// File name of the save file inside `home_path`.
pub const SAVE_FILE: &str = "cerch";

pub fn load(path: &Path) -> Result<Universe, PersistenceLoadError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PersistenceLoadError::SaveNotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(PersistenceLoadError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let value: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|source| PersistenceLoadError::InvalidSave {
            path: path.to_path_buf(),
            source,
        })?;
    let serde_json::Value::Object(cookbooks) = value else {
        return Err(PersistenceLoadError::InvalidShape {
            path: path.to_path_buf(),
        });
    };

    let mut universe = Universe::new();
    for (name, versions) in cookbooks {
        let serde_json::Value::Object(versions) = versions else {
            warn!(path = %path.display(), cookbook = %name, "Skipping malformed save entry");
            continue;
        };
        for (raw_version, entry) in versions {
            let version = match normalize_version(&raw_version) {
                Ok(version) => version,
                Err(e) => {
                    warn!(path = %path.display(), cookbook = %name, error = %e, "Skipping saved version");
                    continue;
                }
            };
            match serde_json::from_value::<UniverseEntry>(entry) {
                Ok(entry) => universe.insert_entry(name.clone(), version, entry),
                Err(e) => {
                    warn!(path = %path.display(), cookbook = %name, version = %version, error = %e, "Skipping malformed save entry");
                }
            }
        }
    }
    info!(path = %path.display(), cookbooks = universe.len(), "Loaded saved universe");
    Ok(universe)
}

/// Write `universe` to `path` by way of a temporary file in the same directory.
pub fn save(path: &Path, universe: &Universe) -> Result<(), PersistenceSaveError> {
    let io_error = |source| PersistenceSaveError::Io {
        path: path.to_path_buf(),
        source,
    };
    let body = serde_json::to_vec(universe)?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_error)?;
    let mut file = NamedTempFile::new_in(dir).map_err(io_error)?;
    file.write_all(&body).map_err(io_error)?;
    file.as_file().sync_all().map_err(io_error)?;
    file.persist(path).map_err(|e| io_error(e.error))?;
    debug!(path = %path.display(), cookbooks = universe.len(), "Saved universe");
    Ok(())
}
