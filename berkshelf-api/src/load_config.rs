/// `load_config` module: reads the YAML configuration file into the core [`Config`].
///
/// This is the only place untrusted YAML is parsed. JSON files are accepted as well since
/// JSON is valid YAML. Structural checks (`endpoints` present, non-zero durations) run here;
/// per-endpoint options are checked when the worker registry builds each endpoint.
///
/// # Errors
/// Failures are returned as `anyhow::Error` wrapping a [`ConfigurationError`], so the CLI
/// can print them and tests can downcast them.
use anyhow::Result;
use berkshelf_api_core::config::Config;
use berkshelf_api_core::error::ConfigurationError;
use std::fs;
use std::path::Path;
use tracing::{error, info};

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(ConfigurationError::Read {
                path: path_ref.to_path_buf(),
                source: e,
            }
            .into());
        }
    };

    let config: Config = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(ConfigurationError::Parse(e.to_string()).into());
        }
    };

    if let Err(e) = config.validate() {
        error!(error = %e, config_path = ?path_ref, "Invalid configuration");
        return Err(e.into());
    }
    Ok(config)
}
