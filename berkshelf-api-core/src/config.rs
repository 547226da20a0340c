use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigurationError;
use crate::persistence::SAVE_FILE;

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding the save file and the cookbook archive cache.
    #[serde(default = "default_home_path")]
    pub home_path: PathBuf,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_build_interval_secs")]
    pub build_interval_secs: u64,
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub save_snapshots: bool,
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Ordered source descriptors. Order is registration order.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// One configured source: a worker type tag plus its type-specific options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    #[serde(rename = "type")]
    pub worker_type: String,
    /// Lower value wins. Defaults to the registration index.
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// How many restarts a supervised unit may take inside a sliding window before escalating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartPolicy {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,
    #[serde(default = "default_restart_window_secs")]
    pub within_secs: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            within_secs: default_restart_window_secs(),
        }
    }
}

impl RestartPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.within_secs)
    }
}

/// A worker registration derived from an [`EndpointConfig`]: lives for the process lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRegistration {
    /// Zero-based position in `endpoints`; breaks priority ties.
    pub index: usize,
    pub worker_type: String,
    pub priority: i64,
    pub options: serde_json::Value,
}

fn default_home_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "berkshelf-api")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".berkshelf-api"))
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    26200
}

fn default_build_interval_secs() -> u64 {
    300
}

fn default_worker_timeout_secs() -> u64 {
    60
}

fn default_cycle_timeout_secs() -> u64 {
    600
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> usize {
    3
}

fn default_restart_window_secs() -> u64 {
    60
}

impl Config {
    /// A configuration with every default and the given endpoints.
    pub fn with_endpoints(endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            home_path: default_home_path(),
            host: default_host(),
            port: default_port(),
            build_interval_secs: default_build_interval_secs(),
            worker_timeout_secs: default_worker_timeout_secs(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            save_snapshots: true,
            restart: RestartPolicy::default(),
            endpoints,
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            home_path = %self.home_path.display(),
            listen = %self.listen_addr(),
            endpoints = self.endpoints.len(),
            build_interval_secs = self.build_interval_secs,
            "Loaded Config"
        );
        for endpoint in &self.endpoints {
            debug!(
                worker_type = %endpoint.worker_type,
                priority = ?endpoint.priority,
                "Configured endpoint"
            );
        }
    }

    /// Structural checks that do not need a worker registry.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.endpoints.is_empty() {
            return Err(ConfigurationError::NoEndpoints);
        }
        let durations = [
            ("build_interval_secs", self.build_interval_secs),
            ("worker_timeout_secs", self.worker_timeout_secs),
            ("cycle_timeout_secs", self.cycle_timeout_secs),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs),
            ("restart.within_secs", self.restart.within_secs),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(ConfigurationError::ZeroDuration { field });
            }
        }
        Ok(())
    }

    /// Registrations in configuration order.
    ///
    /// A priority may be given on the descriptor or as `options.priority`; the descriptor wins.
    pub fn registrations(&self) -> Result<Vec<WorkerRegistration>, ConfigurationError> {
        self.endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                let mut options = match &endpoint.options {
                    serde_json::Value::Null => serde_json::Value::Object(Default::default()),
                    serde_json::Value::Object(map) => serde_json::Value::Object(map.clone()),
                    _ => {
                        return Err(ConfigurationError::Invalid {
                            index,
                            worker_type: endpoint.worker_type.clone(),
                            reason: "options must be a mapping".to_string(),
                        })
                    }
                };
                let option_priority = match options
                    .as_object_mut()
                    .and_then(|map| map.remove("priority"))
                {
                    None | Some(serde_json::Value::Null) => None,
                    Some(value) => Some(value.as_i64().ok_or_else(|| {
                        ConfigurationError::Invalid {
                            index,
                            worker_type: endpoint.worker_type.clone(),
                            reason: "priority must be an integer".to_string(),
                        }
                    })?),
                };
                let priority = endpoint
                    .priority
                    .or(option_priority)
                    .unwrap_or(index as i64);
                Ok(WorkerRegistration {
                    index,
                    worker_type: endpoint.worker_type.clone(),
                    priority,
                    options,
                })
            })
            .collect()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn save_path(&self) -> Option<PathBuf> {
        self.save_snapshots.then(|| self.home_path.join(SAVE_FILE))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.home_path.join("archives")
    }

    pub fn build_interval(&self) -> Duration {
        Duration::from_secs(self.build_interval_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
