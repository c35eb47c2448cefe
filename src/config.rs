use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::content::FingerprintPolicy;
use crate::core::Value;
use crate::error::ConfigError;

pub const ENV_TOKEN_COUNT: &str = "TSUMIKI_TOKEN_COUNT";
pub const ENV_WORKER_THREADS: &str = "TSUMIKI_WORKER_THREADS";

/// Engine configuration.
///
/// Paths in `build_directory` are in the namespace of the content provider the
/// engine was created with; `database_path` is a path on the local disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the computation token pool. Defaults to one and a half
    /// times the available parallelism, but at least 2.
    pub token_count: Option<usize>,
    /// Upper bound of worker threads which are not parked at the same time.
    pub worker_threads: Option<usize>,
    /// Output files of abandoned tasks are only deleted inside this directory.
    pub build_directory: Utf8PathBuf,
    pub database_path: Option<Utf8PathBuf>,
    pub fingerprint: FingerprintPolicy,
    pub environment_name: String,
    /// Added on top of the detected properties of the local machine.
    pub environment_properties: BTreeMap<String, Value>,
    /// Whether the task database is written to disk after each execution.
    pub persist: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            token_count: None,
            worker_threads: None,
            build_directory: Utf8PathBuf::from("build"),
            database_path: None,
            fingerprint: FingerprintPolicy::default(),
            environment_name: "local".to_owned(),
            environment_properties: BTreeMap::new(),
            persist: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Applies `TSUMIKI_TOKEN_COUNT` and `TSUMIKI_WORKER_THREADS`.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(count) = read_override(ENV_TOKEN_COUNT)? {
            self.token_count = Some(count);
        }
        if let Some(count) = read_override(ENV_WORKER_THREADS)? {
            self.worker_threads = Some(count);
        }
        Ok(self)
    }

    pub fn with_token_count(mut self, count: usize) -> Self {
        self.token_count = Some(count);
        self
    }

    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    pub fn with_build_directory(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.build_directory = path.into();
        self
    }

    pub fn with_database_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_fingerprint(mut self, policy: FingerprintPolicy) -> Self {
        self.fingerprint = policy;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.environment_properties.insert(key.into(), value);
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub(crate) fn token_capacity(&self) -> usize {
        match self.token_count {
            Some(count) => count.max(1),
            None => (available_parallelism() * 3 / 2).max(2),
        }
    }

    pub(crate) fn worker_limit(&self) -> usize {
        match self.worker_threads {
            Some(count) => count.max(1),
            None => (available_parallelism() * 2).max(4),
        }
    }

    pub(crate) fn database_file(&self) -> Utf8PathBuf {
        match &self.database_path {
            Some(path) => path.clone(),
            None => self.build_directory.join(".tsumiki").join("tasks.db"),
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn read_override(name: &'static str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|&n| n > 0)
            .map(Some)
            .ok_or(ConfigError::InvalidOverride { name, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.token_capacity() >= 2);
        assert!(config.persist);
        assert_eq!(config.database_file(), Utf8PathBuf::from("build/.tsumiki/tasks.db"));
    }

    #[test]
    fn test_from_json() {
        let config = EngineConfig::from_json_str(
            r#"{
                "token_count": 3,
                "build_directory": "out",
                "fingerprint": "attributes",
                "environment_properties": { "gpu": true }
            }"#,
        )
        .unwrap();

        assert_eq!(config.token_capacity(), 3);
        assert_eq!(config.build_directory, Utf8PathBuf::from("out"));
        assert_eq!(config.fingerprint, FingerprintPolicy::Attributes);
        assert_eq!(config.environment_properties.get("gpu"), Some(&Value::Bool(true)));
        assert_eq!(config.environment_name, "local");
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            EngineConfig::from_json_str("{ \"token_count\": \"many\" }"),
            Err(ConfigError::Parse(_))
        ));
    }
}
