//! Election configuration management

use crate::candidate::{ElectionRoot, DEFAULT_CANDIDATE_PREFIX};
use crate::error::{ElectionError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main election configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Coordination service endpoints (`host:port`)
    pub endpoints: Vec<String>,

    /// Persistent node under which candidates register
    pub root_path: String,

    /// Name prefix of candidate entries, before the sequence suffix
    pub candidate_prefix: String,

    /// How many times an expired session is replaced before giving up
    pub max_session_recoveries: u32,

    /// Session timeout requested from the coordination service on connect.
    /// Bounds how long a crashed leader keeps its entry.
    pub session_timeout: Duration,

    /// Backoff for transient service failures
    pub retry: RetryConfig,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2181".to_string()],
            root_path: "/election".to_string(),
            session_timeout: Duration::from_secs(6),
            candidate_prefix: DEFAULT_CANDIDATE_PREFIX.to_string(),
            retry: RetryConfig::default(),
            max_session_recoveries: 3,
        }
    }
}

/// Exponential backoff settings for service calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_times: usize,

    /// Randomize delays so restarting candidates do not retry in lockstep
    pub jitter: bool,

    /// First delay between attempts
    pub min_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            max_times: 10,
            jitter: true,
        }
    }
}

impl ElectionConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(ElectionError::configuration(
                "At least one coordination endpoint is required",
            ));
        }

        if self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(ElectionError::configuration("Endpoints cannot be empty"));
        }

        self.root()?;

        if self.candidate_prefix.is_empty() || self.candidate_prefix.contains('/') {
            return Err(ElectionError::configuration(
                "Candidate prefix must be non-empty and contain no '/'",
            ));
        }

        if self.session_timeout < Duration::from_secs(1) {
            return Err(ElectionError::configuration(
                "Session timeout must be at least 1 second",
            ));
        }

        if self.retry.min_delay > self.retry.max_delay {
            return Err(ElectionError::configuration(
                "Retry min_delay cannot exceed max_delay",
            ));
        }

        Ok(())
    }

    /// Parsed election root
    pub fn root(&self) -> Result<ElectionRoot> {
        ElectionRoot::new(self.root_path.clone())
    }

    pub fn with_endpoints<I, T>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_root_path<T: Into<String>>(mut self, root_path: T) -> Self {
        self.root_path = root_path.into();
        self
    }

    pub fn with_session_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }

    pub fn with_candidate_prefix<T: Into<String>>(mut self, prefix: T) -> Self {
        self.candidate_prefix = prefix.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_session_recoveries(mut self, max: u32) -> Self {
        self.max_session_recoveries = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ElectionConfig::default();
        assert_eq!(config.root_path, "/election");
        assert_eq!(config.candidate_prefix, "candidate-");
        assert_eq!(config.session_timeout, Duration::from_secs(6));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ElectionConfig::default();

        config.endpoints = vec![];
        assert!(config.validate().is_err());

        config = ElectionConfig::default().with_root_path("relative/path");
        assert!(config.validate().is_err());

        config = ElectionConfig::default().with_candidate_prefix("a/b");
        assert!(config.validate().is_err());

        config = ElectionConfig::default().with_session_timeout(Duration::from_millis(10));
        assert!(config.validate().is_err());

        config = ElectionConfig::default().with_retry(RetryConfig {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(1),
            ..RetryConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = ElectionConfig::default()
            .with_endpoints(["zk1:2181", "zk2:2181", "zk3:2181"])
            .with_root_path("/chroot");
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: ElectionConfig = toml::from_str(&serialized).unwrap();

        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ElectionConfig = toml::from_str("root_path = \"/chroot\"").unwrap();
        assert_eq!(config.root_path, "/chroot");
        assert_eq!(config.endpoints, vec!["127.0.0.1:2181"]);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("election.toml");

        let config = ElectionConfig::default().with_max_session_recoveries(0);

        config.to_file(&config_path).unwrap();
        assert!(config_path.exists());

        let loaded_config = ElectionConfig::from_file(&config_path).unwrap();
        assert_eq!(config, loaded_config);

        std::fs::write(&config_path, "root_path = \"nope\"").unwrap();
        assert!(ElectionConfig::from_file(&config_path).is_err());
    }

    #[test]
    fn test_missing_config_file_is_io_error() {
        let temp_dir = tempdir().unwrap();

        let err = ElectionConfig::from_file(temp_dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ElectionError::Io(_)));

        let err = ElectionConfig::default()
            .to_file(temp_dir.path().join("no-such-dir").join("election.toml"))
            .unwrap_err();
        assert!(matches!(err, ElectionError::Io(_)));
    }
}
