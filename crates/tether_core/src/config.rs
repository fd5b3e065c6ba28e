//! JSON configuration for hosts embedding the core.
//!
//! # Responsibility
//! - Describe where the store lives, how to log, and which policy to load.
//! - Resolve file-relative paths against the config file's directory.
//!
//! # Invariants
//! - Every section is optional; an empty document is a valid config
//!   (in-memory store, build-mode log level, empty policy).
//! - Unknown keys are rejected.

use crate::db::{DbError, Store};
use crate::logging::{default_log_level, init_logging, normalize_level, LoggingError};
use crate::model::policy::{LifecyclePolicy, PolicyError};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite file; absent means an in-memory store.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    /// Absolute log directory; absent disables file logging.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub policy_path: Option<PathBuf>,
}

impl CoreConfig {
    /// Parses and validates a JSON document. Paths are kept as written.
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(source).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a config file; relative `database.path` and `policy_path` are
    /// resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
        let mut config = Self::from_json_str(&source)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(level) = self.logging.level.as_deref() {
            normalize_level(level)?;
        }
        if let Some(dir) = self.logging.dir.as_ref() {
            if !dir.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "logging.dir must be absolute, got `{}`",
                    dir.display()
                )));
            }
        }
        if self
            .database
            .path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            return Err(ConfigError::Invalid(
                "database.path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or(default_log_level())
    }

    /// Starts file logging when `logging.dir` is set.
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.logging.dir.as_ref() {
            Some(dir) => Ok(init_logging(self.log_level(), dir)?),
            None => Ok(()),
        }
    }

    /// Loads the configured policy, or an empty one.
    pub fn load_policy(&self) -> Result<LifecyclePolicy, ConfigError> {
        match self.policy_path.as_ref() {
            Some(path) => Ok(LifecyclePolicy::load(path)?),
            None => Ok(LifecyclePolicy::new()),
        }
    }

    /// Opens the configured store with migrations applied.
    pub fn open_store(&self) -> Result<Store, ConfigError> {
        let store = match self.database.path.as_ref() {
            Some(path) => Store::open(path)?,
            None => Store::open_in_memory()?,
        };
        Ok(store)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        for path in [self.database.path.as_mut(), self.policy_path.as_mut()]
            .into_iter()
            .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
    Logging(LoggingError),
    Policy(PolicyError),
    Db(DbError),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(message) => write!(f, "failed to read config: {message}"),
            Self::Parse(message) => write!(f, "failed to parse config: {message}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
            Self::Logging(err) => write!(f, "{err}"),
            Self::Policy(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Logging(err) => Some(err),
            Self::Policy(err) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LoggingError> for ConfigError {
    fn from(value: LoggingError) -> Self {
        Self::Logging(value)
    }
}

impl From<PolicyError> for ConfigError {
    fn from(value: PolicyError) -> Self {
        Self::Policy(value)
    }
}

impl From<DbError> for ConfigError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, CoreConfig};
    use std::path::{Path, PathBuf};

    #[test]
    fn empty_document_uses_defaults() {
        let config = CoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert!(config.database.path.is_none());
        assert!(config.load_policy().unwrap().cascades.is_empty());
    }

    #[test]
    fn rejects_unknown_keys_and_bad_levels() {
        assert!(matches!(
            CoreConfig::from_json_str(r#"{"databse": {}}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            CoreConfig::from_json_str(r#"{"logging": {"level": "loud"}}"#),
            Err(ConfigError::Logging(_))
        ));
        assert!(matches!(
            CoreConfig::from_json_str(r#"{"logging": {"dir": "relative/logs"}}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn relative_paths_resolve_against_config_directory() {
        let mut config = CoreConfig::from_json_str(
            r#"{"database": {"path": "data/tether.db"}, "policy_path": "/etc/tether/policy.json"}"#,
        )
        .unwrap();
        config.resolve_relative_to(Path::new("/srv/app"));
        assert_eq!(
            config.database.path,
            Some(PathBuf::from("/srv/app/data/tether.db"))
        );
        assert_eq!(
            config.policy_path,
            Some(PathBuf::from("/etc/tether/policy.json"))
        );
    }
}
