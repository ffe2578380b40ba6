//! Registry configuration.
//!
//! Settings come from an optional JSON file and are then overridden by
//! `ENTITIES_REGISTRY_*` environment variables:
//!
//! | Variable                            | Field             |
//! |-------------------------------------|-------------------|
//! | `ENTITIES_REGISTRY_BACKEND`         | `backend`         |
//! | `ENTITIES_REGISTRY_DATA_DIR`        | `data_dir`        |
//! | `ENTITIES_REGISTRY_SYNC_ON_WRITE`   | `sync_on_write`   |
//! | `ENTITIES_REGISTRY_MAX_WAL_SIZE`    | `max_wal_size`    |
//! | `ENTITIES_REGISTRY_COMPACT_ON_OPEN` | `compact_on_open` |
//! | `ENTITIES_REGISTRY_ACCESS_TOKEN`    | `access_token`    |

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::auth::{AccessVerifier, AllowAll, StaticTokenVerifier};
use crate::error::RegistryResult;
use crate::storage::memory::InMemoryEntityStore;
use crate::storage::EntityStore;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "ENTITIES_REGISTRY_";

/// Default log size that triggers compaction (64 MiB).
const DEFAULT_MAX_WAL_SIZE: u64 = 64 * 1024 * 1024;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("backend '{0}' is not available in this build")]
    BackendUnavailable(BackendKind),
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Storage technology behind the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local, lost on exit.
    #[default]
    Memory,
    /// Write-ahead logged files in `data_dir`.
    Persistent,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Persistent => "persistent",
        })
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "persistent" => Ok(Self::Persistent),
            other => Err(invalid(
                "backend",
                format!("expected 'memory' or 'persistent', got '{other}'"),
            )),
        }
    }
}

/// Settings given on the command line; they win over the file and the
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Replaces the configured backend.
    pub backend: Option<BackendKind>,
    /// Also selects the persistent backend unless `backend` is given.
    pub data_dir: Option<PathBuf>,
}

/// Registry settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Which backend [`open_store`] builds.
    pub backend: BackendKind,
    /// Data directory; required by the persistent backend.
    pub data_dir: Option<PathBuf>,
    /// Fsync after every log append.
    pub sync_on_write: bool,
    /// Log size in bytes that triggers compaction.
    pub max_wal_size: u64,
    /// Compact right after replaying a non-empty log.
    pub compact_on_open: bool,
    /// Bearer token required for writes. `None` allows every caller.
    pub access_token: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            data_dir: None,
            sync_on_write: true,
            max_wal_size: DEFAULT_MAX_WAL_SIZE,
            compact_on_open: false,
            access_token: None,
        }
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("backend", &self.backend)
            .field("data_dir", &self.data_dir)
            .field("sync_on_write", &self.sync_on_write)
            .field("max_wal_size", &self.max_wal_size)
            .field("compact_on_open", &self.compact_on_open)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(key, format!("expected a boolean, got '{other}'"))),
    }
}

impl RegistryConfig {
    /// Reads settings from a JSON file. Missing fields keep their defaults.
    ///
    /// # Errors
    /// Returns `Read` or `Parse` naming the file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `ENTITIES_REGISTRY_*` overrides from `vars`; other keys are ignored.
    ///
    /// # Errors
    /// Returns `InvalidValue` for a value that does not parse.
    pub fn with_env<I>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field {
                "BACKEND" => self.backend = value.parse()?,
                "DATA_DIR" => self.data_dir = Some(PathBuf::from(value)),
                "SYNC_ON_WRITE" => self.sync_on_write = parse_bool(&key, &value)?,
                "MAX_WAL_SIZE" => {
                    self.max_wal_size = value
                        .trim()
                        .parse()
                        .map_err(|e| invalid(&key, format!("{e}")))?;
                }
                "COMPACT_ON_OPEN" => self.compact_on_open = parse_bool(&key, &value)?,
                "ACCESS_TOKEN" => self.access_token = Some(value),
                _ => {}
            }
        }
        Ok(self)
    }

    /// Applies command-line settings on top of everything else.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(dir) = overrides.data_dir {
            self.data_dir = Some(dir);
            self.backend = BackendKind::Persistent;
        }
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }
        self
    }

    /// Loads the file (if given), then the process environment, then
    /// `overrides`, and validates the result once.
    ///
    /// # Errors
    /// Any error of [`Self::from_file`], [`Self::with_env`] or [`Self::validate`].
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.with_env(std::env::vars())?
            .with_overrides(overrides)
            .validate()
    }

    /// Returns true if nothing written survives the process.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.backend == BackendKind::Memory
    }

    /// Checks the settings against the chosen backend.
    ///
    /// # Errors
    /// - `BackendUnavailable` for `persistent` in a build without that feature
    /// - `InvalidValue` for a persistent backend without `data_dir`, a log limit
    ///   below the minimum, or an empty access token
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.access_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(invalid("access_token", "must not be empty"));
        }

        if self.backend == BackendKind::Persistent {
            #[cfg(not(feature = "persistent"))]
            return Err(ConfigError::BackendUnavailable(self.backend));

            #[cfg(feature = "persistent")]
            {
                if self.data_dir.is_none() {
                    return Err(invalid("data_dir", "required by the persistent backend"));
                }
                self.persistent_config().validate()?;
            }
        }
        Ok(self)
    }

    /// Persistent backend tuning derived from these settings.
    #[cfg(feature = "persistent")]
    #[must_use]
    pub fn persistent_config(&self) -> crate::storage::persistent::PersistentConfig {
        crate::storage::persistent::PersistentConfig {
            sync_on_write: self.sync_on_write,
            max_wal_size: self.max_wal_size,
            compact_on_open: self.compact_on_open,
        }
    }

    /// Builds the access verifier for writes.
    #[must_use]
    pub fn verifier(&self) -> Arc<dyn AccessVerifier> {
        match &self.access_token {
            Some(token) => Arc::new(StaticTokenVerifier::new(token.clone())),
            None => Arc::new(AllowAll),
        }
    }
}

/// Instantiates the configured backend.
///
/// # Errors
/// - `Config` if the settings do not validate
/// - `Storage` if the persistent store cannot be opened
pub fn open_store(config: &RegistryConfig) -> RegistryResult<Arc<dyn EntityStore>> {
    let config = config.clone().validate()?;

    let store: Arc<dyn EntityStore> = match config.backend {
        BackendKind::Memory => Arc::new(InMemoryEntityStore::new()),
        #[cfg(feature = "persistent")]
        BackendKind::Persistent => {
            let dir = config
                .data_dir
                .as_deref()
                .ok_or_else(|| invalid("data_dir", "required by the persistent backend"))?;
            Arc::new(crate::storage::persistent::open_database(
                dir,
                Some(config.persistent_config()),
            )?)
        }
        #[cfg(not(feature = "persistent"))]
        BackendKind::Persistent => {
            return Err(ConfigError::BackendUnavailable(config.backend).into())
        }
    };

    info!(backend = store.backend_name(), "opened entity store");
    Ok(store)
}
