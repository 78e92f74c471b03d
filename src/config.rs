use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifelogConfig {
    pub storage: StorageConfig,
    pub retrieval: RetrievalConfig,
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub default_owner: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Default number of nearest neighbors returned by search.
    pub default_k: usize,
    /// KNN candidates fetched per requested result before post-filtering.
    pub overfetch_factor: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Attempts per coordination step before transitioning to `failed`.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between retries.
    pub base_backoff_ms: u64,
    /// Timeout applied to each external embedding call.
    pub embed_timeout_ms: u64,
    /// Background worker poll interval.
    pub poll_interval_ms: u64,
}

impl Default for LifelogConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            retrieval: RetrievalConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_lifelog_dir()
            .join("lifelog.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            default_owner: "default".into(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: 10,
            overfetch_factor: 4,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 500,
            embed_timeout_ms: 30_000,
            poll_interval_ms: 1_000,
        }
    }
}

/// Returns `~/.lifelog/`
pub fn default_lifelog_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".lifelog")
}

/// Returns the default config file path: `~/.lifelog/config.toml`
pub fn default_config_path() -> PathBuf {
    default_lifelog_dir().join("config.toml")
}

impl LifelogConfig {
    /// Load from the default location, `~/.lifelog/config.toml`.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Read `path` if it exists, fall back to defaults otherwise. In either
    /// case `LIFELOG_DB` / `LIFELOG_OWNER` win over the file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file absent, using defaults");
                LifelogConfig::default()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", path.display()))
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LIFELOG_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("LIFELOG_OWNER") {
            self.storage.default_owner = val;
        }
    }

    /// Database path with `~` expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    // load_from reads LIFELOG_* vars, so tests touching the environment
    // must not interleave with the rest.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn missing_file_yields_defaults() {
        let _env = ENV_LOCK.lock().unwrap();
        let config = LifelogConfig::load_from("/nonexistent/lifelog/config.toml").unwrap();
        assert_eq!(config.storage.default_owner, "default");
        assert!(config.storage.db_path.ends_with("lifelog.db"));
        assert_eq!(config.retrieval.default_k, 10);
        assert_eq!(config.coordinator.max_attempts, 5);
    }

    #[test]
    fn partial_file_keeps_unset_sections_at_defaults() {
        let _env = ENV_LOCK.lock().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[coordinator]\nmax_attempts = 3\nbase_backoff_ms = 100\n\n\
             [storage]\ndefault_owner = \"alice\""
        )
        .unwrap();

        let config = LifelogConfig::load_from(file.path()).unwrap();
        assert_eq!(config.coordinator.max_attempts, 3);
        assert_eq!(config.coordinator.base_backoff_ms, 100);
        assert_eq!(config.storage.default_owner, "alice");
        // sections and fields the file never mentions keep their defaults
        assert_eq!(config.coordinator.embed_timeout_ms, 30_000);
        assert_eq!(config.retrieval.overfetch_factor, 4);
        assert!(config.storage.db_path.ends_with("lifelog.db"));
    }

    #[test]
    fn malformed_file_is_an_error_not_a_fallback() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage\ndb_path = broken").unwrap();
        assert!(LifelogConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn env_vars_win_over_defaults() {
        let _env = ENV_LOCK.lock().unwrap();
        std::env::set_var("LIFELOG_DB", "/tmp/override.db");
        std::env::set_var("LIFELOG_OWNER", "env-owner");
        let config = LifelogConfig::load_from("/nonexistent/lifelog/config.toml").unwrap();
        std::env::remove_var("LIFELOG_DB");
        std::env::remove_var("LIFELOG_OWNER");

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.storage.default_owner, "env-owner");
    }

    #[test]
    fn tilde_paths_resolve_under_home() {
        let expanded = expand_tilde("~/journal/lifelog.db");
        assert!(expanded.ends_with("journal/lifelog.db"));
        assert!(!expanded.to_string_lossy().contains('~'));

        assert_eq!(
            expand_tilde("/var/lib/lifelog.db"),
            PathBuf::from("/var/lib/lifelog.db")
        );
    }
}
