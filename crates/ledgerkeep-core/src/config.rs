//! Configuration loaded from `config.toml` in the ledgerkeep home directory.
//!
//! Every field is optional. Effective values come from the getters, which
//! apply defaults and clamp nonsensical values (zero batch sizes, zero
//! timeouts) to a working minimum.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::migration::{DEFAULT_VERIFY_FIELDS, MigrationOptions};
use crate::sequence::RetryPolicy;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "LEDGERKEEP_HOME";
pub const CONFIG_FILE: &str = "config.toml";

const DEFAULT_DB_FILE: &str = "ledger.db";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_COUNTER_ID: &str = "audit_sequence";
const DEFAULT_BACKOFF_BASE_MS: u64 = 10;
const DEFAULT_BACKOFF_MAX_MS: u64 = 500;
const DEFAULT_MAX_TRANSIENT_RETRIES: u32 = 2;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_ERROR_DETAILS: usize = 10;
const DEFAULT_AUDIT_VERIFY_LIMIT: usize = 1000;
const DEFAULT_PREDECESSOR_WAIT_MS: u64 = 2_000;
const DEFAULT_INTERACTION_VERIFY_LIMIT: usize = 100;

/// Resolve the home directory.
///
/// Precedence:
/// 1. `home_override` (from the `--home` flag)
/// 2. `LEDGERKEEP_HOME` environment variable
/// 3. `~/.ledgerkeep`
pub fn resolve_home(home_override: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = home_override {
        return Ok(path);
    }
    if let Ok(home) = std::env::var(HOME_ENV)
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    dirs_next::home_dir()
        .map(|home| home.join(".ledgerkeep"))
        .ok_or_else(|| LedgerError::Config("home directory not found".to_string()))
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    /// Database file. Relative paths are resolved against the home directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_timeout_ms: Option<u64>,
}

impl StoreConfig {
    pub fn backend(&self) -> Backend {
        self.backend.unwrap_or_default()
    }

    pub fn path(&self, home: &Path) -> PathBuf {
        match &self.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => home.join(path),
            None => home.join(DEFAULT_DB_FILE),
        }
    }

    /// Enforces a minimum of 1ms.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS).max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_max_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_transient_retries: Option<u32>,
}

impl SequenceConfig {
    pub fn counter_id(&self) -> &str {
        self.counter_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(DEFAULT_COUNTER_ID)
    }

    /// The ceiling never drops below the base delay.
    pub fn retry_policy(&self) -> RetryPolicy {
        let base = self.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS).max(1);
        let max = self.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS).max(base);
        RetryPolicy {
            backoff_base: Duration::from_millis(base),
            backoff_max: Duration::from_millis(max),
            max_transient_retries: self
                .max_transient_retries
                .unwrap_or(DEFAULT_MAX_TRANSIENT_RETRIES),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_error_details: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_fields: Option<Vec<String>>,
}

impl MigrationConfig {
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1)
    }

    pub fn options(&self) -> MigrationOptions {
        let defaults = MigrationOptions::default();
        MigrationOptions {
            source_container: self
                .source_container
                .clone()
                .unwrap_or(defaults.source_container),
            target_container: self
                .target_container
                .clone()
                .unwrap_or(defaults.target_container),
            max_error_details: self.max_error_details.unwrap_or(DEFAULT_MAX_ERROR_DETAILS),
            verify_fields: match &self.verify_fields {
                Some(fields) if !fields.is_empty() => fields.clone(),
                _ => DEFAULT_VERIFY_FIELDS.iter().map(|f| f.to_string()).collect(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory for the write-once archive copy of every event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_limit: Option<usize>,
    /// How long an append waits for its predecessor before linking to the
    /// latest entry it can see.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor_wait_ms: Option<u64>,
}

impl AuditConfig {
    pub fn archive_dir(&self, home: &Path) -> Option<PathBuf> {
        self.archive_dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                home.join(dir)
            }
        })
    }

    #[inline]
    pub fn verify_limit(&self) -> usize {
        self.verify_limit.unwrap_or(DEFAULT_AUDIT_VERIFY_LIMIT).max(1)
    }

    pub fn predecessor_wait(&self) -> Duration {
        Duration::from_millis(self.predecessor_wait_ms.unwrap_or(DEFAULT_PREDECESSOR_WAIT_MS))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_limit: Option<usize>,
}

impl InteractionsConfig {
    #[inline]
    pub fn verify_limit(&self) -> usize {
        self.verify_limit
            .unwrap_or(DEFAULT_INTERACTION_VERIFY_LIMIT)
            .max(1)
    }
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub interactions: InteractionsConfig,
}

impl Config {
    /// Load `config.toml` from `home`, or defaults if the file is absent.
    pub fn load(home: &Path) -> Result<Self> {
        let path = home.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| LedgerError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| LedgerError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        let home = Path::new("/srv/ledger");
        assert_eq!(config.store.backend(), Backend::Sqlite);
        assert_eq!(config.store.path(home), home.join("ledger.db"));
        assert_eq!(config.sequence.counter_id(), "audit_sequence");
        assert_eq!(config.sequence.retry_policy(), RetryPolicy::default());
        assert_eq!(config.migration.batch_size(), 100);
        assert_eq!(config.migration.options(), MigrationOptions::default());
        assert_eq!(config.audit.verify_limit(), 1000);
        assert_eq!(config.audit.archive_dir(home), None);
        assert_eq!(config.interactions.verify_limit(), 100);
    }

    #[test]
    fn test_parse_sections() {
        let config = Config::parse(
            r#"
            [store]
            backend = "memory"
            path = "data/ledger.sqlite"
            busy_timeout_ms = 250

            [sequence]
            counter_id = "global"
            max_transient_retries = 5

            [migration]
            batch_size = 25
            verify_fields = ["id", "filename"]

            [audit]
            archive_dir = "/var/archive"
            "#,
        )
        .unwrap();
        let home = Path::new("/home/ops/.ledgerkeep");

        assert_eq!(config.store.backend(), Backend::Memory);
        assert_eq!(config.store.path(home), home.join("data/ledger.sqlite"));
        assert_eq!(config.store.busy_timeout(), Duration::from_millis(250));
        assert_eq!(config.sequence.counter_id(), "global");
        assert_eq!(config.sequence.retry_policy().max_transient_retries, 5);
        assert_eq!(config.migration.batch_size(), 25);
        assert_eq!(config.migration.options().verify_fields, vec!["id", "filename"]);
        assert_eq!(config.migration.options().source_container, "documents");
        assert_eq!(
            config.audit.archive_dir(home),
            Some(PathBuf::from("/var/archive"))
        );
    }

    #[test]
    fn test_getters_enforce_minimums() {
        let config = Config::parse(
            r#"
            [store]
            busy_timeout_ms = 0
            [sequence]
            backoff_base_ms = 0
            backoff_max_ms = 0
            [migration]
            batch_size = 0
            [interactions]
            verify_limit = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.store.busy_timeout(), Duration::from_millis(1));
        let retry = config.sequence.retry_policy();
        assert_eq!(retry.backoff_base, Duration::from_millis(1));
        assert!(retry.backoff_max >= retry.backoff_base);
        assert_eq!(config.migration.batch_size(), 1);
        assert_eq!(config.interactions.verify_limit(), 1);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(Config::load(tmp.path()).unwrap(), Config::default());
    }

    #[test]
    fn test_load_reports_bad_toml() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), "[store\nbackend = 1").unwrap();
        let err = Config::load(tmp.path()).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    #[serial]
    fn test_resolve_home_precedence() {
        // SAFETY: serialized with every other test touching the environment
        unsafe {
            std::env::set_var(HOME_ENV, "/from/env");
        }
        let flagged = resolve_home(Some(PathBuf::from("/from/flag"))).unwrap();
        let from_env = resolve_home(None).unwrap();
        unsafe {
            std::env::remove_var(HOME_ENV);
        }
        assert_eq!(flagged, PathBuf::from("/from/flag"));
        assert_eq!(from_env, PathBuf::from("/from/env"));
    }

    #[test]
    #[serial]
    fn test_resolve_home_default() {
        // SAFETY: serialized with every other test touching the environment
        unsafe {
            std::env::remove_var(HOME_ENV);
        }
        if let Some(home) = dirs_next::home_dir() {
            assert_eq!(resolve_home(None).unwrap(), home.join(".ledgerkeep"));
        }
    }
}
