//! Facade wiring configuration, store and services together for frontends.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Backend, Config, resolve_home};
use crate::error::{LedgerError, Result};
use crate::layout::{self, CATALOGUE, ContainerReport};
use crate::ledger::audit::{AuditArchive, AuditLedger};
use crate::ledger::interactions::InteractionLedger;
use crate::migration::MigrationCoordinator;
use crate::sequence::SequenceAllocator;
use crate::store::{MemoryStore, PartitionedStore, SqliteStore};

/// Options for [`Ledgerkeep::load_with_options`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Override the home directory.
    /// If `None`, uses `LEDGERKEEP_HOME` or `~/.ledgerkeep`.
    pub home: Option<PathBuf>,
}

/// Loaded configuration plus an open store.
pub struct Ledgerkeep {
    home: PathBuf,
    config: Config,
    store: Arc<dyn PartitionedStore>,
}

impl Ledgerkeep {
    pub fn load() -> Result<Self> {
        Self::load_with_options(LoadOptions::default())
    }

    /// Resolve the home directory, read `config.toml` and open the store.
    pub fn load_with_options(options: LoadOptions) -> Result<Self> {
        let home = resolve_home(options.home)?;
        fs::create_dir_all(&home).map_err(|e| {
            LedgerError::Config(format!("cannot create home {}: {e}", home.display()))
        })?;
        let config = Config::load(&home)?;
        let store = open_store(&home, &config)?;
        Ok(Self {
            home,
            config,
            store,
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PartitionedStore> {
        &self.store
    }

    pub fn migration(&self) -> MigrationCoordinator {
        MigrationCoordinator::new(
            self.store.clone(),
            self.store.clone(),
            self.config.migration.options(),
        )
    }

    pub fn audit(&self) -> AuditLedger {
        let sequence = &self.config.sequence;
        let allocator = SequenceAllocator::new(
            self.store.clone(),
            layout::AUDIT_COUNTERS,
            sequence.counter_id(),
            sequence.retry_policy(),
        );
        let ledger = AuditLedger::new(self.store.clone(), layout::AUDIT_LOGS, allocator)
            .with_predecessor_wait(self.config.audit.predecessor_wait());
        match self.config.audit.archive_dir(&self.home) {
            Some(dir) => ledger.with_archive(AuditArchive::new(dir)),
            None => ledger,
        }
    }

    pub fn interactions(&self) -> InteractionLedger {
        InteractionLedger::new(self.store.clone(), layout::AI_INTERACTIONS)
    }

    pub async fn verify_layout(&self) -> Result<Vec<ContainerReport>> {
        layout::verify_layout(self.store.as_ref(), CATALOGUE).await
    }

    pub async fn init_layout(&self) -> Result<Vec<ContainerReport>> {
        layout::init_layout(self.store.as_ref(), CATALOGUE).await
    }
}

/// Open the configured backend.
pub fn open_store(home: &Path, config: &Config) -> Result<Arc<dyn PartitionedStore>> {
    match config.store.backend() {
        Backend::Memory => {
            log::debug!("using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        Backend::Sqlite => {
            let path = config.store.path(home);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    LedgerError::Config(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
            log::debug!("opening sqlite store at {}", path.display());
            Ok(Arc::new(SqliteStore::open(&path, config.store.busy_timeout())?))
        }
    }
}
