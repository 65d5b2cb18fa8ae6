//! ledgerkeep-core: tamper-evident ledgers and partition-key migration.
//!
//! Provides hierarchical partition-key routing, a gap-free sequence
//! allocator, hash-chained interaction and audit ledgers, and the batch
//! migration from tenant-keyed to composite-keyed containers, all over a
//! pluggable [`PartitionedStore`].
//!
//! # Quick Start
//!
//! ```no_run
//! use ledgerkeep_core::Ledgerkeep;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let lk = Ledgerkeep::load()?;
//!     lk.init_layout().await?;
//!     let result = lk.audit().verify(1000).await?;
//!     println!("valid: {} ({} entries)", result.is_valid, result.count_checked);
//!     Ok(())
//! }
//! ```

pub mod canonical;
pub mod config;
pub mod error;
pub mod layout;
pub mod ledger;
mod ledgerkeep;
pub mod migration;
pub mod partition;
pub mod records;
pub mod sequence;
pub mod store;
pub mod time;

// Re-export the facade
pub use ledgerkeep::{Ledgerkeep, LoadOptions, open_store};

// Re-export commonly used types
pub use config::Config;
pub use error::{LedgerError, Result, StoreError, ValidationError};
pub use layout::{ContainerReport, ContainerStatus};
pub use ledger::audit::{AuditFilter, AuditLedger, RecordedEvent};
pub use ledger::interactions::InteractionLedger;
pub use ledger::{ChainEntry, ChainFailureKind, ChainVerification};
pub use migration::{MigrationCoordinator, MigrationRequest, MigrationStats, MigrationVerification};
pub use partition::{IdentityFields, PartitionKey, PartitionPolicy, ScopedQuery, derive_key, scoped_query_key};
pub use records::{AuditEvent, AuditSummary, Interaction};
pub use sequence::SequenceAllocator;
pub use store::{MemoryStore, PartitionedStore, QueryScope, SqliteStore};

#[cfg(test)]
pub(crate) mod test_support;
