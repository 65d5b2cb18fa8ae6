//! Append-only hash-chain engine.
//!
//! A [`ChainLedger`] stores records of one [`ChainRecord`] type in one
//! container. Each persisted [`ChainEntry`] carries the record plus a
//! [`ChainLink`]: its own content hash, its predecessor's hash and the
//! canonicalization version used. The first entry of every ordering domain
//! links to [`GENESIS_HASH`].
//!
//! Two ordering domains exist:
//!
//! - a single partition, ordered by a timestamp field (see [`interactions`]),
//! - the whole container, ordered by a global sequence number (see [`audit`]).
//!
//! The engine is the same for both; the domain is just the [`QueryScope`] used
//! to find the latest entry and to walk the chain during verification.
//!
//! Entries are written once with a strict create and never updated.
//! Verification is a pure read.

pub mod audit;
pub mod interactions;

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::canonical::{self, CURRENT_HASH_VERSION, CanonicalFields, FieldValue, GENESIS_HASH};
use crate::error::{LedgerError, Result};
use crate::partition::PartitionKey;
use crate::store::{PartitionedStore, Query, QueryScope, SortOrder, StoredItem};

// ============================================================================
// Records and entries
// ============================================================================

/// A record type that can be chained.
pub trait ChainRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Body field the chain is ordered by.
    const ORDER_FIELD: &'static str;

    /// Item id used in the store.
    fn storage_id(&self) -> String;

    /// Human-readable position used in verification messages,
    /// e.g. `sequence 12` or `interaction <uuid>`.
    fn position_label(&self) -> String;

    /// Value of [`Self::ORDER_FIELD`] as it enters the hash.
    fn ordering_value(&self) -> FieldValue;

    /// Hashed immutable fields for a canonicalization version.
    /// `None` if this record type has no field set for that version.
    fn canonical_fields(&self, version: u32) -> Option<CanonicalFields>;

    /// Domain-specific ordering rule between consecutive entries.
    fn check_successor(&self, _previous: Option<&Self>) -> std::result::Result<(), String> {
        Ok(())
    }
}

fn default_hash_version() -> u32 {
    1
}

/// Hash-chain fields attached to every persisted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub content_hash: String,
    pub previous_hash: String,
    #[serde(default = "default_hash_version")]
    pub hash_version: u32,
}

/// A persisted record together with its chain link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry<R> {
    #[serde(flatten)]
    pub record: R,
    #[serde(flatten)]
    pub link: ChainLink,
}

impl<R: ChainRecord> ChainEntry<R> {
    /// Recompute the content hash from the stored fields and stored link.
    /// `None` if the entry's hash version is unknown.
    pub fn recompute_hash(&self) -> Option<String> {
        compute_hash(&self.record, self.link.hash_version, &self.link.previous_hash)
    }
}

/// Content hash of `record` linked to `previous_hash`.
pub fn compute_hash<R: ChainRecord>(record: &R, version: u32, previous_hash: &str) -> Option<String> {
    let fields = record.canonical_fields(version)?;
    canonical::content_hash(version, &fields, &record.ordering_value(), previous_hash)
}

// ============================================================================
// Verification results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFailureKind {
    /// `previous_hash` does not match the predecessor's `content_hash`.
    ChainBroken,
    /// Stored `content_hash` does not match the recomputed hash.
    ContentMismatch,
    /// Domain ordering rule violated (sequence gap, duplicate, wrong genesis).
    OrderingViolation,
    UnsupportedVersion,
    /// The stored item does not decode as an entry.
    MalformedEntry,
}

/// First failure found by [`ChainLedger::verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainFailure {
    pub kind: ChainFailureKind,
    pub entry_id: String,
    pub position: String,
}

/// Result of walking a chain.
///
/// `message` is empty for a valid chain and pinpoints the first broken entry
/// otherwise. `count_checked` is the number of entries that passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub is_valid: bool,
    pub message: String,
    pub count_checked: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ChainFailure>,
}

impl ChainVerification {
    fn valid(count_checked: usize) -> Self {
        Self {
            is_valid: true,
            message: String::new(),
            count_checked,
            failure: None,
        }
    }

    fn invalid(count_checked: usize, failure: ChainFailure, message: String) -> Self {
        Self {
            is_valid: false,
            message,
            count_checked,
            failure: Some(failure),
        }
    }

    /// Turn an invalid result into [`LedgerError::ChainIntegrity`].
    pub fn into_result(self) -> Result<Self> {
        match &self.failure {
            Some(failure) if !self.is_valid => Err(LedgerError::ChainIntegrity {
                at: failure.position.clone(),
                details: self.message.clone(),
            }),
            _ => Ok(self),
        }
    }
}

// ============================================================================
// Ledger engine
// ============================================================================

/// Chain engine over one container.
pub struct ChainLedger<R> {
    store: Arc<dyn PartitionedStore>,
    container: String,
    _record: PhantomData<fn() -> R>,
}

impl<R: ChainRecord> ChainLedger<R> {
    pub fn new(store: Arc<dyn PartitionedStore>, container: impl Into<String>) -> Self {
        Self {
            store,
            container: container.into(),
            _record: PhantomData,
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn store(&self) -> &Arc<dyn PartitionedStore> {
        &self.store
    }

    fn decode(&self, item: &StoredItem) -> Result<ChainEntry<R>> {
        Ok(item.decode(&self.container)?)
    }

    /// Latest entry of a domain, always read fresh from the store.
    pub async fn latest(&self, domain: &QueryScope) -> Result<Option<ChainEntry<R>>> {
        let query = Query::new()
            .order_by(R::ORDER_FIELD, SortOrder::Descending)
            .limit(1);
        let items = self.store.query(&self.container, &query, domain).await?;
        items.first().map(|item| self.decode(item)).transpose()
    }

    /// Hash of the latest entry in `domain`, or `"genesis"` for an empty domain.
    pub async fn latest_hash(&self, domain: &QueryScope) -> Result<String> {
        Ok(self
            .latest(domain)
            .await?
            .map(|entry| entry.link.content_hash)
            .unwrap_or_else(|| GENESIS_HASH.to_string()))
    }

    /// Chain `record` onto the latest entry of `domain` and persist it at `key`.
    pub async fn append(
        &self,
        record: R,
        domain: &QueryScope,
        key: &PartitionKey,
    ) -> Result<ChainEntry<R>> {
        let previous_hash = self.latest_hash(domain).await?;
        self.append_linked(record, previous_hash, key).await
    }

    /// Persist `record` linked to an already chosen predecessor hash.
    ///
    /// The record's ordering value must be final: it is part of the hash.
    pub async fn append_linked(
        &self,
        record: R,
        previous_hash: String,
        key: &PartitionKey,
    ) -> Result<ChainEntry<R>> {
        let content_hash = compute_hash(&record, CURRENT_HASH_VERSION, &previous_hash).ok_or_else(
            || LedgerError::Config(format!("no canonical field set for hash version {CURRENT_HASH_VERSION}")),
        )?;
        let entry = ChainEntry {
            record,
            link: ChainLink {
                content_hash,
                previous_hash,
                hash_version: CURRENT_HASH_VERSION,
            },
        };
        let body = serde_json::to_value(&entry)?;
        let id = entry.record.storage_id();
        self.store.create(&self.container, key, &id, &body).await?;
        log::debug!(
            "appended {} to '{}' (previous {})",
            entry.record.position_label(),
            self.container,
            short(&entry.link.previous_hash)
        );
        Ok(entry)
    }

    /// Point read of one entry.
    pub async fn get(&self, key: &PartitionKey, id: &str) -> Result<ChainEntry<R>> {
        let item = self.store.read(&self.container, key, id).await?;
        self.decode(&item)
    }

    /// Decoded query results.
    pub async fn query(&self, query: &Query, scope: &QueryScope) -> Result<Vec<ChainEntry<R>>> {
        self.store
            .query(&self.container, query, scope)
            .await?
            .iter()
            .map(|item| self.decode(item))
            .collect()
    }

    /// Walk the oldest `limit` entries of `domain` and check every link.
    ///
    /// Store failures are returned as errors; a broken chain is a successful
    /// call returning an invalid [`ChainVerification`].
    pub async fn verify_chain(&self, domain: &QueryScope, limit: usize) -> Result<ChainVerification> {
        let query = Query::new()
            .order_by(R::ORDER_FIELD, SortOrder::Ascending)
            .limit(limit);
        let items = self.store.query(&self.container, &query, domain).await?;

        let mut expected = GENESIS_HASH.to_string();
        let mut previous: Option<R> = None;

        for (checked, item) in items.iter().enumerate() {
            let entry: ChainEntry<R> = match item.decode(&self.container) {
                Ok(entry) => entry,
                Err(e) => {
                    return Ok(self.fail(
                        checked,
                        ChainFailureKind::MalformedEntry,
                        item.id.clone(),
                        format!("item '{}'", item.id),
                        format!("Malformed entry '{}': {e}", item.id),
                    ));
                }
            };
            let label = entry.record.position_label();
            let entry_id = item.id.clone();

            if let Err(reason) = entry.record.check_successor(previous.as_ref()) {
                return Ok(self.fail(
                    checked,
                    ChainFailureKind::OrderingViolation,
                    entry_id,
                    label.clone(),
                    format!("Ordering violation at {label}: {reason}"),
                ));
            }

            if entry.link.previous_hash != expected {
                return Ok(self.fail(
                    checked,
                    ChainFailureKind::ChainBroken,
                    entry_id,
                    label.clone(),
                    format!(
                        "Hash chain broken at {label}: expected previous_hash='{expected}', got '{}'",
                        entry.link.previous_hash
                    ),
                ));
            }

            let Some(computed) = entry.recompute_hash() else {
                return Ok(self.fail(
                    checked,
                    ChainFailureKind::UnsupportedVersion,
                    entry_id,
                    label.clone(),
                    format!(
                        "Unsupported hash version {} at {label}",
                        entry.link.hash_version
                    ),
                ));
            };
            if computed != entry.link.content_hash {
                return Ok(self.fail(
                    checked,
                    ChainFailureKind::ContentMismatch,
                    entry_id,
                    label.clone(),
                    format!(
                        "Content hash mismatch at {label}: expected '{}', computed '{computed}'",
                        entry.link.content_hash
                    ),
                ));
            }

            expected = entry.link.content_hash;
            previous = Some(entry.record);
        }

        log::debug!("verified {} entries in '{}'", items.len(), self.container);
        Ok(ChainVerification::valid(items.len()))
    }

    fn fail(
        &self,
        checked: usize,
        kind: ChainFailureKind,
        entry_id: String,
        position: String,
        message: String,
    ) -> ChainVerification {
        log::warn!("chain verification failed in '{}': {message}", self.container);
        ChainVerification::invalid(
            checked,
            ChainFailure {
                kind,
                entry_id,
                position,
            },
            message,
        )
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
