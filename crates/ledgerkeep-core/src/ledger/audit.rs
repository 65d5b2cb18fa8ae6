//! System-wide audit ledger.
//!
//! Every event draws a number from the [`SequenceAllocator`] before it is
//! hashed, lives in its own `/sequence_number` partition and links to the
//! entry holding the previous number. Writers that allocated `n` wait briefly
//! for `n - 1` to land so concurrent appends still form one chain; if it never
//! appears (its writer died after allocating) the event links to the latest
//! entry instead and verification reports the gap.
//!
//! Items are stored under their sequence number, so a reused number (a reset
//! counter) fails as a store conflict instead of creating a second entry.
//!
//! Appended entries can additionally be written to an archive directory as
//! `<sequence:010>.json`, created exclusively and never overwritten.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use uuid::Uuid;

use super::{ChainEntry, ChainLedger, ChainVerification};
use crate::canonical::GENESIS_HASH;
use crate::error::{LedgerError, Result, StoreError};
use crate::partition::PartitionKey;
use crate::records::{AuditEvent, AuditSummary};
use crate::sequence::SequenceAllocator;
use crate::store::{PartitionedStore, Query, QueryScope, SortOrder};

const PREDECESSOR_POLL: Duration = Duration::from_millis(5);
const PREDECESSOR_POLL_MAX: Duration = Duration::from_millis(100);

/// Write-once JSON copies of appended events.
#[derive(Debug, Clone)]
pub struct AuditArchive {
    dir: PathBuf,
}

impl AuditArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, sequence_number: u64) -> PathBuf {
        self.dir.join(format!("{sequence_number:010}.json"))
    }

    /// Write `entry` to its archive file. Fails with `AlreadyExists` rather
    /// than overwriting.
    pub async fn write(&self, entry: &ChainEntry<AuditEvent>) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(entry.record.sequence_number);
        let json = serde_json::to_vec_pretty(entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(&json).await?;
        file.flush().await?;
        Ok(path)
    }
}

/// What happened to the archive copy of an appended event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveStatus {
    Disabled,
    Written(PathBuf),
    /// The ledger entry is persisted; only the copy failed.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub entry: ChainEntry<AuditEvent>,
    pub archive: ArchiveStatus,
}

/// Optional equality filters for [`AuditLedger::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub space_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub event_category: Option<String>,
}

impl AuditFilter {
    fn apply(&self, mut query: Query) -> Query {
        if let Some(space_id) = self.space_id {
            query = query.filter("space_id", space_id.to_string());
        }
        if let Some(event_type) = &self.event_type {
            query = query.filter("event_type", event_type.as_str());
        }
        if let Some(category) = &self.event_category {
            query = query.filter("event_category", category.as_str());
        }
        query
    }
}

pub struct AuditLedger {
    chain: ChainLedger<AuditEvent>,
    allocator: SequenceAllocator,
    archive: Option<AuditArchive>,
    predecessor_wait: Duration,
}

impl AuditLedger {
    pub fn new(
        store: Arc<dyn PartitionedStore>,
        container: impl Into<String>,
        allocator: SequenceAllocator,
    ) -> Self {
        Self {
            chain: ChainLedger::new(store, container),
            allocator,
            archive: None,
            predecessor_wait: Duration::from_secs(2),
        }
    }

    pub fn with_archive(mut self, archive: AuditArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// How long a writer waits for the previous sequence number to land.
    pub fn with_predecessor_wait(mut self, wait: Duration) -> Self {
        self.predecessor_wait = wait;
        self
    }

    pub fn chain(&self) -> &ChainLedger<AuditEvent> {
        &self.chain
    }

    pub fn allocator(&self) -> &SequenceAllocator {
        &self.allocator
    }

    /// Number and append an event.
    pub async fn record(&self, mut event: AuditEvent) -> Result<RecordedEvent> {
        let sequence_number = self.allocator.next().await?;
        event.sequence_number = sequence_number;
        let previous_hash = self.predecessor_hash(sequence_number).await?;
        let entry = self
            .chain
            .append_linked(event, previous_hash, &PartitionKey::sequence(sequence_number))
            .await?;

        let archive = match &self.archive {
            None => ArchiveStatus::Disabled,
            Some(archive) => match archive.write(&entry).await {
                Ok(path) => ArchiveStatus::Written(path),
                Err(e) => {
                    log::error!("archive copy of sequence {sequence_number} failed: {e}");
                    ArchiveStatus::Failed(e.to_string())
                }
            },
        };
        Ok(RecordedEvent { entry, archive })
    }

    async fn predecessor_hash(&self, sequence_number: u64) -> Result<String> {
        if sequence_number <= 1 {
            return Ok(GENESIS_HASH.to_string());
        }
        let previous = sequence_number - 1;
        let deadline = Instant::now() + self.predecessor_wait;
        let mut delay = PREDECESSOR_POLL;

        loop {
            match self.get(previous).await {
                Ok(entry) => return Ok(entry.link.content_hash),
                Err(LedgerError::Store(StoreError::NotFound { .. })) if Instant::now() < deadline => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(PREDECESSOR_POLL_MAX);
                }
                Err(LedgerError::Store(StoreError::NotFound { .. })) => break,
                Err(e) => return Err(e),
            }
        }

        log::warn!(
            "sequence {previous} did not appear within {:?}; chaining {sequence_number} to the latest entry",
            self.predecessor_wait
        );
        self.chain.latest_hash(&QueryScope::CrossPartition).await
    }

    pub async fn get(&self, sequence_number: u64) -> Result<ChainEntry<AuditEvent>> {
        self.chain
            .get(
                &PartitionKey::sequence(sequence_number),
                &sequence_number.to_string(),
            )
            .await
    }

    /// Newest-first summaries matching `filter`.
    pub async fn list(
        &self,
        filter: &AuditFilter,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<AuditSummary>> {
        let query = filter
            .apply(Query::new())
            .order_by("sequence_number", SortOrder::Descending)
            .offset(skip)
            .limit(limit);
        let entries = self.chain.query(&query, &QueryScope::CrossPartition).await?;
        Ok(entries.iter().map(|e| AuditSummary::from(&e.record)).collect())
    }

    /// Verify the first `limit` entries from sequence 1.
    pub async fn verify(&self, limit: usize) -> Result<ChainVerification> {
        self.chain
            .verify_chain(&QueryScope::CrossPartition, limit)
            .await
    }

    /// Convenience for producers: record an event from its parts.
    pub async fn log_event(
        &self,
        event_type: &str,
        event_category: &str,
        event_data: Value,
        scope: (Option<Uuid>, Option<Uuid>, Option<Uuid>),
    ) -> Result<RecordedEvent> {
        let (space_id, tenant_id, user_id) = scope;
        self.record(
            AuditEvent::new(event_type, event_category, event_data)
                .with_scope(space_id, tenant_id, user_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ChainFailureKind;
    use crate::partition::PartitionPolicy;
    use crate::sequence::RetryPolicy;
    use crate::test_support::{FaultyStore, Op};
    use crate::store::MemoryStore;
    use serde_json::json;
    use tempfile::TempDir;

    const LOGS: &str = "audit_logs";
    const COUNTERS: &str = "audit_counters";

    async fn store() -> Arc<dyn PartitionedStore> {
        let store = MemoryStore::new();
        store
            .ensure_container(LOGS, PartitionPolicy::SequenceNumber)
            .await
            .unwrap();
        store
            .ensure_container(COUNTERS, PartitionPolicy::ItemId)
            .await
            .unwrap();
        Arc::new(store)
    }

    fn allocator(store: &Arc<dyn PartitionedStore>) -> SequenceAllocator {
        SequenceAllocator::new(
            store.clone(),
            COUNTERS,
            "audit_sequence",
            RetryPolicy {
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(5),
                max_transient_retries: 2,
            },
        )
    }

    async fn ledger() -> AuditLedger {
        let store = store().await;
        let allocator = allocator(&store);
        AuditLedger::new(store, LOGS, allocator).with_predecessor_wait(Duration::from_millis(20))
    }

    fn event(kind: &str) -> AuditEvent {
        AuditEvent::new(kind, "data", json!({"filename": "contract.pdf", "size_bytes": 1048576}))
    }

    async fn tamper(ledger: &AuditLedger, sequence: u64, field: &str, value: Value) {
        let store = ledger.chain().store();
        let key = PartitionKey::sequence(sequence);
        let id = sequence.to_string();
        let mut item = store.read(LOGS, &key, &id).await.unwrap();
        item.body[field] = value;
        store.upsert(LOGS, &key, &id, &item.body).await.unwrap();
    }

    #[tokio::test]
    async fn test_appends_are_numbered_and_chained() {
        let ledger = ledger().await;
        let first = ledger.record(event("document.uploaded")).await.unwrap().entry;
        let second = ledger.record(event("query.executed")).await.unwrap().entry;

        assert_eq!(first.record.sequence_number, 1);
        assert_eq!(first.link.previous_hash, GENESIS_HASH);
        assert_eq!(second.record.sequence_number, 2);
        assert_eq!(second.link.previous_hash, first.link.content_hash);

        let result = ledger.verify(100).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.message, "");
        assert_eq!(result.count_checked, 2);
    }

    #[tokio::test]
    async fn test_chain_is_global_across_scopes() {
        let ledger = ledger().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let first = ledger
            .log_event("user.login", "security", json!({}), (Some(a), None, None))
            .await
            .unwrap()
            .entry;
        let second = ledger
            .log_event("user.login", "security", json!({}), (Some(b), None, None))
            .await
            .unwrap()
            .entry;
        assert_eq!(second.link.previous_hash, first.link.content_hash);
    }

    #[tokio::test]
    async fn test_verify_respects_limit() {
        let ledger = ledger().await;
        for i in 0..10 {
            ledger.record(event(&format!("e{i}"))).await.unwrap();
        }
        let result = ledger.verify(4).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.count_checked, 4);
    }

    #[tokio::test]
    async fn test_tampered_event_data_is_detected() {
        let ledger = ledger().await;
        for i in 0..3 {
            ledger.record(event(&format!("e{i}"))).await.unwrap();
        }
        tamper(&ledger, 2, "event_data", json!({"filename": "other.pdf"})).await;
        let result = ledger.verify(100).await.unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.count_checked, 1);
        assert_eq!(
            result.message.split(':').next().unwrap(),
            "Content hash mismatch at sequence 2"
        );
    }

    #[tokio::test]
    async fn test_tampered_previous_hash_is_broken_link() {
        let ledger = ledger().await;
        let first = ledger.record(event("a")).await.unwrap().entry;
        ledger.record(event("b")).await.unwrap();
        tamper(&ledger, 2, "previous_hash", json!("bogus")).await;

        let result = ledger.verify(100).await.unwrap();
        assert_eq!(
            result.message,
            format!(
                "Hash chain broken at sequence 2: expected previous_hash='{}', got 'bogus'",
                first.link.content_hash
            )
        );
    }

    #[tokio::test]
    async fn test_gap_is_reported_after_predecessor_wait() {
        let ledger = ledger().await;
        ledger.record(event("a")).await.unwrap();
        // A writer that allocated 2 and died before appending
        assert_eq!(ledger.allocator().next().await.unwrap(), 2);
        let third = ledger.record(event("c")).await.unwrap().entry;
        assert_eq!(third.record.sequence_number, 3);

        let result = ledger.verify(100).await.unwrap();
        assert!(!result.is_valid);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, ChainFailureKind::OrderingViolation);
        assert_eq!(failure.position, "sequence 3");
    }

    #[tokio::test]
    async fn test_failed_append_burns_its_number() {
        let inner = store().await;
        let faulty = Arc::new(FaultyStore::new(inner.clone()));
        faulty.fail_id(Op::Create, "2");
        let faulty: Arc<dyn PartitionedStore> = faulty;
        let flaky = AuditLedger::new(faulty.clone(), LOGS, allocator(&faulty))
            .with_predecessor_wait(Duration::from_millis(20));

        flaky.record(event("a")).await.unwrap();
        let err = flaky.record(event("b")).await.unwrap_err();
        assert!(err.is_transient());

        let healthy = AuditLedger::new(inner.clone(), LOGS, allocator(&inner))
            .with_predecessor_wait(Duration::from_millis(20));
        let third = healthy.record(event("c")).await.unwrap().entry;
        assert_eq!(third.record.sequence_number, 3);

        let result = healthy.verify(100).await.unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.count_checked, 1);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, ChainFailureKind::OrderingViolation);
        assert_eq!(failure.position, "sequence 3");
        assert!(result.message.contains("expected sequence 2"), "{}", result.message);
    }

    #[tokio::test]
    async fn test_reset_counter_cannot_reuse_numbers() {
        let store = store().await;
        let ledger = AuditLedger::new(store.clone(), LOGS, allocator(&store));
        ledger.record(event("a")).await.unwrap();

        // Operator resets the counter: sequence 1 comes back
        let fresh = AuditLedger::new(store.clone(), LOGS, SequenceAllocator::new(
            store.clone(),
            COUNTERS,
            "another_counter",
            RetryPolicy::default(),
        ));
        let err = fresh.record(event("b")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Store(StoreError::Conflict { .. })));
        assert!(ledger.verify(100).await.unwrap().is_valid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_form_one_chain() {
        let store = store().await;
        let mut handles = Vec::new();
        for w in 0..4 {
            let ledger = AuditLedger::new(store.clone(), LOGS, allocator(&store));
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    ledger.record(event(&format!("w{w}-{i}"))).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let ledger = AuditLedger::new(store.clone(), LOGS, allocator(&store));
        let result = ledger.verify(1000).await.unwrap();
        assert!(result.is_valid, "{}", result.message);
        assert_eq!(result.count_checked, 40);
    }

    #[tokio::test]
    async fn test_list_filters_newest_first() {
        let ledger = ledger().await;
        ledger.record(event("document.uploaded")).await.unwrap();
        ledger.record(event("query.executed")).await.unwrap();
        ledger.record(event("document.uploaded")).await.unwrap();

        let filter = AuditFilter {
            event_type: Some("document.uploaded".into()),
            ..AuditFilter::default()
        };
        let listed = ledger.list(&filter, 0, 10).await.unwrap();
        let seqs: Vec<u64> = listed.iter().map(|s| s.sequence_number).collect();
        assert_eq!(seqs, vec![3, 1]);

        let page = ledger.list(&AuditFilter::default(), 1, 1).await.unwrap();
        assert_eq!(page[0].sequence_number, 2);
    }

    #[tokio::test]
    async fn test_archive_is_write_once() {
        let dir = TempDir::new().unwrap();
        let archive = AuditArchive::new(dir.path().join("archive"));
        let ledger = ledger().await.with_archive(archive.clone());

        let recorded = ledger.record(event("a")).await.unwrap();
        let path = archive.path_for(1);
        assert_eq!(recorded.archive, ArchiveStatus::Written(path.clone()));
        assert!(path.ends_with("0000000001.json"));
        let copy: ChainEntry<AuditEvent> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(copy, recorded.entry);

        // A stale file for the next number is never overwritten
        std::fs::write(archive.path_for(2), b"stale").unwrap();
        let recorded = ledger.record(event("b")).await.unwrap();
        assert!(matches!(recorded.archive, ArchiveStatus::Failed(_)));
        assert_eq!(std::fs::read(archive.path_for(2)).unwrap(), b"stale");
        assert!(ledger.get(2).await.is_ok());
    }
}
