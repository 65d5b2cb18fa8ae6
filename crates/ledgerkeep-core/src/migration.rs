//! Legacy to composite-key migration.
//!
//! Records are read from the legacy (tenant-keyed) container in stable
//! insertion order, `batch_size` at a time from offset `skip`, and written to
//! the composite-keyed container. Each record ends in exactly one outcome:
//!
//! ```text
//! pending -> migrated | skipped_validation | skipped_duplicate | failed
//! ```
//!
//! A record's failure never aborts the batch. Re-running with the same `skip`
//! retries failures and skips what already landed, so batches are resumable
//! and disjoint ranges can run in parallel. Dry runs may read the target for
//! the duplicate check but never write to it.
//!
//! Every record outcome is logged under the `ledgerkeep::migration` target as
//! `record=<id> outcome=<outcome>`, followed by a summary block.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use serde_json::{Value, json};

use crate::canonical::fingerprint;
use crate::error::{LedgerError, Result, ValidationError};
use crate::partition::{IdentityFields, PartitionKey, PartitionPolicy, derive_key, parse_identifier};
use crate::store::{PartitionedStore, Query, QueryScope};

pub const LOG_TARGET: &str = "ledgerkeep::migration";

/// Body field holding provenance of a migrated record.
pub const PROVENANCE_FIELD: &str = "_migration_metadata";
pub const MIGRATION_VERSION: &str = "1.0";

/// Fields compared by [`MigrationCoordinator::verify_migration`] by default.
pub const DEFAULT_VERIFY_FIELDS: &[&str] = &["id", "space_id", "tenant_id", "user_id", "filename"];

const RULE: &str = "============================================================";

// ============================================================================
// Outcomes and statistics
// ============================================================================

/// Terminal state of one record within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Migrated,
    SkippedValidation,
    SkippedDuplicate,
    Failed,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Migrated => "migrated",
            RecordOutcome::SkippedValidation => "skipped_validation",
            RecordOutcome::SkippedDuplicate => "skipped_duplicate",
            RecordOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for RecordOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed record with its error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub record_id: String,
    pub error: String,
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Aggregate result of one batch. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStats {
    pub total: usize,
    /// Records written, or that would be written in a dry run.
    pub migrated: usize,
    pub skipped_validation: usize,
    pub skipped_duplicate: usize,
    pub failed: usize,
    /// First failures, bounded by `max_error_details`.
    pub errors: Vec<RecordFailure>,
    /// Failures beyond the bound.
    pub errors_omitted: usize,
    pub dry_run: bool,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl MigrationStats {
    fn new(dry_run: bool) -> Self {
        Self {
            total: 0,
            migrated: 0,
            skipped_validation: 0,
            skipped_duplicate: 0,
            failed: 0,
            errors: Vec::new(),
            errors_omitted: 0,
            dry_run,
            elapsed: Duration::ZERO,
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped_validation + self.skipped_duplicate
    }

    /// A batch succeeds when no record failed. Skips are not failures.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Migrated records per second, if any time elapsed.
    pub fn rate(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (secs > 0.0).then(|| self.migrated as f64 / secs)
    }

    fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Migrated => self.migrated += 1,
            RecordOutcome::SkippedValidation => self.skipped_validation += 1,
            RecordOutcome::SkippedDuplicate => self.skipped_duplicate += 1,
            RecordOutcome::Failed => self.failed += 1,
        }
    }

    fn record_failure(&mut self, record_id: &str, error: String, max_details: usize) {
        if self.errors.len() < max_details {
            self.errors.push(RecordFailure {
                record_id: record_id.to_string(),
                error,
            });
        } else {
            self.errors_omitted += 1;
        }
    }
}

impl fmt::Display for MigrationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{RULE}")?;
        if self.dry_run {
            writeln!(f, "MIGRATION REPORT (dry run, nothing written)")?;
        } else {
            writeln!(f, "MIGRATION REPORT")?;
        }
        writeln!(f, "{RULE}")?;
        writeln!(f, "Total records: {}", self.total)?;
        if self.dry_run {
            writeln!(f, "Would migrate: {}", self.migrated)?;
        } else {
            writeln!(f, "Migrated: {}", self.migrated)?;
        }
        writeln!(f, "Skipped (validation): {}", self.skipped_validation)?;
        writeln!(f, "Skipped (already migrated): {}", self.skipped_duplicate)?;
        writeln!(f, "Failed: {}", self.failed)?;
        writeln!(f, "Duration: {:.2} seconds", self.elapsed.as_secs_f64())?;
        match self.rate() {
            Some(rate) => writeln!(f, "Rate: {rate:.2} records/second")?,
            None => writeln!(f, "Rate: n/a")?,
        }
        if self.failed > 0 {
            writeln!(f, "Errors encountered: {}", self.failed)?;
            for e in &self.errors {
                writeln!(f, "  - {}: {}", e.record_id, e.error)?;
            }
            if self.errors_omitted > 0 {
                writeln!(f, "  ... and {} more errors", self.errors_omitted)?;
            }
        }
        write!(f, "{RULE}")
    }
}

// ============================================================================
// Verification results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationIssue {
    pub record_id: String,
    pub problem: String,
}

/// Structural comparison of a sample of source records with their targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationVerification {
    pub sampled: usize,
    pub verified: usize,
    pub errors: usize,
    /// First issues, bounded by `max_error_details`.
    pub issues: Vec<VerificationIssue>,
}

impl MigrationVerification {
    /// `(verified_count, error_count)`.
    pub fn counts(&self) -> (usize, usize) {
        (self.verified, self.errors)
    }

    pub fn is_success(&self) -> bool {
        self.errors == 0
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// One batch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationRequest {
    pub batch_size: usize,
    pub skip: usize,
    pub dry_run: bool,
    /// Overwrite records that already exist in the target.
    pub force: bool,
}

impl MigrationRequest {
    pub fn new(batch_size: usize, skip: usize) -> Self {
        Self {
            batch_size,
            skip,
            dry_run: false,
            force: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    pub source_container: String,
    pub target_container: String,
    pub max_error_details: usize,
    pub verify_fields: Vec<String>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            source_container: "documents".to_string(),
            target_container: "documents_hpk".to_string(),
            max_error_details: 10,
            verify_fields: DEFAULT_VERIFY_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

fn record_id(body: &Value) -> String {
    match body.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "unknown".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Composite key and canonical item id for a legacy record.
///
/// Names every missing or invalid field, the record id included.
pub fn target_address(body: &Value) -> std::result::Result<(PartitionKey, String), ValidationError> {
    let id = match body.get("id") {
        None | Some(Value::Null) => Err(None),
        Some(Value::String(s)) if s.trim().is_empty() => Err(None),
        Some(Value::String(s)) => parse_identifier(s).map_err(Some),
        Some(other) => parse_identifier(&other.to_string()).map_err(Some),
    };
    let key = derive_key(&IdentityFields::from_json(body), PartitionPolicy::Composite);

    match (id, key) {
        (Ok(id), Ok(key)) => Ok((key, id.to_string())),
        (id, key) => {
            let (mut missing, mut invalid) = match key {
                Err(ValidationError::Fields { missing, invalid }) => (missing, invalid),
                Err(other) => return Err(other),
                Ok(_) => (Vec::new(), Vec::new()),
            };
            match id {
                Err(None) => missing.insert(0, "id"),
                Err(Some(reason)) => invalid.insert(0, ("id", reason)),
                Ok(_) => {}
            }
            Err(ValidationError::Fields { missing, invalid })
        }
    }
}

/// Moves records from the legacy container into the composite-key container.
pub struct MigrationCoordinator {
    source: Arc<dyn PartitionedStore>,
    target: Arc<dyn PartitionedStore>,
    options: MigrationOptions,
}

impl MigrationCoordinator {
    pub fn new(
        source: Arc<dyn PartitionedStore>,
        target: Arc<dyn PartitionedStore>,
        options: MigrationOptions,
    ) -> Self {
        Self {
            source,
            target,
            options,
        }
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// Declare the target container with the composite policy.
    pub async fn prepare_target(&self) -> Result<()> {
        self.target
            .ensure_container(&self.options.target_container, PartitionPolicy::Composite)
            .await?;
        Ok(())
    }

    async fn read_source(&self, offset: usize, limit: usize) -> Result<Vec<Value>> {
        let query = Query::new().offset(offset).limit(limit);
        let items = self
            .source
            .query(&self.options.source_container, &query, &QueryScope::CrossPartition)
            .await?;
        Ok(items.into_iter().map(|item| item.body).collect())
    }

    /// Migrate one batch.
    ///
    /// Only a failure to read the batch itself is returned as an error;
    /// per-record problems are counted in the stats.
    pub async fn migrate_batch(&self, request: MigrationRequest) -> Result<MigrationStats> {
        let started = Instant::now();
        let mut stats = MigrationStats::new(request.dry_run);

        log::info!(
            target: LOG_TARGET,
            "starting migration from '{}' to '{}' (batch_size={}, skip={}, dry_run={}, force={})",
            self.options.source_container,
            self.options.target_container,
            request.batch_size,
            request.skip,
            request.dry_run,
            request.force
        );

        let records = self.read_source(request.skip, request.batch_size).await?;
        stats.total = records.len();

        for record in records {
            let id = record_id(&record);
            let (outcome, detail) = match self.migrate_record(record, &request).await {
                Ok(outcome) => (outcome, None),
                Err((outcome, detail)) => (outcome, Some(detail)),
            };
            stats.record(outcome);

            match (outcome, &detail) {
                (RecordOutcome::Failed, Some(detail)) => {
                    let error = LedgerError::MigrationRecord {
                        record_id: id.clone(),
                        details: detail.clone(),
                    };
                    log::error!(target: LOG_TARGET, "record={id} outcome={outcome} error={error}");
                    stats.record_failure(&id, detail.clone(), self.options.max_error_details);
                }
                (_, Some(detail)) => {
                    log::warn!(target: LOG_TARGET, "record={id} outcome={outcome} reason={detail}");
                }
                (_, None) if request.dry_run => {
                    log::info!(target: LOG_TARGET, "record={id} outcome={outcome} dry_run=true");
                }
                (_, None) => log::info!(target: LOG_TARGET, "record={id} outcome={outcome}"),
            }
        }

        stats.elapsed = started.elapsed();
        for line in stats.to_string().lines() {
            log::info!(target: LOG_TARGET, "{line}");
        }
        Ok(stats)
    }

    /// Walk one record through the state machine.
    ///
    /// `Err` carries a non-migrated outcome with its reason.
    async fn migrate_record(
        &self,
        mut record: Value,
        request: &MigrationRequest,
    ) -> std::result::Result<RecordOutcome, (RecordOutcome, String)> {
        let (key, id) =
            target_address(&record).map_err(|e| (RecordOutcome::SkippedValidation, e.to_string()))?;
        let target = &self.options.target_container;

        if !request.force {
            match self.target.read(target, &key, &id).await {
                Ok(_) => {
                    return Err((
                        RecordOutcome::SkippedDuplicate,
                        "already migrated".to_string(),
                    ));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err((RecordOutcome::Failed, format!("existence check failed: {e}")));
                }
            }
        }

        if request.dry_run {
            return Ok(RecordOutcome::Migrated);
        }

        let source_hash = fingerprint(&record);
        let Some(fields) = record.as_object_mut() else {
            return Err((
                RecordOutcome::SkippedValidation,
                "record is not a JSON object".to_string(),
            ));
        };
        fields.insert(
            PROVENANCE_FIELD.to_string(),
            json!({
                "migrated_at": crate::time::format(&crate::time::now()),
                "source_hash": source_hash,
                "migration_version": MIGRATION_VERSION,
            }),
        );

        self.target
            .upsert(target, &key, &id, &record)
            .await
            .map(|_| RecordOutcome::Migrated)
            .map_err(|e| (RecordOutcome::Failed, format!("write failed: {e}")))
    }

    /// Compare the first `sample_size` source records with their targets on
    /// the configured fields. A missing target or any difference is an error.
    pub async fn verify_migration(&self, sample_size: usize) -> Result<MigrationVerification> {
        log::info!(target: LOG_TARGET, "verifying migration (sample_size={sample_size})");
        let sample = self.read_source(0, sample_size).await?;
        let mut result = MigrationVerification {
            sampled: sample.len(),
            verified: 0,
            errors: 0,
            issues: Vec::new(),
        };

        for source in &sample {
            let id = record_id(source);
            match self.verify_record(source).await {
                Ok(()) => {
                    result.verified += 1;
                    log::debug!(target: LOG_TARGET, "record={id} verified");
                }
                Err(problem) => {
                    result.errors += 1;
                    log::error!(target: LOG_TARGET, "record={id} verification failed: {problem}");
                    if result.issues.len() < self.options.max_error_details {
                        result.issues.push(VerificationIssue {
                            record_id: id,
                            problem,
                        });
                    }
                }
            }
        }

        log::info!(
            target: LOG_TARGET,
            "verification complete: {} verified, {} errors",
            result.verified,
            result.errors
        );
        Ok(result)
    }

    async fn verify_record(&self, source: &Value) -> std::result::Result<(), String> {
        let (key, id) = target_address(source).map_err(|e| format!("not addressable: {e}"))?;
        let target = match self.target.read(&self.options.target_container, &key, &id).await {
            Ok(item) => item.body,
            Err(e) if e.is_not_found() => return Err("not found in target".to_string()),
            Err(e) => return Err(format!("read failed: {e}")),
        };
        for field in &self.options.verify_fields {
            if source.get(field) != target.get(field) {
                return Err(format!("mismatch in {field}"));
            }
        }
        Ok(())
    }
}
