//! Well-known containers and their partitioning policies.

use serde::Serialize;

use crate::error::Result;
use crate::partition::PartitionPolicy;
use crate::store::PartitionedStore;

pub const DOCUMENTS: &str = "documents";
pub const DOCUMENTS_HPK: &str = "documents_hpk";
pub const CHUNKS: &str = "chunks";
pub const AI_INTERACTIONS: &str = "ai_interactions";
pub const AUDIT_LOGS: &str = "audit_logs";
pub const AUDIT_COUNTERS: &str = "audit_counters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: &'static str,
    pub policy: PartitionPolicy,
}

/// Every container a deployment is expected to have.
pub const CATALOGUE: &[ContainerSpec] = &[
    ContainerSpec {
        name: DOCUMENTS,
        policy: PartitionPolicy::LegacySingle,
    },
    ContainerSpec {
        name: DOCUMENTS_HPK,
        policy: PartitionPolicy::Composite,
    },
    ContainerSpec {
        name: CHUNKS,
        policy: PartitionPolicy::Composite,
    },
    ContainerSpec {
        name: AI_INTERACTIONS,
        policy: PartitionPolicy::Composite,
    },
    ContainerSpec {
        name: AUDIT_LOGS,
        policy: PartitionPolicy::SequenceNumber,
    },
    ContainerSpec {
        name: AUDIT_COUNTERS,
        policy: PartitionPolicy::ItemId,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContainerStatus {
    Ok,
    Mismatch { actual: PartitionPolicy },
    Missing,
}

impl ContainerStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ContainerStatus::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerReport {
    pub name: String,
    pub expected: PartitionPolicy,
    #[serde(flatten)]
    pub status: ContainerStatus,
}

/// Compare each catalogue entry with what the store has declared.
pub async fn verify_layout(
    store: &dyn PartitionedStore,
    catalogue: &[ContainerSpec],
) -> Result<Vec<ContainerReport>> {
    let mut reports = Vec::with_capacity(catalogue.len());
    for spec in catalogue {
        let status = match store.container_policy(spec.name).await? {
            Some(actual) if actual == spec.policy => ContainerStatus::Ok,
            Some(actual) => ContainerStatus::Mismatch { actual },
            None => ContainerStatus::Missing,
        };
        if !status.is_ok() {
            log::warn!("container '{}' is {status:?}, expected '{}'", spec.name, spec.policy);
        }
        reports.push(ContainerReport {
            name: spec.name.to_string(),
            expected: spec.policy,
            status,
        });
    }
    Ok(reports)
}

/// Declare every missing container, then report the resulting layout.
///
/// Mismatched containers are left alone; they still report as mismatches.
pub async fn init_layout(
    store: &dyn PartitionedStore,
    catalogue: &[ContainerSpec],
) -> Result<Vec<ContainerReport>> {
    for spec in catalogue {
        if store.container_policy(spec.name).await?.is_none() {
            log::info!("creating container '{}' ({})", spec.name, spec.policy);
            store.ensure_container(spec.name, spec.policy).await?;
        }
    }
    verify_layout(store, catalogue).await
}
