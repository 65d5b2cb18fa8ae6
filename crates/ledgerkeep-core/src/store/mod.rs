//! Partitioned document store: the storage abstraction under the ledgers.
//!
//! Backends hold JSON items addressed by `(container, partition key, id)`.
//! Every container declares a [`PartitionPolicy`] and every call validates
//! the key's arity against it before touching data. Items carry a native
//! concurrency token (`etag`) that changes on every write; conditional
//! replace is the only cross-process coordination primitive the ledgers use.
//!
//! # Dyn-compatibility
//!
//! Methods return boxed futures so that `Arc<dyn PartitionedStore>` works and
//! the backend can be picked from configuration at runtime.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{StoreError, ValidationError};
use crate::partition::{PartitionKey, PartitionPolicy};

/// Boxed, Send future returned by every store method.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type StoreResult<T> = Result<T, StoreError>;

/// An item as persisted, with its concurrency token.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    pub id: String,
    pub partition_key: PartitionKey,
    pub body: Value,
    pub etag: String,
}

impl StoredItem {
    /// Deserialize the body into a typed record.
    pub fn decode<T: DeserializeOwned>(&self, container: &str) -> StoreResult<T> {
        serde_json::from_value(self.body.clone()).map_err(|e| StoreError::Corrupt {
            container: container.to_string(),
            details: format!("item '{}': {e}", self.id),
        })
    }
}

/// Where a query runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// Single partition.
    Partition(PartitionKey),
    /// Every partition of the container. Must be asked for explicitly.
    CrossPartition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Equality filters, an optional sort field and a page window.
///
/// Without `order_by`, results come back in insertion order, which keeps
/// offset-based paging stable across repeated calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<(String, SortOrder)>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `body[field] == value`. A `null` value also matches a missing field.
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some((field.into(), order));
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, body: &Value) -> bool {
        self.filters.iter().all(|(field, expected)| match body.get(field) {
            None => expected.is_null(),
            Some(actual) => actual == expected,
        })
    }
}

/// Storage backend for partitioned JSON items.
pub trait PartitionedStore: Send + Sync {
    /// Declare a container. Redeclaring with a different policy is an error.
    fn ensure_container<'a>(
        &'a self,
        container: &'a str,
        policy: PartitionPolicy,
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// Declared policy of a container, `None` if it does not exist.
    fn container_policy<'a>(
        &'a self,
        container: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<PartitionPolicy>>>;

    /// Strict create. Fails with `Conflict` if `(key, id)` already exists.
    fn create<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, StoreResult<StoredItem>>;

    /// Point read. Fails with `NotFound`.
    fn read<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
    ) -> BoxFuture<'a, StoreResult<StoredItem>>;

    /// Replace only if the stored etag still equals `etag`.
    fn replace_if_match<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
        etag: &'a str,
    ) -> BoxFuture<'a, StoreResult<StoredItem>>;

    /// Create or overwrite.
    fn upsert<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, StoreResult<StoredItem>>;

    /// Run `query` against one partition or, if asked for, all of them.
    fn query<'a>(
        &'a self,
        container: &'a str,
        query: &'a Query,
        scope: &'a QueryScope,
    ) -> BoxFuture<'a, StoreResult<Vec<StoredItem>>>;
}

// ============================================================================
// Shared backend helpers
// ============================================================================

/// Resolve a container's policy and check `key` against it.
fn check_key(
    container: &str,
    policy: Option<PartitionPolicy>,
    key: &PartitionKey,
) -> StoreResult<PartitionPolicy> {
    let policy = policy.ok_or_else(|| StoreError::UnknownContainer(container.to_string()))?;
    policy.validate_key(key)?;
    Ok(policy)
}

fn check_scope(
    container: &str,
    policy: Option<PartitionPolicy>,
    scope: &QueryScope,
) -> StoreResult<PartitionPolicy> {
    match scope {
        QueryScope::Partition(key) => check_key(container, policy, key),
        QueryScope::CrossPartition => {
            policy.ok_or_else(|| StoreError::UnknownContainer(container.to_string()))
        }
    }
}

fn policy_conflict(container: &str, declared: PartitionPolicy, requested: PartitionPolicy) -> StoreError {
    StoreError::InvalidKey(ValidationError::PolicyConflict {
        container: container.to_string(),
        declared: declared.as_str(),
        requested: requested.as_str(),
    })
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) | Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(_) => 3,
    }
}

/// Sort order for body fields: missing and null first, then numbers
/// (booleans as 0/1), then strings, then composite values.
fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn numeric(v: &Value) -> f64 {
        match v {
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }
    match (a, b) {
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) if x.is_u64() && y.is_u64() => {
            x.as_u64().cmp(&y.as_u64())
        }
        (Some(x), Some(y)) if type_rank(a) == 1 && type_rank(b) == 1 => {
            numeric(x).total_cmp(&numeric(y))
        }
        (Some(x), Some(y)) if type_rank(a) == 3 && type_rank(b) == 3 => {
            x.to_string().cmp(&y.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
