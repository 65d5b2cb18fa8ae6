//! Store wrappers and fixtures shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::StoreError;
use crate::partition::{PartitionKey, PartitionPolicy};
use crate::store::{BoxFuture, PartitionedStore, Query, QueryScope, StoreResult, StoredItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Read,
    Replace,
    Upsert,
    Query,
}

#[derive(Default)]
struct Faults {
    remaining: HashMap<Op, u32>,
    ids: HashMap<Op, HashSet<String>>,
    calls: HashMap<Op, u32>,
}

/// Delegating store that counts calls and injects `Unavailable` failures.
///
/// Injected failures happen before delegation, so a failed write never lands.
pub struct FaultyStore {
    inner: Arc<dyn PartitionedStore>,
    faults: Mutex<Faults>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn PartitionedStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Fail the next `n` calls of `op`.
    pub fn fail_next(&self, op: Op, n: u32) {
        self.faults.lock().unwrap().remaining.insert(op, n);
    }

    /// Fail every call of `op` that targets item `id`.
    pub fn fail_id(&self, op: Op, id: &str) {
        self.faults
            .lock()
            .unwrap()
            .ids
            .entry(op)
            .or_default()
            .insert(id.to_string());
    }

    pub fn calls(&self, op: Op) -> u32 {
        self.faults.lock().unwrap().calls.get(&op).copied().unwrap_or(0)
    }

    /// Calls on any write path.
    pub fn writes(&self) -> u32 {
        self.calls(Op::Create) + self.calls(Op::Replace) + self.calls(Op::Upsert)
    }

    fn check(&self, op: Op, id: Option<&str>) -> StoreResult<()> {
        let mut faults = self.faults.lock().unwrap();
        *faults.calls.entry(op).or_default() += 1;
        if let Some(n) = faults.remaining.get_mut(&op)
            && *n > 0
        {
            *n -= 1;
            return Err(StoreError::Unavailable(format!("injected {op:?} failure")));
        }
        if let Some(id) = id
            && faults.ids.get(&op).is_some_and(|ids| ids.contains(id))
        {
            return Err(StoreError::Unavailable(format!("injected {op:?} failure for '{id}'")));
        }
        Ok(())
    }
}

impl PartitionedStore for FaultyStore {
    fn ensure_container<'a>(
        &'a self,
        container: &'a str,
        policy: PartitionPolicy,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.ensure_container(container, policy)
    }

    fn container_policy<'a>(
        &'a self,
        container: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<PartitionPolicy>>> {
        self.inner.container_policy(container)
    }

    fn create<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        Box::pin(async move {
            self.check(Op::Create, Some(id))?;
            self.inner.create(container, key, id, body).await
        })
    }

    fn read<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        Box::pin(async move {
            self.check(Op::Read, Some(id))?;
            self.inner.read(container, key, id).await
        })
    }

    fn replace_if_match<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
        etag: &'a str,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        Box::pin(async move {
            self.check(Op::Replace, Some(id))?;
            self.inner.replace_if_match(container, key, id, body, etag).await
        })
    }

    fn upsert<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        Box::pin(async move {
            self.check(Op::Upsert, Some(id))?;
            self.inner.upsert(container, key, id, body).await
        })
    }

    fn query<'a>(
        &'a self,
        container: &'a str,
        query: &'a Query,
        scope: &'a QueryScope,
    ) -> BoxFuture<'a, StoreResult<Vec<StoredItem>>> {
        Box::pin(async move {
            self.check(Op::Query, None)?;
            self.inner.query(container, query, scope).await
        })
    }
}

pub const SPACE: &str = "123e4567-e89b-12d3-a456-426614174001";
pub const TENANT: &str = "123e4567-e89b-12d3-a456-426614174002";
pub const USER: &str = "123e4567-e89b-12d3-a456-426614174003";
pub const OTHER_USER: &str = "123e4567-e89b-12d3-a456-426614174009";
