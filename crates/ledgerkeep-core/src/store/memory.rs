//! In-process store backend.
//!
//! Everything lives behind one `std::sync::Mutex`; no lock is held across an
//! await point because every operation completes synchronously and is handed
//! back as a ready future.

use std::collections::HashMap;
use std::future::ready;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use super::{
    BoxFuture, PartitionedStore, Query, QueryScope, SortOrder, StoreResult, StoredItem,
    check_key, check_scope, compare_fields, policy_conflict,
};
use crate::error::StoreError;
use crate::partition::{PartitionKey, PartitionPolicy};

struct Slot {
    /// Insertion position; kept across overwrites.
    position: u64,
    body: Value,
    etag: u64,
}

struct Container {
    policy: PartitionPolicy,
    items: HashMap<(PartitionKey, String), Slot>,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, Container>,
    next_position: u64,
    next_etag: u64,
}

impl Inner {
    fn container(
        &mut self,
        name: &str,
        key: &PartitionKey,
    ) -> StoreResult<&mut Container> {
        let policy = self.containers.get(name).map(|c| c.policy);
        check_key(name, policy, key)?;
        self.containers
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownContainer(name.to_string()))
    }

    fn bump_etag(&mut self) -> u64 {
        self.next_etag += 1;
        self.next_etag
    }

    fn bump_position(&mut self) -> u64 {
        self.next_position += 1;
        self.next_position
    }
}

fn stored(key: &PartitionKey, id: &str, slot: &Slot) -> StoredItem {
    StoredItem {
        id: id.to_string(),
        partition_key: key.clone(),
        body: slot.body.clone(),
        etag: slot.etag.to_string(),
    }
}

/// Insertion-ordered in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn do_ensure_container(&self, name: &str, policy: PartitionPolicy) -> StoreResult<()> {
        let mut inner = self.lock()?;
        match inner.containers.get(name) {
            Some(existing) if existing.policy != policy => {
                Err(policy_conflict(name, existing.policy, policy))
            }
            Some(_) => Ok(()),
            None => {
                inner.containers.insert(
                    name.to_string(),
                    Container {
                        policy,
                        items: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn do_create(
        &self,
        name: &str,
        key: &PartitionKey,
        id: &str,
        body: &Value,
    ) -> StoreResult<StoredItem> {
        let mut inner = self.lock()?;
        inner.container(name, key)?;
        let etag = inner.bump_etag();
        let position = inner.bump_position();
        let container = inner.container(name, key)?;
        let slot_key = (key.clone(), id.to_string());
        if container.items.contains_key(&slot_key) {
            return Err(StoreError::Conflict {
                container: name.to_string(),
                id: id.to_string(),
            });
        }
        let slot = Slot {
            position,
            body: body.clone(),
            etag,
        };
        let item = stored(key, id, &slot);
        container.items.insert(slot_key, slot);
        Ok(item)
    }

    fn do_read(&self, name: &str, key: &PartitionKey, id: &str) -> StoreResult<StoredItem> {
        let mut inner = self.lock()?;
        let container = inner.container(name, key)?;
        container
            .items
            .get(&(key.clone(), id.to_string()))
            .map(|slot| stored(key, id, slot))
            .ok_or_else(|| StoreError::NotFound {
                container: name.to_string(),
                id: id.to_string(),
            })
    }

    fn do_replace_if_match(
        &self,
        name: &str,
        key: &PartitionKey,
        id: &str,
        body: &Value,
        etag: &str,
    ) -> StoreResult<StoredItem> {
        let mut inner = self.lock()?;
        inner.container(name, key)?;
        let next = inner.bump_etag();
        let container = inner.container(name, key)?;
        let slot = container
            .items
            .get_mut(&(key.clone(), id.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                container: name.to_string(),
                id: id.to_string(),
            })?;
        if slot.etag.to_string() != etag {
            return Err(StoreError::PreconditionFailed {
                container: name.to_string(),
                id: id.to_string(),
            });
        }
        slot.body = body.clone();
        slot.etag = next;
        Ok(stored(key, id, slot))
    }

    fn do_upsert(
        &self,
        name: &str,
        key: &PartitionKey,
        id: &str,
        body: &Value,
    ) -> StoreResult<StoredItem> {
        let mut inner = self.lock()?;
        inner.container(name, key)?;
        let etag = inner.bump_etag();
        let position = inner.bump_position();
        let container = inner.container(name, key)?;
        let slot = container
            .items
            .entry((key.clone(), id.to_string()))
            .or_insert(Slot {
                position,
                body: Value::Null,
                etag,
            });
        slot.body = body.clone();
        slot.etag = etag;
        Ok(stored(key, id, slot))
    }

    fn do_query(
        &self,
        name: &str,
        query: &Query,
        scope: &QueryScope,
    ) -> StoreResult<Vec<StoredItem>> {
        let inner = self.lock()?;
        let policy = inner.containers.get(name).map(|c| c.policy);
        check_scope(name, policy, scope)?;
        let Some(container) = inner.containers.get(name) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<(&(PartitionKey, String), &Slot)> = container
            .items
            .iter()
            .filter(|((key, _), _)| match scope {
                QueryScope::Partition(wanted) => key == wanted,
                QueryScope::CrossPartition => true,
            })
            .filter(|(_, slot)| query.matches(&slot.body))
            .collect();

        // Ties fall back to insertion order, reversed for descending sorts.
        hits.sort_by(|(_, a), (_, b)| match &query.order_by {
            None => a.position.cmp(&b.position),
            Some((field, SortOrder::Ascending)) => compare_fields(a.body.get(field), b.body.get(field))
                .then(a.position.cmp(&b.position)),
            Some((field, SortOrder::Descending)) => compare_fields(b.body.get(field), a.body.get(field))
                .then(b.position.cmp(&a.position)),
        });

        Ok(hits
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|((key, id), slot)| stored(key, id, slot))
            .collect())
    }
}

impl PartitionedStore for MemoryStore {
    fn ensure_container<'a>(
        &'a self,
        container: &'a str,
        policy: PartitionPolicy,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(ready(self.do_ensure_container(container, policy)))
    }

    fn container_policy<'a>(
        &'a self,
        container: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<PartitionPolicy>>> {
        let result = self
            .lock()
            .map(|inner| inner.containers.get(container).map(|c| c.policy));
        Box::pin(ready(result))
    }

    fn create<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        Box::pin(ready(self.do_create(container, key, id, body)))
    }

    fn read<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        Box::pin(ready(self.do_read(container, key, id)))
    }

    fn replace_if_match<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
        etag: &'a str,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        Box::pin(ready(
            self.do_replace_if_match(container, key, id, body, etag),
        ))
    }

    fn upsert<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        Box::pin(ready(self.do_upsert(container, key, id, body)))
    }

    fn query<'a>(
        &'a self,
        container: &'a str,
        query: &'a Query,
        scope: &'a QueryScope,
    ) -> BoxFuture<'a, StoreResult<Vec<StoredItem>>> {
        Box::pin(ready(self.do_query(container, query, scope)))
    }
}
