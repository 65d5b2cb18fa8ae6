//! Per-user interaction ledger.
//!
//! Every `(space, tenant, user)` partition is its own chain, ordered by
//! `created_at`. Appends need no cross-caller coordination beyond the store's
//! strict create. Two appends racing on one partition can both link to the
//! same predecessor; verification then reports the second child as a broken
//! link rather than accepting the fork.

use std::sync::Arc;

use uuid::Uuid;

use super::{ChainEntry, ChainLedger, ChainVerification};
use crate::canonical::GENESIS_HASH;
use crate::error::{Result, ValidationError};
use crate::partition::{PartitionKey, SPACE_ID, ScopedQuery};
use crate::records::Interaction;
use crate::store::{PartitionedStore, Query, QueryScope, SortOrder};

pub struct InteractionLedger {
    chain: ChainLedger<Interaction>,
}

impl InteractionLedger {
    pub fn new(store: Arc<dyn PartitionedStore>, container: impl Into<String>) -> Self {
        Self {
            chain: ChainLedger::new(store, container),
        }
    }

    pub fn chain(&self) -> &ChainLedger<Interaction> {
        &self.chain
    }

    /// Append an interaction to its own partition's chain.
    ///
    /// A `created_at` older than the partition's latest entry is raised to
    /// that entry's time so the walk order matches the link order.
    pub async fn record(&self, mut interaction: Interaction) -> Result<ChainEntry<Interaction>> {
        let key = interaction.partition_key();
        let domain = QueryScope::Partition(key.clone());
        let previous_hash = match self.chain.latest(&domain).await? {
            Some(latest) => {
                if interaction.created_at < latest.record.created_at {
                    log::debug!(
                        "interaction {} predates latest in {key}, raising created_at",
                        interaction.id
                    );
                    interaction.created_at = latest.record.created_at;
                }
                latest.link.content_hash
            }
            None => GENESIS_HASH.to_string(),
        };
        self.chain.append_linked(interaction, previous_hash, &key).await
    }

    pub async fn get(&self, key: &PartitionKey, id: Uuid) -> Result<ChainEntry<Interaction>> {
        self.chain.get(key, &id.to_string()).await
    }

    /// One user's interactions, newest first.
    pub async fn list_for_user(
        &self,
        key: &PartitionKey,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<ChainEntry<Interaction>>> {
        let query = Query::new()
            .order_by("created_at", SortOrder::Descending)
            .offset(skip)
            .limit(limit);
        self.chain
            .query(&query, &QueryScope::Partition(key.clone()))
            .await
    }

    /// Interactions in a space, newest first, narrowed by whatever tenant and
    /// user are known.
    ///
    /// A partially known scope needs a cross-partition scan, which runs only
    /// when `allow_cross_partition` is set; otherwise the call fails naming
    /// the missing fields.
    pub async fn list_in_space(
        &self,
        route: &ScopedQuery,
        allow_cross_partition: bool,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<ChainEntry<Interaction>>> {
        let filters = route.filters();
        if !filters.iter().any(|(name, _)| *name == SPACE_ID) {
            return Err(ValidationError::Fields {
                missing: vec![SPACE_ID],
                invalid: Vec::new(),
            }
            .into());
        }
        let scope = if allow_cross_partition {
            route.allow_cross_partition()
        } else {
            route.require_point()?
        };

        let query = filters
            .into_iter()
            .fold(Query::new(), |q, (name, value)| q.filter(name, value))
            .order_by("created_at", SortOrder::Descending)
            .offset(skip)
            .limit(limit);
        self.chain.query(&query, &scope).await
    }

    /// Verify the oldest `limit` entries of one partition.
    pub async fn verify(&self, key: &PartitionKey, limit: usize) -> Result<ChainVerification> {
        self.chain
            .verify_chain(&QueryScope::Partition(key.clone()), limit)
            .await
    }
}
