//! In-process fake [`Store`], used by the unit/property test suite so the
//! batch processor and bulk-writer logic can be exercised without a live
//! database.

use super::{Store, UpsertAddressesOutcome, UpsertRelationshipsOutcome};
use crate::error::Result;
use crate::models::{Chain, FailureLog};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    chains: HashMap<String, Chain>,
    next_chain_row_id: i64,
    addresses: HashMap<String, i64>,
    next_address_id: i64,
    relationships: std::collections::HashSet<(i64, i64)>,
    failure_logs: Vec<FailureLog>,
}

/// In-memory stand-in for [`super::pg::PgStore`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Seed a chain row, as an operator bootstrapping a fresh chain would.
    pub async fn seed_chain(&self, chain_name: &str, chain_id: &str, next_block_number: i64) {
        let mut inner = self.inner.lock().await;
        inner.next_chain_row_id += 1;
        let id = inner.next_chain_row_id;
        let now = Utc::now();
        inner.chains.insert(
            chain_id.to_string(),
            Chain {
                id,
                chain_name: chain_name.to_string(),
                chain_id: chain_id.to_string(),
                next_block_number,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub async fn address_count(&self) -> usize {
        self.inner.lock().await.addresses.len()
    }

    pub async fn relationship_count(&self) -> usize {
        self.inner.lock().await.relationships.len()
    }

    pub async fn failure_logs(&self) -> Vec<FailureLog> {
        self.inner.lock().await.failure_logs.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_chain_by_external_id(&self, chain_id: &str) -> Result<Option<Chain>> {
        Ok(self.inner.lock().await.chains.get(chain_id).cloned())
    }

    async fn upsert_addresses(
        &self,
        addresses: &BTreeSet<String>,
    ) -> Result<UpsertAddressesOutcome> {
        let mut inner = self.inner.lock().await;
        let mut inserted = 0;
        for address in addresses {
            if !inner.addresses.contains_key(address) {
                inner.next_address_id += 1;
                let id = inner.next_address_id;
                inner.addresses.insert(address.clone(), id);
                inserted += 1;
            }
        }
        Ok(UpsertAddressesOutcome { inserted })
    }

    async fn lookup_address_ids(
        &self,
        addresses: &BTreeSet<String>,
    ) -> Result<HashMap<String, i64>> {
        let inner = self.inner.lock().await;
        Ok(addresses
            .iter()
            .filter_map(|a| inner.addresses.get(a).map(|id| (a.clone(), *id)))
            .collect())
    }

    async fn upsert_relationships(
        &self,
        address_ids: &[i64],
        chain_row_id: i64,
    ) -> Result<UpsertRelationshipsOutcome> {
        let mut inner = self.inner.lock().await;
        let mut outcome = UpsertRelationshipsOutcome::default();
        for &address_id in address_ids {
            if inner.relationships.insert((address_id, chain_row_id)) {
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn update_chain_high_water_mark(
        &self,
        chain_row_id: i64,
        new_next_block_number: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(chain) = inner.chains.values_mut().find(|c| c.id == chain_row_id) {
            chain.next_block_number = new_next_block_number;
            chain.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_failure_log(
        &self,
        chain_id: &str,
        block_number: i64,
        status_code: &str,
        error_message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let id = inner.failure_logs.len() as i64 + 1;
        inner.failure_logs.push(FailureLog {
            id,
            chain_id: chain_id.to_string(),
            block_number,
            status_code: status_code.to_string(),
            error_message: error_message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}
