//! Bulk persistence of a batch's discovered addresses (§4.4).

use crate::error::Result;
use crate::store::Store;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Timings for one [`BulkWriter::upsert`] call, surfaced via metrics.
#[derive(Debug, Clone, Default)]
pub struct UpsertTimings {
    pub address_upsert: std::time::Duration,
    pub id_resolution: std::time::Duration,
    pub relationship_upsert: std::time::Duration,
}

/// Owns all writes to `Address`, `AddressChain`, and `Chain.next_block_number`.
pub struct BulkWriter {
    store: Arc<dyn Store>,
}

impl BulkWriter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Insert missing addresses, resolve every input address to a surrogate
    /// id, and insert missing relationship rows for `chain_row_id`. Best
    /// effort on relationships; address-batch failure propagates (§7
    /// `StorageIntegrity`).
    pub async fn upsert(
        &self,
        addresses: &BTreeSet<String>,
        chain_row_id: i64,
    ) -> Result<UpsertTimings> {
        let mut timings = UpsertTimings::default();
        if addresses.is_empty() {
            return Ok(timings);
        }

        let started = Instant::now();
        let address_outcome = self.store.upsert_addresses(addresses).await?;
        timings.address_upsert = started.elapsed();

        let started = Instant::now();
        let ids = self.store.lookup_address_ids(addresses).await?;
        timings.id_resolution = started.elapsed();

        let address_ids: Vec<i64> = ids.values().copied().collect();
        let started = Instant::now();
        let relationship_outcome = self
            .store
            .upsert_relationships(&address_ids, chain_row_id)
            .await?;
        timings.relationship_upsert = started.elapsed();

        info!(
            addresses_inserted = address_outcome.inserted,
            relationships_inserted = relationship_outcome.inserted,
            relationships_failed = relationship_outcome.failed,
            "bulk upsert complete"
        );
        if relationship_outcome.failed > 0 {
            warn!(
                "{} relationship inserts failed for chain_row_id={chain_row_id} (non-fatal, StorageTransient)",
                relationship_outcome.failed
            );
        }

        Ok(timings)
    }

    /// Atomic single-row advance of the chain's high-water mark, issued
    /// outside the transaction(s) used for the row upserts (§9 Open
    /// Question 2 — decided in DESIGN.md).
    pub async fn advance_high_water_mark(
        &self,
        chain_row_id: i64,
        new_next_block_number: i64,
    ) -> Result<()> {
        self.store
            .update_chain_high_water_mark(chain_row_id, new_next_block_number)
            .await
    }

    /// Optional session-level hint issued before a large batch; failures
    /// are swallowed inside the `Store` implementation (§4.4).
    pub async fn tune_for_bulk(&self) {
        self.store.tune_for_bulk().await;
    }

    pub async fn reset_tuning(&self) {
        self.store.reset_tuning().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn addrs(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn upsert_is_idempotent_across_replays() {
        let store = Arc::new(MemoryStore::new());
        let writer = BulkWriter::new(store.clone());
        let set = addrs(&["0xA", "0xB", "0xA"]);

        writer.upsert(&set, 1).await.unwrap();
        writer.upsert(&set, 1).await.unwrap();

        assert_eq!(store.address_count().await, 2);
        assert_eq!(store.relationship_count().await, 2);
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let writer = BulkWriter::new(store.clone());
        writer.upsert(&BTreeSet::new(), 1).await.unwrap();
        assert_eq!(store.address_count().await, 0);
    }

    #[tokio::test]
    async fn advance_high_water_mark_updates_chain_row() {
        let store = Arc::new(MemoryStore::new());
        store.seed_chain("mainnet", "1", 100).await;
        let chain = store.load_chain_by_external_id("1").await.unwrap().unwrap();

        let writer = BulkWriter::new(store.clone());
        writer.advance_high_water_mark(chain.id, 150).await.unwrap();

        let updated = store.load_chain_by_external_id("1").await.unwrap().unwrap();
        assert_eq!(updated.next_block_number, 150);
    }
}
