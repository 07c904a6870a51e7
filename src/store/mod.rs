//! Narrow persistence capability (§9 Design Note 1).
//!
//! Rather than an ORM mapper hierarchy, the core depends on a single
//! `Store` trait with exactly the six operations the pipeline needs. Two
//! implementations exist: [`pg::PgStore`] for production, and
//! [`memory::MemoryStore`] — an in-process fake — for the unit and property
//! test suite, so the batch processor and bulk-writer logic are fully
//! testable without a live database.

pub mod memory;
pub mod pg;

use crate::error::Result;
use crate::models::Chain;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

/// Result of a single call to [`Store::upsert_addresses`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertAddressesOutcome {
    pub inserted: usize,
}

/// Result of a single call to [`Store::upsert_relationships`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertRelationshipsOutcome {
    pub inserted: usize,
    pub failed: usize,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Load a chain row by its external chain id.
    async fn load_chain_by_external_id(&self, chain_id: &str) -> Result<Option<Chain>>;

    /// Insert any addresses in `addresses` not already present, ignoring
    /// conflicts on the unique wallet-address constraint. A failure here is
    /// a `StorageIntegrity` condition (§7): the whole call either succeeds
    /// or returns an error, never partially silently.
    async fn upsert_addresses(
        &self,
        addresses: &BTreeSet<String>,
    ) -> Result<UpsertAddressesOutcome>;

    /// Resolve the surrogate id of every address in `addresses`. Must see
    /// rows inserted earlier in the same logical batch (read-own-writes).
    async fn lookup_address_ids(
        &self,
        addresses: &BTreeSet<String>,
    ) -> Result<HashMap<String, i64>>;

    /// Insert any missing `(address_id, chain_row_id)` relationship rows.
    /// A single relationship failing to insert is `StorageTransient` (§7):
    /// logged and skipped, never aborts the caller.
    async fn upsert_relationships(
        &self,
        address_ids: &[i64],
        chain_row_id: i64,
    ) -> Result<UpsertRelationshipsOutcome>;

    /// Atomically set the chain's `next_block_number` and `updated_at`.
    async fn update_chain_high_water_mark(
        &self,
        chain_row_id: i64,
        new_next_block_number: i64,
    ) -> Result<()>;

    /// Record a failed RPC fetch for one block.
    async fn insert_failure_log(
        &self,
        chain_id: &str,
        block_number: i64,
        status_code: &str,
        error_message: &str,
    ) -> Result<()>;

    /// Optional session-level hint issued before a large batch (§4.4). The
    /// default is a no-op; `PgStore` overrides it. Failures are non-fatal
    /// by construction: the method has no error return.
    async fn tune_for_bulk(&self) {}

    /// Undo [`Store::tune_for_bulk`] after the batch completes.
    async fn reset_tuning(&self) {}
}
