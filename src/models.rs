//! Data model for the ingestion pipeline (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A chain the pipeline is walking.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Chain {
    pub id: i64,
    pub chain_name: String,
    pub chain_id: String,
    pub next_block_number: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A wallet address observed on some chain.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Address {
    pub id: i64,
    pub wallet_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Association between an address and a chain it was observed on.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AddressChain {
    pub id: i64,
    pub wallet_address_id: i64,
    pub chain_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Record of a failed RPC fetch for a single block.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FailureLog {
    pub id: i64,
    pub chain_id: String,
    pub block_number: i64,
    pub status_code: String,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

/// A pre-seeded status code row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Status {
    pub id: i64,
    pub status_type: String,
    pub status_code: String,
    pub status_description: String,
    pub created_at: DateTime<Utc>,
}

/// The block data the RPC client extracts (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBlock {
    pub block_hash: String,
    pub timestamp: i64,
    pub tx_count: usize,
    pub addresses: std::collections::BTreeSet<String>,
}
