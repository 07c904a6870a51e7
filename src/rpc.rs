//! JSON-RPC client adaptor over `eth_getBlockByNumber` (§4.2).

use crate::error::IngestError;
use crate::models::FetchedBlock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Normalises either a decimal or `0x`-prefixed block number into `0x`-hex.
pub fn to_hex_block_number(block_number: u64) -> String {
    format!("0x{:x}", block_number)
}

/// Thin adaptor over the upstream JSON-RPC provider.
#[async_trait::async_trait]
pub trait BlockFetcher: Send + Sync {
    async fn fetch_block(&self, block_number: u64) -> Result<FetchedBlock, IngestError>;
}

/// `reqwest`-backed implementation of [`BlockFetcher`].
pub struct RpcClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout,
        }
    }

    fn extract_addresses(transactions: &[serde_json::Value]) -> BTreeSet<String> {
        let mut addresses = BTreeSet::new();
        for tx in transactions {
            for field in ["from", "to"] {
                if let Some(addr) = tx.get(field).and_then(|v| v.as_str()) {
                    let trimmed = addr.trim();
                    if !trimmed.is_empty() {
                        addresses.insert(trimmed.to_string());
                    }
                }
            }
        }
        addresses
    }

    fn parse_hex_u64(value: &serde_json::Value) -> i64 {
        value
            .as_str()
            .and_then(|s| i64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl BlockFetcher for RpcClient {
    async fn fetch_block(&self, block_number: u64) -> Result<FetchedBlock, IngestError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "eth_getBlockByNumber",
            params: vec![
                serde_json::json!(to_hex_block_number(block_number)),
                serde_json::json!(true),
            ],
        };

        let send = self.client.post(&self.endpoint).json(&request).send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| IngestError::Timeout)?
            .map_err(IngestError::Transport)?;

        if !response.status().is_success() {
            return Err(IngestError::Internal(format!(
                "non-2xx http status: {}",
                response.status()
            )));
        }

        let body: RpcResponse = response.json().await.map_err(IngestError::Transport)?;

        if let Some(error) = body.error {
            return Err(IngestError::Upstream {
                code: error.code,
                message: error.message,
            });
        }

        let result = body.result.ok_or(IngestError::NotFound)?;
        if result.is_null() {
            return Err(IngestError::NotFound);
        }

        let block_hash = result
            .get("hash")
            .and_then(|h| h.as_str())
            .unwrap_or_default()
            .to_string();
        let timestamp = result
            .get("timestamp")
            .map(Self::parse_hex_u64)
            .unwrap_or(0);
        let transactions = result
            .get("transactions")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();
        let addresses = Self::extract_addresses(&transactions);

        Ok(FetchedBlock {
            block_hash,
            timestamp,
            tx_count: transactions.len(),
            addresses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_block_number_has_no_leading_zeroes() {
        assert_eq!(to_hex_block_number(0), "0x0");
        assert_eq!(to_hex_block_number(255), "0xff");
        assert_eq!(to_hex_block_number(100), "0x64");
    }

    #[test]
    fn extracts_distinct_nonempty_addresses() {
        let txs: Vec<serde_json::Value> = vec![
            serde_json::json!({"from": "0xA", "to": "0xB"}),
            serde_json::json!({"from": "0xA", "to": "0xC"}),
            serde_json::json!({"from": null, "to": "0xB"}),
            serde_json::json!({"from": "0xA", "to": ""}),
        ];
        let addresses = RpcClient::extract_addresses(&txs);
        let expected: BTreeSet<String> = ["0xA", "0xB", "0xC"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(addresses, expected);
    }

    #[test]
    fn extracts_empty_set_from_empty_transactions() {
        let txs: Vec<serde_json::Value> = vec![];
        assert!(RpcClient::extract_addresses(&txs).is_empty());
    }
}
