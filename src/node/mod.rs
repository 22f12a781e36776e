//! Read-only chain access and raw-transaction broadcast.
//!
//! [`EthClient`] is the only seam the pipelines see; [`client::RpcEthClient`]
//! implements it over HTTP JSON-RPC. Value types here mirror the wire shapes
//! the engine actually consumes rather than full node types.

use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256, U64};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod header_traversal;

pub use client::RpcEthClient;
pub use header_traversal::{HeaderTraversal, TraversalError};

/// Failure kinds of a chain-node call. Absence of a resource is distinct
/// from a transport failure so callers can treat "receipt not yet mined"
/// differently from "node unreachable".
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("rpc transport failure: {0}")]
    Transport(String),
    #[error("rpc request timed out after {0:?}")]
    Timeout(Duration),
    #[error("resource not found")]
    NotFound,
}

/// Block header slice consumed by the indexing cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHeader {
    pub hash: B256,
    pub parent_hash: B256,
    pub number: U64,
    pub timestamp: U64,
}

impl RpcHeader {
    pub fn number(&self) -> u64 {
        self.number.to()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.to()
    }
}

/// Block body slice: transaction hashes plus the base fee needed for fee
/// computation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub hash: B256,
    #[serde(default)]
    pub transactions: Vec<B256>,
    #[serde(default)]
    pub base_fee_per_gas: Option<U256>,
}

/// Transaction fields the deposit pipeline classifies on. `from` is the
/// EIP-155 sender as derived by the node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    #[serde(default)]
    pub transaction_index: Option<U64>,
}

/// Receipt fields needed for fee computation and success checks.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    #[serde(rename = "type", default)]
    pub tx_type: Option<U64>,
    #[serde(default)]
    pub status: Option<U64>,
    pub effective_gas_price: U256,
    pub gas_used: U256,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub transaction_index: Option<U64>,
}

impl RpcReceipt {
    /// EIP-1559 dynamic-fee receipt (`type == 0x2`).
    pub fn is_dynamic_fee(&self) -> bool {
        self.tx_type.map(|t| t.to::<u64>() == 2).unwrap_or(false)
    }

    /// Post-Byzantium execution success.
    pub fn succeeded(&self) -> bool {
        self.status.map(|s| s.to::<u64>() == 1).unwrap_or(false)
    }
}

/// Chain-node operations required by the wallet engine. All methods are
/// bounded by the per-request timeout of the implementation.
#[async_trait]
pub trait EthClient: Send + Sync {
    /// Header at `number`, or the latest header when `None`.
    async fn block_header_by_number(&self, number: Option<u64>) -> Result<RpcHeader, NodeError>;

    /// Block hash, transaction hashes and base fee at `number`.
    async fn block_by_number(&self, number: u64) -> Result<RpcBlock, NodeError>;

    /// Contiguous headers for `from..=to`, fetched concurrently.
    async fn block_headers_by_range(&self, from: u64, to: u64)
        -> Result<Vec<RpcHeader>, NodeError>;

    async fn tx_by_hash(&self, hash: B256) -> Result<RpcTransaction, NodeError>;

    async fn tx_receipt_by_hash(&self, hash: B256) -> Result<RpcReceipt, NodeError>;

    /// Latest-state nonce for `address`.
    async fn tx_count(&self, address: Address) -> Result<u64, NodeError>;

    /// Broadcast a `0x`-prefixed signed envelope.
    async fn send_raw_transaction(&self, raw_hex: &str) -> Result<(), NodeError>;

    async fn suggest_gas_price(&self) -> Result<U256, NodeError>;

    async fn suggest_gas_tip_cap(&self) -> Result<U256, NodeError>;

    /// Release the underlying connection.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_type_and_status_probes() {
        let dynamic = RpcReceipt {
            tx_type: Some(U64::from(2)),
            status: Some(U64::from(1)),
            effective_gas_price: U256::from(20_000_000_000u64),
            gas_used: U256::from(21_000u64),
            block_number: None,
            transaction_index: None,
        };
        assert!(dynamic.is_dynamic_fee());
        assert!(dynamic.succeeded());

        let legacy = RpcReceipt {
            tx_type: Some(U64::from(0)),
            status: Some(U64::from(0)),
            effective_gas_price: U256::ZERO,
            gas_used: U256::ZERO,
            block_number: None,
            transaction_index: None,
        };
        assert!(!legacy.is_dynamic_fee());
        assert!(!legacy.succeeded());

        let pre_typed = RpcReceipt {
            tx_type: None,
            status: None,
            effective_gas_price: U256::ZERO,
            gas_used: U256::ZERO,
            block_number: None,
            transaction_index: None,
        };
        assert!(!pre_typed.is_dynamic_fee());
        assert!(!pre_typed.succeeded());
    }

    #[test]
    fn test_header_deserializes_from_rpc_shape() {
        let raw = r#"{
            "hash": "0x52fd87b1f05d930d1f533cd1562fb72eeba899e02a20e20db0be9d6ab8c330fe",
            "parentHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "number": "0x64",
            "timestamp": "0x6617b6f0",
            "gasLimit": "0x1c9c380"
        }"#;
        let header: RpcHeader = serde_json::from_str(raw).unwrap();
        assert_eq!(header.number(), 100);
        assert!(header.timestamp() > 0);
    }

    #[test]
    fn test_block_deserializes_with_missing_base_fee() {
        let raw = r#"{
            "hash": "0x52fd87b1f05d930d1f533cd1562fb72eeba899e02a20e20db0be9d6ab8c330fe",
            "transactions": []
        }"#;
        let block: RpcBlock = serde_json::from_str(raw).unwrap();
        assert!(block.base_fee_per_gas.is_none());
        assert!(block.transactions.is_empty());
    }
}
