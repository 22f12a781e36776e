//! HTTP JSON-RPC implementation of [`EthClient`].

use std::time::Duration;

use alloy::primitives::{Address, B256, U256, U64};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::retry::{self, Backoff};

use super::{EthClient, NodeError, RpcBlock, RpcHeader, RpcReceipt, RpcTransaction};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Chain-node client over HTTP. Every call is bounded by the request
/// timeout; construction probes the node with exponential backoff.
pub struct RpcEthClient {
    provider: RootProvider<Http<Client>>,
    request_timeout: Duration,
}

impl RpcEthClient {
    /// Dial `rpc_url` and probe it with `eth_chainId`, retrying up to five
    /// times with exponential backoff before giving up.
    pub async fn dial(rpc_url: &str) -> Result<Self, NodeError> {
        let url = rpc_url
            .parse()
            .map_err(|e| NodeError::Transport(format!("invalid rpc url: {e}")))?;
        let client = Self {
            provider: ProviderBuilder::new().on_http(url),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        };

        let backoff = Backoff {
            min: Duration::from_millis(500),
            max: Duration::from_secs(5),
            max_jitter: Duration::from_millis(250),
        };
        let chain_id: U64 = retry::with_retry(retry::DIAL_ATTEMPTS, &backoff, "eth_chainId", || {
            client.call("eth_chainId", serde_json::json!([]))
        })
        .await?;
        info!(rpc_url, chain_id = chain_id.to::<u64>(), "Chain node connected");

        Ok(client)
    }

    /// Issue a raw call whose result must not be null.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<T, NodeError> {
        self.call_opt(method, params)
            .await?
            .ok_or(NodeError::NotFound)
    }

    /// Issue a raw call; a null result maps to `None`.
    async fn call_opt<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<Option<T>, NodeError> {
        let raw_params = serde_json::value::to_raw_value(&params)
            .map_err(|e| NodeError::Transport(format!("encode params: {e}")))?;
        let fut = self.provider.raw_request_dyn(method.into(), &raw_params);
        let raw = tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| NodeError::Timeout(self.request_timeout))?
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        serde_json::from_str(raw.get())
            .map_err(|e| NodeError::Transport(format!("decode {method} response: {e}")))
    }
}

fn block_number_arg(number: Option<u64>) -> serde_json::Value {
    match number {
        Some(n) => serde_json::Value::String(format!("0x{n:x}")),
        None => serde_json::Value::String("latest".to_string()),
    }
}

#[async_trait]
impl EthClient for RpcEthClient {
    async fn block_header_by_number(&self, number: Option<u64>) -> Result<RpcHeader, NodeError> {
        self.call(
            "eth_getBlockByNumber",
            serde_json::json!([block_number_arg(number), false]),
        )
        .await
    }

    async fn block_by_number(&self, number: u64) -> Result<RpcBlock, NodeError> {
        self.call(
            "eth_getBlockByNumber",
            serde_json::json!([block_number_arg(Some(number)), false]),
        )
        .await
    }

    async fn block_headers_by_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<RpcHeader>, NodeError> {
        if from > to {
            return Ok(Vec::new());
        }
        let headers =
            try_join_all((from..=to).map(|n| self.block_header_by_number(Some(n)))).await?;
        Ok(headers)
    }

    async fn tx_by_hash(&self, hash: B256) -> Result<RpcTransaction, NodeError> {
        self.call("eth_getTransactionByHash", serde_json::json!([hash]))
            .await
    }

    async fn tx_receipt_by_hash(&self, hash: B256) -> Result<RpcReceipt, NodeError> {
        self.call("eth_getTransactionReceipt", serde_json::json!([hash]))
            .await
    }

    async fn tx_count(&self, address: Address) -> Result<u64, NodeError> {
        let nonce: U64 = self
            .call(
                "eth_getTransactionCount",
                serde_json::json!([address, "latest"]),
            )
            .await?;
        Ok(nonce.to())
    }

    async fn send_raw_transaction(&self, raw_hex: &str) -> Result<(), NodeError> {
        let tx_hash: B256 = self
            .call("eth_sendRawTransaction", serde_json::json!([raw_hex]))
            .await?;
        debug!(%tx_hash, "Raw transaction accepted by node");
        Ok(())
    }

    async fn suggest_gas_price(&self) -> Result<U256, NodeError> {
        self.call("eth_gasPrice", serde_json::json!([])).await
    }

    async fn suggest_gas_tip_cap(&self) -> Result<U256, NodeError> {
        self.call("eth_maxPriorityFeePerGas", serde_json::json!([]))
            .await
    }

    fn close(&self) {
        // HTTP transport holds no persistent connection state to release.
        debug!("Chain node client closed");
    }
}
