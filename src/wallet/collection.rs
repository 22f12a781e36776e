//! Collection pipeline: sweep accumulated user balances into the hot wallet.
//!
//! Every user balance row at or above the collection threshold is swept with
//! a transfer signed by that user's own key. Native sweeps leave a
//! configurable fee reserve behind for gas; token sweeps move the full
//! balance. The sweep's pending transaction row and the lock staging commit
//! atomically; the deposit pipeline settles both once the transfer is mined.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use eyre::{eyre, Result};
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{FundingConfig, GasConfig};
use crate::db::{self, BalanceLock, BalanceRow, NewTransactionRecord};
use crate::node::{EthClient, NodeError};
use crate::retry::{self, Backoff};
use crate::signer::{erc20_transfer_calldata, Eip1559Fields, WalletSigner};
use crate::types::{TransactionStatus, TxType};

pub struct CollectionPipeline {
    client: Arc<dyn EthClient>,
    signer: Arc<dyn WalletSigner>,
    pool: PgPool,
    chain_id: u64,
    gas: GasConfig,
    funding: FundingConfig,
    interval: Duration,
    backoff: Backoff,
}

impl CollectionPipeline {
    pub fn new(
        client: Arc<dyn EthClient>,
        signer: Arc<dyn WalletSigner>,
        pool: PgPool,
        chain_id: u64,
        gas: GasConfig,
        funding: FundingConfig,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            signer,
            pool,
            chain_id,
            gas,
            funding,
            interval,
            backoff: Backoff::default(),
        }
    }

    pub async fn run(self) -> Result<()> {
        info!(threshold = %self.funding.collection_funding, "Collection pipeline started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await?;
        }
    }

    async fn tick(&self) -> Result<()> {
        let uncollected =
            match db::uncollected_balances(&self.pool, self.funding.collection_funding).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "Failed to read uncollected balances, retrying next tick");
                    return Ok(());
                }
            };
        if uncollected.is_empty() {
            return Ok(());
        }
        let hot = match db::query_hot_wallet_info(&self.pool).await {
            Ok(Some(hot)) => hot,
            Ok(None) => {
                debug!("No hot wallet enrolled, collection idle");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Failed to read hot wallet info, retrying next tick");
                return Ok(());
            }
        };
        let hot_address = hot.address();

        let mut transactions = Vec::new();
        let mut locks = Vec::new();
        for row in &uncollected {
            match self.sweep(row, hot_address).await {
                Ok(Some(record)) => {
                    locks.push(BalanceLock {
                        address: row.address(),
                        token_address: row.token_address(),
                        lock: row.balance(),
                    });
                    transactions.push(record);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(owner = %row.address(), error = %e, "Failed to sweep balance");
                }
            }
        }
        if transactions.is_empty() {
            return Ok(());
        }

        let pool = self.pool.clone();
        retry::with_retry(
            retry::DB_COMMIT_ATTEMPTS,
            &self.backoff,
            "collection commit",
            || commit_sweeps(&pool, &transactions, &locks),
        )
        .await
        .map_err(|e| eyre!("collection commit exhausted retries: {e}"))?;

        info!(swept = transactions.len(), "Collection sweeps broadcast");
        Ok(())
    }

    /// Sign and broadcast one sweep. Returns the pending transaction record,
    /// or `None` when the row cannot be swept right now.
    async fn sweep(
        &self,
        row: &BalanceRow,
        hot_address: Address,
    ) -> Result<Option<NewTransactionRecord>> {
        let owner = row.address();
        let Some(owner_entry) = db::query_address(&self.pool, &owner).await? else {
            warn!(%owner, "Balance row without address-book entry, skipping sweep");
            return Ok(None);
        };

        let token = row.token_address();
        let balance = row.balance();
        let (fields, amount) = if token == Address::ZERO {
            if balance <= self.funding.fee_reserve {
                debug!(%owner, %balance, "Balance cannot cover the fee reserve, skipping");
                return Ok(None);
            }
            let amount = balance - self.funding.fee_reserve;
            (
                Eip1559Fields {
                    nonce: 0,
                    gas_tip_cap: self.gas.max_priority_fee_per_gas,
                    gas_fee_cap: self.gas.max_fee_per_gas,
                    gas_limit: self.gas.eth_gas_limit,
                    to: hot_address,
                    value: amount,
                    data: Default::default(),
                },
                amount,
            )
        } else {
            (
                Eip1559Fields {
                    nonce: 0,
                    gas_tip_cap: self.gas.max_priority_fee_per_gas,
                    gas_fee_cap: self.gas.max_fee_per_gas,
                    gas_limit: self.gas.token_gas_limit,
                    to: token,
                    value: U256::ZERO,
                    data: erc20_transfer_calldata(hot_address, balance),
                },
                balance,
            )
        };

        let nonce = match self.client.tx_count(owner).await {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(%owner, error = %e, "Failed to fetch nonce, sweep deferred");
                return Ok(None);
            }
        };
        let fields = Eip1559Fields { nonce, ..fields };

        let signed = self
            .signer
            .sign_eip1559(&fields, &owner_entry.key_ref(), self.chain_id)?;
        match self.client.send_raw_transaction(&signed.raw_hex).await {
            Ok(()) => {}
            Err(NodeError::Transport(msg)) if retry::is_known_transaction(&msg) => {}
            Err(e) => {
                warn!(%owner, error = %e, "Sweep broadcast failed, deferred");
                return Ok(None);
            }
        }

        info!(
            %owner,
            %token,
            %amount,
            tx_hash = %signed.tx_hash,
            "Collection sweep broadcast"
        );
        Ok(Some(NewTransactionRecord {
            guid: Uuid::new_v4(),
            block_hash: B256::ZERO,
            block_number: 0,
            tx_hash: signed.tx_hash,
            from: owner,
            to: hot_address,
            token,
            fee: U256::ZERO,
            amount,
            status: TransactionStatus::Confirming.code(),
            tx_type: TxType::Collect,
            tx_index: 0,
        }))
    }
}

async fn commit_sweeps(
    pool: &PgPool,
    transactions: &[NewTransactionRecord],
    locks: &[BalanceLock],
) -> Result<()> {
    let mut dbtx = pool.begin().await?;
    db::store_transactions(&mut dbtx, transactions).await?;
    db::stage_balance_locks(&mut dbtx, locks, true).await?;
    dbtx.commit().await?;
    Ok(())
}
