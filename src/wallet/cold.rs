//! Cold pipeline: drain hot-wallet funds above the retain threshold into
//! cold storage.
//!
//! All transfers originate from the hot account, so one nonce fetch per tick
//! seeds a local counter. Each over-threshold (hot, token) row sends the
//! full excess and stages a matching hot lock, which the deposit pipeline
//! releases when the transfer is observed on-chain.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use eyre::{eyre, Result};
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{FundingConfig, GasConfig};
use crate::db::{self, AddressRow, BalanceLock, BalanceRow, NewTransactionRecord};
use crate::node::{EthClient, NodeError};
use crate::retry::{self, Backoff};
use crate::signer::{erc20_transfer_calldata, Eip1559Fields, WalletSigner};
use crate::types::{TransactionStatus, TxType};

pub struct ColdPipeline {
    client: Arc<dyn EthClient>,
    signer: Arc<dyn WalletSigner>,
    pool: PgPool,
    chain_id: u64,
    gas: GasConfig,
    funding: FundingConfig,
    interval: Duration,
    backoff: Backoff,
}

impl ColdPipeline {
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
        info!(threshold = %self.funding.cold_funding, "Cold pipeline started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await?;
        }
    }

    async fn tick(&self) -> Result<()> {
        let over_threshold =
            match db::hot_balances_over(&self.pool, self.funding.cold_funding).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "Failed to read hot balances, retrying next tick");
                    return Ok(());
                }
            };
        if over_threshold.is_empty() {
            return Ok(());
        }
        let wallets = match (
            db::query_hot_wallet_info(&self.pool).await,
            db::query_cold_wallet_info(&self.pool).await,
        ) {
            (Ok(Some(hot)), Ok(Some(cold))) => (hot, cold),
            (Ok(_), Ok(_)) => {
                debug!("Hot or cold wallet not enrolled, drain idle");
                return Ok(());
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to read wallet info, retrying next tick");
                return Ok(());
            }
        };
        let (hot, cold) = wallets;

        let mut nonce = match self.client.tx_count(hot.address()).await {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(error = %e, "Failed to fetch hot wallet nonce, retrying next tick");
                return Ok(());
            }
        };

        let mut transactions = Vec::new();
        let mut locks = Vec::new();
        for row in &over_threshold {
            match self.drain(row, &hot, cold.address(), nonce).await {
                Ok(Some((record, lock))) => {
                    nonce += 1;
                    transactions.push(record);
                    locks.push(lock);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(token = %row.token_address(), error = %e, "Failed to drain hot balance");
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
            "cold drain commit",
            || commit_drains(&pool, &transactions, &locks),
        )
        .await
        .map_err(|e| eyre!("cold drain commit exhausted retries: {e}"))?;

        info!(drained = transactions.len(), "Hot-to-cold transfers broadcast");
        Ok(())
    }

    async fn drain(
        &self,
        row: &BalanceRow,
        hot: &AddressRow,
        cold_address: Address,
        nonce: u64,
    ) -> Result<Option<(NewTransactionRecord, BalanceLock)>> {
        let token = row.token_address();
        let balance = row.balance();
        if balance <= self.funding.cold_funding {
            return Ok(None);
        }
        let excess = balance - self.funding.cold_funding;

        let fields = if token == Address::ZERO {
            Eip1559Fields {
                nonce,
                gas_tip_cap: self.gas.max_priority_fee_per_gas,
                gas_fee_cap: self.gas.max_fee_per_gas,
                gas_limit: self.gas.eth_gas_limit,
                to: cold_address,
                value: excess,
                data: Default::default(),
            }
        } else {
            Eip1559Fields {
                nonce,
                gas_tip_cap: self.gas.max_priority_fee_per_gas,
                gas_fee_cap: self.gas.max_fee_per_gas,
                gas_limit: self.gas.token_gas_limit,
                to: token,
                value: U256::ZERO,
                data: erc20_transfer_calldata(cold_address, excess),
            }
        };

        let signed = self
            .signer
            .sign_eip1559(&fields, &hot.key_ref(), self.chain_id)?;
        match self.client.send_raw_transaction(&signed.raw_hex).await {
            Ok(()) => {}
            Err(NodeError::Transport(msg)) if retry::is_known_transaction(&msg) => {}
            Err(e) => {
                warn!(%token, error = %e, "Drain broadcast failed, deferred");
                return Ok(None);
            }
        }

        info!(
            %token,
            amount = %excess,
            tx_hash = %signed.tx_hash,
            "Hot-to-cold transfer broadcast"
        );
        Ok(Some((
            NewTransactionRecord {
                guid: Uuid::new_v4(),
                block_hash: B256::ZERO,
                block_number: 0,
                tx_hash: signed.tx_hash,
                from: hot.address(),
                to: cold_address,
                token,
                fee: U256::ZERO,
                amount: excess,
                status: TransactionStatus::Confirming.code(),
                tx_type: TxType::HotToCold,
                tx_index: 0,
            },
            BalanceLock {
                address: hot.address(),
                token_address: token,
                lock: excess,
            },
        )))
    }
}

async fn commit_drains(
    pool: &PgPool,
    transactions: &[NewTransactionRecord],
    locks: &[BalanceLock],
) -> Result<()> {
    let mut dbtx = pool.begin().await?;
    db::store_transactions(&mut dbtx, transactions).await?;
    db::stage_balance_locks(&mut dbtx, locks, false).await?;
    dbtx.commit().await?;
    Ok(())
}
