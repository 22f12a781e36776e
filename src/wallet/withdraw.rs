//! Withdrawal signing and broadcast pipeline.
//!
//! Unsigned rows queued by the business layer are signed with the hot-wallet
//! key and broadcast. Signing and broadcasting are split by an outbox step:
//! the signed envelope and its hash are committed (together with the
//! hot-balance lock) before the first send, so a crash or commit failure at
//! any point replays the identical bytes instead of re-signing with a fresh
//! nonce. Node-side duplicate rejections count as success.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use eyre::{eyre, Result};
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::GasConfig;
use crate::db::{self, AddressRow, BalanceLock, WithdrawRow};
use crate::node::{EthClient, NodeError};
use crate::retry::{self, Backoff};
use crate::signer::{erc20_transfer_calldata, Eip1559Fields, SignedTx, WalletSigner};

pub struct WithdrawPipeline {
    client: Arc<dyn EthClient>,
    signer: Arc<dyn WalletSigner>,
    pool: PgPool,
    chain_id: u64,
    gas: GasConfig,
    interval: Duration,
    backoff: Backoff,
}

impl WithdrawPipeline {
    pub fn new(
        client: Arc<dyn EthClient>,
        signer: Arc<dyn WalletSigner>,
        pool: PgPool,
        chain_id: u64,
        gas: GasConfig,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            signer,
            pool,
            chain_id,
            gas,
            interval,
            backoff: Backoff::default(),
        }
    }

    pub async fn run(self) -> Result<()> {
        info!("Withdraw pipeline started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await?;
        }
    }

    async fn tick(&self) -> Result<()> {
        let unsent = match db::unsent_withdrawals(&self.pool).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Failed to read unsent withdrawals, retrying next tick");
                return Ok(());
            }
        };
        if unsent.is_empty() {
            return Ok(());
        }
        let hot = match db::query_hot_wallet_info(&self.pool).await {
            Ok(Some(hot)) => hot,
            Ok(None) => {
                debug!("No hot wallet enrolled, withdrawals wait");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Failed to read hot wallet info, retrying next tick");
                return Ok(());
            }
        };

        // Finish rows that were signed but not marked BROADCAST before a
        // restart: re-send the persisted bytes, never re-sign.
        let (signed, unsigned): (Vec<_>, Vec<_>) =
            unsent.into_iter().partition(|w| w.has_signed_tx());
        for withdrawal in &signed {
            if let Err(e) = self.rebroadcast(withdrawal).await {
                warn!(guid = %withdrawal.guid, error = %e, "Failed to re-broadcast signed withdrawal");
            }
        }
        if unsigned.is_empty() {
            return Ok(());
        }

        // One nonce fetch per tick; a local counter keeps the values
        // distinct when several withdrawals go out before any is mined.
        let mut nonce = match self.client.tx_count(hot.address()).await {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(error = %e, "Failed to fetch hot wallet nonce, retrying next tick");
                return Ok(());
            }
        };

        for withdrawal in &unsigned {
            match self.process_withdrawal(withdrawal, &hot, nonce).await {
                Ok(true) => nonce += 1,
                Ok(false) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Sign, persist, broadcast and mark one withdrawal. Returns whether the
    /// nonce was consumed. Policy violations (insufficient funds) and
    /// broadcast hiccups leave the row for a later tick.
    async fn process_withdrawal(
        &self,
        withdrawal: &WithdrawRow,
        hot: &AddressRow,
        nonce: u64,
    ) -> Result<bool> {
        let token = withdrawal.token_address();
        let amount = withdrawal.amount();

        let hot_balance = match db::query_balance(&self.pool, &hot.address(), &token).await {
            Ok(row) => row.map(|b| b.balance()).unwrap_or(U256::ZERO),
            Err(e) => {
                warn!(guid = %withdrawal.guid, error = %e, "Failed to read hot balance, deferred");
                return Ok(false);
            }
        };
        if hot_balance < amount {
            warn!(
                guid = %withdrawal.guid,
                %amount,
                available = %hot_balance,
                "Hot wallet balance insufficient, withdrawal deferred"
            );
            return Ok(false);
        }

        let fields = self.build_fields(withdrawal, nonce);
        let signed = self.signer.sign_eip1559(&fields, &hot.key_ref(), self.chain_id)?;

        // outbox commit: signed bytes + hot lock in one transaction
        let pool = self.pool.clone();
        let hot_address = hot.address();
        retry::with_retry(
            retry::DB_COMMIT_ATTEMPTS,
            &self.backoff,
            "withdraw outbox commit",
            || commit_signed(&pool, withdrawal, &signed, hot_address),
        )
        .await
        .map_err(|e| eyre!("withdraw outbox commit exhausted retries: {e}"))?;

        if !self.broadcast(&signed.raw_hex).await {
            // row stays UNSIGNED with bytes persisted; next tick re-sends
            warn!(guid = %withdrawal.guid, tx_hash = %signed.tx_hash, "Broadcast failed, will re-send");
            return Ok(true);
        }

        retry::with_retry(
            retry::DB_COMMIT_ATTEMPTS,
            &self.backoff,
            "withdraw mark sent",
            || mark_sent(&pool, withdrawal),
        )
        .await
        .map_err(|e| eyre!("withdraw status commit exhausted retries: {e}"))?;

        info!(
            guid = %withdrawal.guid,
            tx_hash = %signed.tx_hash,
            to = %withdrawal.to_address(),
            %amount,
            "Withdrawal broadcast"
        );
        Ok(true)
    }

    fn build_fields(&self, withdrawal: &WithdrawRow, nonce: u64) -> Eip1559Fields {
        let token = withdrawal.token_address();
        let amount = withdrawal.amount();
        if token == Address::ZERO {
            Eip1559Fields {
                nonce,
                gas_tip_cap: self.gas.max_priority_fee_per_gas,
                gas_fee_cap: self.gas.max_fee_per_gas,
                gas_limit: self.gas.eth_gas_limit,
                to: withdrawal.to_address(),
                value: amount,
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
                data: erc20_transfer_calldata(withdrawal.to_address(), amount),
            }
        }
    }

    /// Send raw bytes; duplicate-transaction rejections are success.
    async fn broadcast(&self, raw_hex: &str) -> bool {
        match self.client.send_raw_transaction(raw_hex).await {
            Ok(()) => true,
            Err(NodeError::Transport(msg)) if retry::is_known_transaction(&msg) => {
                debug!("Node already holds this transaction");
                true
            }
            Err(e) => {
                warn!(error = %e, "send_raw_transaction failed");
                false
            }
        }
    }

    /// Outbox recovery for rows signed before a crash.
    async fn rebroadcast(&self, withdrawal: &WithdrawRow) -> Result<()> {
        if !self.broadcast(&withdrawal.tx_sign_hex).await {
            return Ok(());
        }
        let pool = self.pool.clone();
        retry::with_retry(
            retry::DB_COMMIT_ATTEMPTS,
            &self.backoff,
            "withdraw mark sent",
            || mark_sent(&pool, withdrawal),
        )
        .await
        .map_err(|e| eyre!("withdraw status commit exhausted retries: {e}"))?;
        info!(guid = %withdrawal.guid, "Recovered withdrawal broadcast");
        Ok(())
    }
}

async fn commit_signed(
    pool: &PgPool,
    withdrawal: &WithdrawRow,
    signed: &SignedTx,
    hot: Address,
) -> Result<()> {
    let mut dbtx = pool.begin().await?;
    db::set_withdraw_signed(&mut dbtx, &withdrawal.guid, &signed.tx_hash, &signed.raw_hex).await?;
    db::stage_balance_locks(
        &mut dbtx,
        &[BalanceLock {
            address: hot,
            token_address: withdrawal.token_address(),
            lock: withdrawal.amount(),
        }],
        false,
    )
    .await?;
    dbtx.commit().await?;
    Ok(())
}

async fn mark_sent(pool: &PgPool, withdrawal: &WithdrawRow) -> Result<()> {
    let mut dbtx = pool.begin().await?;
    db::mark_withdraws_sent(&mut dbtx, &[withdrawal.guid]).await?;
    dbtx.commit().await?;
    Ok(())
}
