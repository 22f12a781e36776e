//! Deposit indexing pipeline.
//!
//! Each tick pulls the next confirmed header range from the traversal
//! cursor, classifies every transaction that touches a known token contract
//! or internal address, and commits the resulting rows and balance movements
//! in a single ledger transaction under the retry harness. A failed fetch
//! keeps the header slice for the next tick so no gap can be introduced.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use eyre::{eyre, Result};
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{self, BalanceDelta, NewBlock, NewDeposit, NewTransactionRecord};
use crate::node::{EthClient, HeaderTraversal, NodeError, RpcBlock, RpcHeader, RpcReceipt, TraversalError};
use crate::retry::{self, Backoff};
use crate::signer::parse_erc20_transfer;
use crate::types::{AddressType, TransactionStatus, TxType};

/// Rows and updates accumulated while scanning one header slice, committed
/// atomically.
#[derive(Debug, Default)]
struct DepositBatch {
    blocks: Vec<NewBlock>,
    deposits: Vec<NewDeposit>,
    transactions: Vec<NewTransactionRecord>,
    withdraw_updates: Vec<(B256, U256)>,
    settled_transactions: Vec<(B256, U256)>,
    balance_deltas: Vec<BalanceDelta>,
    end_block: u64,
}

pub struct DepositPipeline {
    client: Arc<dyn EthClient>,
    pool: PgPool,
    traversal: HeaderTraversal,
    confirmations: u64,
    blocks_step: u64,
    interval: Duration,
    backoff: Backoff,
    /// Headers fetched but not yet committed; retained across failed ticks.
    pending_headers: Vec<RpcHeader>,
    /// Number and hash of the last committed block, for linkage warnings.
    last_committed: Option<(u64, B256)>,
}

impl DepositPipeline {
    pub fn new(
        client: Arc<dyn EthClient>,
        pool: PgPool,
        traversal: HeaderTraversal,
        confirmations: u64,
        blocks_step: u64,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            pool,
            traversal,
            confirmations,
            blocks_step,
            interval,
            backoff: Backoff::default(),
            pending_headers: Vec::new(),
            last_committed: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            confirmations = self.confirmations,
            blocks_step = self.blocks_step,
            "Deposit pipeline started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await?;
        }
    }

    /// One unit of work. Chain hiccups log and leave state for the next
    /// tick; only commit exhaustion is fatal.
    async fn tick(&mut self) -> Result<()> {
        if self.pending_headers.is_empty() {
            match self.traversal.next_headers(self.blocks_step).await {
                Ok(headers) => self.pending_headers = headers,
                Err(TraversalError::AheadOfProvider) => {
                    error!(
                        last_committed = ?self.last_committed,
                        "Chain node reports a tip below the indexed height, holding the cursor"
                    );
                    return Ok(());
                }
                Err(TraversalError::Node(e)) => {
                    warn!(error = %e, "Failed to fetch next headers, retrying on next tick");
                    return Ok(());
                }
            }
        }
        if self.pending_headers.is_empty() {
            return Ok(());
        }

        if let (Some((number, hash)), Some(first)) =
            (self.last_committed, self.pending_headers.first())
        {
            if first.number() == number + 1 && first.parent_hash != hash {
                warn!(
                    block = first.number(),
                    expected_parent = %hash,
                    actual_parent = %first.parent_hash,
                    "Parent hash does not link to the last committed block; \
                     reorg deeper than the confirmation depth suspected"
                );
            }
        }

        let (first_number, last_number, last_hash) =
            match (self.pending_headers.first(), self.pending_headers.last()) {
                (Some(first), Some(last)) => (first.number(), last.number(), last.hash),
                _ => return Ok(()),
            };

        let batch = match self.build_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(
                    error = %e,
                    headers = self.pending_headers.len(),
                    "Failed to assemble deposit batch, headers retained for next tick"
                );
                return Ok(());
            }
        };

        let hot = match db::query_hot_wallet_info(&self.pool).await {
            Ok(row) => row.map(|r| r.address()),
            Err(e) => {
                warn!(error = %e, "Failed to read hot wallet info, headers retained for next tick");
                return Ok(());
            }
        };
        let pool = self.pool.clone();
        let confirmations = self.confirmations;
        retry::with_retry(
            retry::DB_COMMIT_ATTEMPTS,
            &self.backoff,
            "deposit batch commit",
            || commit_batch(&pool, &batch, confirmations, hot),
        )
        .await
        .map_err(|e| eyre!("deposit batch commit exhausted retries: {e}"))?;

        self.last_committed = Some((last_number, last_hash));
        info!(
            from = first_number,
            to = last_number,
            deposits = batch.deposits.len(),
            withdraws = batch.withdraw_updates.len(),
            "Committed deposit batch"
        );
        self.pending_headers.clear();
        Ok(())
    }

    async fn build_batch(&self) -> Result<DepositBatch> {
        let mut batch = DepositBatch::default();
        for header in &self.pending_headers {
            let block = self.client.block_by_number(header.number()).await?;
            for tx_hash in &block.transactions {
                self.process_transaction(*tx_hash, &block, header, &mut batch)
                    .await?;
            }
            batch.blocks.push(NewBlock::from(header));
            batch.end_block = header.number();
        }
        Ok(batch)
    }

    /// Classify one transaction and queue its ledger effects. Decoding
    /// problems skip the transaction; transport problems abort the batch.
    async fn process_transaction(
        &self,
        tx_hash: B256,
        block: &RpcBlock,
        header: &RpcHeader,
        batch: &mut DepositBatch,
    ) -> Result<()> {
        let tx = match self.client.tx_by_hash(tx_hash).await {
            Ok(tx) => tx,
            Err(NodeError::NotFound) => {
                warn!(%tx_hash, "Mined transaction missing from node, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(to) = tx.to else {
            // contract creation
            return Ok(());
        };

        let token = db::query_token(&self.pool, &to).await?;
        let to_entry = db::query_address(&self.pool, &to).await?;
        if token.is_none() && to_entry.is_none() {
            // cheap early filter: only our own pending outbound transfers
            // can still be interesting at an unknown recipient
            let pending_withdraw = db::query_withdraw_by_tx_hash(&self.pool, &tx_hash).await?;
            let pending_tx = db::query_transaction_by_tx_hash(&self.pool, &tx_hash).await?;
            if pending_withdraw.is_none() && pending_tx.is_none() {
                return Ok(());
            }
        }

        let receipt = match self.client.tx_receipt_by_hash(tx_hash).await {
            Ok(receipt) => receipt,
            Err(NodeError::NotFound) => {
                warn!(%tx_hash, "Receipt missing for mined transaction, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if !receipt.succeeded() {
            debug!(%tx_hash, "Transaction reverted, skipping");
            return Ok(());
        }

        let (recipient, amount, token_address) = if token.is_some() {
            match parse_erc20_transfer(&tx.input) {
                Some((transfer_to, transfer_amount)) => (transfer_to, transfer_amount, to),
                None => {
                    debug!(%tx_hash, "Token call is not transfer(address,uint256), skipping");
                    return Ok(());
                }
            }
        } else {
            (to, tx.value, Address::ZERO)
        };
        let sender = tx.from;

        let recipient_entry = if token.is_some() {
            db::query_address(&self.pool, &recipient).await?
        } else {
            to_entry
        };
        let sender_entry = db::query_address(&self.pool, &sender).await?;
        if recipient_entry.is_none() && sender_entry.is_none() {
            return Ok(());
        }

        let pending_withdraw = db::query_withdraw_by_tx_hash(&self.pool, &tx_hash).await?;
        let pending_tx = db::query_transaction_by_tx_hash(&self.pool, &tx_hash).await?;

        let fee = compute_fee(&receipt, block.base_fee_per_gas);
        let tx_index = receipt
            .transaction_index
            .or(tx.transaction_index)
            .map(|i| i.to::<u64>())
            .unwrap_or_default();

        match (&recipient_entry, &sender_entry) {
            // inbound transfer from the outside: a deposit
            (Some(to_row), None) => {
                let address_type = to_row.address_type().unwrap_or(AddressType::User);
                batch.deposits.push(NewDeposit {
                    guid: Uuid::new_v4(),
                    block_hash: header.hash,
                    block_number: header.number(),
                    tx_hash,
                    from: sender,
                    to: recipient,
                    token: token_address,
                    fee,
                    amount,
                    tx_index,
                });
                batch.transactions.push(NewTransactionRecord {
                    guid: Uuid::new_v4(),
                    block_hash: header.hash,
                    block_number: header.number(),
                    tx_hash,
                    from: sender,
                    to: recipient,
                    token: token_address,
                    fee,
                    amount,
                    status: TransactionStatus::Confirming.code(),
                    tx_type: TxType::Deposit,
                    tx_index,
                });
                batch.balance_deltas.push(BalanceDelta {
                    address: recipient,
                    token_address,
                    address_type,
                    amount,
                    tx_type: TxType::Deposit,
                });
                info!(
                    %tx_hash,
                    to = %recipient,
                    token = %token_address,
                    %amount,
                    "Observed deposit"
                );
            }
            // outbound transfer to the outside: a withdrawal we broadcast
            (None, Some(_)) => {
                if pending_withdraw.is_none() {
                    debug!(%tx_hash, "Outbound transfer with no pending withdrawal, skipping");
                    return Ok(());
                }
                batch.withdraw_updates.push((tx_hash, fee));
                batch.transactions.push(NewTransactionRecord {
                    guid: Uuid::new_v4(),
                    block_hash: header.hash,
                    block_number: header.number(),
                    tx_hash,
                    from: sender,
                    to: recipient,
                    token: token_address,
                    fee,
                    amount,
                    status: TransactionStatus::Settled.code(),
                    tx_type: TxType::Withdraw,
                    tx_index,
                });
                batch.balance_deltas.push(BalanceDelta {
                    address: sender,
                    token_address,
                    address_type: AddressType::Hot,
                    amount,
                    tx_type: TxType::Withdraw,
                });
                info!(%tx_hash, to = %recipient, %amount, "Withdrawal observed on-chain");
            }
            // both endpoints internal: collection or operator rebalancing
            (Some(to_row), Some(from_row)) => {
                let Some(tx_type) =
                    internal_transfer_type(from_row.address_type(), to_row.address_type())
                else {
                    debug!(%tx_hash, "Unrecognized internal transfer, skipping");
                    return Ok(());
                };
                if pending_tx.is_some() {
                    batch.settled_transactions.push((tx_hash, fee));
                } else {
                    // not staged by a pipeline (e.g. a manual cold refill)
                    batch.transactions.push(NewTransactionRecord {
                        guid: Uuid::new_v4(),
                        block_hash: header.hash,
                        block_number: header.number(),
                        tx_hash,
                        from: sender,
                        to: recipient,
                        token: token_address,
                        fee,
                        amount,
                        status: TransactionStatus::Settled.code(),
                        tx_type,
                        tx_index,
                    });
                }
                batch.balance_deltas.push(BalanceDelta {
                    address: sender,
                    token_address,
                    address_type: from_row.address_type().unwrap_or(AddressType::User),
                    amount,
                    tx_type,
                });
                info!(%tx_hash, %tx_type, %amount, "Internal transfer observed on-chain");
            }
            (None, None) => {}
        }
        Ok(())
    }
}

/// Commit one scanned slice atomically: blocks, new deposits, confirmation
/// promotion, withdrawal/transaction settlement, balance movements.
async fn commit_batch(
    pool: &PgPool,
    batch: &DepositBatch,
    confirmations: u64,
    hot: Option<Address>,
) -> Result<()> {
    let mut dbtx = pool.begin().await?;
    db::store_blocks(&mut dbtx, &batch.blocks).await?;
    db::store_deposits(&mut dbtx, &batch.deposits).await?;
    // promotion must run after the inserts so rows from this very slice are
    // credited once they are already deep enough
    let promote_below = batch.end_block.saturating_sub(confirmations);
    db::update_deposits_status(&mut dbtx, promote_below).await?;
    db::update_withdraws_onchain(&mut dbtx, &batch.withdraw_updates).await?;
    db::store_transactions(&mut dbtx, &batch.transactions).await?;
    db::update_transactions_status(&mut dbtx, promote_below).await?;
    db::update_transactions_settled(&mut dbtx, &batch.settled_transactions).await?;
    db::apply_balance_deltas(&mut dbtx, &batch.balance_deltas, hot).await?;
    dbtx.commit().await?;
    Ok(())
}

/// Semantic type of a transfer between two internal addresses.
fn internal_transfer_type(
    from: Option<AddressType>,
    to: Option<AddressType>,
) -> Option<TxType> {
    match (from?, to?) {
        (AddressType::User, AddressType::Hot) => Some(TxType::Collect),
        (AddressType::Hot, AddressType::Cold) => Some(TxType::HotToCold),
        (AddressType::Cold, AddressType::Hot) => Some(TxType::ColdToHot),
        _ => None,
    }
}

/// Transaction fee as the wallet accounts it: dynamic-fee receipts pay
/// `(effective_gas_price + base_fee) * gas_used`, legacy receipts
/// `effective_gas_price * gas_used`.
fn compute_fee(receipt: &RpcReceipt, base_fee: Option<U256>) -> U256 {
    if receipt.is_dynamic_fee() {
        (receipt.effective_gas_price + base_fee.unwrap_or(U256::ZERO)) * receipt.gas_used
    } else {
        receipt.effective_gas_price * receipt.gas_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U64;

    fn receipt(tx_type: u64, effective_gas_price: u64, gas_used: u64) -> RpcReceipt {
        RpcReceipt {
            tx_type: Some(U64::from(tx_type)),
            status: Some(U64::from(1)),
            effective_gas_price: U256::from(effective_gas_price),
            gas_used: U256::from(gas_used),
            block_number: None,
            transaction_index: None,
        }
    }

    #[test]
    fn test_dynamic_fee_includes_base_fee() {
        // 20 gwei effective + 10 gwei base, 21000 gas
        let r = receipt(2, 20_000_000_000, 21_000);
        let fee = compute_fee(&r, Some(U256::from(10_000_000_000u64)));
        assert_eq!(fee, U256::from(630_000_000_000_000u64)); // 30 gwei * 21000
    }

    #[test]
    fn test_legacy_fee_ignores_base_fee() {
        let r = receipt(0, 20_000_000_000, 21_000);
        let fee = compute_fee(&r, Some(U256::from(10_000_000_000u64)));
        assert_eq!(fee, U256::from(420_000_000_000_000u64)); // 20 gwei * 21000
    }

    #[test]
    fn test_dynamic_fee_with_absent_base_fee() {
        let r = receipt(2, 20_000_000_000, 21_000);
        assert_eq!(
            compute_fee(&r, None),
            U256::from(420_000_000_000_000u64)
        );
    }

    #[test]
    fn test_internal_transfer_classification() {
        use AddressType::*;
        assert_eq!(internal_transfer_type(Some(User), Some(Hot)), Some(TxType::Collect));
        assert_eq!(internal_transfer_type(Some(Hot), Some(Cold)), Some(TxType::HotToCold));
        assert_eq!(internal_transfer_type(Some(Cold), Some(Hot)), Some(TxType::ColdToHot));
        // user-to-user and hot-to-user transfers are not engine traffic
        assert_eq!(internal_transfer_type(Some(User), Some(User)), None);
        assert_eq!(internal_transfer_type(Some(Hot), Some(User)), None);
        assert_eq!(internal_transfer_type(None, Some(Hot)), None);
    }
}
