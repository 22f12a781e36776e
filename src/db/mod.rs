//! Transactional persistence for blocks, deposits, withdrawals,
//! transactions, balances, tokens and addresses.
//!
//! Queries take a pool and return `None`/empty when no row matches. Writers
//! take `&mut PgConnection` so a pipeline can compose a whole batch into one
//! atomic transaction (`pool.begin()` .. `commit()`), typically wrapped by
//! the retry harness. Batched inserts are chunked at [`BATCH_INSERT_SIZE`].

use alloy::primitives::{Address, B256, U256};
use chrono::Utc;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use uuid::Uuid;

pub mod models;

pub use models::*;

use crate::types::{AddressType, TxType, WithdrawStatus};

/// Rows per INSERT statement.
pub const BATCH_INSERT_SIZE: usize = 3_000;

const BALANCE_COLUMNS: &str = "guid, address, token_address, address_type, \
     balance::TEXT AS balance, lock_balance::TEXT AS lock_balance, timestamp";

const WITHDRAW_COLUMNS: &str = "guid, block_hash, block_number, hash, from_address, to_address, \
     token_address, fee::TEXT AS fee, amount::TEXT AS amount, status, transaction_index, \
     tx_sign_hex, timestamp";

const TRANSACTION_COLUMNS: &str = "guid, block_hash, block_number, hash, from_address, \
     to_address, token_address, fee::TEXT AS fee, amount::TEXT AS amount, status, tx_type, \
     transaction_index, timestamp";

fn now() -> i64 {
    Utc::now().timestamp()
}

/// Create a database connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/).
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Address book
// ---------------------------------------------------------------------------

pub async fn query_address(pool: &PgPool, address: &Address) -> Result<Option<AddressRow>> {
    sqlx::query_as::<_, AddressRow>("SELECT * FROM addresses WHERE address = $1")
        .bind(address.as_slice())
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to query address")
}

pub async fn query_hot_wallet_info(pool: &PgPool) -> Result<Option<AddressRow>> {
    sqlx::query_as::<_, AddressRow>("SELECT * FROM addresses WHERE address_type = $1 LIMIT 1")
        .bind(AddressType::Hot.code())
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to query hot wallet info")
}

pub async fn query_cold_wallet_info(pool: &PgPool) -> Result<Option<AddressRow>> {
    sqlx::query_as::<_, AddressRow>("SELECT * FROM addresses WHERE address_type = $1 LIMIT 1")
        .bind(AddressType::Cold.code())
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to query cold wallet info")
}

/// Enroll addresses. Used by tooling and tests; the engine itself treats the
/// address book as read-only.
pub async fn store_addresses(conn: &mut PgConnection, addresses: &[NewAddress]) -> Result<()> {
    for chunk in addresses.chunks(BATCH_INSERT_SIZE) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO addresses (guid, user_uid, address, address_type, private_key, \
             public_key, timestamp) ",
        );
        let ts = now();
        qb.push_values(chunk, |mut b, a| {
            b.push_bind(Uuid::new_v4())
                .push_bind(&a.user_uid)
                .push_bind(a.address.as_slice())
                .push_bind(a.address_type.code())
                .push_bind(&a.private_key)
                .push_bind(&a.public_key)
                .push_bind(ts);
        });
        qb.push(" ON CONFLICT (address) DO NOTHING");
        qb.build()
            .execute(&mut *conn)
            .await
            .wrap_err("Failed to store addresses")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Token registry
// ---------------------------------------------------------------------------

pub async fn query_token(pool: &PgPool, token_address: &Address) -> Result<Option<TokenRow>> {
    sqlx::query_as::<_, TokenRow>(
        "SELECT guid, token_address, decimals, token_name, \
         collect_amount::TEXT AS collect_amount, timestamp \
         FROM tokens WHERE token_address = $1",
    )
    .bind(token_address.as_slice())
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to query token")
}

pub async fn store_tokens(conn: &mut PgConnection, tokens: &[NewToken]) -> Result<()> {
    for chunk in tokens.chunks(BATCH_INSERT_SIZE) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO tokens (guid, token_address, decimals, token_name, collect_amount, \
             timestamp) ",
        );
        let ts = now();
        qb.push_values(chunk, |mut b, t| {
            b.push_bind(Uuid::new_v4())
                .push_bind(t.token_address.as_slice())
                .push_bind(t.decimals)
                .push_bind(&t.token_name)
                .push_bind(t.collect_amount.to_string())
                .push_unseparated("::NUMERIC")
                .push_bind(ts);
        });
        qb.push(" ON CONFLICT (token_address) DO NOTHING");
        qb.build()
            .execute(&mut *conn)
            .await
            .wrap_err("Failed to store tokens")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// Highest indexed block, used to resume the traversal cursor.
pub async fn latest_block(pool: &PgPool) -> Result<Option<BlockRow>> {
    sqlx::query_as::<_, BlockRow>("SELECT * FROM blocks ORDER BY number DESC LIMIT 1")
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to query latest block")
}

pub async fn store_blocks(conn: &mut PgConnection, blocks: &[NewBlock]) -> Result<()> {
    for chunk in blocks.chunks(BATCH_INSERT_SIZE) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO blocks (hash, parent_hash, number, timestamp, header_bytes) ",
        );
        qb.push_values(chunk, |mut b, blk| {
            b.push_bind(blk.hash.to_vec())
                .push_bind(blk.parent_hash.to_vec())
                .push_bind(blk.number as i64)
                .push_bind(blk.timestamp as i64)
                .push_bind(blk.header_bytes.as_slice());
        });
        qb.push(" ON CONFLICT (hash) DO NOTHING");
        qb.build()
            .execute(&mut *conn)
            .await
            .wrap_err("Failed to store blocks")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Deposits
// ---------------------------------------------------------------------------

/// Insert observed deposits. Duplicate (hash, transaction_index) pairs are
/// ignored so a replayed batch cannot double-credit.
pub async fn store_deposits(conn: &mut PgConnection, deposits: &[NewDeposit]) -> Result<()> {
    for chunk in deposits.chunks(BATCH_INSERT_SIZE) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO deposits (guid, block_hash, block_number, hash, from_address, \
             to_address, token_address, fee, amount, status, transaction_index, timestamp) ",
        );
        let ts = now();
        qb.push_values(chunk, |mut b, d| {
            b.push_bind(d.guid)
                .push_bind(d.block_hash.to_vec())
                .push_bind(d.block_number as i64)
                .push_bind(d.tx_hash.to_vec())
                .push_bind(d.from.as_slice())
                .push_bind(d.to.as_slice())
                .push_bind(d.token.as_slice())
                .push_bind(d.fee.to_string())
                .push_unseparated("::NUMERIC")
                .push_bind(d.amount.to_string())
                .push_unseparated("::NUMERIC")
                .push_bind(crate::types::DepositStatus::Confirming.code())
                .push_bind(d.tx_index as i64)
                .push_bind(ts);
        });
        qb.push(" ON CONFLICT (hash, transaction_index) DO NOTHING");
        qb.build()
            .execute(&mut *conn)
            .await
            .wrap_err("Failed to store deposits")?;
    }
    Ok(())
}

/// Promote every confirming deposit at or below `block_number` to credited.
pub async fn update_deposits_status(conn: &mut PgConnection, block_number: u64) -> Result<()> {
    sqlx::query("UPDATE deposits SET status = 1 WHERE status = 0 AND block_number <= $1")
        .bind(block_number as i64)
        .execute(conn)
        .await
        .wrap_err("Failed to update deposit statuses")?;
    Ok(())
}

pub async fn query_deposits_by_address(pool: &PgPool, address: &Address) -> Result<Vec<DepositRow>> {
    sqlx::query_as::<_, DepositRow>(
        "SELECT guid, block_hash, block_number, hash, from_address, to_address, token_address, \
         fee::TEXT AS fee, amount::TEXT AS amount, status, transaction_index, timestamp \
         FROM deposits WHERE to_address = $1 ORDER BY timestamp DESC",
    )
    .bind(address.as_slice())
    .fetch_all(pool)
    .await
    .wrap_err("Failed to query deposits")
}

// ---------------------------------------------------------------------------
// Withdrawals
// ---------------------------------------------------------------------------

/// Entry point for the business layer: queue an unsigned withdrawal.
pub async fn submit_withdrawal(
    conn: &mut PgConnection,
    from: Address,
    to: Address,
    token: Address,
    amount: U256,
) -> Result<Uuid> {
    let guid = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO withdraws (guid, block_hash, block_number, hash, from_address, to_address, \
         token_address, fee, amount, status, transaction_index, tx_sign_hex, timestamp) \
         VALUES ($1, '', 0, '', $2, $3, $4, 0, $5::NUMERIC, $6, 0, '', $7)",
    )
    .bind(guid)
    .bind(from.as_slice())
    .bind(to.as_slice())
    .bind(token.as_slice())
    .bind(amount.to_string())
    .bind(WithdrawStatus::Unsigned.code())
    .bind(now())
    .execute(conn)
    .await
    .wrap_err("Failed to submit withdrawal")?;
    Ok(guid)
}

/// All withdrawals still awaiting signing or broadcast.
pub async fn unsent_withdrawals(pool: &PgPool) -> Result<Vec<WithdrawRow>> {
    sqlx::query_as::<_, WithdrawRow>(&format!(
        "SELECT {WITHDRAW_COLUMNS} FROM withdraws WHERE status = $1 ORDER BY timestamp ASC"
    ))
    .bind(WithdrawStatus::Unsigned.code())
    .fetch_all(pool)
    .await
    .wrap_err("Failed to query unsent withdrawals")
}

pub async fn query_withdraw_by_tx_hash(
    pool: &PgPool,
    tx_hash: &B256,
) -> Result<Option<WithdrawRow>> {
    sqlx::query_as::<_, WithdrawRow>(&format!(
        "SELECT {WITHDRAW_COLUMNS} FROM withdraws WHERE hash = $1"
    ))
    .bind(tx_hash.as_slice())
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to query withdrawal by tx hash")
}

pub async fn query_withdraw_by_guid(pool: &PgPool, guid: &Uuid) -> Result<Option<WithdrawRow>> {
    sqlx::query_as::<_, WithdrawRow>(&format!(
        "SELECT {WITHDRAW_COLUMNS} FROM withdraws WHERE guid = $1"
    ))
    .bind(guid)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to query withdrawal by guid")
}

/// Outbox step: persist the signed envelope and its hash before broadcast.
pub async fn set_withdraw_signed(
    conn: &mut PgConnection,
    guid: &Uuid,
    tx_hash: &B256,
    raw_hex: &str,
) -> Result<()> {
    sqlx::query("UPDATE withdraws SET hash = $2, tx_sign_hex = $3 WHERE guid = $1")
        .bind(guid)
        .bind(tx_hash.as_slice())
        .bind(raw_hex)
        .execute(conn)
        .await
        .wrap_err("Failed to persist signed withdrawal")?;
    Ok(())
}

/// Promote unsigned withdrawals to status BROADCAST. The status guard keeps
/// a row the deposit pipeline already saw on-chain from moving backwards.
pub async fn mark_withdraws_sent(conn: &mut PgConnection, guids: &[Uuid]) -> Result<()> {
    if guids.is_empty() {
        return Ok(());
    }
    sqlx::query("UPDATE withdraws SET status = $2 WHERE guid = ANY($1) AND status = $3")
        .bind(guids)
        .bind(WithdrawStatus::Broadcast.code())
        .bind(WithdrawStatus::Unsigned.code())
        .execute(conn)
        .await
        .wrap_err("Failed to mark withdrawals sent")?;
    Ok(())
}

/// Move observed withdrawals to ON_CHAIN and record the final fee. Keyed by
/// tx hash (set at signing time).
pub async fn update_withdraws_onchain(
    conn: &mut PgConnection,
    updates: &[(B256, U256)],
) -> Result<()> {
    for (tx_hash, fee) in updates {
        sqlx::query("UPDATE withdraws SET status = $2, fee = $3::NUMERIC WHERE hash = $1")
            .bind(tx_hash.as_slice())
            .bind(WithdrawStatus::OnChain.code())
            .bind(fee.to_string())
            .execute(&mut *conn)
            .await
            .wrap_err("Failed to update withdrawal status")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Transactions (audit log)
// ---------------------------------------------------------------------------

pub async fn query_transaction_by_tx_hash(
    pool: &PgPool,
    tx_hash: &B256,
) -> Result<Option<TransactionRow>> {
    sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE hash = $1 LIMIT 1"
    ))
    .bind(tx_hash.as_slice())
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to query transaction by tx hash")
}

pub async fn store_transactions(
    conn: &mut PgConnection,
    transactions: &[NewTransactionRecord],
) -> Result<()> {
    for chunk in transactions.chunks(BATCH_INSERT_SIZE) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO transactions (guid, block_hash, block_number, hash, from_address, \
             to_address, token_address, fee, amount, status, tx_type, transaction_index, \
             timestamp) ",
        );
        let ts = now();
        qb.push_values(chunk, |mut b, t| {
            b.push_bind(t.guid)
                .push_bind(t.block_hash.to_vec())
                .push_bind(t.block_number as i64)
                .push_bind(t.tx_hash.to_vec())
                .push_bind(t.from.as_slice())
                .push_bind(t.to.as_slice())
                .push_bind(t.token.as_slice())
                .push_bind(t.fee.to_string())
                .push_unseparated("::NUMERIC")
                .push_bind(t.amount.to_string())
                .push_unseparated("::NUMERIC")
                .push_bind(t.status)
                .push_bind(t.tx_type.code())
                .push_bind(t.tx_index as i64)
                .push_bind(ts);
        });
        qb.build()
            .execute(&mut *conn)
            .await
            .wrap_err("Failed to store transactions")?;
    }
    Ok(())
}

/// Promote every confirming transaction row at or below `block_number`.
pub async fn update_transactions_status(conn: &mut PgConnection, block_number: u64) -> Result<()> {
    sqlx::query("UPDATE transactions SET status = 1 WHERE status = 0 AND block_number <= $1")
        .bind(block_number as i64)
        .execute(conn)
        .await
        .wrap_err("Failed to update transaction statuses")?;
    Ok(())
}

/// Settle previously recorded pending transfers (collection / hot-to-cold
/// rows the deposit pipeline has now observed on-chain).
pub async fn update_transactions_settled(
    conn: &mut PgConnection,
    updates: &[(B256, U256)],
) -> Result<()> {
    for (tx_hash, fee) in updates {
        sqlx::query("UPDATE transactions SET status = 1, fee = $2::NUMERIC WHERE hash = $1")
            .bind(tx_hash.as_slice())
            .bind(fee.to_string())
            .execute(&mut *conn)
            .await
            .wrap_err("Failed to settle transaction")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

pub async fn query_balance(
    pool: &PgPool,
    address: &Address,
    token_address: &Address,
) -> Result<Option<BalanceRow>> {
    sqlx::query_as::<_, BalanceRow>(&format!(
        "SELECT {BALANCE_COLUMNS} FROM balances WHERE address = $1 AND token_address = $2"
    ))
    .bind(address.as_slice())
    .bind(token_address.as_slice())
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to query balance")
}

/// User balance rows at or above the collection threshold.
pub async fn uncollected_balances(pool: &PgPool, threshold: U256) -> Result<Vec<BalanceRow>> {
    sqlx::query_as::<_, BalanceRow>(&format!(
        "SELECT {BALANCE_COLUMNS} FROM balances \
         WHERE address_type = $1 AND balance >= $2::NUMERIC"
    ))
    .bind(AddressType::User.code())
    .bind(threshold.to_string())
    .fetch_all(pool)
    .await
    .wrap_err("Failed to query uncollected balances")
}

/// Hot-wallet balance rows at or above the cold-storage threshold.
pub async fn hot_balances_over(pool: &PgPool, threshold: U256) -> Result<Vec<BalanceRow>> {
    sqlx::query_as::<_, BalanceRow>(&format!(
        "SELECT {BALANCE_COLUMNS} FROM balances \
         WHERE address_type = $1 AND balance >= $2::NUMERIC"
    ))
    .bind(AddressType::Hot.code())
    .bind(threshold.to_string())
    .fetch_all(pool)
    .await
    .wrap_err("Failed to query hot wallet balances")
}

/// Apply confirmed balance movements. Arithmetic happens in SQL so the
/// storage engine's row locks serialize concurrent pipelines.
pub async fn apply_balance_deltas(
    conn: &mut PgConnection,
    deltas: &[BalanceDelta],
    hot: Option<Address>,
) -> Result<()> {
    for delta in deltas {
        match delta.tx_type {
            TxType::Deposit => {
                credit_balance(
                    conn,
                    &delta.address,
                    &delta.token_address,
                    delta.address_type,
                    delta.amount,
                )
                .await?;
            }
            TxType::Withdraw | TxType::HotToCold => {
                let Some(hot) = hot else { continue };
                release_lock(conn, &hot, &delta.token_address).await?;
            }
            TxType::Collect => {
                release_lock(conn, &delta.address, &delta.token_address).await?;
                let Some(hot) = hot else { continue };
                credit_balance(conn, &hot, &delta.token_address, AddressType::Hot, delta.amount)
                    .await?;
            }
            TxType::ColdToHot => {
                let Some(hot) = hot else { continue };
                credit_balance(conn, &hot, &delta.token_address, AddressType::Hot, delta.amount)
                    .await?;
            }
        }
    }
    Ok(())
}

async fn credit_balance(
    conn: &mut PgConnection,
    address: &Address,
    token_address: &Address,
    address_type: AddressType,
    amount: U256,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO balances (guid, address, token_address, address_type, balance, \
         lock_balance, timestamp) \
         VALUES ($1, $2, $3, $4, $5::NUMERIC, 0, $6) \
         ON CONFLICT (address, token_address) DO UPDATE \
         SET balance = balances.balance + EXCLUDED.balance, timestamp = EXCLUDED.timestamp",
    )
    .bind(Uuid::new_v4())
    .bind(address.as_slice())
    .bind(token_address.as_slice())
    .bind(address_type.code())
    .bind(amount.to_string())
    .bind(now())
    .execute(conn)
    .await
    .wrap_err("Failed to credit balance")?;
    Ok(())
}

async fn release_lock(
    conn: &mut PgConnection,
    address: &Address,
    token_address: &Address,
) -> Result<()> {
    sqlx::query(
        "UPDATE balances SET lock_balance = 0, timestamp = $3 \
         WHERE address = $1 AND token_address = $2",
    )
    .bind(address.as_slice())
    .bind(token_address.as_slice())
    .bind(now())
    .execute(conn)
    .await
    .wrap_err("Failed to release balance lock")?;
    Ok(())
}

/// Stage locks for outbound transfers. With `is_collection` the whole
/// spendable balance moves into the lock; otherwise the given lock amount is
/// carved out of the spendable balance.
pub async fn stage_balance_locks(
    conn: &mut PgConnection,
    locks: &[BalanceLock],
    is_collection: bool,
) -> Result<()> {
    for lock in locks {
        if is_collection {
            sqlx::query(
                "UPDATE balances SET lock_balance = balance, balance = 0, timestamp = $3 \
                 WHERE address = $1 AND token_address = $2",
            )
            .bind(lock.address.as_slice())
            .bind(lock.token_address.as_slice())
            .bind(now())
            .execute(&mut *conn)
            .await
            .wrap_err("Failed to stage collection lock")?;
        } else {
            sqlx::query(
                "UPDATE balances \
                 SET balance = balance - $3::NUMERIC, lock_balance = $3::NUMERIC, timestamp = $4 \
                 WHERE address = $1 AND token_address = $2",
            )
            .bind(lock.address.as_slice())
            .bind(lock.token_address.as_slice())
            .bind(lock.lock.to_string())
            .bind(now())
            .execute(&mut *conn)
            .await
            .wrap_err("Failed to stage balance lock")?;
        }
    }
    Ok(())
}
