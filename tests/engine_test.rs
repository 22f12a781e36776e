//! Ledger integration tests for the wallet engine.
//!
//! Run with: cargo test --test engine_test -- --nocapture
//!
//! Prerequisites:
//! - Postgres reachable via DATABASE_URL (migrations run automatically)
//!
//! Every test uses freshly generated addresses so runs are independent and
//! repeatable against the same database.

use alloy::primitives::{Address, B256, U256};
use uuid::Uuid;

use ethvault::db::{
    self, BalanceDelta, BalanceLock, NewAddress, NewBlock, NewDeposit, NewToken,
    NewTransactionRecord,
};
use ethvault::types::{AddressType, TransactionStatus, TxType};

mod helpers {
    use sqlx::postgres::{PgPool, PgPoolOptions};
    use std::time::Duration;

    /// Test configuration loaded from environment variables
    pub struct TestConfig {
        pub database_url: String,
    }

    impl TestConfig {
        /// Load test configuration from environment variables
        pub fn from_env() -> Option<Self> {
            Some(TestConfig {
                database_url: std::env::var("DATABASE_URL").ok()?,
            })
        }
    }

    /// Connect and migrate; `None` when the database is unreachable.
    pub async fn connect(url: &str) -> Option<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .ok()?;
        ethvault::db::run_migrations(&pool).await.ok()?;
        Some(pool)
    }

    pub fn random_address() -> alloy::primitives::Address {
        alloy::primitives::Address::from(rand::random::<[u8; 20]>())
    }

    pub fn random_hash() -> alloy::primitives::B256 {
        alloy::primitives::B256::from(rand::random::<[u8; 32]>())
    }
}

use helpers::{connect, random_address, random_hash, TestConfig};

async fn setup() -> Option<(sqlx::PgPool, Address, Address, Address)> {
    let config = TestConfig::from_env()?;
    let pool = connect(&config.database_url).await?;

    let user = random_address();
    let hot = random_address();
    let cold = random_address();
    let mut conn = pool.acquire().await.ok()?;
    db::store_addresses(
        &mut conn,
        &[
            NewAddress {
                user_uid: "user-1".into(),
                address: user,
                address_type: AddressType::User,
                private_key: String::new(),
                public_key: String::new(),
            },
            NewAddress {
                user_uid: String::new(),
                address: hot,
                address_type: AddressType::Hot,
                private_key: String::new(),
                public_key: String::new(),
            },
            NewAddress {
                user_uid: String::new(),
                address: cold,
                address_type: AddressType::Cold,
                private_key: String::new(),
                public_key: String::new(),
            },
        ],
    )
    .await
    .ok()?;
    Some((pool, user, hot, cold))
}

fn deposit_of(user: Address, amount: U256, block_number: u64) -> NewDeposit {
    NewDeposit {
        guid: Uuid::new_v4(),
        block_hash: random_hash(),
        block_number,
        tx_hash: random_hash(),
        from: random_address(),
        to: user,
        token: Address::ZERO,
        fee: U256::from(630_000_000_000_000u64),
        amount,
        tx_index: 0,
    }
}

#[tokio::test]
async fn test_native_deposit_credit_and_confirmation() {
    let Some((pool, user, _hot, _cold)) = setup().await else {
        eprintln!("DATABASE_URL not set or unreachable, skipping");
        return;
    };

    let one_eth = U256::from(1_000_000_000_000_000_000u128);
    let deposit = deposit_of(user, one_eth, 100);
    let tx_hash = deposit.tx_hash;

    let mut dbtx = pool.begin().await.unwrap();
    db::store_deposits(&mut dbtx, &[deposit]).await.unwrap();
    db::apply_balance_deltas(
        &mut dbtx,
        &[BalanceDelta {
            address: user,
            token_address: Address::ZERO,
            address_type: AddressType::User,
            amount: one_eth,
            tx_type: TxType::Deposit,
        }],
        None,
    )
    .await
    .unwrap();
    dbtx.commit().await.unwrap();

    let balance = db::query_balance(&pool, &user, &Address::ZERO)
        .await
        .unwrap()
        .expect("balance row created on first credit");
    assert_eq!(balance.balance(), one_eth);
    assert_eq!(balance.lock_balance(), U256::ZERO);

    // replaying the same (hash, index) pair must not double-credit
    let replay = NewDeposit {
        guid: Uuid::new_v4(),
        tx_hash,
        ..deposit_of(user, one_eth, 100)
    };
    let mut dbtx = pool.begin().await.unwrap();
    db::store_deposits(&mut dbtx, &[replay]).await.unwrap();
    dbtx.commit().await.unwrap();

    // tip at 106 with confirmations=5 promotes block 100
    let mut dbtx = pool.begin().await.unwrap();
    db::update_deposits_status(&mut dbtx, 101).await.unwrap();
    dbtx.commit().await.unwrap();

    let rows = db::query_deposits_by_address(&pool, &user).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, 1); // CREDITED
    assert_eq!(rows[0].amount(), one_eth);
}

#[tokio::test]
async fn test_withdraw_lock_staging_and_release() {
    let Some((pool, _user, hot, _cold)) = setup().await else {
        eprintln!("DATABASE_URL not set or unreachable, skipping");
        return;
    };

    let start = U256::from(500_000_000_000_000_000u128); // 5e17
    let amount = U256::from(100_000_000_000_000_000u128); // 1e17

    let mut conn = pool.acquire().await.unwrap();
    let mut dbtx = pool.begin().await.unwrap();
    db::apply_balance_deltas(
        &mut dbtx,
        &[BalanceDelta {
            address: hot,
            token_address: Address::ZERO,
            address_type: AddressType::Hot,
            amount: start,
            tx_type: TxType::Deposit,
        }],
        None,
    )
    .await
    .unwrap();
    dbtx.commit().await.unwrap();

    let guid = db::submit_withdrawal(&mut conn, hot, random_address(), Address::ZERO, amount)
        .await
        .unwrap();
    let row = db::query_withdraw_by_guid(&pool, &guid).await.unwrap().unwrap();
    assert_eq!(row.status, 0); // UNSIGNED
    assert_eq!(row.amount(), amount);
    assert!(!row.has_signed_tx());

    // outbox step: signed bytes + lock staged atomically
    let tx_hash = random_hash();
    let mut dbtx = pool.begin().await.unwrap();
    db::set_withdraw_signed(&mut dbtx, &guid, &tx_hash, "0x02f87001").await.unwrap();
    db::stage_balance_locks(
        &mut dbtx,
        &[BalanceLock {
            address: hot,
            token_address: Address::ZERO,
            lock: amount,
        }],
        false,
    )
    .await
    .unwrap();
    db::mark_withdraws_sent(&mut dbtx, &[guid]).await.unwrap();
    dbtx.commit().await.unwrap();

    let balance = db::query_balance(&pool, &hot, &Address::ZERO).await.unwrap().unwrap();
    assert_eq!(balance.balance(), start - amount);
    assert_eq!(balance.lock_balance(), amount);
    let row = db::query_withdraw_by_tx_hash(&pool, &tx_hash).await.unwrap().unwrap();
    assert_eq!(row.status, 1); // BROADCAST
    assert!(row.has_signed_tx());

    // deposit pipeline observes the tx on-chain
    let fee = U256::from(630_000_000_000_000u64);
    let mut dbtx = pool.begin().await.unwrap();
    db::update_withdraws_onchain(&mut dbtx, &[(tx_hash, fee)]).await.unwrap();
    db::apply_balance_deltas(
        &mut dbtx,
        &[BalanceDelta {
            address: hot,
            token_address: Address::ZERO,
            address_type: AddressType::Hot,
            amount,
            tx_type: TxType::Withdraw,
        }],
        Some(hot),
    )
    .await
    .unwrap();
    dbtx.commit().await.unwrap();

    let row = db::query_withdraw_by_tx_hash(&pool, &tx_hash).await.unwrap().unwrap();
    assert_eq!(row.status, 2); // ON_CHAIN
    let balance = db::query_balance(&pool, &hot, &Address::ZERO).await.unwrap().unwrap();
    assert_eq!(balance.balance(), start - amount);
    assert_eq!(balance.lock_balance(), U256::ZERO);
}

#[tokio::test]
async fn test_collection_conserves_funds() {
    let Some((pool, user, hot, _cold)) = setup().await else {
        eprintln!("DATABASE_URL not set or unreachable, skipping");
        return;
    };

    let user_balance = U256::from(20_000_000_000_000_000u128); // 2e16
    let fee_reserve = U256::from(1_000_000_000_000_000u128); // 1e15
    let swept = user_balance - fee_reserve;

    let mut dbtx = pool.begin().await.unwrap();
    db::apply_balance_deltas(
        &mut dbtx,
        &[BalanceDelta {
            address: user,
            token_address: Address::ZERO,
            address_type: AddressType::User,
            amount: user_balance,
            tx_type: TxType::Deposit,
        }],
        None,
    )
    .await
    .unwrap();
    dbtx.commit().await.unwrap();

    // the sweep threshold (1e16) catches the row
    let threshold = U256::from(10_000_000_000_000_000u128);
    let uncollected = db::uncollected_balances(&pool, threshold).await.unwrap();
    assert!(uncollected.iter().any(|b| b.address() == user));

    // collection tick: pending transaction + lock staging
    let tx_hash = random_hash();
    let mut dbtx = pool.begin().await.unwrap();
    db::store_transactions(
        &mut dbtx,
        &[NewTransactionRecord {
            guid: Uuid::new_v4(),
            block_hash: B256::ZERO,
            block_number: 0,
            tx_hash,
            from: user,
            to: hot,
            token: Address::ZERO,
            fee: U256::ZERO,
            amount: swept,
            status: TransactionStatus::Confirming.code(),
            tx_type: TxType::Collect,
            tx_index: 0,
        }],
    )
    .await
    .unwrap();
    db::stage_balance_locks(
        &mut dbtx,
        &[BalanceLock {
            address: user,
            token_address: Address::ZERO,
            lock: user_balance,
        }],
        true,
    )
    .await
    .unwrap();
    dbtx.commit().await.unwrap();

    let balance = db::query_balance(&pool, &user, &Address::ZERO).await.unwrap().unwrap();
    assert_eq!(balance.balance(), U256::ZERO);
    assert_eq!(balance.lock_balance(), user_balance);
    let pending = db::query_transaction_by_tx_hash(&pool, &tx_hash).await.unwrap().unwrap();
    assert_eq!(pending.tx_type(), Some(TxType::Collect));

    // deposit pipeline confirms the sweep: user lock released, hot credited
    let mut dbtx = pool.begin().await.unwrap();
    db::update_transactions_settled(&mut dbtx, &[(tx_hash, U256::from(21_000u64))])
        .await
        .unwrap();
    db::apply_balance_deltas(
        &mut dbtx,
        &[BalanceDelta {
            address: user,
            token_address: Address::ZERO,
            address_type: AddressType::User,
            amount: swept,
            tx_type: TxType::Collect,
        }],
        Some(hot),
    )
    .await
    .unwrap();
    dbtx.commit().await.unwrap();

    let user_row = db::query_balance(&pool, &user, &Address::ZERO).await.unwrap().unwrap();
    assert_eq!(user_row.balance(), U256::ZERO);
    assert_eq!(user_row.lock_balance(), U256::ZERO);
    let hot_row = db::query_balance(&pool, &hot, &Address::ZERO).await.unwrap().unwrap();
    assert_eq!(hot_row.balance(), swept);
    let settled = db::query_transaction_by_tx_hash(&pool, &tx_hash).await.unwrap().unwrap();
    assert_eq!(settled.status, 1);
}

#[tokio::test]
async fn test_hot_to_cold_drain_staging() {
    let Some((pool, _user, hot, _cold)) = setup().await else {
        eprintln!("DATABASE_URL not set or unreachable, skipping");
        return;
    };

    let hot_balance = U256::from(3_000_000_000_000_000_000u128); // 3e18
    let cold_funding = U256::from(2_000_000_000_000_000_000u128); // 2e18
    let excess = hot_balance - cold_funding;

    let mut dbtx = pool.begin().await.unwrap();
    db::apply_balance_deltas(
        &mut dbtx,
        &[BalanceDelta {
            address: hot,
            token_address: Address::ZERO,
            address_type: AddressType::Hot,
            amount: hot_balance,
            tx_type: TxType::Deposit,
        }],
        None,
    )
    .await
    .unwrap();
    dbtx.commit().await.unwrap();

    let over = db::hot_balances_over(&pool, cold_funding).await.unwrap();
    assert!(over.iter().any(|b| b.address() == hot));

    let mut dbtx = pool.begin().await.unwrap();
    db::stage_balance_locks(
        &mut dbtx,
        &[BalanceLock {
            address: hot,
            token_address: Address::ZERO,
            lock: excess,
        }],
        false,
    )
    .await
    .unwrap();
    dbtx.commit().await.unwrap();

    let row = db::query_balance(&pool, &hot, &Address::ZERO).await.unwrap().unwrap();
    assert_eq!(row.balance(), cold_funding);
    assert_eq!(row.lock_balance(), excess);

    // confirmation releases the hot lock
    let mut dbtx = pool.begin().await.unwrap();
    db::apply_balance_deltas(
        &mut dbtx,
        &[BalanceDelta {
            address: hot,
            token_address: Address::ZERO,
            address_type: AddressType::Hot,
            amount: excess,
            tx_type: TxType::HotToCold,
        }],
        Some(hot),
    )
    .await
    .unwrap();
    dbtx.commit().await.unwrap();

    let row = db::query_balance(&pool, &hot, &Address::ZERO).await.unwrap().unwrap();
    assert_eq!(row.balance(), cold_funding);
    assert_eq!(row.lock_balance(), U256::ZERO);
}

#[tokio::test]
async fn test_token_registry_and_block_store() {
    let Some((pool, _user, _hot, _cold)) = setup().await else {
        eprintln!("DATABASE_URL not set or unreachable, skipping");
        return;
    };

    let token = random_address();
    let mut conn = pool.acquire().await.unwrap();
    db::store_tokens(
        &mut conn,
        &[NewToken {
            token_address: token,
            decimals: 6,
            token_name: "USDC".into(),
            collect_amount: U256::from(5_000_000u64),
        }],
    )
    .await
    .unwrap();

    let row = db::query_token(&pool, &token).await.unwrap().unwrap();
    assert_eq!(row.token_address(), token);
    assert_eq!(row.decimals, 6);
    assert_eq!(row.collect_amount(), U256::from(5_000_000u64));
    assert!(db::query_token(&pool, &random_address()).await.unwrap().is_none());

    // strictly increasing across runs so this block is always the newest
    let number = chrono::Utc::now().timestamp_millis() as u64;
    let block = NewBlock {
        hash: random_hash(),
        parent_hash: random_hash(),
        number,
        timestamp: 1_700_000_000,
        header_bytes: vec![],
    };
    let mut dbtx = pool.begin().await.unwrap();
    db::store_blocks(&mut dbtx, &[block.clone()]).await.unwrap();
    dbtx.commit().await.unwrap();

    let latest = db::latest_block(&pool).await.unwrap().unwrap();
    assert_eq!(latest.hash(), block.hash);
}
