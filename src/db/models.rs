//! Row and insert types for the wallet ledger.
//!
//! Money columns are NUMERIC(78,0) in the database. Row structs carry them as
//! `String`: queries cast with `::TEXT` on the way out and writers cast with
//! `$n::NUMERIC` on the way in, so a full uint256 survives without a decimal
//! dependency. Addresses and hashes are raw BYTEA.

use alloy::primitives::{Address, B256, U256};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use crate::node::RpcHeader;
use crate::signer::KeyRef;
use crate::types::{AddressType, TxType};

fn parse_numeric(text: &str) -> U256 {
    U256::from_str(text.trim()).unwrap_or(U256::ZERO)
}

/// Address-book entry. Created by external tooling, immutable afterwards.
#[derive(Debug, Clone, FromRow)]
pub struct AddressRow {
    pub guid: Uuid,
    pub user_uid: String,
    pub address: Vec<u8>,
    pub address_type: i16,
    pub private_key: String,
    pub public_key: String,
    pub timestamp: i64,
}

impl AddressRow {
    pub fn address(&self) -> Address {
        Address::from_slice(&self.address)
    }

    pub fn address_type(&self) -> Option<AddressType> {
        AddressType::from_code(self.address_type)
    }

    pub fn key_ref(&self) -> KeyRef {
        KeyRef::new(self.private_key.clone())
    }
}

#[derive(Debug, Clone)]
pub struct NewAddress {
    pub user_uid: String,
    pub address: Address,
    pub address_type: AddressType,
    pub private_key: String,
    pub public_key: String,
}

/// Token-registry entry; the zero address denotes the native currency.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub guid: Uuid,
    pub token_address: Vec<u8>,
    pub decimals: i16,
    pub token_name: String,
    pub collect_amount: String,
    pub timestamp: i64,
}

impl TokenRow {
    pub fn token_address(&self) -> Address {
        Address::from_slice(&self.token_address)
    }

    pub fn collect_amount(&self) -> U256 {
        parse_numeric(&self.collect_amount)
    }
}

#[derive(Debug, Clone)]
pub struct NewToken {
    pub token_address: Address,
    pub decimals: i16,
    pub token_name: String,
    pub collect_amount: U256,
}

/// Per (owner, token) funds. `balance` is spendable; `lock_balance` is staged
/// for an in-flight outbound transfer and released on confirmation.
#[derive(Debug, Clone, FromRow)]
pub struct BalanceRow {
    pub guid: Uuid,
    pub address: Vec<u8>,
    pub token_address: Vec<u8>,
    pub address_type: i16,
    pub balance: String,
    pub lock_balance: String,
    pub timestamp: i64,
}

impl BalanceRow {
    pub fn address(&self) -> Address {
        Address::from_slice(&self.address)
    }

    pub fn token_address(&self) -> Address {
        Address::from_slice(&self.token_address)
    }

    pub fn balance(&self) -> U256 {
        parse_numeric(&self.balance)
    }

    pub fn lock_balance(&self) -> U256 {
        parse_numeric(&self.lock_balance)
    }
}

/// Indexed block header.
#[derive(Debug, Clone, FromRow)]
pub struct BlockRow {
    pub hash: Vec<u8>,
    pub parent_hash: Vec<u8>,
    pub number: i64,
    pub timestamp: i64,
    pub header_bytes: Vec<u8>,
}

impl BlockRow {
    pub fn hash(&self) -> B256 {
        B256::from_slice(&self.hash)
    }

    /// The header exactly as it was observed from the node.
    pub fn header(&self) -> Option<RpcHeader> {
        serde_json::from_slice(&self.header_bytes).ok()
    }
}

#[derive(Debug, Clone)]
pub struct NewBlock {
    pub hash: B256,
    pub parent_hash: B256,
    pub number: u64,
    pub timestamp: u64,
    pub header_bytes: Vec<u8>,
}

impl From<&RpcHeader> for NewBlock {
    fn from(header: &RpcHeader) -> Self {
        Self {
            hash: header.hash,
            parent_hash: header.parent_hash,
            number: header.number(),
            timestamp: header.timestamp(),
            header_bytes: serde_json::to_vec(header).unwrap_or_default(),
        }
    }
}

/// Inbound transfer to a user address observed in a mined block.
#[derive(Debug, Clone, FromRow)]
pub struct DepositRow {
    pub guid: Uuid,
    pub block_hash: Vec<u8>,
    pub block_number: i64,
    pub hash: Vec<u8>,
    pub from_address: Vec<u8>,
    pub to_address: Vec<u8>,
    pub token_address: Vec<u8>,
    pub fee: String,
    pub amount: String,
    pub status: i16,
    pub transaction_index: i64,
    pub timestamp: i64,
}

impl DepositRow {
    pub fn amount(&self) -> U256 {
        parse_numeric(&self.amount)
    }

    pub fn fee(&self) -> U256 {
        parse_numeric(&self.fee)
    }
}

#[derive(Debug, Clone)]
pub struct NewDeposit {
    pub guid: Uuid,
    pub block_hash: B256,
    pub block_number: u64,
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub token: Address,
    pub fee: U256,
    pub amount: U256,
    pub tx_index: u64,
}

/// Outbound transfer requested by the business layer.
#[derive(Debug, Clone, FromRow)]
pub struct WithdrawRow {
    pub guid: Uuid,
    pub block_hash: Vec<u8>,
    pub block_number: i64,
    pub hash: Vec<u8>,
    pub from_address: Vec<u8>,
    pub to_address: Vec<u8>,
    pub token_address: Vec<u8>,
    pub fee: String,
    pub amount: String,
    pub status: i16,
    pub transaction_index: i64,
    pub tx_sign_hex: String,
    pub timestamp: i64,
}

impl WithdrawRow {
    pub fn to_address(&self) -> Address {
        Address::from_slice(&self.to_address)
    }

    pub fn token_address(&self) -> Address {
        Address::from_slice(&self.token_address)
    }

    pub fn amount(&self) -> U256 {
        parse_numeric(&self.amount)
    }

    pub fn tx_hash(&self) -> Option<B256> {
        (self.hash.len() == 32).then(|| B256::from_slice(&self.hash))
    }

    /// Signed bytes persisted by the outbox step but not yet broadcast.
    pub fn has_signed_tx(&self) -> bool {
        !self.tx_sign_hex.is_empty()
    }
}

/// Audit-log row for every engine-initiated transfer and observed deposit.
#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub guid: Uuid,
    pub block_hash: Vec<u8>,
    pub block_number: i64,
    pub hash: Vec<u8>,
    pub from_address: Vec<u8>,
    pub to_address: Vec<u8>,
    pub token_address: Vec<u8>,
    pub fee: String,
    pub amount: String,
    pub status: i16,
    pub tx_type: i16,
    pub transaction_index: i64,
    pub timestamp: i64,
}

impl TransactionRow {
    pub fn tx_type(&self) -> Option<TxType> {
        TxType::from_code(self.tx_type)
    }

    pub fn amount(&self) -> U256 {
        parse_numeric(&self.amount)
    }
}

#[derive(Debug, Clone)]
pub struct NewTransactionRecord {
    pub guid: Uuid,
    pub block_hash: B256,
    pub block_number: u64,
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub token: Address,
    pub fee: U256,
    pub amount: U256,
    pub status: i16,
    pub tx_type: TxType,
    pub tx_index: u64,
}

/// Confirmed balance movement queued by the deposit pipeline; the `tx_type`
/// selects which rows move and in which direction.
#[derive(Debug, Clone)]
pub struct BalanceDelta {
    pub address: Address,
    pub token_address: Address,
    pub address_type: AddressType,
    pub amount: U256,
    pub tx_type: TxType,
}

/// Lock-staging instruction for an outbound transfer about to leave an
/// account.
#[derive(Debug, Clone)]
pub struct BalanceLock {
    pub address: Address,
    pub token_address: Address,
    pub lock: U256,
}
