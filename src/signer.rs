//! Offline EIP-1559 signing and ERC-20 transfer call encoding.
//!
//! Key material never leaves this module: pipelines hand over an opaque
//! [`KeyRef`] and receive raw signed bytes plus the resulting transaction
//! hash. Swapping [`LocalSigner`] for an HSM-backed implementation touches
//! nothing outside this file.

use std::fmt;

use alloy::consensus::{SignableTransaction, Signed, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use thiserror::Error;

/// `keccak256("transfer(address,uint256)")[..4]`
pub const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid key material")]
    InvalidKey,
    #[error("failed to encode or sign transaction: {0}")]
    Encoding(String),
}

/// Opaque reference to signing key material. For [`LocalSigner`] this wraps
/// the hex-encoded secp256k1 secret from the address book; an HSM
/// implementation would carry a slot identifier instead.
#[derive(Clone)]
pub struct KeyRef(String);

impl KeyRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    fn material(&self) -> &str {
        &self.0
    }
}

/// Redacted so key material cannot leak through logs.
impl fmt::Debug for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyRef").field(&"<redacted>").finish()
    }
}

/// Unsigned dynamic-fee transaction fields as the pipelines build them.
#[derive(Debug, Clone)]
pub struct Eip1559Fields {
    pub nonce: u64,
    pub gas_tip_cap: u128,
    pub gas_fee_cap: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// Result of signing: the broadcastable envelope and its canonical hash.
#[derive(Debug, Clone)]
pub struct SignedTx {
    /// `0x`-prefixed hex of the EIP-2718 envelope (`0x02` type byte).
    pub raw_hex: String,
    /// Keccak-256 of the signed envelope, equal to what the chain computes.
    pub tx_hash: B256,
}

/// Signing boundary injected into the withdraw/collection/cold pipelines.
pub trait WalletSigner: Send + Sync {
    fn sign_eip1559(
        &self,
        fields: &Eip1559Fields,
        key: &KeyRef,
        chain_id: u64,
    ) -> Result<SignedTx, SignerError>;
}

/// In-process secp256k1 signer.
#[derive(Debug, Default, Clone)]
pub struct LocalSigner;

impl LocalSigner {
    /// Sign and return the full signed transaction, used by
    /// [`WalletSigner::sign_eip1559`] and by sender-recovery tests.
    pub fn sign_transaction(
        &self,
        fields: &Eip1559Fields,
        key: &KeyRef,
        chain_id: u64,
    ) -> Result<Signed<TxEip1559>, SignerError> {
        let signer: PrivateKeySigner = key
            .material()
            .parse()
            .map_err(|_| SignerError::InvalidKey)?;

        let mut tx = TxEip1559 {
            chain_id,
            nonce: fields.nonce,
            gas_limit: fields.gas_limit,
            max_fee_per_gas: fields.gas_fee_cap,
            max_priority_fee_per_gas: fields.gas_tip_cap,
            to: TxKind::Call(fields.to),
            value: fields.value,
            access_list: Default::default(),
            input: fields.data.clone(),
        };

        let signature = signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| SignerError::Encoding(e.to_string()))?;

        Ok(tx.into_signed(signature))
    }
}

impl WalletSigner for LocalSigner {
    fn sign_eip1559(
        &self,
        fields: &Eip1559Fields,
        key: &KeyRef,
        chain_id: u64,
    ) -> Result<SignedTx, SignerError> {
        let signed = self.sign_transaction(fields, key, chain_id)?;
        let tx_hash = *signed.hash();
        let envelope = TxEnvelope::Eip1559(signed);
        let raw = envelope.encoded_2718();
        Ok(SignedTx {
            raw_hex: format!("0x{}", hex::encode(raw)),
            tx_hash,
        })
    }
}

/// Recover the EIP-155 sender of a signed dynamic-fee transaction.
pub fn recover_sender(signed: &Signed<TxEip1559>) -> Result<Address, SignerError> {
    let sig_hash = signed.tx().signature_hash();
    signed
        .signature()
        .recover_address_from_prehash(&sig_hash)
        .map_err(|e| SignerError::Encoding(e.to_string()))
}

/// Build `transfer(address,uint256)` calldata: 4-byte selector, 32-byte
/// left-padded recipient, 32-byte big-endian amount.
pub fn erc20_transfer_calldata(to: Address, amount: U256) -> Bytes {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&TRANSFER_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(to.as_slice());
    data.extend_from_slice(&amount.to_be_bytes::<32>());
    Bytes::from(data)
}

/// Parse `transfer(address,uint256)` calldata. Returns `None` for any other
/// selector or a payload shorter than 68 bytes.
pub fn parse_erc20_transfer(input: &[u8]) -> Option<(Address, U256)> {
    if input.len() < 68 || input[..4] != TRANSFER_SELECTOR {
        return None;
    }
    let to = Address::from_slice(&input[16..36]);
    let amount = U256::from_be_slice(&input[36..68]);
    Some((to, amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, keccak256, U256};

    const TEST_KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    fn test_fields() -> Eip1559Fields {
        Eip1559Fields {
            nonce: 7,
            gas_tip_cap: 2_600_000_000,
            gas_fee_cap: 2_900_000_000,
            gas_limit: 21_000,
            to: address!("dddddddddddddddddddddddddddddddddddddddd"),
            value: U256::from(100_000_000_000_000_000u128),
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_transfer_selector_matches_keccak() {
        let digest = keccak256(b"transfer(address,uint256)");
        assert_eq!(&digest[..4], &TRANSFER_SELECTOR);
    }

    #[test]
    fn test_sign_produces_type_2_envelope() {
        let signed = LocalSigner
            .sign_eip1559(&test_fields(), &KeyRef::new(TEST_KEY), 1)
            .unwrap();
        assert!(signed.raw_hex.starts_with("0x02"));
        // the envelope hash is the keccak of the raw bytes
        let raw = hex::decode(signed.raw_hex.trim_start_matches("0x")).unwrap();
        assert_eq!(keccak256(&raw), signed.tx_hash);
    }

    #[test]
    fn test_envelope_decode_round_trip() {
        use alloy::eips::eip2718::Decodable2718;

        let fields = test_fields();
        let signed = LocalSigner
            .sign_eip1559(&fields, &KeyRef::new(TEST_KEY), 1)
            .unwrap();
        let raw = hex::decode(signed.raw_hex.trim_start_matches("0x")).unwrap();
        let decoded = TxEnvelope::decode_2718(&mut raw.as_slice()).unwrap();
        let TxEnvelope::Eip1559(tx) = decoded else {
            panic!("expected an EIP-1559 envelope");
        };
        assert_eq!(*tx.hash(), signed.tx_hash);
        assert_eq!(tx.tx().chain_id, 1);
        assert_eq!(tx.tx().nonce, fields.nonce);
        assert_eq!(tx.tx().max_fee_per_gas, fields.gas_fee_cap);
        assert_eq!(tx.tx().max_priority_fee_per_gas, fields.gas_tip_cap);
        assert_eq!(tx.tx().gas_limit, fields.gas_limit);
        assert_eq!(tx.tx().to, TxKind::Call(fields.to));
        assert_eq!(tx.tx().value, fields.value);
    }

    #[test]
    fn test_sender_recovery_round_trip() {
        let key = KeyRef::new(TEST_KEY);
        let signer: PrivateKeySigner = TEST_KEY.parse().unwrap();
        let signed = LocalSigner
            .sign_transaction(&test_fields(), &key, 17_000)
            .unwrap();
        assert_eq!(recover_sender(&signed).unwrap(), signer.address());
    }

    #[test]
    fn test_invalid_key_rejected() {
        let err = LocalSigner
            .sign_eip1559(&test_fields(), &KeyRef::new("0x1234"), 1)
            .unwrap_err();
        assert!(matches!(err, SignerError::InvalidKey));
    }

    #[test]
    fn test_erc20_calldata_round_trip() {
        let to = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let amount = U256::from(5_000_000u64);
        let data = erc20_transfer_calldata(to, amount);
        assert_eq!(data.len(), 68);
        let (parsed_to, parsed_amount) = parse_erc20_transfer(&data).unwrap();
        assert_eq!(parsed_to, to);
        assert_eq!(parsed_amount, amount);
    }

    #[test]
    fn test_parse_rejects_wrong_selector() {
        let to = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let mut data = erc20_transfer_calldata(to, U256::from(1u64)).to_vec();
        data[0] = 0xde;
        assert!(parse_erc20_transfer(&data).is_none());
    }

    #[test]
    fn test_parse_rejects_short_payload() {
        let to = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let data = erc20_transfer_calldata(to, U256::from(1u64));
        assert!(parse_erc20_transfer(&data[..67]).is_none());
        assert!(parse_erc20_transfer(&[]).is_none());
        assert!(parse_erc20_transfer(&TRANSFER_SELECTOR).is_none());
    }
}
