//! A set of helpers for testing.

use alloy::{
    primitives::{Address, B256, Bytes, LogData, U256},
    rpc::types::Log,
    sol_types::SolEvent,
};
use chrono::{TimeZone, Utc};

use crate::{
    chain::decode::Transfer,
    models::{Provider, Transaction, TransactionType},
};

/// Builds a raw ERC-20 Transfer log the way an RPC node would report it.
pub fn transfer_log(
    token: Address,
    from: Address,
    to: Address,
    value: U256,
    block_number: u64,
    log_index: u64,
) -> Log {
    let mut tx_hash = [0u8; 32];
    tx_hash[..8].copy_from_slice(&block_number.to_be_bytes());
    tx_hash[8..16].copy_from_slice(&log_index.to_be_bytes());

    Log {
        inner: alloy::primitives::Log {
            address: token,
            data: LogData::new_unchecked(
                vec![Transfer::SIGNATURE_HASH, from.into_word(), to.into_word()],
                Bytes::from(value.to_be_bytes::<32>().to_vec()),
            ),
        },
        block_hash: None,
        block_number: Some(block_number),
        block_timestamp: None,
        transaction_hash: Some(B256::from(tx_hash)),
        transaction_index: None,
        log_index: Some(log_index),
        removed: false,
    }
}

/// Builds a normalized transaction with the identity fields under test and
/// neutral values everywhere else.
pub fn sample_transaction(
    provider: Provider,
    provider_account: &str,
    provider_tx_id: &str,
    value: i64,
) -> Transaction {
    Transaction {
        timestamp: Utc.with_ymd_and_hms(2024, 9, 2, 10, 10, 7).unwrap(),
        provider,
        provider_account: provider_account.to_string(),
        provider_tx_id: provider_tx_id.to_string(),
        account_address: None,
        counterparty_address: None,
        counterparty_name: None,
        counterparty_profile: None,
        value,
        token_symbol: "EUR".to_string(),
        token_decimals: 2,
        tx_type: TransactionType::Transfer,
        tags: None,
        description: None,
        invoice_uuid: None,
        data: None,
    }
}
