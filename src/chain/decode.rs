//! Decoding of raw ERC-20 Transfer logs into typed transfer records.

use alloy::{
    primitives::{Address, B256, U256},
    rpc::types::Log,
    sol,
    sol_types::SolEvent,
};
use thiserror::Error;

sol! {
    /// Standard ERC-20 transfer event.
    #[derive(Debug)]
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// A decoded token transfer, still in raw chain units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    /// Sender address.
    pub from: Address,
    /// Recipient address.
    pub to: Address,
    /// Transferred amount in token base units.
    pub value: U256,
    /// Block the event was emitted in.
    pub block_number: u64,
    /// Position of the log within the block.
    pub log_index: u64,
    /// Hash of the containing transaction, when the node reports one.
    pub tx_hash: Option<B256>,
}

/// Errors decoding a single log entry. Fatal to that entry only.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The log payload does not match the Transfer ABI.
    #[error("undecodable transfer log: {0}")]
    Abi(String),

    /// The node returned a log without a block number.
    #[error("transfer log missing block number")]
    MissingBlockNumber,
}

/// Decodes one raw log into a [`TokenTransfer`].
pub fn decode_transfer(log: &Log) -> Result<TokenTransfer, DecodeError> {
    let event = Transfer::decode_log(&log.inner).map_err(|e| DecodeError::Abi(e.to_string()))?;
    let block_number = log.block_number.ok_or(DecodeError::MissingBlockNumber)?;
    Ok(TokenTransfer {
        from: event.from,
        to: event.to,
        value: event.value,
        block_number,
        log_index: log.log_index.unwrap_or_default(),
        tx_hash: log.transaction_hash,
    })
}
