//! Chain-side ingestion: the RPC data-source boundary, ERC-20 Transfer
//! decoding, and the chunked, resumable log scanner.

pub mod decode;
pub mod rpc;
pub mod scanner;
pub mod traits;

pub use scanner::{ChainAccount, LogScanner, ScanOutcome};
pub use traits::{ChainDataSource, DataSourceError};

use std::str::FromStr;

use alloy::primitives::Address;
use thiserror::Error;

/// Error returned when a chain provider-account string cannot be parsed.
#[derive(Debug, Error)]
#[error("invalid chain account {0:?}: expected <chain>:<token_address>/<wallet_address>")]
pub struct AccountParseError(String);

impl FromStr for ChainAccount {
    type Err = AccountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chain_id, rest) =
            s.split_once(':').ok_or_else(|| AccountParseError(s.to_string()))?;
        let (token, wallet) =
            rest.split_once('/').ok_or_else(|| AccountParseError(s.to_string()))?;
        if chain_id.is_empty() {
            return Err(AccountParseError(s.to_string()));
        }
        let token = Address::from_str(token).map_err(|_| AccountParseError(s.to_string()))?;
        let wallet = Address::from_str(wallet).map_err(|_| AccountParseError(s.to_string()))?;
        Ok(ChainAccount { chain_id: chain_id.to_string(), token, wallet })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chain_token_wallet_triple() {
        let account: ChainAccount =
            "gnosis:0xcB444e90D8198415266c6a2724b7900fb12FC56E/0x1111111111111111111111111111111111111111"
                .parse()
                .unwrap();
        assert_eq!(account.chain_id, "gnosis");
        assert_eq!(
            account.wallet,
            Address::from_str("0x1111111111111111111111111111111111111111").unwrap()
        );
    }

    #[test]
    fn rejects_malformed_accounts() {
        assert!("gnosis".parse::<ChainAccount>().is_err());
        assert!("gnosis:0x1234".parse::<ChainAccount>().is_err());
        assert!(":0xcB444e90D8198415266c6a2724b7900fb12FC56E/0x1111111111111111111111111111111111111111"
            .parse::<ChainAccount>()
            .is_err());
        assert!("gnosis:not-an-address/0x1111111111111111111111111111111111111111"
            .parse::<ChainAccount>()
            .is_err());
    }
}
