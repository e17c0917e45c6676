//! Protocol event signatures and account extraction from logs.
//!
//! Discovery only needs to know which account an event touches. Each event is
//! described by its Keccak256 signature and where the account sits in the
//! log: an indexed topic or a word of the non-indexed data.

use super::CandidateActivity;
use crate::port::{scan_logs_chunked, ChainError, ChainReader, LogEntry, ReadOptions};
use alloy::primitives::{keccak256, Address, B256};
use std::time::Duration;

/// Where the affected account is stored in a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountField {
    /// Indexed topic (topic 0 is the signature)
    Topic(usize),
    /// 32-byte word of the data section
    DataWord(usize),
}

/// An event that marks an account as a discovery candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub signature: B256,
    pub account: AccountField,
}

impl DiscoveryEvent {
    pub fn new(signature: &str, account: AccountField) -> Self {
        Self {
            signature: keccak256(signature),
            account,
        }
    }

    /// Extract the account from a log emitted for this event.
    pub fn account_of(&self, log: &LogEntry) -> Option<Address> {
        if log.topics.first() != Some(&self.signature) {
            return None;
        }
        let user = match self.account {
            AccountField::Topic(i) => log.topics.get(i).map(|t| Address::from_word(*t))?,
            AccountField::DataWord(w) => {
                let word = log.data.get(w * 32..(w + 1) * 32)?;
                Address::from_slice(&word[12..])
            }
        };
        (!user.is_zero()).then_some(user)
    }
}

/// AAVE V3 pool events.
pub mod aave_v3 {
    use super::{AccountField, DiscoveryEvent};

    /// Supply(address indexed reserve, address user, address indexed onBehalfOf, uint256 amount, uint16 indexed referralCode)
    pub fn supply() -> DiscoveryEvent {
        DiscoveryEvent::new(
            "Supply(address,address,address,uint256,uint16)",
            AccountField::Topic(2),
        )
    }

    /// Borrow(address indexed reserve, address user, address indexed onBehalfOf, uint256 amount, uint8 interestRateMode, uint256 borrowRate, uint16 indexed referralCode)
    pub fn borrow() -> DiscoveryEvent {
        DiscoveryEvent::new(
            "Borrow(address,address,address,uint256,uint8,uint256,uint16)",
            AccountField::Topic(2),
        )
    }

    pub fn discovery() -> Vec<DiscoveryEvent> {
        vec![borrow(), supply()]
    }
}

/// Comptroller-fork market (cToken) events. No field is indexed.
pub mod compound_v2 {
    use super::{AccountField, DiscoveryEvent};

    /// Borrow(address borrower, uint borrowAmount, uint accountBorrows, uint totalBorrows)
    pub fn borrow() -> DiscoveryEvent {
        DiscoveryEvent::new(
            "Borrow(address,uint256,uint256,uint256)",
            AccountField::DataWord(0),
        )
    }

    /// Mint(address minter, uint mintAmount, uint mintTokens)
    pub fn mint() -> DiscoveryEvent {
        DiscoveryEvent::new("Mint(address,uint256,uint256)", AccountField::DataWord(0))
    }

    pub fn discovery() -> Vec<DiscoveryEvent> {
        vec![borrow(), mint()]
    }
}

/// Compound V3 (Comet) events.
pub mod comet {
    use super::{AccountField, DiscoveryEvent};

    /// Withdraw(address indexed src, address indexed to, uint amount)
    ///
    /// Withdrawing base beyond the supplied balance opens a borrow.
    pub fn withdraw() -> DiscoveryEvent {
        DiscoveryEvent::new("Withdraw(address,address,uint256)", AccountField::Topic(1))
    }

    /// SupplyCollateral(address indexed from, address indexed dst, address indexed asset, uint amount)
    pub fn supply_collateral() -> DiscoveryEvent {
        DiscoveryEvent::new(
            "SupplyCollateral(address,address,address,uint256)",
            AccountField::Topic(2),
        )
    }

    pub fn discovery() -> Vec<DiscoveryEvent> {
        vec![withdraw(), supply_collateral()]
    }
}

/// Scan `address` for the given events and return one activity per matching
/// log. Logs whose account cannot be extracted are dropped.
pub async fn collect_activity(
    reader: &dyn ChainReader,
    address: Address,
    events: &[DiscoveryEvent],
    from_block: u64,
    to_block: u64,
    timeout: Duration,
    options: ReadOptions,
) -> Result<Vec<CandidateActivity>, ChainError> {
    let signatures: Vec<B256> = events.iter().map(|e| e.signature).collect();
    let logs = scan_logs_chunked(
        reader,
        address,
        &signatures,
        from_block,
        to_block,
        options.log_chunk_blocks,
        timeout,
        options.retry,
    )
    .await?;

    Ok(logs
        .iter()
        .filter_map(|log| {
            events
                .iter()
                .find_map(|e| e.account_of(log))
                .map(|user| CandidateActivity {
                    user,
                    block_number: log.block_number,
                    log_index: log.log_index,
                })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Bytes;

    fn log(topics: Vec<B256>, data: Vec<u8>) -> LogEntry {
        LogEntry {
            address: Address::ZERO,
            topics,
            data: Bytes::from(data),
            block_number: 1,
            log_index: 0,
        }
    }

    #[test]
    fn test_aave_on_behalf_of_from_topic() {
        let user = Address::repeat_byte(0xab);
        let event = aave_v3::borrow();
        let entry = log(
            vec![
                event.signature,
                Address::repeat_byte(1).into_word(),
                user.into_word(),
                B256::ZERO,
            ],
            Vec::new(),
        );
        assert_eq!(event.account_of(&entry), Some(user));
        assert_eq!(aave_v3::supply().account_of(&entry), None);
    }

    #[test]
    fn test_compound_borrower_from_data() {
        let user = Address::repeat_byte(0xcd);
        let event = compound_v2::borrow();
        let mut data = user.into_word().to_vec();
        data.extend_from_slice(&[0u8; 96]);
        assert_eq!(event.account_of(&log(vec![event.signature], data)), Some(user));

        // Truncated data
        assert_eq!(event.account_of(&log(vec![event.signature], vec![0u8; 10])), None);
    }

    #[test]
    fn test_signatures_are_distinct() {
        let all: Vec<B256> = aave_v3::discovery()
            .into_iter()
            .chain(compound_v2::discovery())
            .chain(comet::discovery())
            .map(|e| e.signature)
            .collect();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
