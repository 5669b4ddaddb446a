//! Domain types for randomness requests and fulfillment attempts.

use alloy_primitives::{Address, B256, U256};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// A request observed in a `RandomWordsRequested` log.
///
/// Besides the identity of the request it carries the commitment fields the
/// coordinator re-hashes when the request is fulfilled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomnessRequest {
    pub request_id: U256,
    pub requester: Address,
    /// Block the request log was emitted in.
    pub block_number: u64,
    pub sub_id: u64,
    pub callback_gas_limit: u32,
    pub num_words: u32,
    pub tx_hash: Option<B256>,
}

/// Local lifecycle of a request. `Pending` is implied for unknown IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Claimed,
    Fulfilling,
    Fulfilled,
    Failed,
}

/// Which of the two redundant deployments this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRole {
    /// Fulfills as soon as a request shows up.
    Immediate,
    /// Backup: polls slower and only acts on requests older than its delay.
    Delay,
}

impl InstanceRole {
    /// Multiplier applied to the base poll interval.
    pub fn poll_multiplier(self) -> u32 {
        match self {
            Self::Immediate => 1,
            Self::Delay => 4,
        }
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => f.write_str("immediate"),
            Self::Delay => f.write_str("delay"),
        }
    }
}

impl FromStr for InstanceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" | "primary" => Ok(Self::Immediate),
            "delay" | "backup" => Ok(Self::Delay),
            other => Err(format!("unknown instance role {other:?}")),
        }
    }
}

/// One broadcast fulfillment transaction for a request.
#[derive(Debug, Clone)]
pub struct FulfillmentAttempt {
    pub request_id: U256,
    pub seed: U256,
    pub tx_hash: B256,
    pub nonce: u64,
    pub submitted_at: Instant,
    pub role: InstanceRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_aliases() {
        assert_eq!("Immediate".parse::<InstanceRole>(), Ok(InstanceRole::Immediate));
        assert_eq!(" delay ".parse::<InstanceRole>(), Ok(InstanceRole::Delay));
        assert_eq!("backup".parse::<InstanceRole>(), Ok(InstanceRole::Delay));
        assert!("sometimes".parse::<InstanceRole>().is_err());
    }

    #[test]
    fn delay_role_polls_slower() {
        assert!(InstanceRole::Delay.poll_multiplier() > InstanceRole::Immediate.poll_multiplier());
    }
}
