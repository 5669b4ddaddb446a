//! Built-in defaults for the chains the relay has been deployed on.

/// Defaults for one chain. Every field can be overridden from the
/// environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainProfile {
    pub chain_id: u64,
    pub name: &'static str,
    /// Primary endpoint first; all of them receive broadcasts.
    pub rpc_urls: &'static [&'static str],
    pub max_gas_gwei: Option<f64>,
    /// Node does not accept EIP-1559 transactions.
    pub legacy_gas: bool,
}

const KNOWN_CHAINS: &[ChainProfile] = &[
    ChainProfile {
        chain_id: 8453,
        name: "base",
        rpc_urls: &["https://mainnet.base.org"],
        max_gas_gwei: Some(2.0),
        legacy_gas: false,
    },
    ChainProfile {
        chain_id: 84531,
        name: "base-goerli",
        rpc_urls: &["https://goerli.base.org"],
        max_gas_gwei: Some(2.0),
        legacy_gas: false,
    },
    ChainProfile {
        chain_id: 43114,
        name: "avalanche",
        rpc_urls: &[
            "https://api.avax.network/ext/bc/C/rpc",
            "https://rpc.ankr.com/avalanche",
            "https://avalanche.blockpi.network/v1/rpc/public",
            "https://avalanche-c-chain.publicnode.com",
            "https://ava-mainnet.public.blastapi.io/ext/bc/C/rpc",
            "https://1rpc.io/avax/c",
        ],
        max_gas_gwei: Some(100.0),
        legacy_gas: false,
    },
    ChainProfile {
        chain_id: 43113,
        name: "avalanche-fuji",
        rpc_urls: &[
            "https://api.avax-test.network/ext/bc/C/rpc",
            "https://rpc.ankr.com/avalanche_fuji",
            "https://avalanche-fuji.blockpi.network/v1/rpc/public",
        ],
        max_gas_gwei: Some(40.0),
        legacy_gas: false,
    },
    ChainProfile {
        chain_id: 5000,
        name: "mantle",
        rpc_urls: &["https://rpc.mantle.xyz"],
        max_gas_gwei: None,
        legacy_gas: true,
    },
    ChainProfile {
        chain_id: 336,
        name: "mevm-devnet",
        rpc_urls: &["https://mevm.devnet.m1.movementlabs.xyz/v1"],
        max_gas_gwei: None,
        legacy_gas: false,
    },
    ChainProfile {
        chain_id: 132008,
        name: "btc-l1",
        rpc_urls: &["https://rpc.bitcoinl1.net/main/evm/132008"],
        max_gas_gwei: Some(0.002),
        legacy_gas: false,
    },
    ChainProfile {
        chain_id: 10143,
        name: "monad-testnet",
        rpc_urls: &["https://testnet-rpc.monad.xyz"],
        max_gas_gwei: Some(60.0),
        legacy_gas: false,
    },
    ChainProfile {
        chain_id: 6342,
        name: "megaeth-testnet",
        rpc_urls: &["https://carrot.megaeth.com/rpc"],
        max_gas_gwei: Some(0.003),
        legacy_gas: false,
    },
];

pub fn lookup(chain_id: u64) -> Option<&'static ChainProfile> {
    KNOWN_CHAINS.iter().find(|c| c.chain_id == chain_id)
}

/// Endpoint list with `primary` moved to the front.
pub fn endpoints_with_primary(primary: Option<&str>, others: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(others.len() + 1);
    if let Some(primary) = primary {
        out.push(primary.to_string());
    }
    for url in others {
        if !out.contains(url) {
            out.push(url.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mantle_uses_legacy_gas() {
        let mantle = lookup(5000).unwrap();
        assert!(mantle.legacy_gas);
        assert!(mantle.max_gas_gwei.is_none());
    }

    #[test]
    fn chain_ids_are_unique() {
        for (i, a) in KNOWN_CHAINS.iter().enumerate() {
            assert!(KNOWN_CHAINS[i + 1..].iter().all(|b| b.chain_id != a.chain_id));
        }
    }

    #[test]
    fn primary_override_goes_first_without_duplicates() {
        let others = vec!["https://a".to_string(), "https://b".to_string()];
        assert_eq!(
            endpoints_with_primary(Some("https://b"), &others),
            vec!["https://b", "https://a"]
        );
        assert_eq!(endpoints_with_primary(None, &others), others);
    }

    #[test]
    fn unknown_chain() {
        assert!(lookup(1).is_none());
    }
}
