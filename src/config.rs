//! Application configuration loaded from environment variables.
//!
//! Required: `CHAIN_ID`, `COORDINATOR_ADDRESS`, and one of `SIGNING_KEY` or
//! `SIGNING_KEY_PATH`.
//! Optional: `RPC_URL`, `RPC_URLS`, `SIGNING_KEY_ENCODING`, `ALERT_HOOK_URL`,
//!           `FULFILLMENT_HOOK_URL`, `INSTANCE_ROLE`, `POLL_INTERVAL_MS`,
//!           `DELAY_BLOCKS`, `MAX_GAS_PRICE_GWEI`, `PRIORITY_FEE_GWEI`,
//!           `GAS_LIMIT`, `LEGACY_GAS`, `STATE_PATH`, `CLAIM_TTL_SECS`,
//!           `MAX_ATTEMPTS`, `READ_FAILURE_ALERT_THRESHOLD`, `RPC_TIMEOUT_MS`,
//!           `SEND_TIMEOUT_MS`, `CONFIRMATION_TIMEOUT_SECS`, `RESCAN_BLOCKS`,
//!           `MAX_BLOCK_RANGE`, `STARTUP_LOOKBACK_BLOCKS`,
//!           `FULFILLMENT_CONCURRENCY`, `WSS_ENDPOINT`

use alloy_primitives::Address;
use anyhow::{Context, Result, anyhow, bail, ensure};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::chains;
use crate::fulfiller::SubmitSettings;
use crate::keys::{KeyEncoding, Wallet};
use crate::reader::ScanSettings;
use crate::relay::LoopSettings;
use crate::request::InstanceRole;
use crate::tx::GasPricing;

const WEI_PER_GWEI: f64 = 1e9;
const DEFAULT_DELAY_BLOCKS: u64 = 20;
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

/// Application configuration for the randomness relay.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub chain_id: u64,
    /// Human readable chain name, used in logs and webhook messages.
    pub chain_name: String,
    /// JSON-RPC endpoints; the first serves reads, all receive broadcasts.
    pub rpc_urls: Vec<String>,
    pub coordinator: Address,
    /// Account that signs fulfillments.
    pub wallet: Wallet,
    pub alert_hook_url: Option<String>,
    pub fulfillment_hook_url: Option<String>,
    pub role: InstanceRole,
    /// Base poll interval before the role multiplier.
    pub poll_interval: Duration,
    pub delay_blocks: u64,
    pub pricing: GasPricing,
    pub gas_limit: u64,
    /// Where the scan cursor is persisted.
    pub state_path: PathBuf,
    pub claim_ttl: Duration,
    pub max_attempts: u32,
    pub read_failure_alert_threshold: u32,
    pub rpc_timeout: Duration,
    pub send_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub rescan_blocks: u64,
    pub max_block_range: u64,
    pub startup_lookback_blocks: u64,
    /// Maximum fulfillments awaiting confirmation at once.
    pub fulfillment_concurrency: usize,
    /// WebSocket endpoint for live log subscription; polling only when unset.
    pub wss_endpoint: Option<String>,
}

/// Parse an optional variable, rejecting malformed values.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}")),
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(parse_var(lookup, key)?.unwrap_or(default))
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn gwei_to_wei(gwei: f64) -> Result<u128> {
    ensure!(gwei.is_finite() && gwei >= 0.0, "gas price must be a non-negative number, got {gwei}");
    Ok((gwei * WEI_PER_GWEI).round() as u128)
}

impl AppConfig {
    /// Load configuration through `lookup`, which maps variable names to
    /// values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let chain_id: u64 =
            parse_var(&lookup, "CHAIN_ID")?.context("CHAIN_ID env var must be set")?;
        let profile = chains::lookup(chain_id);
        let chain_name = profile
            .map(|p| p.name.to_string())
            .unwrap_or_else(|| format!("chain-{chain_id}"));

        let primary = non_empty(&lookup, "RPC_URL");
        let extra: Vec<String> = match non_empty(&lookup, "RPC_URLS") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => profile
                .map(|p| p.rpc_urls.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
        };
        let rpc_urls = chains::endpoints_with_primary(primary.as_deref(), &extra);
        ensure!(
            !rpc_urls.is_empty(),
            "chain {chain_id} is not a known chain; set RPC_URL"
        );

        let coordinator_str = non_empty(&lookup, "COORDINATOR_ADDRESS")
            .context("COORDINATOR_ADDRESS env var must be set")?;
        let coordinator = Address::from_str(&coordinator_str)
            .with_context(|| format!("invalid COORDINATOR_ADDRESS: {coordinator_str}"))?;

        let encoding = parse_or(&lookup, "SIGNING_KEY_ENCODING", KeyEncoding::Obfuscated)?;
        let key_value = match (non_empty(&lookup, "SIGNING_KEY"), non_empty(&lookup, "SIGNING_KEY_PATH")) {
            (Some(inline), _) => inline,
            (None, Some(path)) => {
                let path = shellexpand::tilde(&path).to_string();
                std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read signing key from {path}"))?
            }
            (None, None) => bail!("SIGNING_KEY or SIGNING_KEY_PATH env var must be set"),
        };
        let wallet = Wallet::decode(&key_value, encoding)?;

        let role = parse_or(&lookup, "INSTANCE_ROLE", InstanceRole::Immediate)?;
        let default_delay = match role {
            InstanceRole::Immediate => 0,
            InstanceRole::Delay => DEFAULT_DELAY_BLOCKS,
        };
        let delay_blocks = parse_or(&lookup, "DELAY_BLOCKS", default_delay)?;

        let poll_interval_ms: u64 = parse_or(&lookup, "POLL_INTERVAL_MS", 1_000)?;
        ensure!(poll_interval_ms > 0, "POLL_INTERVAL_MS must be positive");

        let max_gas_gwei = match parse_var::<f64>(&lookup, "MAX_GAS_PRICE_GWEI")? {
            Some(v) => v,
            None => profile.and_then(|p| p.max_gas_gwei).with_context(|| {
                format!("MAX_GAS_PRICE_GWEI must be set for chain {chain_id}")
            })?,
        };
        let max_fee = gwei_to_wei(max_gas_gwei).context("invalid MAX_GAS_PRICE_GWEI")?;
        let priority_fee = gwei_to_wei(parse_or(&lookup, "PRIORITY_FEE_GWEI", 0.001)?)
            .context("invalid PRIORITY_FEE_GWEI")?;
        let legacy = parse_or(
            &lookup,
            "LEGACY_GAS",
            profile.is_some_and(|p| p.legacy_gas),
        )?;
        let pricing = if legacy {
            GasPricing::Legacy { gas_price: max_fee }
        } else {
            GasPricing::Eip1559 {
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: priority_fee.min(max_fee),
            }
        };
        let gas_limit = parse_or(&lookup, "GAS_LIMIT", 1_500_000)?;

        let state_path = match non_empty(&lookup, "STATE_PATH") {
            Some(path) => PathBuf::from(shellexpand::tilde(&path).to_string()),
            None => PathBuf::from(format!("relay-state-{chain_id}-{role}.json")),
        };

        let rescan_blocks = parse_or(&lookup, "RESCAN_BLOCKS", 50)?;
        let max_block_range = parse_or(&lookup, "MAX_BLOCK_RANGE", 1_900)?;
        ensure!(
            max_block_range > rescan_blocks + delay_blocks,
            "MAX_BLOCK_RANGE ({max_block_range}) must exceed RESCAN_BLOCKS + DELAY_BLOCKS ({})",
            rescan_blocks + delay_blocks
        );

        let fulfillment_concurrency = parse_or(&lookup, "FULFILLMENT_CONCURRENCY", 5)?;
        ensure!(fulfillment_concurrency > 0, "FULFILLMENT_CONCURRENCY must be positive");

        let wss_endpoint = non_empty(&lookup, "WSS_ENDPOINT");
        if let Some(url) = &wss_endpoint {
            ensure!(
                url.starts_with("ws://") || url.starts_with("wss://"),
                "WSS_ENDPOINT must be a ws:// or wss:// URL"
            );
        }

        Ok(Self {
            chain_id,
            chain_name,
            rpc_urls,
            coordinator,
            wallet,
            alert_hook_url: non_empty(&lookup, "ALERT_HOOK_URL"),
            fulfillment_hook_url: non_empty(&lookup, "FULFILLMENT_HOOK_URL"),
            role,
            poll_interval: Duration::from_millis(poll_interval_ms),
            delay_blocks,
            pricing,
            gas_limit,
            state_path,
            claim_ttl: Duration::from_secs(parse_or(&lookup, "CLAIM_TTL_SECS", 120)?),
            max_attempts: parse_or(&lookup, "MAX_ATTEMPTS", 3)?,
            read_failure_alert_threshold: parse_or(&lookup, "READ_FAILURE_ALERT_THRESHOLD", 5)?,
            rpc_timeout: Duration::from_millis(parse_or(&lookup, "RPC_TIMEOUT_MS", 10_000)?),
            send_timeout: Duration::from_millis(parse_or(&lookup, "SEND_TIMEOUT_MS", 500)?),
            confirmation_timeout: Duration::from_secs(parse_or(
                &lookup,
                "CONFIRMATION_TIMEOUT_SECS",
                120,
            )?),
            rescan_blocks,
            max_block_range,
            startup_lookback_blocks: parse_or(&lookup, "STARTUP_LOOKBACK_BLOCKS", 10_000)?,
            fulfillment_concurrency,
            wss_endpoint,
        })
    }

    /// Prefix for log lines and webhook messages, e.g. `base-immediate`.
    pub fn label(&self) -> String {
        format!("{}-{}", self.chain_name, self.role)
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            rescan_blocks: self.rescan_blocks,
            delay_blocks: self.delay_blocks,
            max_block_range: self.max_block_range,
            startup_lookback_blocks: self.startup_lookback_blocks,
            alert_threshold: self.read_failure_alert_threshold,
        }
    }

    pub fn submit_settings(&self) -> SubmitSettings {
        SubmitSettings {
            chain_id: self.chain_id,
            coordinator: self.coordinator,
            pricing: self.pricing,
            gas_limit: self.gas_limit,
            confirmation_timeout: self.confirmation_timeout,
            receipt_poll_interval: RECEIPT_POLL_INTERVAL,
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            role: self.role,
            poll_interval: self.poll_interval * self.role.poll_multiplier(),
            fulfillment_concurrency: self.fulfillment_concurrency,
            summary_interval: SUMMARY_INTERVAL,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keys::obfuscate;
    use std::collections::HashMap;

    pub(crate) const ANVIL_KEY: &str =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    pub(crate) fn base_env() -> HashMap<String, String> {
        [
            ("CHAIN_ID", "8453".to_string()),
            (
                "COORDINATOR_ADDRESS",
                "0x5FbDB2315678afecb367f032d93F642f64180aa3".to_string(),
            ),
            ("SIGNING_KEY", obfuscate(ANVIL_KEY)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    pub(crate) fn load(env: &HashMap<String, String>) -> Result<AppConfig> {
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn known_chain_fills_defaults() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.chain_name, "base");
        assert_eq!(config.rpc_urls, vec!["https://mainnet.base.org"]);
        assert_eq!(config.role, InstanceRole::Immediate);
        assert_eq!(config.delay_blocks, 0);
        assert_eq!(
            config.pricing,
            GasPricing::Eip1559 {
                max_fee_per_gas: 2_000_000_000,
                max_priority_fee_per_gas: 1_000_000,
            }
        );
        assert_eq!(config.gas_limit, 1_500_000);
        assert_eq!(config.state_path, PathBuf::from("relay-state-8453-immediate.json"));
        assert_eq!(config.label(), "base-immediate");
        assert_eq!(
            config.wallet.address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse::<Address>().unwrap()
        );
    }

    #[test]
    fn websocket_endpoint_is_optional_and_checked() {
        assert_eq!(load(&base_env()).unwrap().wss_endpoint, None);

        let mut env = base_env();
        env.insert("WSS_ENDPOINT".into(), "wss://base.example/ws".into());
        assert_eq!(
            load(&env).unwrap().wss_endpoint.as_deref(),
            Some("wss://base.example/ws")
        );

        env.insert("WSS_ENDPOINT".into(), "https://base.example".into());
        let err = load(&env).unwrap_err();
        assert!(err.to_string().contains("WSS_ENDPOINT"));
    }

    #[test]
    fn delay_role_polls_slower_and_waits_blocks() {
        let mut env = base_env();
        env.insert("INSTANCE_ROLE".into(), "delay".into());
        env.insert("POLL_INTERVAL_MS".into(), "250".into());
        let config = load(&env).unwrap();

        assert_eq!(config.delay_blocks, 20);
        assert_eq!(config.loop_settings().poll_interval, Duration::from_secs(1));
        assert_eq!(config.scan_settings().delay_blocks, 20);
    }

    #[test]
    fn rpc_override_goes_first() {
        let mut env = base_env();
        env.insert("CHAIN_ID".into(), "43113".into());
        env.insert("RPC_URL".into(), "https://rpc.ankr.com/avalanche_fuji".into());
        let config = load(&env).unwrap();

        assert_eq!(config.rpc_urls.len(), 3);
        assert_eq!(config.rpc_urls[0], "https://rpc.ankr.com/avalanche_fuji");
    }

    #[test]
    fn mantle_defaults_to_legacy_and_needs_gas_cap() {
        let mut env = base_env();
        env.insert("CHAIN_ID".into(), "5000".into());
        let err = load(&env).unwrap_err();
        assert!(err.to_string().contains("MAX_GAS_PRICE_GWEI"));

        env.insert("MAX_GAS_PRICE_GWEI".into(), "0.05".into());
        let config = load(&env).unwrap();
        assert_eq!(config.pricing, GasPricing::Legacy { gas_price: 50_000_000 });
    }

    #[test]
    fn unknown_chain_requires_rpc_url() {
        let mut env = base_env();
        env.insert("CHAIN_ID".into(), "31337".into());
        env.insert("MAX_GAS_PRICE_GWEI".into(), "1".into());
        assert!(load(&env).is_err());

        env.insert("RPC_URL".into(), "http://127.0.0.1:8545".into());
        let config = load(&env).unwrap();
        assert_eq!(config.chain_name, "chain-31337");
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut env = base_env();
        env.insert("POLL_INTERVAL_MS".into(), "soon".into());
        let err = load(&env).unwrap_err();
        assert!(err.to_string().contains("POLL_INTERVAL_MS"));
    }

    #[test]
    fn scan_window_must_exceed_overlap() {
        let mut env = base_env();
        env.insert("MAX_BLOCK_RANGE".into(), "40".into());
        assert!(load(&env).is_err());
    }

    #[test]
    fn missing_key_is_an_error() {
        let mut env = base_env();
        env.remove("SIGNING_KEY");
        let err = load(&env).unwrap_err();
        assert!(err.to_string().contains("SIGNING_KEY"));
    }

    #[test]
    fn key_is_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, format!("{}\n", obfuscate(ANVIL_KEY))).unwrap();
        let mut env = base_env();
        env.remove("SIGNING_KEY");
        env.insert("SIGNING_KEY_PATH".into(), path.display().to_string());

        assert!(load(&env).is_ok());
    }

    #[test]
    fn undecryptable_key_fails() {
        let mut env = base_env();
        env.insert("SIGNING_KEY".into(), ANVIL_KEY.into());
        let err = load(&env).unwrap_err();
        assert!(format!("{err:#}").contains("signing key decryption failed"));
    }

    #[test]
    fn gwei_conversion() {
        assert_eq!(gwei_to_wei(0.001).unwrap(), 1_000_000);
        assert_eq!(gwei_to_wei(100.0).unwrap(), 100_000_000_000);
        assert!(gwei_to_wei(-1.0).is_err());
    }
}
