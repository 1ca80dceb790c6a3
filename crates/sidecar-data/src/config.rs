//! Runtime configuration.
//!
//! [`Config`] is built once at startup (from `SIDECAR_*` environment
//! variables or directly in tests) and handed to each component.

use eyre::{eyre, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported deployments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Mainnet,
    Holesky,
    Preprod,
}

impl FromStr for Chain {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "holesky" => Ok(Self::Holesky),
            "preprod" => Ok(Self::Preprod),
            other => Err(eyre!("unknown chain '{other}'")),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mainnet => "mainnet",
            Self::Holesky => "holesky",
            Self::Preprod => "preprod",
        };
        f.write_str(name)
    }
}

/// Protocol contract addresses for one chain (lowercase hex).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAddresses {
    pub rewards_coordinator: String,
    pub eigenpod_manager: String,
    pub strategy_manager: String,
    pub delegation_manager: String,
    pub avs_directory: String,
}

impl ContractAddresses {
    pub fn for_chain(chain: Chain) -> Self {
        let (rewards_coordinator, eigenpod_manager, strategy_manager, delegation_manager, avs_directory) =
            match chain {
                Chain::Preprod => (
                    "0xb22ef643e1e067c994019a4c19e403253c05c2b0",
                    "0xb8d8952f572e67b11e43bc21250967772fa883ff",
                    "0xf9fbf2e35d8803273e214c99bf15174139f4e67a",
                    "0x75dfe5b44c2e530568001400d3f704bc8ae350cc",
                    "0x141d6995556135d4997b2ff72eb443be300353bc",
                ),
                Chain::Holesky => (
                    "0xacc1fb458a1317e886db376fc8141540537e68fe",
                    "0x30770d7e3e71112d7a6b7259542d1f680a70e315",
                    "0xdfb5f6ce42aaa7830e94ecfccad411bef4d4d5b6",
                    "0xa44151489861fe9e3055d95adc98fbd462b948e7",
                    "0x055733000064333caddbc92763c58bf0192ffebf",
                ),
                Chain::Mainnet => (
                    "0x7750d328b314effa365a0402ccfd489b80b0adda",
                    "0x91e677b07f7af907ec9a428aafa9fc14a0d3a338",
                    "0x858646372cc42e1a627fce94aa7a7033e7cf075a",
                    "0x39053d51b77dc0d36036fc1fcc8cb819df8ef37a",
                    "0x135dda560e946695d6f155dacafc6f1f25c1f5af",
                ),
            };

        Self {
            rewards_coordinator: rewards_coordinator.to_string(),
            eigenpod_manager: eigenpod_manager.to_string(),
            strategy_manager: strategy_manager.to_string(),
            delegation_manager: delegation_manager.to_string(),
            avs_directory: avs_directory.to_string(),
        }
    }

    pub fn all(&self) -> Vec<String> {
        vec![
            self.rewards_coordinator.clone(),
            self.eigenpod_manager.clone(),
            self.strategy_manager.clone(),
            self.delegation_manager.clone(),
            self.avs_directory.clone(),
        ]
    }
}

/// Indexer configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub chain: Chain,
    pub rpc_url: Option<String>,
    pub etherscan_api_keys: Vec<String>,
    pub db_path: String,
    /// Restaked strategies are reconciled on blocks divisible by this.
    pub restaked_strategies_interval: u64,
    /// Concurrent `getOperatorRestakedStrategies` calls.
    pub restaked_strategies_workers: usize,
    pub rpc_batch_size: usize,
    pub chain_tip_poll_interval_secs: u64,
    /// Extra nodes queried alongside `rpc_url` for historical contract
    /// calls. Their answers must agree.
    pub contract_call_rpc_urls: Vec<String>,
    pub contracts: ContractAddresses,
}

impl Config {
    /// Default configuration for `chain`.
    pub fn for_chain(chain: Chain) -> Self {
        Self {
            chain,
            rpc_url: None,
            etherscan_api_keys: Vec::new(),
            db_path: "data/sidecar.sqlite".to_string(),
            restaked_strategies_interval: 3600,
            restaked_strategies_workers: 20,
            rpc_batch_size: 500,
            chain_tip_poll_interval_secs: 10,
            contract_call_rpc_urls: Vec::new(),
            contracts: ContractAddresses::for_chain(chain),
        }
    }

    /// Reads `SIDECAR_*` environment variables on top of the holesky
    /// defaults.
    ///
    /// # Errors
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with a custom variable lookup.
    ///
    /// # Errors
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let chain = match lookup("SIDECAR_CHAIN") {
            Some(value) => value.parse()?,
            None => Chain::Holesky,
        };
        let mut config = Self::for_chain(chain);

        config.rpc_url = lookup("SIDECAR_ETHEREUM_RPC_URL").filter(|url| !url.is_empty());
        if let Some(keys) = lookup("SIDECAR_ETHERSCAN_API_KEYS") {
            config.etherscan_api_keys = split_list(&keys);
        }
        if let Some(urls) = lookup("SIDECAR_CONTRACT_CALL_RPC_URLS") {
            config.contract_call_rpc_urls = split_list(&urls);
        }
        if let Some(path) = lookup("SIDECAR_DATABASE_PATH") {
            config.db_path = path;
        }
        if let Some(value) = lookup("SIDECAR_RESTAKED_STRATEGIES_INTERVAL") {
            config.restaked_strategies_interval = parse_number(&value, "SIDECAR_RESTAKED_STRATEGIES_INTERVAL")?;
        }
        if let Some(value) = lookup("SIDECAR_RESTAKED_STRATEGIES_WORKERS") {
            config.restaked_strategies_workers = parse_number(&value, "SIDECAR_RESTAKED_STRATEGIES_WORKERS")?;
        }
        if let Some(value) = lookup("SIDECAR_RPC_BATCH_SIZE") {
            config.rpc_batch_size = parse_number(&value, "SIDECAR_RPC_BATCH_SIZE")?;
        }
        if let Some(value) = lookup("SIDECAR_CHAIN_TIP_POLL_SECS") {
            config.chain_tip_poll_interval_secs = parse_number(&value, "SIDECAR_CHAIN_TIP_POLL_SECS")?;
        }

        if config.restaked_strategies_interval == 0 {
            return Err(eyre!("SIDECAR_RESTAKED_STRATEGIES_INTERVAL must be greater than zero"));
        }
        if config.restaked_strategies_workers == 0 {
            return Err(eyre!("SIDECAR_RESTAKED_STRATEGIES_WORKERS must be greater than zero"));
        }
        Ok(config)
    }

    /// Addresses whose transactions and logs are indexed.
    pub fn interesting_addresses(&self) -> Vec<String> {
        self.contracts.all()
    }

    pub fn is_interesting_address(&self, address: &str) -> bool {
        self.interesting_addresses()
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(address))
    }

    /// AVS directories walked during restaked-strategy reconciliation.
    ///
    /// Holesky hosts both the testnet and preprod deployments, so both
    /// directories are reconciled there.
    pub fn avs_directory_addresses(&self) -> Vec<String> {
        match self.chain {
            Chain::Mainnet => vec![self.contracts.avs_directory.clone()],
            Chain::Holesky | Chain::Preprod => vec![
                ContractAddresses::for_chain(Chain::Preprod).avs_directory,
                ContractAddresses::for_chain(Chain::Holesky).avs_directory,
            ],
        }
    }

    /// Whether `block_number` triggers restaked-strategy reconciliation.
    pub fn is_restaked_strategies_block(&self, block_number: u64) -> bool {
        block_number % self.restaked_strategies_interval == 0
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: FromStr>(value: &str, key: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .wrap_err_with(|| format!("{key} must be a number, got '{value}'"))
}
