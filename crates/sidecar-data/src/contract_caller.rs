//! Point-in-time contract reads used by restaked-strategy reconciliation.

use alloy::hex;
use alloy::primitives::Address;
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use eyre::{eyre, Context, Result};
use std::sync::Arc;

use crate::chain::ChainGateway;
use crate::retry::{retry, Backoff, Sleeper, TokioSleeper};

sol! {
    interface IServiceManager {
        function getOperatorRestakedStrategies(address operator) external view returns (address[] memory);
    }
}

/// Reads an AVS's view of an operator at a historical block.
#[async_trait]
pub trait ContractCaller: Send + Sync {
    /// Strategies `operator` has restaked into `avs` as of `block_number`,
    /// as lowercase hex addresses.
    async fn get_operator_restaked_strategies(
        &self,
        avs: &str,
        operator: &str,
        block_number: u64,
    ) -> Result<Vec<String>>;
}

/// [`ContractCaller`] that issues `eth_call` through a [`ChainGateway`].
pub struct RpcContractCaller {
    gateway: Arc<dyn ChainGateway>,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
}

impl RpcContractCaller {
    pub fn new(gateway: Arc<dyn ChainGateway>) -> Self {
        Self {
            gateway,
            backoff: Backoff::contract_call(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

/// The node pruned the requested historical state; retrying cannot help.
fn is_missing_state(err: &eyre::Report) -> bool {
    format!("{err:#}").contains("missing trie node")
}

fn is_reverted(err: &eyre::Report) -> bool {
    format!("{err:#}").contains("execution reverted")
}

/// Decodes the ABI-encoded `address[]` return value.
///
/// # Errors
/// Returns error if `output` is not valid hex or not an `address[]`.
pub fn decode_restaked_strategies(output: &str) -> Result<Vec<String>> {
    let bytes = hex::decode(output.trim_start_matches("0x"))
        .wrap_err("eth_call output is not valid hex")?;
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let decoded =
        IServiceManager::getOperatorRestakedStrategiesCall::abi_decode_returns(&bytes, true)
            .map_err(|err| eyre!("failed to decode restaked strategies: {err}"))?;
    Ok(decoded._0.iter().map(|address| format!("{address:#x}")).collect())
}

#[async_trait]
impl ContractCaller for RpcContractCaller {
    #[tracing::instrument(skip(self))]
    async fn get_operator_restaked_strategies(
        &self,
        avs: &str,
        operator: &str,
        block_number: u64,
    ) -> Result<Vec<String>> {
        let operator: Address = operator
            .parse()
            .wrap_err_with(|| format!("invalid operator address {operator}"))?;
        let call_data = IServiceManager::getOperatorRestakedStrategiesCall { operator }.abi_encode();
        let call_hex = format!("0x{}", hex::encode(call_data));

        let result = retry(
            &self.backoff,
            self.sleeper.as_ref(),
            || self.gateway.call(avs, &call_hex, block_number),
            |err| is_missing_state(err) || is_reverted(err),
        )
        .await;

        match result {
            Ok(output) => decode_restaked_strategies(&output),
            Err(err) if is_reverted(&err) => {
                tracing::warn!(avs, block_number, "getOperatorRestakedStrategies reverted");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

/// Queries several callers and only answers when they all agree.
pub struct ReconciledContractCaller {
    callers: Vec<Arc<dyn ContractCaller>>,
}

impl ReconciledContractCaller {
    /// # Errors
    /// Returns error if `callers` is empty.
    pub fn new(callers: Vec<Arc<dyn ContractCaller>>) -> Result<Self> {
        if callers.is_empty() {
            return Err(eyre!("no contract callers provided"));
        }
        Ok(Self { callers })
    }
}

#[async_trait]
impl ContractCaller for ReconciledContractCaller {
    async fn get_operator_restaked_strategies(
        &self,
        avs: &str,
        operator: &str,
        block_number: u64,
    ) -> Result<Vec<String>> {
        let mut results = Vec::with_capacity(self.callers.len());
        for (index, caller) in self.callers.iter().enumerate() {
            match caller
                .get_operator_restaked_strategies(avs, operator, block_number)
                .await
            {
                Ok(strategies) => results.push(strategies),
                Err(err) => {
                    tracing::error!(client_index = index, error = %err, "contract caller failed");
                }
            }
        }

        if results.len() != self.callers.len() {
            return Err(eyre!("failed to fetch results for all clients"));
        }
        let first = results.remove(0);
        if let Some(index) = results.iter().position(|other| *other != first) {
            return Err(eyre!("client {} returned different results", index + 1));
        }
        Ok(first)
    }
}
