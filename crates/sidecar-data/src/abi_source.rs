//! External ABI sources.
//!
//! ABI lookups are best effort and an error here never stops indexing. Only
//! [`AbiSourceError::NotVerified`] is definitive: the contract resolver marks
//! a contract as checked on that error and retries the lookup on any other.

use async_trait::async_trait;
use eyre::{eyre, Context, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::Chain;
use crate::retry::{retry, Backoff, Sleeper, TokioSleeper};

/// Typed ABI lookup failures, carried inside `eyre::Report`.
#[derive(Debug, thiserror::Error)]
pub enum AbiSourceError {
    /// The explorer has no verified source for the contract.
    #[error("contract {0} has no verified source")]
    NotVerified(String),
    /// The explorer asked us to slow down.
    #[error("etherscan rate limit: {0}")]
    RateLimited(String),
    #[error("no ABI source configured for {0}")]
    NotConfigured(String),
}

/// Whether `err` says the contract will never have an ABI from this source.
pub fn is_not_verified(err: &eyre::Report) -> bool {
    matches!(err.downcast_ref::<AbiSourceError>(), Some(AbiSourceError::NotVerified(_)))
}

fn is_rate_limited(err: &eyre::Report) -> bool {
    matches!(err.downcast_ref::<AbiSourceError>(), Some(AbiSourceError::RateLimited(_)))
}

/// Something that can return the verified JSON ABI of a contract.
#[async_trait]
pub trait AbiSource: Send + Sync {
    /// Returns the ABI as a JSON array string.
    async fn contract_abi(&self, address: &str) -> Result<String>;
}

/// ABI source used when no explorer is configured. Always fails with
/// [`AbiSourceError::NotConfigured`], which is not definitive.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAbiSource;

#[async_trait]
impl AbiSource for NoopAbiSource {
    async fn contract_abi(&self, address: &str) -> Result<String> {
        Err(AbiSourceError::NotConfigured(address.to_string()).into())
    }
}

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    message: String,
    result: serde_json::Value,
}

/// Maps a `getabi` reply to the ABI or a classified error.
fn read_abi_response(address: &str, http_ok: bool, body: EtherscanResponse) -> Result<String> {
    let result = body.result.as_str().unwrap_or_default().to_string();
    if result.starts_with("Max rate limit reached") {
        return Err(AbiSourceError::RateLimited(result).into());
    }
    if !http_ok {
        return Err(eyre!("etherscan request failed: {}", body.message));
    }
    if body.status != "1" {
        if result.contains("not verified") {
            return Err(AbiSourceError::NotVerified(address.to_string()).into());
        }
        return Err(eyre!("etherscan: {} ({result})", body.message));
    }
    Ok(result)
}

/// Etherscan `getabi` client.
pub struct EtherscanClient {
    http: reqwest::Client,
    base_url: String,
    api_keys: Vec<String>,
    next_key: AtomicUsize,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
}

impl EtherscanClient {
    /// Creates a client for the explorer that serves `chain`.
    ///
    /// # Errors
    /// Returns error if `api_keys` is empty.
    pub fn new(chain: Chain, api_keys: Vec<String>) -> Result<Self> {
        if api_keys.is_empty() {
            return Err(eyre!("at least one etherscan API key is required"));
        }
        let network = match chain {
            Chain::Mainnet => "api",
            Chain::Holesky | Chain::Preprod => "api-holesky",
        };
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .wrap_err("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: format!("https://{network}.etherscan.io/api"),
            api_keys,
            next_key: AtomicUsize::new(0),
            backoff: Backoff::explorer(),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Rotates through the configured keys.
    fn api_key(&self) -> &str {
        let index = self.next_key.fetch_add(1, Ordering::Relaxed) % self.api_keys.len();
        &self.api_keys[index]
    }

    async fn get_abi_once(&self, address: &str) -> Result<String> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("module", "contract"),
                ("action", "getabi"),
                ("address", address),
                ("apikey", self.api_key()),
            ])
            .send()
            .await
            .wrap_err("failed to send etherscan request")?;

        let http_ok = response.status().is_success();
        let body: EtherscanResponse = response
            .json()
            .await
            .wrap_err("failed to parse etherscan response")?;
        read_abi_response(address, http_ok, body)
    }
}

#[async_trait]
impl AbiSource for EtherscanClient {
    #[tracing::instrument(skip(self))]
    async fn contract_abi(&self, address: &str) -> Result<String> {
        retry(
            &self.backoff,
            self.sleeper.as_ref(),
            || self.get_abi_once(address),
            |err| !is_rate_limited(err),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_api_keys() {
        assert!(EtherscanClient::new(Chain::Mainnet, vec![]).is_err());
    }

    #[test]
    fn picks_explorer_host_by_chain() {
        let mainnet = EtherscanClient::new(Chain::Mainnet, vec!["k".to_string()])
            .expect("client should build");
        let holesky = EtherscanClient::new(Chain::Holesky, vec!["k".to_string()])
            .expect("client should build");

        assert_eq!(mainnet.base_url, "https://api.etherscan.io/api");
        assert_eq!(holesky.base_url, "https://api-holesky.etherscan.io/api");
    }

    #[test]
    fn rotates_api_keys() {
        let client = EtherscanClient::new(Chain::Mainnet, vec!["a".to_string(), "b".to_string()])
            .expect("client should build");
        let keys: Vec<String> = (0..3).map(|_| client.api_key().to_string()).collect();
        assert_eq!(keys, vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn noop_source_always_fails() {
        let err = NoopAbiSource.contract_abi("0x1").await.expect_err("no source");
        assert!(!is_not_verified(&err));
    }

    fn reply(status: &str, message: &str, result: &str) -> EtherscanResponse {
        EtherscanResponse {
            status: status.to_string(),
            message: message.to_string(),
            result: serde_json::Value::String(result.to_string()),
        }
    }

    #[test]
    fn classifies_explorer_replies() {
        let abi = read_abi_response("0xa", true, reply("1", "OK", "[]")).expect("verified");
        assert_eq!(abi, "[]");

        let err = read_abi_response("0xa", true, reply("0", "NOTOK", "Contract source code not verified"))
            .expect_err("unverified");
        assert!(is_not_verified(&err));

        let err = read_abi_response("0xa", true, reply("0", "NOTOK", "Max rate limit reached"))
            .expect_err("rate limited");
        assert!(is_rate_limited(&err));
        assert!(!is_not_verified(&err));

        let err = read_abi_response("0xa", false, reply("0", "NOTOK", "Invalid API Key"))
            .expect_err("server error");
        assert!(!is_not_verified(&err));
        assert!(!is_rate_limited(&err));
    }
}
