//! Contract resolution: ABIs, EIP-1967 proxies and lookalike contracts.
//!
//! Every address a transaction or log touches is recorded as a contract the
//! first time it is seen. External lookups (bytecode, explorer ABI, proxy
//! slot) are best effort: failures are logged and the contract is still
//! recorded, so decoding can fall back to a lookalike or to the raw topic.
//! Only a definitive "not verified" answer marks a contract as checked for
//! an ABI; transient explorer failures leave it eligible for another lookup
//! the next time the address is seen.

use eyre::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;

use sidecar_data::abi_source::{is_not_verified, AbiSource};
use sidecar_data::chain::{
    hash_bytecode, ChainGateway, EIP1967_IMPLEMENTATION_SLOT, NULL_ADDRESS,
};
use sidecar_data::store::Store;
use sidecar_data::types::{Contract, ContractsTree, ProxyContract};

use crate::decoder::DecodedLog;

/// Event emitted by EIP-1967 proxies when their implementation changes.
pub const UPGRADED_EVENT: &str = "Upgraded";

/// How many proxy hops are followed from a newly seen contract.
pub const DEFAULT_MAX_PROXY_DEPTH: usize = 4;

/// Extracts the implementation address from an EIP-1967 slot word.
///
/// Only a `0x`-prefixed 32-byte word whose low 20 bytes are non-zero names
/// an implementation.
pub fn implementation_from_slot(value: &str) -> Option<String> {
    if value.len() != 66 || !value.starts_with("0x") {
        return None;
    }
    let low_bytes = value.get(26..)?;
    if !low_bytes.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let address = format!("0x{}", low_bytes.to_lowercase());
    if address == NULL_ADDRESS {
        return None;
    }
    Some(address)
}

/// Resolves which ABI applies to an address at a block height.
pub struct ContractResolver {
    store: Arc<Store>,
    gateway: Arc<dyn ChainGateway>,
    abi_source: Arc<dyn AbiSource>,
    max_proxy_depth: usize,
}

impl ContractResolver {
    pub fn new(store: Arc<Store>, gateway: Arc<dyn ChainGateway>, abi_source: Arc<dyn AbiSource>) -> Self {
        Self {
            store,
            gateway,
            abi_source,
            max_proxy_depth: DEFAULT_MAX_PROXY_DEPTH,
        }
    }

    pub fn with_max_proxy_depth(mut self, depth: usize) -> Self {
        self.max_proxy_depth = depth.max(1);
        self
    }

    pub fn max_proxy_depth(&self) -> usize {
        self.max_proxy_depth
    }

    /// Read-only lookup of the contract tree for `address` at `block_number`.
    ///
    /// # Errors
    /// Returns error if the store query fails.
    pub fn get_contract_with_proxy(&self, address: &str, block_number: u64) -> Result<Option<ContractsTree>> {
        self.store.get_contract_with_proxy_contract(address, block_number)
    }

    /// Returns the contract tree for `address` at `block_number`, creating
    /// the contract, its ABI and its proxy history on first sight.
    ///
    /// An existing tree is returned untouched unless `reindex` is set.
    ///
    /// # Errors
    /// Returns error only for storage failures; chain and explorer failures
    /// are logged.
    #[tracing::instrument(skip(self, bytecode_hash), fields(address = %address))]
    pub async fn find_or_create_contract_with_proxy(
        &self,
        address: &str,
        block_number: u64,
        bytecode_hash: Option<&str>,
        reindex: bool,
    ) -> Result<Option<ContractsTree>> {
        let address = address.to_lowercase();
        if !reindex {
            if let Some(tree) = self.store.get_contract_with_proxy_contract(&address, block_number)? {
                let Some(contract) = self
                    .store
                    .get_contract(&address)?
                    .filter(|contract| !contract.checked_for_abi || !contract.checked_for_proxy)
                else {
                    tracing::debug!(address, "found contract in store");
                    return Ok(Some(tree));
                };
                if !contract.checked_for_abi {
                    tracing::debug!(address, "retrying ABI lookup for stored contract");
                    self.find_and_set_contract_abi(&contract).await?;
                    self.find_and_set_lookalike(&address).await?;
                }
                if !contract.checked_for_proxy {
                    self.resolve_proxy_chain(&address, block_number, false).await?;
                }
                return self.store.get_contract_with_proxy_contract(&address, block_number);
            }
        }

        self.create_contract(&address, bytecode_hash.unwrap_or_default(), reindex)
            .await?;
        self.resolve_proxy_chain(&address, block_number, reindex).await?;

        self.store.get_contract_with_proxy_contract(&address, block_number)
    }

    /// Records `address`, fetching its bytecode hash when none is given,
    /// then looks up its ABI and a verified lookalike.
    ///
    /// # Errors
    /// Returns error if the store rejects the contract.
    pub async fn create_contract(&self, address: &str, bytecode_hash: &str, reindex: bool) -> Result<Contract> {
        let address = address.to_lowercase();
        let mut bytecode_hash = bytecode_hash.to_string();
        if bytecode_hash.is_empty() {
            match self.gateway.get_code(&address).await.and_then(|code| hash_bytecode(&code)) {
                Ok(hash) => {
                    tracing::debug!(address, bytecode_hash = %hash, "fetched contract bytecode");
                    bytecode_hash = hash;
                }
                Err(err) => {
                    tracing::error!(address, error = %err, "failed to get contract bytecode");
                }
            }
        }

        let contract = self
            .store
            .find_or_create_contract(&address, &bytecode_hash)
            .wrap_err_with(|| format!("failed to create contract {address}"))?;

        if reindex || !contract.checked_for_abi {
            self.find_and_set_contract_abi(&contract).await?;
        }
        self.find_and_set_lookalike(&address).await?;

        self.store
            .get_contract(&address)?
            .ok_or_else(|| eyre::eyre!("contract {address} vanished after creation"))
    }

    /// Asks the ABI source for `contract`'s ABI and records the attempt.
    ///
    /// A lookup that fails for any reason other than an unverified source
    /// is not recorded. Whatever ABI was already stored is kept.
    async fn find_and_set_contract_abi(&self, contract: &Contract) -> Result<()> {
        let address = contract.contract_address.as_str();
        let abi = match self.abi_source.contract_abi(address).await {
            Ok(abi) => abi,
            Err(err) if is_not_verified(&err) => String::new(),
            Err(err) => {
                tracing::warn!(address, error = %err, "failed to fetch contract ABI, will retry later");
                return Ok(());
            }
        };

        if abi.is_empty() && !contract.contract_abi.is_empty() {
            return self
                .store
                .set_contract_abi(address, &contract.contract_abi, contract.verified);
        }
        if abi.is_empty() {
            tracing::debug!(address, "no ABI available");
        }
        self.store.set_contract_abi(address, &abi, !abi.is_empty())
    }

    /// Links an unverified contract to the oldest verified, unmatched
    /// contract with the same bytecode hash.
    async fn find_and_set_lookalike(&self, address: &str) -> Result<()> {
        let Some(contract) = self.store.get_contract(address)? else {
            return Ok(());
        };
        if contract.verified
            || contract.bytecode_hash.is_empty()
            || !contract.matching_contract_address.is_empty()
        {
            return Ok(());
        }

        match self
            .store
            .find_verified_contract_with_matching_bytecode_hash(&contract.bytecode_hash, address)?
        {
            Some(similar) => {
                tracing::debug!(
                    address,
                    similar_address = %similar.contract_address,
                    "found lookalike contract"
                );
                self.store
                    .set_contract_matching_address(address, &similar.contract_address)
            }
            None => {
                tracing::debug!(address, "no lookalike contract found");
                Ok(())
            }
        }
    }

    /// Follows EIP-1967 delegation from `address`, recording one proxy row
    /// per hop, until a non-proxy, an already checked contract, a cycle or
    /// the depth limit.
    async fn resolve_proxy_chain(&self, address: &str, block_number: u64, reindex: bool) -> Result<()> {
        let mut visited = HashSet::from([address.to_string()]);
        let mut current = address.to_string();

        for depth in 0..self.max_proxy_depth {
            if depth > 0 && !reindex {
                let checked = self
                    .store
                    .get_contract(&current)?
                    .is_some_and(|contract| contract.checked_for_proxy);
                if checked {
                    return Ok(());
                }
            }

            let value = match self
                .gateway
                .get_storage_at(&current, EIP1967_IMPLEMENTATION_SLOT, None)
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    tracing::error!(address = %current, error = %err, "failed to read implementation slot");
                    return Ok(());
                }
            };

            if let Some(implementation) = implementation_from_slot(&value) {
                if visited.contains(&implementation) {
                    tracing::warn!(address = %current, implementation, "proxy cycle detected");
                    self.store.set_contract_checked_for_proxy(&current)?;
                    return Ok(());
                }
            }

            match self
                .handle_proxy_contract_creation(&current, &value, block_number, reindex)
                .await?
            {
                Some(proxy) => {
                    visited.insert(proxy.proxy_contract_address.clone());
                    current = proxy.proxy_contract_address;
                }
                None => return Ok(()),
            }
        }

        tracing::warn!(address, max_depth = self.max_proxy_depth, "proxy chain depth limit reached");
        Ok(())
    }

    /// Interprets the EIP-1967 slot value read for `address`.
    ///
    /// Anything other than a 66-character word naming a non-null address
    /// creates no proxy row. The contract is marked as checked for proxy
    /// either way.
    ///
    /// # Errors
    /// Returns error for storage failures.
    pub async fn handle_proxy_contract_creation(
        &self,
        address: &str,
        slot_value: &str,
        block_number: u64,
        reindex: bool,
    ) -> Result<Option<ProxyContract>> {
        let address = address.to_lowercase();
        let implementation = implementation_from_slot(slot_value);
        self.store.set_contract_checked_for_proxy(&address)?;

        let Some(implementation) = implementation else {
            tracing::debug!(address, slot_value, "not a proxy contract");
            return Ok(None);
        };
        if implementation == address {
            tracing::warn!(address, "contract claims to proxy to itself");
            return Ok(None);
        }

        self.create_proxy_contract(&address, &implementation, block_number, reindex)
            .await
            .map(Some)
    }

    /// Records that `address` delegates to `implementation` from
    /// `block_number`, creating the implementation contract if unseen.
    ///
    /// # Errors
    /// Returns error for storage failures.
    pub async fn create_proxy_contract(
        &self,
        address: &str,
        implementation: &str,
        block_number: u64,
        reindex: bool,
    ) -> Result<ProxyContract> {
        if self.store.get_contract(address)?.is_none() {
            self.store.find_or_create_contract(address, "")?;
        }
        let needs_lookup = self
            .store
            .get_contract(implementation)?
            .map_or(true, |contract| !contract.checked_for_abi);
        if reindex || needs_lookup {
            self.create_contract(implementation, "", reindex).await?;
        }

        let proxy = self
            .store
            .find_or_create_proxy_contract(block_number, address, implementation)
            .wrap_err_with(|| format!("failed to record proxy {address} -> {implementation}"))?;
        tracing::debug!(
            address,
            implementation = %proxy.proxy_contract_address,
            block_number,
            "recorded proxy contract"
        );
        Ok(proxy)
    }

    /// Appends a proxy row for an `Upgraded` log.
    ///
    /// The new implementation comes from the log's `implementation`
    /// argument, or from the proxy slot at the log's block when the event
    /// does not carry it. Returns `None` when no implementation is found.
    ///
    /// # Errors
    /// Returns error for storage failures.
    #[tracing::instrument(skip(self, log), fields(address = %log.address, log_index = log.log_index))]
    pub async fn handle_contract_upgrade(
        &self,
        block_number: u64,
        log: &DecodedLog,
    ) -> Result<Option<ProxyContract>> {
        let from_argument = log
            .arguments
            .iter()
            .find(|arg| arg.name == "implementation")
            .and_then(|arg| arg.value.as_str())
            .map(str::to_lowercase)
            .filter(|address| !address.is_empty() && address != NULL_ADDRESS);

        let implementation = match from_argument {
            Some(address) => Some(address),
            None => match self
                .gateway
                .get_storage_at(&log.address, EIP1967_IMPLEMENTATION_SLOT, Some(block_number))
                .await
            {
                Ok(value) => {
                    let implementation = implementation_from_slot(&value);
                    if implementation.is_none() {
                        tracing::error!(storage_value = %value, "invalid implementation slot value");
                    }
                    implementation
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to get implementation slot");
                    None
                }
            },
        };

        let Some(implementation) = implementation else {
            tracing::debug!("no new implementation address found");
            return Ok(None);
        };

        let proxy = self
            .create_upgraded_proxy_contract(block_number, &log.address, &implementation)
            .await?;
        tracing::info!(
            implementation = %proxy.proxy_contract_address,
            block_number,
            "upgraded proxy contract"
        );
        Ok(Some(proxy))
    }

    async fn create_upgraded_proxy_contract(
        &self,
        block_number: u64,
        address: &str,
        implementation: &str,
    ) -> Result<ProxyContract> {
        match self.store.get_proxy_contract_at(address, block_number)? {
            Some(existing) if existing.block_number == block_number => {
                tracing::debug!(address, block_number, "proxy row already exists for block");
                Ok(existing)
            }
            _ => {
                self.create_proxy_contract(address, implementation, block_number, false)
                    .await
            }
        }
    }
}
