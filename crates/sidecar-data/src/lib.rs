//! sidecar-data crate
//!
//! Chain access, configuration and persistence shared by the indexer and
//! the state models.

pub mod abi_source;
pub mod chain;
pub mod config;
pub mod contract_caller;
pub mod core_contracts;
pub mod retry;
pub mod rpc;
pub mod store;
pub mod types;

pub use chain::{ChainGateway, EthereumBlock, EthereumLog, EthereumReceipt, EthereumTransaction};
pub use config::{Chain, Config};
pub use store::Store;
pub use types::{Block, Contract, ContractsTree, LogArgument, StateRoot, Transaction, TransactionLog};
